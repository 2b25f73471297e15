use crate::index::{Candidate, ChunkFilter, LegalIndex};
use async_trait::async_trait;
use lex_core::LegalChunk;
use lex_error::Result;
use lex_llm::EmbedModel;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;

/// 基于内存的法规索引
///
/// 开发与测试用，行为与 Qdrant 索引一致。
pub struct MemoryLegalIndex {
    entries: Arc<RwLock<Vec<(LegalChunk, Vec<f32>)>>>,
}

impl MemoryLegalIndex {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for MemoryLegalIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LegalIndex for MemoryLegalIndex {
    async fn upsert(&self, chunks: Vec<(LegalChunk, Vec<f32>)>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.extend(chunks);
        Ok(())
    }

    #[instrument(skip(self, embedding, filter))]
    async fn query(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<Candidate>> {
        let entries = self.entries.read().await;
        let mut candidates: Vec<Candidate> = entries
            .iter()
            .filter(|(chunk, _)| filter.matches(chunk))
            .map(|(chunk, vector)| Candidate {
                chunk: chunk.clone(),
                similarity: cosine_similarity(embedding, vector),
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn remove_source(&self, source_id: &str) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(chunk, _)| chunk.source_id != source_id);
        Ok(before - entries.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn count_by_level(&self) -> Result<BTreeMap<u8, usize>> {
        let entries = self.entries.read().await;
        let mut counts = BTreeMap::new();
        for (chunk, _) in entries.iter() {
            *counts.entry(chunk.hierarchy_level).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

/// 余弦相似度，零向量返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Mock 嵌入模型：基于词哈希的确定性向量，用于无外部依赖的环境
pub struct MockEmbedModel {
    dimension: usize,
}

impl MockEmbedModel {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbedModel {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbedModel for MockEmbedModel {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; self.dimension];
                for word in text.split_whitespace() {
                    let mut hash: u64 = 1469598103934665603;
                    for byte in word.to_lowercase().bytes() {
                        hash ^= byte as u64;
                        hash = hash.wrapping_mul(1099511628211);
                    }
                    vector[(hash % self.dimension as u64) as usize] += 1.0;
                }
                let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for value in vector.iter_mut() {
                        *value /= norm;
                    }
                }
                vector
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_mock_embed_is_deterministic() {
        let model = MockEmbedModel::default();
        let a = model.embed(&["Förderfähige Kosten".to_string()]).await.unwrap();
        let b = model.embed(&["Förderfähige Kosten".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }
}
