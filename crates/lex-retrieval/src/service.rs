use crate::index::{Candidate, ChunkFilter, LegalIndex};
use crate::weights::HierarchyWeights;
use chrono::{DateTime, Utc};
use lex_core::{CorpusStats, LegalChunk, LegalDefinition, LegalSearchResult};
use lex_error::{LexError, Result};
use lex_llm::EmbedModel;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

const MAX_RESULTS: usize = 20;
/// 候选超采样倍率：先按相似度取 3×n，加权重排后再截断
const CANDIDATE_FACTOR: usize = 3;

/// 检索参数
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub n_results: usize,
    pub funding_period: Option<String>,
    /// 层级白名单，None 表示不过滤
    pub hierarchy_levels: Option<Vec<u8>>,
    /// 关闭时加权分直接取相似度
    pub rerank_by_hierarchy: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            n_results: 5,
            funding_period: None,
            hierarchy_levels: None,
            rerank_by_hierarchy: true,
        }
    }
}

/// 法规检索服务
///
/// 在向量索引之上做层级加权重排：加权分 = 相似度 × 层级权重，
/// 使上位法条款在相似度接近时排在下位法和指南之前。
pub struct LegalRetrievalService {
    embed_model: Arc<dyn EmbedModel>,
    index: Arc<dyn LegalIndex>,
    weights: HierarchyWeights,
    definitions: Arc<RwLock<Vec<(String, LegalDefinition)>>>,
    sources: Arc<RwLock<HashSet<String>>>,
    last_ingested: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl LegalRetrievalService {
    pub fn new(embed_model: Arc<dyn EmbedModel>, index: Arc<dyn LegalIndex>) -> Self {
        Self::with_weights(embed_model, index, HierarchyWeights::default())
    }

    pub fn with_weights(
        embed_model: Arc<dyn EmbedModel>,
        index: Arc<dyn LegalIndex>,
        weights: HierarchyWeights,
    ) -> Self {
        Self {
            embed_model,
            index,
            weights,
            definitions: Arc::new(RwLock::new(Vec::new())),
            sources: Arc::new(RwLock::new(HashSet::new())),
            last_ingested: Arc::new(RwLock::new(None)),
        }
    }

    /// 写入一个法规来源的块与定义。重复写入同一 source_id 先清除旧块。
    #[instrument(skip(self, chunks, definitions), fields(chunks = chunks.len()))]
    pub async fn ingest(
        &self,
        source_id: &str,
        chunks: Vec<LegalChunk>,
        definitions: Vec<LegalDefinition>,
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Err(LexError::InvalidRequest {
                reason: format!("no chunks to ingest for source {}", source_id),
            });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self.embed_model.embed(&texts).await?;
        if embeddings.len() != chunks.len() {
            return Err(LexError::EmbeddingService {
                provider: "unknown".to_string(),
                message: format!(
                    "embedding count mismatch: {} texts, {} vectors",
                    chunks.len(),
                    embeddings.len()
                ),
                retry_after: None,
            });
        }

        let replaced = self.index.remove_source(source_id).await?;
        if replaced > 0 {
            info!(source_id = %source_id, replaced, "replacing previously ingested source");
        }

        let count = chunks.len();
        self.index
            .upsert(chunks.into_iter().zip(embeddings).collect())
            .await?;

        {
            let mut defs = self.definitions.write().await;
            defs.retain(|(owner, _)| owner != source_id);
            defs.extend(
                definitions
                    .into_iter()
                    .map(|d| (source_id.to_string(), d)),
            );
        }
        self.sources.write().await.insert(source_id.to_string());
        *self.last_ingested.write().await = Some(Utc::now());

        info!(source_id = %source_id, chunks = count, "legal source ingested");
        Ok(count)
    }

    /// 层级加权检索。
    ///
    /// n_results 收敛到 1..=20。空查询返回空列表而不是错误。
    /// 返回结果按加权分降序；加权分相同时上位法（层级数小）在前。
    #[instrument(skip(self, options))]
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<LegalSearchResult>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let n_results = options.n_results.clamp(1, MAX_RESULTS);

        let embeddings = self
            .embed_model
            .embed(&[query.to_string()])
            .await
            .map_err(|e| LexError::Retrieval {
                stage: "embed_query".to_string(),
                message: e.to_string(),
            })?;
        let query_embedding = embeddings.first().ok_or_else(|| LexError::Retrieval {
            stage: "embed_query".to_string(),
            message: "embedding provider returned no vector".to_string(),
        })?;

        let filter = ChunkFilter {
            funding_period: options.funding_period.clone(),
            hierarchy_levels: options.hierarchy_levels.clone(),
        };
        let candidates = self
            .index
            .query(query_embedding, n_results * CANDIDATE_FACTOR, &filter)
            .await
            .map_err(|e| LexError::Retrieval {
                stage: "vector_query".to_string(),
                message: e.to_string(),
            })?;

        let mut results: Vec<LegalSearchResult> = candidates
            .into_iter()
            .map(|c| self.to_result(c, options.rerank_by_hierarchy))
            .collect();

        // 稳定排序：加权分降序，同分时层级数小者（上位法）在前，
        // 再同则保持索引返回的原始相似度顺序
        results.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.hierarchy_level.cmp(&b.hierarchy_level))
        });
        results.truncate(n_results);

        debug!(results = results.len(), "legal search complete");
        Ok(results)
    }

    fn to_result(&self, candidate: Candidate, rerank: bool) -> LegalSearchResult {
        let chunk = candidate.chunk;
        let weighted_score = if rerank {
            self.weights
                .weighted_score(candidate.similarity, chunk.hierarchy_level)
        } else {
            candidate.similarity
        };
        LegalSearchResult {
            content: chunk.content,
            norm_citation: chunk.norm_citation,
            article: chunk.article,
            paragraph: chunk.paragraph,
            hierarchy_level: chunk.hierarchy_level,
            similarity: candidate.similarity,
            weighted_score,
            cross_references: chunk.cross_references,
            definitions_used: chunk.definitions_used,
            metadata: serde_json::json!({
                "source_id": chunk.source_id,
                "funding_period": chunk.funding_period,
                "chunk_index": chunk.chunk_index,
            }),
        }
    }

    /// 术语定义查询。term 为空时返回全部定义。
    pub async fn definitions(&self, term: Option<&str>) -> Vec<LegalDefinition> {
        let defs = self.definitions.read().await;
        match term {
            Some(t) if !t.trim().is_empty() => {
                let needle = t.to_lowercase();
                defs.iter()
                    .filter(|(_, d)| d.term.to_lowercase().contains(&needle))
                    .map(|(_, d)| d.clone())
                    .collect()
            }
            _ => defs.iter().map(|(_, d)| d.clone()).collect(),
        }
    }

    pub async fn stats(&self) -> Result<CorpusStats> {
        let total_chunks = self.index.count().await? as u64;
        let by_level = self.index.count_by_level().await?;
        Ok(CorpusStats {
            total_sources: self.sources.read().await.len() as u64,
            total_chunks,
            total_definitions: self.definitions.read().await.len() as u64,
            chunks_by_level: by_level
                .into_iter()
                .map(|(k, v)| (k, v as u64))
                .collect(),
            last_ingested: *self.last_ingested.read().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLegalIndex;
    use async_trait::async_trait;

    /// 返回固定向量表的嵌入模型
    struct FixedEmbedModel;

    #[async_trait]
    impl EmbedModel for FixedEmbedModel {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| match t.as_str() {
                    "rechnungsangaben" => vec![1.0, 0.0],
                    "Pflichtangaben einer Rechnung nach Unionsrecht" => vec![0.6, 0.8],
                    "Rechnungsanforderungen nach nationalem Steuerrecht" => vec![0.6454, 0.7639],
                    _ => vec![0.0, 1.0],
                })
                .collect())
        }
    }

    fn chunk(citation: &str, content: &str, level: u8) -> LegalChunk {
        LegalChunk {
            content: content.to_string(),
            norm_citation: citation.to_string(),
            article: None,
            paragraph: None,
            subparagraph: None,
            hierarchy_level: level,
            cross_references: vec![],
            definitions_used: vec![],
            chunk_index: 0,
            total_chunks: 1,
            funding_period: Some("2021-2027".to_string()),
            source_id: citation.to_string(),
            created_at: Utc::now(),
        }
    }

    async fn seeded_service() -> LegalRetrievalService {
        let service = LegalRetrievalService::new(
            Arc::new(FixedEmbedModel),
            Arc::new(MemoryLegalIndex::new()),
        );
        service
            .ingest(
                "vo-2021-1060",
                vec![chunk(
                    "Art. 53 VO (EU) 2021/1060",
                    "Pflichtangaben einer Rechnung nach Unionsrecht",
                    2,
                )],
                vec![],
            )
            .await
            .unwrap();
        service
            .ingest(
                "ustg",
                vec![chunk(
                    "§ 14 UStG",
                    "Rechnungsanforderungen nach nationalem Steuerrecht",
                    5,
                )],
                vec![],
            )
            .await
            .unwrap();
        service
    }

    #[tokio::test]
    async fn test_hierarchy_weighting_reranks_similar_hits() {
        let service = seeded_service().await;
        let results = service
            .search("rechnungsangaben", &SearchOptions::default())
            .await
            .unwrap();

        // 原始相似度：国家法 0.6454 > 条例 0.6，但加权后条例在前
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].norm_citation, "Art. 53 VO (EU) 2021/1060");
        assert!((results[0].weighted_score - 0.84).abs() < 0.01);
        assert_eq!(results[1].norm_citation, "§ 14 UStG");
        assert!((results[1].weighted_score - 0.71).abs() < 0.01);
        assert!(results[1].similarity > results[0].similarity);
    }

    #[tokio::test]
    async fn test_rerank_disabled_keeps_similarity_order() {
        let service = seeded_service().await;
        let options = SearchOptions {
            rerank_by_hierarchy: false,
            ..Default::default()
        };
        let results = service
            .search("rechnungsangaben", &options)
            .await
            .unwrap();

        // 不加权时按原始相似度排序，国家法在前
        assert_eq!(results[0].norm_citation, "§ 14 UStG");
        assert_eq!(results[0].weighted_score, results[0].similarity);
        assert_eq!(results[1].weighted_score, results[1].similarity);
    }

    #[tokio::test]
    async fn test_result_count_is_bounded() {
        let service = seeded_service().await;
        let results = service
            .search(
                "rechnungsangaben",
                &SearchOptions {
                    n_results: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        // 超出上限的 n_results 收敛而不是报错
        let results = service
            .search(
                "rechnungsangaben",
                &SearchOptions {
                    n_results: 500,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty_list() {
        let service = seeded_service().await;
        let results = service
            .search("  ", &SearchOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_funding_period_filter() {
        let service = seeded_service().await;
        let options = SearchOptions {
            funding_period: Some("2014-2020".to_string()),
            ..Default::default()
        };
        let results = service
            .search("rechnungsangaben", &options)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_tie_breaks_prefer_higher_ranking_norm() {
        let index = Arc::new(MemoryLegalIndex::new());
        let service = LegalRetrievalService::with_weights(
            Arc::new(FixedEmbedModel),
            index,
            HierarchyWeights::new([1.0; 7]),
        );
        // 平权时两块加权分相同，层级数小者在前
        service
            .ingest(
                "guidance",
                vec![chunk("Merkblatt 3", "same text either way", 6)],
                vec![],
            )
            .await
            .unwrap();
        service
            .ingest(
                "treaty",
                vec![chunk("Art. 1 AEUV", "same text either way", 1)],
                vec![],
            )
            .await
            .unwrap();

        let results = service
            .search("rechnungsangaben", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results[0].norm_citation, "Art. 1 AEUV");
        assert_eq!(results[1].norm_citation, "Merkblatt 3");
    }

    #[tokio::test]
    async fn test_reingest_replaces_source() {
        let service = seeded_service().await;
        service
            .ingest(
                "ustg",
                vec![chunk(
                    "§ 14 UStG",
                    "Rechnungsanforderungen nach nationalem Steuerrecht",
                    5,
                )],
                vec![],
            )
            .await
            .unwrap();

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_sources, 2);
    }

    #[tokio::test]
    async fn test_definition_lookup() {
        let service = seeded_service().await;
        service
            .ingest(
                "vo-defs",
                vec![chunk("Art. 2 VO (EU) 2021/1060", "Begriffsbestimmungen", 2)],
                vec![LegalDefinition {
                    term: "Begünstigter".to_string(),
                    definition: "eine Einrichtung, die Mittel aus dem Fonds erhält".to_string(),
                    norm_citation: "Art. 2 VO (EU) 2021/1060".to_string(),
                    funding_period: Some("2021-2027".to_string()),
                }],
            )
            .await
            .unwrap();

        let hits = service.definitions(Some("begünstigter")).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].norm_citation, "Art. 2 VO (EU) 2021/1060");

        let all = service.definitions(None).await;
        assert_eq!(all.len(), 1);
        assert!(service.definitions(Some("vorhaben")).await.is_empty());
    }

    #[tokio::test]
    async fn test_stats_by_level() {
        let service = seeded_service().await;
        let stats = service.stats().await.unwrap();
        assert_eq!(stats.chunks_by_level.get(&2), Some(&1));
        assert_eq!(stats.chunks_by_level.get(&5), Some(&1));
        assert!(stats.last_ingested.is_some());
    }
}
