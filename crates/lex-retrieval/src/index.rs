use async_trait::async_trait;
use lex_core::LegalChunk;
use lex_error::Result;

/// 候选块：索引返回的原始相似度命中，加权排序在服务层完成
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: LegalChunk,
    pub similarity: f32,
}

/// 索引查询的结构化过滤条件
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub funding_period: Option<String>,
    pub hierarchy_levels: Option<Vec<u8>>,
}

impl ChunkFilter {
    pub fn matches(&self, chunk: &LegalChunk) -> bool {
        if let Some(period) = &self.funding_period {
            if chunk.funding_period.as_deref() != Some(period.as_str()) {
                return false;
            }
        }
        if let Some(levels) = &self.hierarchy_levels {
            if !levels.contains(&chunk.hierarchy_level) {
                return false;
            }
        }
        true
    }
}

/// 法规块向量索引
///
/// 只负责存取与相似度检索，层级加权和排序属于检索服务。
#[async_trait]
pub trait LegalIndex: Send + Sync {
    /// 批量写入带嵌入向量的块
    async fn upsert(&self, chunks: Vec<(LegalChunk, Vec<f32>)>) -> Result<()>;

    /// 按查询向量取前 limit 个候选（已应用过滤条件）
    async fn query(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<Candidate>>;

    /// 删除某一来源的全部块，返回删除数量
    async fn remove_source(&self, source_id: &str) -> Result<usize>;

    /// 索引中的块总数
    async fn count(&self) -> Result<usize>;

    /// 按层级统计块数量，键为层级 1..=7
    async fn count_by_level(&self) -> Result<std::collections::BTreeMap<u8, usize>>;
}
