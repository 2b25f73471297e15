use crate::index::{Candidate, ChunkFilter, LegalIndex};
use async_trait::async_trait;
use lex_core::LegalChunk;
use lex_error::{LexError, Result};
use qdrant_client::{
    qdrant::{
        vectors_config::Config, Condition, CountPoints, CreateCollection, DeletePoints, Distance,
        Filter, PointStruct, SearchPoints, UpsertPoints, VectorParams, VectorsConfig,
    },
    Payload, Qdrant,
};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 基于 Qdrant 的法规索引
pub struct QdrantLegalIndex {
    client: Qdrant,
    collection_name: String,
    vector_size: usize,
}

impl QdrantLegalIndex {
    pub async fn new(qdrant_url: &str, collection_name: &str, vector_size: usize) -> Result<Self> {
        let client = Qdrant::from_url(qdrant_url)
            .build()
            .map_err(|e| LexError::VectorStore {
                operation: "connect".to_string(),
                message: format!("Failed to connect to Qdrant: {}", e),
            })?;

        let index = Self {
            client,
            collection_name: collection_name.to_string(),
            vector_size,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        match self.client.collection_exists(&self.collection_name).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                warn!("Failed to check collection existence: {}", e);
            }
        }

        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: self.vector_size as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            })),
        };
        let create_collection = CreateCollection {
            collection_name: self.collection_name.clone(),
            vectors_config: Some(vectors_config),
            ..Default::default()
        };
        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| LexError::VectorStore {
                operation: "create_collection".to_string(),
                message: format!(
                    "Failed to create collection {}: {}",
                    self.collection_name, e
                ),
            })?;

        info!("Created Qdrant collection: {}", self.collection_name);
        Ok(())
    }

    fn build_filter(filter: &ChunkFilter) -> Option<Filter> {
        let mut must = Vec::new();
        let mut should = Vec::new();

        if let Some(period) = &filter.funding_period {
            must.push(Condition::matches("funding_period", period.clone()));
        }
        if let Some(levels) = &filter.hierarchy_levels {
            for level in levels {
                should.push(Condition::matches("hierarchy_level", *level as i64));
            }
        }

        if must.is_empty() && should.is_empty() {
            return None;
        }
        Some(Filter {
            must,
            should,
            ..Default::default()
        })
    }

    async fn count_with_filter(&self, filter: Option<Filter>) -> Result<usize> {
        let result = self
            .client
            .count(CountPoints {
                collection_name: self.collection_name.clone(),
                filter,
                exact: Some(true),
                ..Default::default()
            })
            .await
            .map_err(|e| LexError::VectorStore {
                operation: "count".to_string(),
                message: e.to_string(),
            })?;
        Ok(result.result.map(|r| r.count as usize).unwrap_or(0))
    }
}

#[async_trait]
impl LegalIndex for QdrantLegalIndex {
    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    async fn upsert(&self, chunks: Vec<(LegalChunk, Vec<f32>)>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let mut points = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks {
            let payload = Payload::try_from(serde_json::json!({
                "chunk": serde_json::to_string(&chunk)?,
                "source_id": chunk.source_id,
                "funding_period": chunk.funding_period,
                "hierarchy_level": chunk.hierarchy_level as i64,
            }))
            .map_err(|e| LexError::VectorStore {
                operation: "build_payload".to_string(),
                message: e.to_string(),
            })?;
            points.push(PointStruct::new(
                Uuid::new_v4().to_string(),
                vector,
                payload,
            ));
        }

        self.client
            .upsert_points(UpsertPoints {
                collection_name: self.collection_name.clone(),
                points,
                ..Default::default()
            })
            .await
            .map_err(|e| LexError::VectorStore {
                operation: "upsert".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self, embedding, filter))]
    async fn query(
        &self,
        embedding: &[f32],
        limit: usize,
        filter: &ChunkFilter,
    ) -> Result<Vec<Candidate>> {
        let response = self
            .client
            .search_points(SearchPoints {
                collection_name: self.collection_name.clone(),
                vector: embedding.to_vec(),
                limit: limit as u64,
                filter: Self::build_filter(filter),
                with_payload: Some(true.into()),
                ..Default::default()
            })
            .await
            .map_err(|e| LexError::VectorStore {
                operation: "search".to_string(),
                message: e.to_string(),
            })?;

        let mut candidates = Vec::with_capacity(response.result.len());
        for point in response.result {
            let Some(raw) = point.payload.get("chunk").and_then(|v| v.as_str()) else {
                warn!("point without chunk payload, skipping");
                continue;
            };
            let chunk: LegalChunk = serde_json::from_str(raw)?;
            candidates.push(Candidate {
                chunk,
                similarity: point.score,
            });
        }
        Ok(candidates)
    }

    #[instrument(skip(self))]
    async fn remove_source(&self, source_id: &str) -> Result<usize> {
        let filter = Filter {
            must: vec![Condition::matches("source_id", source_id.to_string())],
            ..Default::default()
        };
        let before = self.count_with_filter(Some(filter.clone())).await?;

        self.client
            .delete_points(DeletePoints {
                collection_name: self.collection_name.clone(),
                points: Some(filter.into()),
                ..Default::default()
            })
            .await
            .map_err(|e| LexError::VectorStore {
                operation: "delete".to_string(),
                message: e.to_string(),
            })?;
        Ok(before)
    }

    async fn count(&self) -> Result<usize> {
        self.count_with_filter(None).await
    }

    async fn count_by_level(&self) -> Result<BTreeMap<u8, usize>> {
        let mut counts = BTreeMap::new();
        for level in 1..=7u8 {
            let filter = Filter {
                must: vec![Condition::matches("hierarchy_level", level as i64)],
                ..Default::default()
            };
            let count = self.count_with_filter(Some(filter)).await?;
            if count > 0 {
                counts.insert(level, count);
            }
        }
        Ok(counts)
    }
}
