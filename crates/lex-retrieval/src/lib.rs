pub mod index;
pub mod memory;
pub mod qdrant;
pub mod service;
pub mod weights;

pub use index::{Candidate, ChunkFilter, LegalIndex};
pub use memory::{cosine_similarity, MemoryLegalIndex, MockEmbedModel};
pub use qdrant::QdrantLegalIndex;
pub use service::{LegalRetrievalService, SearchOptions};
pub use weights::HierarchyWeights;
