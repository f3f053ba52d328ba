pub mod retriever;
pub mod scoring;
pub mod text_similarity;

pub use retriever::{RetrievalParams, Retriever, ScoredDocument};
