//! # Medlar Providers
//! Clients for the external services executors talk to. Each client maps its
//! wire contract onto `MedlarError` so the retry manager can classify failures.

pub mod search;
pub mod similarity;
pub mod textgen;

pub use search::SearchClient;
pub use similarity::{ChromaIndex, NoopIndex, SimilarTask, VectorIndex};
pub use textgen::TextGenClient;
