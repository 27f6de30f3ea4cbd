//! Vector-similarity index — planner context retrieval.
//!
//! Failure is non-fatal by contract: the planner proceeds without context,
//! so callers treat `Err` as "no similar tasks".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use medlar_core::error::{MedlarError, Result};

/// A prior completed task similar to the query description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarTask {
    pub task_id: i64,
    pub similarity: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn find_similar(&self, description: &str, k: usize) -> Result<Vec<SimilarTask>>;

    /// Add or replace one task document in the index.
    async fn index_task(&self, task_id: i64, text: &str) -> Result<()>;
}

/// HTTP-backed index (Chroma-style query endpoint).
pub struct ChromaIndex {
    url: String,
    collection: String,
    http: reqwest::Client,
}

impl ChromaIndex {
    pub fn new(url: &str, collection: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query_texts: Vec<&'a str>,
    n_results: usize,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Vec<Vec<f64>>,
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    async fn find_similar(&self, description: &str, k: usize) -> Result<Vec<SimilarTask>> {
        let url = format!("{}/api/v1/collections/{}/query", self.url, self.collection);
        let resp = self
            .http
            .post(&url)
            .json(&QueryRequest {
                query_texts: vec![description],
                n_results: k,
            })
            .send()
            .await
            .map_err(|e| MedlarError::Http(format!("similarity query: {e}")))?;

        if !resp.status().is_success() {
            return Err(MedlarError::Provider(format!(
                "similarity service returned {}",
                resp.status()
            )));
        }

        let parsed: QueryResponse = resp
            .json()
            .await
            .map_err(|e| MedlarError::Provider(format!("similarity decode: {e}")))?;

        let ids = parsed.ids.into_iter().next().unwrap_or_default();
        let distances = parsed.distances.into_iter().next().unwrap_or_default();
        let mut out = Vec::new();
        for (i, raw_id) in ids.into_iter().enumerate() {
            let Ok(task_id) = raw_id.parse::<i64>() else {
                continue;
            };
            // Cosine distance → similarity.
            let similarity = 1.0 - distances.get(i).copied().unwrap_or(1.0);
            out.push(SimilarTask {
                task_id,
                similarity,
            });
        }
        Ok(out)
    }

    async fn index_task(&self, task_id: i64, text: &str) -> Result<()> {
        let url = format!("{}/api/v1/collections/{}/add", self.url, self.collection);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "ids": [task_id.to_string()],
                "documents": [text],
            }))
            .send()
            .await
            .map_err(|e| MedlarError::Http(format!("similarity add: {e}")))?;

        if !resp.status().is_success() {
            return Err(MedlarError::Provider(format!(
                "similarity service returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Disabled index — always returns no context.
pub struct NoopIndex;

#[async_trait]
impl VectorIndex for NoopIndex {
    async fn find_similar(&self, _description: &str, _k: usize) -> Result<Vec<SimilarTask>> {
        Ok(Vec::new())
    }

    async fn index_task(&self, _task_id: i64, _text: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_index_is_empty() {
        let index = NoopIndex;
        let similar = index.find_similar("transcode a video", 5).await.unwrap();
        assert!(similar.is_empty());
    }

    #[test]
    fn test_response_decoding() {
        let raw = r#"{"ids": [["12", "34", "oops"]], "distances": [[0.1, 0.4, 0.2]]}"#;
        let parsed: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.ids[0].len(), 3);
        assert_eq!(parsed.distances[0][1], 0.4);
    }
}
