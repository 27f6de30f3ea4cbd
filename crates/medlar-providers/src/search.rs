//! Search index client (Meilisearch REST).
//!
//! Indexing failures are logged by callers, never fatal to the task that
//! produced the document.

use medlar_core::error::{MedlarError, Result};

pub struct SearchClient {
    url: String,
    http: reqwest::Client,
}

impl SearchClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Add or replace one document in an index.
    pub async fn index_document(&self, index: &str, doc: &serde_json::Value) -> Result<()> {
        let url = format!("{}/indexes/{}/documents", self.url, index);
        let resp = self
            .http
            .post(&url)
            .json(&[doc])
            .send()
            .await
            .map_err(|e| MedlarError::Http(format!("index send: {e}")))?;

        if !resp.status().is_success() {
            return Err(MedlarError::Provider(format!(
                "search index returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_normalized() {
        let client = SearchClient::new("http://localhost:7700///");
        assert_eq!(client.url, "http://localhost:7700");
    }
}
