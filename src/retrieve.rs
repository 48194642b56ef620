//! Retrieval gateway.
//!
//! Embeds a query and returns the top-k chunk texts from one key's
//! knowledge base, most relevant first. The tenant filter lives inside
//! the vector store's query signature, so a cross-tenant read cannot be
//! expressed from here. No indexed content is an empty result, not an
//! error; the caller decides whether that is user-facing.

use std::sync::Arc;

use crate::embedding::Embedder;
use crate::error::Result;
use crate::vector::VectorStore;

pub struct RetrievalGateway {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    top_k: usize,
}

impl RetrievalGateway {
    pub fn new(embedder: Arc<dyn Embedder>, vectors: Arc<dyn VectorStore>, top_k: usize) -> Self {
        Self {
            embedder,
            vectors,
            top_k,
        }
    }

    pub async fn retrieve(&self, api_key_id: &str, query_text: &str) -> Result<Vec<String>> {
        let query_vector = self.embedder.embed_one(query_text).await?;
        let hits = self
            .vectors
            .query(api_key_id, &query_vector, self.top_k)
            .await?;

        Ok(hits.into_iter().map(|hit| hit.text).collect())
    }
}
