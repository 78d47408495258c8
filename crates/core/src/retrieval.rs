//! Retriever trait: extra context for the system prompt (RAG).

use async_trait::async_trait;

use crate::error::RetrievalError;

#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &str;

    /// Context text relevant to `query`. Empty means nothing relevant.
    async fn retrieve(&self, query: &str) -> Result<String, RetrievalError>;
}
