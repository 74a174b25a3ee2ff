pub mod assistant;
pub mod json;
pub mod poll;

use async_trait::async_trait;

use crate::error::ExtractError;

/// Turns one document into the service's free-text reply.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    async fn extract(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ExtractError>;
}

/// Raw reply for one document, before JSON isolation.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub source_url: String,
    pub raw_text: String,
}
