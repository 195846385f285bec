//! Source-code provider abstraction.
//!
//! Providers (GitHub, GitLab, …) own everything that talks to the hosting
//! service: webhook management, OAuth token exchange and fetching the pipeline
//! config file out of the repository. Implementations are injected into the
//! registry at construction; nothing in the core knows a concrete provider.

use crate::models::config::PipelineConfig;
use crate::models::pipeline::Pipeline;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("no source code provider registered for type '{0}'")]
    NotRegistered(String),

    #[error("could not fetch pipeline config; {0}")]
    Fetch(String),

    #[error("could not manage webhook; {0}")]
    Webhook(String),

    #[error("could not exchange token; {0}")]
    Token(String),
}

#[async_trait]
pub trait SourceCodeProvider: Debug + Send + Sync {
    /// Fetch and parse the pipeline config file from the repository at the
    /// given ref (empty means the default branch).
    async fn fetch_pipeline_config(
        &self,
        pipeline: &Pipeline,
        ref_spec: &str,
    ) -> Result<PipelineConfig, ProviderError>;

    /// Install the receiving webhook on the repository, returning its id.
    async fn create_webhook(&self, pipeline: &Pipeline) -> Result<String, ProviderError>;

    async fn delete_webhook(&self, pipeline: &Pipeline) -> Result<(), ProviderError>;

    /// Exchange an OAuth code for an access token.
    async fn exchange_token(&self, code: &str) -> Result<String, ProviderError>;
}

/// Provider lookup by source code type.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    providers: HashMap<String, Arc<dyn SourceCodeProvider>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(mut self, kind: &str, provider: Arc<dyn SourceCodeProvider>) -> Self {
        self.providers.insert(kind.to_string(), provider);
        self
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn SourceCodeProvider>, ProviderError> {
        self.providers
            .get(kind)
            .cloned()
            .ok_or_else(|| ProviderError::NotRegistered(kind.to_string()))
    }
}

/// Serves a fixed config for every pipeline. Dev mode and tests only; real
/// deployments register providers that read the config file out of the
/// repository.
#[derive(Debug, Default)]
pub struct StaticProvider {
    pub config: PipelineConfig,
}

impl StaticProvider {
    pub fn new(config: PipelineConfig) -> Self {
        StaticProvider { config }
    }
}

#[async_trait]
impl SourceCodeProvider for StaticProvider {
    async fn fetch_pipeline_config(
        &self,
        _pipeline: &Pipeline,
        _ref_spec: &str,
    ) -> Result<PipelineConfig, ProviderError> {
        Ok(self.config.clone())
    }

    async fn create_webhook(&self, pipeline: &Pipeline) -> Result<String, ProviderError> {
        Ok(format!("static-{}", pipeline.meta.name))
    }

    async fn delete_webhook(&self, _pipeline: &Pipeline) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn exchange_token(&self, _code: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Token(
            "the static provider has no token endpoint".into(),
        ))
    }
}
