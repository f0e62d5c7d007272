//! Credential providers
//!
//! A credential provider turns the opaque `provider_meta` of a routing rule
//! into a live, authenticated [`OriginConnection`]. Providers are looked up
//! by the identifier named in the rule; new kinds are added by registering an
//! implementation in the [`ProviderRegistry`].

use crate::error::{ProxyError, Result};
use crate::origin::{OriginConnection, OriginSettings};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Identifier of [`StaticUrlProvider`]
pub const STATIC_PROVIDER: &str = "static";

/// Identifier of [`EnvUrlProvider`]
pub const ENV_PROVIDER: &str = "env";

/// Resolves provider metadata into an origin connection
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Open and authenticate a new origin connection
    async fn resolve(&self, metadata: &HashMap<String, String>) -> Result<OriginConnection>;
}

/// Connects with the URL stored in `provider_meta["url"]`
#[derive(Debug, Clone)]
pub struct StaticUrlProvider {
    connect_timeout: Duration,
}

impl StaticUrlProvider {
    /// Create a provider; `connect_timeout` applies unless the URL sets its own
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl CredentialProvider for StaticUrlProvider {
    async fn resolve(&self, metadata: &HashMap<String, String>) -> Result<OriginConnection> {
        let url = metadata.get("url").ok_or_else(|| {
            ProxyError::Config("static provider requires provider_meta.url".to_string())
        })?;
        let settings = OriginSettings::from_url(url, self.connect_timeout)?;
        debug!("Static provider resolved origin {}", settings.address());
        OriginConnection::establish(&settings).await
    }
}

/// Connects with the URL held in the environment variable `provider_meta["var"]`
///
/// The variable is read on every resolution, so rotated credentials are
/// picked up by the next connection the pool opens.
#[derive(Debug, Clone)]
pub struct EnvUrlProvider {
    connect_timeout: Duration,
}

impl EnvUrlProvider {
    /// Create a provider; `connect_timeout` applies unless the URL sets its own
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn settings(&self, metadata: &HashMap<String, String>) -> Result<OriginSettings> {
        let var = metadata.get("var").ok_or_else(|| {
            ProxyError::Config("env provider requires provider_meta.var".to_string())
        })?;
        let url = std::env::var(var).map_err(|_| {
            ProxyError::Config(format!("environment variable {} is not set", var))
        })?;
        OriginSettings::from_url(&url, self.connect_timeout)
    }
}

#[async_trait]
impl CredentialProvider for EnvUrlProvider {
    async fn resolve(&self, metadata: &HashMap<String, String>) -> Result<OriginConnection> {
        let settings = self.settings(metadata)?;
        debug!("Env provider resolved origin {}", settings.address());
        OriginConnection::establish(&settings).await
    }
}

/// Providers keyed by identifier
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn CredentialProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in `static` and `env` providers
    pub fn with_builtin(connect_timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(
            STATIC_PROVIDER,
            Arc::new(StaticUrlProvider::new(connect_timeout)),
        );
        registry.register(ENV_PROVIDER, Arc::new(EnvUrlProvider::new(connect_timeout)));
        registry
    }

    /// Register a provider, replacing any provider with the same identifier
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn CredentialProvider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Look up a provider
    pub fn get(&self, name: &str) -> Option<Arc<dyn CredentialProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registered identifiers
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = ProviderRegistry::with_builtin(Duration::from_secs(1));
        assert!(registry.get(STATIC_PROVIDER).is_some());
        assert!(registry.get(ENV_PROVIDER).is_some());
        assert!(registry.get("vault").is_none());
        assert_eq!(registry.names().count(), 2);
    }

    #[tokio::test]
    async fn test_static_provider_requires_url() {
        let provider = StaticUrlProvider::new(Duration::from_secs(1));
        let result = provider.resolve(&HashMap::new()).await;
        assert!(matches!(result, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_env_provider_reads_variable() {
        let provider = EnvUrlProvider::new(Duration::from_secs(1));
        let var = "PGPROXY_TEST_ENV_PROVIDER_URL";
        std::env::set_var(var, "postgres://reporter@10.1.2.3:5544/reports");

        let mut metadata = HashMap::new();
        metadata.insert("var".to_string(), var.to_string());
        let settings = provider.settings(&metadata).unwrap();
        assert_eq!(settings.host, "10.1.2.3");
        assert_eq!(settings.port, 5544);
        assert_eq!(settings.user, "reporter");

        std::env::remove_var(var);
        assert!(matches!(
            provider.settings(&metadata),
            Err(ProxyError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_connection_error() {
        // Bind and drop a listener to get a port nobody is listening on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let provider = StaticUrlProvider::new(Duration::from_secs(2));
        let mut metadata = HashMap::new();
        metadata.insert(
            "url".to_string(),
            format!("postgres://app@127.0.0.1:{}/app", port),
        );
        assert!(matches!(
            provider.resolve(&metadata).await,
            Err(ProxyError::Connection(_))
        ));
    }
}
