//! Origin routing
//!
//! This module provides the [`Router`], which maps the startup parameters of a
//! client connection onto a routing rule and the credential provider that
//! knows how to reach the rule's origin.

/// Credential providers and their registry
pub mod provider;

pub use self::provider::{CredentialProvider, EnvUrlProvider, ProviderRegistry, StaticUrlProvider};

use crate::error::{ProxyError, Result};
use crate::origin::OriginConnection;
use crate::protocol::ConnectionParams;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Predicate of a routing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Exact database name
    pub database: String,
}

impl RuleMatch {
    /// Whether the rule applies to a connection for `database`
    pub fn matches(&self, database: &str) -> bool {
        self.database == database
    }
}

/// One entry of the routing file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Rule name, also the name of the rule's origin pool
    pub name: String,

    /// Which connections the rule applies to
    #[serde(rename = "match")]
    pub matcher: RuleMatch,

    /// Identifier of the credential provider
    pub provider: String,

    /// Opaque settings handed to the provider
    #[serde(default)]
    pub provider_meta: HashMap<String, String>,
}

/// Which rule wins when several rules match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// The first matching rule in file order
    #[default]
    First,

    /// The last matching rule in file order
    Last,
}

impl FromStr for MatchPolicy {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(MatchPolicy::First),
            "last" => Ok(MatchPolicy::Last),
            other => Err(ProxyError::Config(format!("unknown match policy '{}'", other))),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::First => write!(f, "first"),
            MatchPolicy::Last => write!(f, "last"),
        }
    }
}

/// A routed destination: the matched rule plus its provider
#[derive(Clone)]
pub struct OriginTarget {
    rule: Arc<RoutingRule>,
    provider: Arc<dyn CredentialProvider>,
}

impl OriginTarget {
    /// Build a target from a rule and a provider
    pub fn new(rule: Arc<RoutingRule>, provider: Arc<dyn CredentialProvider>) -> Self {
        Self { rule, provider }
    }

    /// Target name (the rule name)
    pub fn name(&self) -> &str {
        &self.rule.name
    }

    /// The matched rule
    pub fn rule(&self) -> &RoutingRule {
        &self.rule
    }

    /// Open a new authenticated origin connection through the provider
    pub async fn connect(&self) -> Result<OriginConnection> {
        self.provider.resolve(&self.rule.provider_meta).await
    }
}

impl fmt::Debug for OriginTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginTarget")
            .field("rule", &self.rule.name)
            .field("provider", &self.rule.provider)
            .finish()
    }
}

/// Maps connection parameters to origin targets
pub struct Router {
    rules: Vec<Arc<RoutingRule>>,
    providers: ProviderRegistry,
    policy: MatchPolicy,
}

impl Router {
    /// Create a router over `rules`
    pub fn new(rules: Vec<RoutingRule>, providers: ProviderRegistry, policy: MatchPolicy) -> Self {
        for rule in &rules {
            if providers.get(&rule.provider).is_none() {
                let mut known: Vec<&str> = providers.names().collect();
                known.sort_unstable();
                warn!(
                    "Routing rule '{}' uses unregistered provider '{}' (registered: {})",
                    rule.name,
                    rule.provider,
                    known.join(", ")
                );
            }
        }

        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            providers,
            policy,
        }
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules at all
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Select the target for a connection
    ///
    /// The `database` parameter is matched; a client that omits it connects
    /// to the database named after its user, as PostgreSQL does.
    pub fn route(&self, params: &ConnectionParams) -> Result<OriginTarget> {
        let database = params
            .get("database")
            .or_else(|| params.get("user"))
            .ok_or_else(|| {
                ProxyError::Routing(
                    "startup parameters name neither a database nor a user".to_string(),
                )
            })?;

        let mut matching = self.rules.iter().filter(|rule| rule.matcher.matches(database));
        let rule = match self.policy {
            MatchPolicy::First => matching.next(),
            MatchPolicy::Last => matching.last(),
        }
        .ok_or_else(|| {
            ProxyError::Routing(format!("could not match against database={}", database))
        })?;

        let provider = self
            .providers
            .get(&rule.provider)
            .ok_or_else(|| ProxyError::UnknownProvider(rule.provider.clone()))?;

        debug!("Routed database={} to rule '{}'", database, rule.name);
        Ok(OriginTarget::new(Arc::clone(rule), provider))
    }
}
