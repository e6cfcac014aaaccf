//! Client factories: where the network clients the pipeline sends through
//! come from.
//!
//! # Design
//! A request names its client source either by factory name (looked up in the
//! engine's factory table) or by supplying its own factory. Every factory
//! returns the client together with an optional disposer; the pool disposes
//! entries only through that disposer, so a custom factory fully controls its
//! own cleanup.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CallError;

/// Tears down a client handle. Called at most once.
pub type Disposer = Box<dyn FnOnce() + Send>;

/// A freshly created client and the way to dispose of it.
pub struct ProvidedClient {
    pub client: reqwest::Client,
    pub disposer: Option<Disposer>,
}

impl ProvidedClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            disposer: None,
        }
    }

    pub fn with_disposer(client: reqwest::Client, disposer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            client,
            disposer: Some(Box::new(disposer)),
        }
    }
}

impl fmt::Debug for ProvidedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedClient")
            .field("has_disposer", &self.disposer.is_some())
            .finish()
    }
}

/// Creates network clients.
pub trait ClientFactory: Send + Sync {
    fn create_client(&self) -> Result<ProvidedClient, CallError>;
}

impl<F> ClientFactory for F
where
    F: Fn() -> Result<ProvidedClient, CallError> + Send + Sync,
{
    fn create_client(&self) -> Result<ProvidedClient, CallError> {
        self()
    }
}

/// Builds plain `reqwest` clients from the engine configuration.
#[derive(Debug, Clone)]
pub struct DefaultClientFactory {
    pub user_agent: String,
    pub connect_timeout: Option<Duration>,
}

impl ClientFactory for DefaultClientFactory {
    fn create_client(&self) -> Result<ProvidedClient, CallError> {
        let mut builder = reqwest::Client::builder().user_agent(&self.user_agent);
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build().map_err(|e| CallError::ConnectionAcquisition {
            key: DEFAULT_FACTORY.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ProvidedClient::new(client))
    }
}

/// Name under which the engine registers its [`DefaultClientFactory`].
pub const DEFAULT_FACTORY: &str = "default";

/// Where a request gets its client from.
#[derive(Clone)]
pub enum ClientSource {
    /// A factory registered on the engine under this name.
    Named(String),
    /// A caller-supplied factory. `key` identifies it in the pool.
    Custom {
        key: String,
        factory: Arc<dyn ClientFactory>,
    },
}

impl ClientSource {
    pub fn custom(key: &str, factory: impl ClientFactory + 'static) -> Self {
        ClientSource::Custom {
            key: key.to_string(),
            factory: Arc::new(factory),
        }
    }

    /// The key this source is pooled under.
    pub fn pool_key(&self) -> String {
        match self {
            ClientSource::Named(name) => format!("named:{name}"),
            ClientSource::Custom { key, .. } => format!("custom:{key}"),
        }
    }
}

impl Default for ClientSource {
    fn default() -> Self {
        ClientSource::Named(DEFAULT_FACTORY.to_string())
    }
}

impl fmt::Debug for ClientSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientSource::Named(name) => f.debug_tuple("Named").field(name).finish(),
            ClientSource::Custom { key, .. } => f.debug_struct("Custom").field("key", key).finish(),
        }
    }
}
