//! Where the set of federator identities comes from, with a TTL cache in front.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use alloy::primitives::Address;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Default lifetime of a cached federator set.
pub const DEFAULT_FEDERATOR_TTL: Duration = Duration::from_secs(60);

/// The federator set could not be fetched.
#[derive(Debug, Clone, Error)]
#[error("federator lookup failed: {0}")]
pub struct FederatorLookupError(pub String);

/// Source of the current federator addresses, typically the bridge contract.
#[async_trait]
pub trait FederatorSource: Send + Sync + fmt::Debug {
    /// The current federator addresses.
    async fn federators(&self) -> Result<Vec<Address>, FederatorLookupError>;
}

/// A fixed federator set.
#[derive(Debug, Clone)]
pub struct StaticFederators(pub Vec<Address>);

#[async_trait]
impl FederatorSource for StaticFederators {
    async fn federators(&self) -> Result<Vec<Address>, FederatorLookupError> {
        Ok(self.0.clone())
    }
}

/// Caches another source's answer for `ttl`.
#[derive(Debug)]
pub struct CachedFederators {
    source: Arc<dyn FederatorSource>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Address>)>>,
}

impl CachedFederators {
    /// Wraps `source`.
    pub fn new(source: Arc<dyn FederatorSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl FederatorSource for CachedFederators {
    async fn federators(&self) -> Result<Vec<Address>, FederatorLookupError> {
        let mut cache = self.cache.lock().await;
        if let Some((fetched_at, federators)) = cache.as_ref() {
            if fetched_at.elapsed() < self.ttl {
                return Ok(federators.clone());
            }
        }
        let federators = self.source.federators().await?;
        debug!(count = federators.len(), "refreshed federator set");
        *cache = Some((Instant::now(), federators.clone()));
        Ok(federators)
    }
}
