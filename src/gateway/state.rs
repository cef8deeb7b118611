//! Gateway state: the store handle plus the two atomically-swappable
//! configuration snapshots
//!
//! The provider registry and the routing snapshot are each an
//! `Arc<RwLock<Arc<T>>>`: request handlers clone the inner `Arc` once at
//! entry and keep working against that immutable snapshot; admin mutations
//! build a complete replacement and swap it in. No per-field locking.

use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use super::broadcast::RecordBroadcaster;
use crate::providers::{PlatformType, ProviderConfig, ProviderRegistry};
use crate::routing::{RoutingMode, RoutingSnapshot};
use crate::store::Store;

/// Shared state for the gateway server. Cheap to clone.
#[derive(Clone)]
pub struct GatewayState {
    pub store: Store,
    pub broadcaster: RecordBroadcaster,
    providers: Arc<RwLock<Arc<ProviderRegistry>>>,
    routing: Arc<RwLock<Arc<RoutingSnapshot>>>,
    /// Client for the legacy passthrough path; per-request timeouts apply
    pub passthrough_http: reqwest::Client,
}

impl GatewayState {
    pub fn new(store: Store) -> Result<Self> {
        let passthrough_http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .context("Failed to create passthrough HTTP client")?;

        Ok(Self {
            store,
            broadcaster: RecordBroadcaster::new(),
            providers: Arc::new(RwLock::new(Arc::new(ProviderRegistry::empty()))),
            routing: Arc::new(RwLock::new(Arc::new(RoutingSnapshot::claude_code_default()))),
            passthrough_http,
        })
    }

    /// The registry snapshot as of now
    pub fn providers(&self) -> Arc<ProviderRegistry> {
        match self.providers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The routing snapshot as of now
    pub fn routing(&self) -> Arc<RoutingSnapshot> {
        match self.routing.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn current_mode(&self) -> RoutingMode {
        self.routing().mode
    }

    /// Rebuild both snapshots from the database and publish them
    ///
    /// Called at startup and whenever a control mutation lands. In-flight
    /// requests keep the snapshots they captured.
    pub async fn reload(&self) -> Result<()> {
        let store = self.store.clone();
        let (platform_rows, routing_snapshot) =
            tokio::task::spawn_blocking(move || -> Result<_> {
                let rows = store.enabled_platforms()?;
                let snapshot = RoutingSnapshot::from_store(&store)?;
                Ok((rows, snapshot))
            })
            .await
            .context("Reload task panicked")??;

        let configs: Vec<ProviderConfig> = platform_rows
            .into_iter()
            .filter_map(|row| match PlatformType::parse(&row.platform_type) {
                Some(platform) => Some(ProviderConfig {
                    platform,
                    api_key: row.api_key.unwrap_or_default(),
                    base_url: row.base_url.unwrap_or_default(),
                    timeout_sec: row.timeout_sec,
                }),
                None => {
                    tracing::error!("Unknown platform type in database: {}", row.platform_type);
                    None
                }
            })
            .collect();

        let registry = Arc::new(ProviderRegistry::from_configs(configs));
        let mode = routing_snapshot.mode;
        let snapshot = Arc::new(routing_snapshot);

        match self.providers.write() {
            Ok(mut guard) => *guard = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
        match self.routing.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }

        tracing::info!("Gateway snapshots reloaded, work mode: {}", mode);
        Ok(())
    }
}
