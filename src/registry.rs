// ABOUTME: Registry of configured systems, each owning one connection pool
// ABOUTME: Routes system/source and system/sink pairs without touching the database

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use deadpool_postgres::Pool;

use crate::config::{BridgeConfig, SystemConfig};
use crate::error::{BridgeError, EndpointKind};
use crate::postgres::build_pool;
use crate::sink::Sink;
use crate::source::Source;

/// One logical system: a pool plus its sources and sinks. Immutable once built.
pub struct System {
    id: String,
    pool: Pool,
    sources: BTreeMap<String, Source>,
    sinks: BTreeMap<String, Sink>,
}

impl System {
    pub fn new(
        id: &str,
        pool: Pool,
        sources: BTreeMap<String, Source>,
        sinks: BTreeMap<String, Sink>,
    ) -> Self {
        Self {
            id: id.to_string(),
            pool,
            sources,
            sinks,
        }
    }

    /// Build the pool and inspect every sink's table.
    pub async fn configure(id: &str, config: &SystemConfig) -> Result<Self> {
        let pool = build_pool(id, config)?;

        let sources = config
            .sources
            .iter()
            .map(|(source_id, source)| (source_id.clone(), Source::from_config(source_id, source)))
            .collect();

        let mut sinks = BTreeMap::new();
        if !config.sinks.is_empty() {
            let client = pool
                .get()
                .await
                .with_context(|| format!("Failed to connect to system '{}'", id))?;
            for (sink_id, sink_config) in &config.sinks {
                let sink = Sink::configure(sink_id, sink_config.clone(), &client)
                    .await
                    .with_context(|| format!("Failed to configure sink '{}/{}'", id, sink_id))?;
                sinks.insert(sink_id.clone(), sink);
            }
        }

        tracing::info!(
            "Configured system '{}' with {} source(s) and {} sink(s)",
            id,
            config.sources.len(),
            sinks.len()
        );
        Ok(Self::new(id, pool, sources, sinks))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn sources(&self) -> impl Iterator<Item = (&str, &Source)> {
        self.sources.iter().map(|(id, s)| (id.as_str(), s))
    }

    pub fn sinks(&self) -> impl Iterator<Item = (&str, &Sink)> {
        self.sinks.iter().map(|(id, s)| (id.as_str(), s))
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("id", &self.id)
            .field("pool", &self.pool.status())
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("sinks", &self.sinks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Owns every configured system for the lifetime of the process.
pub struct Registry {
    systems: BTreeMap<String, System>,
    closed: AtomicBool,
}

impl Registry {
    /// Configure all systems. Any failure aborts and no partial registry is returned.
    pub async fn configure(config: &BridgeConfig) -> Result<Self> {
        let mut systems = Vec::with_capacity(config.systems.len());
        for (id, system) in &config.systems {
            match System::configure(id, system).await {
                Ok(system) => systems.push(system),
                Err(e) => {
                    for built in &systems {
                        built.pool.close();
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::from_systems(systems))
    }

    pub fn from_systems(systems: impl IntoIterator<Item = System>) -> Self {
        Self {
            systems: systems
                .into_iter()
                .map(|system| (system.id.clone(), system))
                .collect(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn systems(&self) -> impl Iterator<Item = &System> {
        self.systems.values()
    }

    pub fn resolve_source(
        &self,
        system_id: &str,
        source_id: &str,
    ) -> Result<(&System, &Source), BridgeError> {
        self.systems
            .get(system_id)
            .and_then(|system| system.sources.get(source_id).map(|s| (system, s)))
            .ok_or_else(|| not_found(system_id, source_id, EndpointKind::Source))
    }

    pub fn resolve_sink(
        &self,
        system_id: &str,
        sink_id: &str,
    ) -> Result<(&System, &Sink), BridgeError> {
        self.systems
            .get(system_id)
            .and_then(|system| system.sinks.get(sink_id).map(|s| (system, s)))
            .ok_or_else(|| not_found(system_id, sink_id, EndpointKind::Sink))
    }

    /// Release every pool. Safe to call more than once; only the first call acts.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for system in self.systems.values() {
            let status = system.pool.status();
            if status.size > status.available {
                tracing::warn!(
                    "Closing system '{}' with {} connection(s) still in use",
                    system.id,
                    status.size - status.available
                );
            }
            system.pool.close();
            tracing::info!("Closed connection pool for system '{}'", system.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.close();
    }
}

fn not_found(system: &str, endpoint: &str, kind: EndpointKind) -> BridgeError {
    BridgeError::NotFound {
        system: system.to_string(),
        endpoint: endpoint.to_string(),
        kind,
    }
}
