use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::clock::{Clock, ResourceDirectory};
use crate::config::Config;
use crate::engine::{Engine, EngineOptions};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;

/// Per-organization engines. Each organization gets its own Engine, WAL,
/// sweeper and compactor; nothing is shared between them.
pub struct TenantManager {
    engines: DashMap<Ulid, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    sweep_interval: Duration,
    options: EngineOptions,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            sweep_interval: Config::default().sweep_interval,
            options: EngineOptions::default(),
        }
    }

    pub fn from_config(
        config: &Config,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn ResourceDirectory>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir: config.data_dir.clone(),
            compact_threshold: config.compact_threshold,
            sweep_interval: config.sweep_interval,
            options: EngineOptions {
                settings: config.engine_settings(),
                clock,
                directory,
            },
        }
    }

    pub fn get(&self, organization_id: Ulid) -> Option<Arc<Engine>> {
        self.engines.get(&organization_id).map(|e| e.value().clone())
    }

    /// Get or lazily open the engine for an organization, replaying its WAL.
    pub fn get_or_create(&self, organization_id: Ulid) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.get(organization_id) {
            return Ok(engine);
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many organizations"));
        }

        // Holding the entry keeps two callers from opening the same WAL twice.
        let engine = match self.engines.entry(organization_id) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{organization_id}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::open(
                    organization_id,
                    wal_path,
                    notify,
                    self.options.clone(),
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        let sweeper_engine = engine.clone();
        let every = self.sweep_interval;
        tokio::spawn(async move {
            sweeper::run_sweeper(sweeper_engine, every).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            sweeper::run_compactor(compactor_engine, threshold, every).await;
        });

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened organization {organization_id}");
        Ok(engine)
    }

    pub fn organizations(&self) -> Vec<Ulid> {
        self.engines.iter().map(|e| *e.key()).collect()
    }
}
