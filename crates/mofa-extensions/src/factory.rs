//! Engine Factory
//!
//! Builds pools of [`ExtensionEngine`]s for one application. Every engine of
//! a pool serves every requested package; modules are compiled once and
//! instantiated separately in each engine.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::ExtensionEngine;
use crate::runtime::SandboxRuntime;
use crate::types::{ExtensionError, ExtensionPackage, ExtensionResult};

/// Factory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryStats {
    /// Pools returned to callers
    pub pools_created: u64,
    /// Engines across all pools
    pub engines_created: u64,
    /// Packages compiled
    pub packages_compiled: u64,
}

/// Extension engine factory
pub struct EngineFactory {
    app: String,
    config: Arc<EngineConfig>,
    runtime: Arc<SandboxRuntime>,
    stats: RwLock<FactoryStats>,
}

impl EngineFactory {
    /// Validate `config` and create the shared sandbox runtime
    pub fn new(app: &str, config: EngineConfig) -> ExtensionResult<Self> {
        config.validate()?;
        let runtime = SandboxRuntime::new(&config)?;

        info!(
            "Extension engine factory created for {} (memory limit {} pages)",
            app,
            config.effective_memory_limit_pages()
        );

        Ok(Self {
            app: app.to_string(),
            config: Arc::new(config),
            runtime: Arc::new(runtime),
            stats: RwLock::new(FactoryStats::default()),
        })
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> FactoryStats {
        self.stats.read().clone()
    }

    /// Build `pool_size` engines with every package loaded into each.
    ///
    /// Either the whole pool is returned or the first load error.
    pub async fn new_engines(
        &self,
        packages: &[ExtensionPackage],
        pool_size: usize,
    ) -> ExtensionResult<Vec<ExtensionEngine>> {
        if pool_size == 0 {
            return Err(ExtensionError::Config(
                "pool size must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for package in packages {
            if !seen.insert(package.qualified_name.as_str()) {
                return Err(ExtensionError::PackageAlreadyLoaded(
                    package.qualified_name.clone(),
                ));
            }
        }

        let start = Instant::now();
        let mut compiled = Vec::with_capacity(packages.len());
        for package in packages {
            let bytecode = package.read_bytecode().await?;
            let module = self.runtime.compile(&package.qualified_name, &bytecode)?;
            debug!(
                "Compiled package {} from {}",
                package.qualified_name, package.module_url
            );
            compiled.push((package, module));
        }

        let mut engines = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let mut engine =
                ExtensionEngine::new(&self.app, self.runtime.clone(), self.config.clone());
            for (package, module) in &compiled {
                engine.load(package, module)?;
            }
            engines.push(engine);
        }

        {
            let mut stats = self.stats.write();
            stats.pools_created += 1;
            stats.engines_created += pool_size as u64;
            stats.packages_compiled += compiled.len() as u64;
        }

        info!(
            "Created pool of {} engines for {} with {} packages in {}ms",
            pool_size,
            self.app,
            packages.len(),
            start.elapsed().as_millis()
        );
        Ok(engines)
    }
}
