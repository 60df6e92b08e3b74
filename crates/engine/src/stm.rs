//! STM runtime
//!
//! An [`Stm`] ties together the pieces every transaction of one runtime must
//! share: the global conflict counter, the default configuration, and one
//! [`TxnExecutor`] (with its speculative state) per named family.
//!
//! Cells are not owned by a runtime. A `TxnRef` can be used from any
//! runtime, but transactions that touch the same cells should share a
//! runtime so that they share a conflict counter; otherwise read
//! consistency during execution is only checked at commit.

use crate::config::StmConfig;
use crate::executor::TxnExecutor;
use crate::metrics::{MetricsRecorder, TransactionMetrics};
use once_cell::sync::Lazy;
use orecstm_concurrency::{GlobalConflictCounter, Transaction, TxnRef, TxnValue};
use orecstm_core::{StmError, StmResult, TxnConfig};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

static GLOBAL: Lazy<Stm> = Lazy::new(Stm::new);

/// A transactional memory runtime
pub struct Stm {
    config: StmConfig,
    counter: Arc<GlobalConflictCounter>,
    metrics: Arc<MetricsRecorder>,
    default_executor: TxnExecutor,
    families: RwLock<FxHashMap<String, Arc<TxnExecutor>>>,
}

impl Stm {
    /// Runtime with the default configuration
    pub fn new() -> Self {
        let config = StmConfig::default();
        let counter = Arc::new(GlobalConflictCounter::new());
        let metrics = Arc::new(MetricsRecorder::default());
        let default_executor =
            Self::build_executor(config.default.clone(), &counter, &metrics);
        Stm {
            config,
            counter,
            metrics,
            default_executor,
            families: RwLock::new(FxHashMap::default()),
        }
    }

    /// Runtime for `config`
    ///
    /// # Errors
    /// `InvalidConfig` if the default or any family does not validate.
    pub fn with_config(mut config: StmConfig) -> StmResult<Self> {
        config.validate()?;
        let counter = Arc::new(GlobalConflictCounter::new());
        let metrics = Arc::new(MetricsRecorder::default());
        let default_executor = TxnExecutor::with_metrics(
            config.default.clone(),
            Arc::clone(&counter),
            Arc::clone(&metrics),
        )?;
        info!(
            target: "orecstm::stm",
            families = config.families.len(),
            "STM runtime configured"
        );
        Ok(Stm {
            config,
            counter,
            metrics,
            default_executor,
            families: RwLock::new(FxHashMap::default()),
        })
    }

    /// Runtime whose default family uses `config`
    pub fn with_default_config(config: TxnConfig) -> StmResult<Self> {
        Self::with_config(StmConfig::new(config))
    }

    /// Runtime configured from a TOML document
    pub fn from_toml_str(s: &str) -> StmResult<Self> {
        Self::with_config(StmConfig::from_toml_str(s)?)
    }

    /// Runtime configured from a TOML file
    pub fn from_toml_file(path: &Path) -> StmResult<Self> {
        Self::with_config(StmConfig::from_toml_file(path)?)
    }

    /// Process-wide runtime with the default configuration
    pub fn global() -> &'static Stm {
        &GLOBAL
    }

    fn build_executor(
        config: TxnConfig,
        counter: &Arc<GlobalConflictCounter>,
        metrics: &Arc<MetricsRecorder>,
    ) -> TxnExecutor {
        match TxnExecutor::with_metrics(config, Arc::clone(counter), Arc::clone(metrics)) {
            Ok(executor) => executor,
            Err(e) => panic!("default transaction config must validate: {}", e),
        }
    }

    // === Accessors ===

    /// Runtime configuration
    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Conflict counter shared by every transaction of this runtime
    pub fn conflict_counter(&self) -> &Arc<GlobalConflictCounter> {
        &self.counter
    }

    /// Executions across all executors of this runtime
    pub fn metrics(&self) -> TransactionMetrics {
        self.metrics.snapshot()
    }

    // === Executors ===

    /// Executor for the default family
    pub fn default_executor(&self) -> &TxnExecutor {
        &self.default_executor
    }

    /// Executor for a named family declared in the configuration
    ///
    /// The executor is created on first use and then shared, so the family
    /// keeps its speculative state across calls.
    ///
    /// # Errors
    /// `InvalidConfig` if the family is not declared.
    pub fn family(&self, name: &str) -> StmResult<Arc<TxnExecutor>> {
        if let Some(executor) = self.families.read().get(name) {
            return Ok(Arc::clone(executor));
        }
        let config = self.config.family(name).cloned().ok_or_else(|| {
            StmError::InvalidConfig(format!("unknown transaction family '{}'", name))
        })?;

        let mut families = self.families.write();
        if let Some(executor) = families.get(name) {
            return Ok(Arc::clone(executor));
        }
        let executor = Arc::new(TxnExecutor::with_metrics(
            config,
            Arc::clone(&self.counter),
            Arc::clone(&self.metrics),
        )?);
        families.insert(name.to_string(), Arc::clone(&executor));
        Ok(executor)
    }

    /// A new, unregistered executor for an ad hoc configuration
    pub fn executor(&self, config: TxnConfig) -> StmResult<TxnExecutor> {
        TxnExecutor::with_metrics(config, Arc::clone(&self.counter), Arc::clone(&self.metrics))
    }

    /// A standalone transaction of the default family, for manual control
    pub fn new_transaction(&self) -> Transaction {
        self.default_executor.new_transaction()
    }

    // === Execution ===

    /// Run `body` in the default family until it commits
    pub fn atomic<T, F>(&self, body: F) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        self.default_executor.execute(body)
    }

    /// Read the committed value of a cell
    ///
    /// Spins and backs off per the default family's configuration.
    pub fn atomic_get<V: TxnValue>(&self, cell: &TxnRef<V>) -> StmResult<V> {
        self.default_executor.atomic_get(cell)
    }

    /// Write a cell in its own transaction
    pub fn atomic_set<V: TxnValue>(&self, cell: &TxnRef<V>, value: V) -> StmResult<()> {
        self.atomic(|tx| cell.set(tx, value.clone()))
    }

    /// Write a cell in its own transaction and return the previous value
    pub fn atomic_get_and_set<V: TxnValue>(&self, cell: &TxnRef<V>, value: V) -> StmResult<V> {
        self.atomic(|tx| cell.get_and_set(tx, value.clone()))
    }

    /// Apply `function` to a cell in its own transaction and return the new
    /// value
    pub fn atomic_alter<V, F>(&self, cell: &TxnRef<V>, function: F) -> StmResult<V>
    where
        V: TxnValue,
        F: Fn(&V) -> V,
    {
        self.atomic(|tx| cell.alter(tx, &function))
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Stm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm")
            .field("conflicts", &self.counter.count())
            .field("families", &self.config.families.len())
            .finish()
    }
}
