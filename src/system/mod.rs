use crate::{
    clock::SharedClock,
    data::{DataManager, DataProvider},
    error::StrateQueueError,
    execution::{
        broker::{BrokerAdapter, BrokerCapabilities},
        GatewayConfig, GatewayHandle, OrderGateway, OrderKind,
    },
    portfolio::AggregateLedger,
    runner::{
        RunnerCommand, RunnerConfig, RunnerHandle, StopOptions, StrategyRunner, StrategyStatus,
        TradeMode,
    },
    statistic::StatisticsSnapshot,
    strategy::{registry::EngineInfo, signal::SignalKind, EngineParams, EngineRegistry},
    system::{
        control::DeployValidateResponse,
        deploy::{Allocation, DeploySpec},
        error::ConfigError,
    },
    types::{Granularity, StrategyId, Symbol},
    Sequence,
};
use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Credential store persistence.
pub mod config;

/// Control-plane request/response contract types.
pub mod control;

/// Deploy specification and allocation arithmetic.
pub mod deploy;

/// Deploy-spec and configuration errors.
pub mod error;

pub use config::CredentialStore;

/// Registry capacity of the snapshot broadcast channel.
const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Authoritative record of one deployed strategy.
///
/// Lifecycle fields (`status`, `last_signal_*`) are merged from the runner's published view
/// at read time; everything else is fixed at deploy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StrategyRecord {
    pub id: StrategyId,
    pub name: String,
    pub source_path: PathBuf,
    pub engine: String,
    pub symbols: Vec<Symbol>,
    pub granularity: Granularity,
    pub lookback: usize,
    pub allocation: Allocation,
    /// Allocation normalised to account currency at deploy time; constant thereafter.
    pub allocation_cash: Decimal,
    pub mode: TradeMode,
    pub data_source: String,
    pub broker: String,
    pub status: StrategyStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_signal_time: Option<DateTime<Utc>>,
    pub last_signal_kind: Option<SignalKind>,
    pub params: EngineParams,
}

/// Consistent registry snapshot published after every supervisor mutation.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistrySnapshot {
    /// Monotonic snapshot sequence; consumers drop anything older than what they hold.
    pub sequence: u64,
    pub time: DateTime<Utc>,
    pub strategies: Vec<StrategyRecord>,
}

struct BrokerEntry {
    adapter: Arc<dyn BrokerAdapter>,
    capabilities: BrokerCapabilities,
    gateway: GatewayHandle,
    task: tokio::task::JoinHandle<Result<(), crate::error::InvariantViolation>>,
}

struct StrategyEntry {
    record: StrategyRecord,
    handle: RunnerHandle,
}

/// Control plane of the runtime: the registry of strategy runners and the only writer
/// to it.
///
/// Deploy validates the spec (engine resolvable, broker capable, allocation fits remaining
/// unallocated equity) and starts the runner. Readers obtain consistent snapshots through
/// the broadcast channel or the query methods; stopped and errored strategies remain in
/// the registry with their last snapshot until explicitly removed.
pub struct Supervisor {
    clock: SharedClock,
    data: DataManager,
    engines: EngineRegistry,
    brokers: HashMap<String, BrokerEntry>,
    registry: IndexMap<StrategyId, StrategyEntry>,
    snapshot_tx: broadcast::Sender<RegistrySnapshot>,
    snapshot_sequence: Sequence,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("brokers", &self.brokers.keys().collect::<Vec<_>>())
            .field("strategies", &self.registry.len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(clock: SharedClock) -> Self {
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            data: DataManager::new(clock.clone()),
            clock,
            engines: EngineRegistry::with_builtin(),
            brokers: HashMap::new(),
            registry: IndexMap::new(),
            snapshot_tx,
            snapshot_sequence: Sequence::default(),
        }
    }

    /// Replace the engine registry (custom evaluator sets).
    pub fn with_engines(mut self, engines: EngineRegistry) -> Self {
        self.engines = engines;
        self
    }

    pub fn data(&self) -> &DataManager {
        &self.data
    }

    pub fn register_provider(&self, provider: Arc<dyn DataProvider>) {
        self.data.register_provider(provider);
    }

    /// Register a broker adapter and spawn its gateway task.
    pub fn register_broker(&mut self, adapter: Arc<dyn BrokerAdapter>) {
        let name = adapter.name().to_owned();
        let capabilities = adapter.capabilities();
        let (gateway, handle, command_rx) = OrderGateway::new(
            Arc::clone(&adapter),
            self.clock.clone(),
            GatewayConfig::default(),
        );
        let task = tokio::spawn(gateway.run(command_rx));

        info!(broker = %name, "broker registered");
        self.brokers.insert(
            name,
            BrokerEntry {
                adapter,
                capabilities,
                gateway: handle,
                task,
            },
        );
    }

    /// Engines listing for the control plane.
    pub fn engines(&self) -> Vec<EngineInfo> {
        self.engines.engines()
    }

    /// Non-mutating deploy validation: every failed check becomes one error string.
    pub async fn validate(&self, spec: &DeploySpec) -> DeployValidateResponse {
        let errors = match self.check_spec(spec).await {
            Ok(_) => Vec::new(),
            Err(err) => vec![err.to_string()],
        };
        DeployValidateResponse {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Validate the spec and start its runner. The only write path into the registry.
    pub async fn deploy(&mut self, spec: DeploySpec) -> Result<StrategyId, ConfigError> {
        let id = StrategyId::new(spec.resolved_id());
        if self.registry.contains_key(&id) {
            return Err(ConfigError::DuplicateStrategyId(id));
        }

        let allocation_cash = self.check_spec(&spec).await?;
        let engine = self.resolve_engine_name(&spec)?;
        let evaluator = self
            .engines
            .resolve(&engine, &spec.params)
            .map_err(|err| ConfigError::EngineInit(err.to_string()))?;

        let broker = self
            .brokers
            .get(&spec.broker)
            .expect("broker checked by check_spec");
        let gateway = match spec.mode {
            TradeMode::Signals => None,
            TradeMode::Paper | TradeMode::Live => Some(broker.gateway.clone()),
        };
        let capabilities = broker.capabilities.clone();

        let mut runner_config = RunnerConfig::new(
            id.clone(),
            spec.symbols.clone(),
            spec.data_source.clone(),
            spec.granularity,
            spec.lookback,
            spec.mode,
            allocation_cash,
        );
        runner_config.allow_short = spec.allow_short;
        runner_config.duration = spec
            .duration_mins
            .map(|minutes| TimeDelta::minutes(minutes as i64));
        runner_config.params = spec.params.clone();

        let handle = StrategyRunner::spawn(
            runner_config,
            self.clock.clone(),
            self.data.clone(),
            evaluator,
            capabilities,
            gateway,
        )
        .map_err(|_| ConfigError::BrokerIncapable("order gateway unavailable".to_owned()))?;

        let now = self.clock.now();
        let record = StrategyRecord {
            id: id.clone(),
            name: id.to_string(),
            source_path: spec.strategy.clone(),
            engine,
            symbols: spec.symbols.clone(),
            granularity: spec.granularity,
            lookback: spec.lookback,
            allocation: spec.allocation,
            allocation_cash,
            mode: spec.mode,
            data_source: spec.data_source.clone(),
            broker: spec.broker.clone(),
            status: StrategyStatus::Initializing,
            created_at: now,
            started_at: Some(now),
            last_signal_time: None,
            last_signal_kind: None,
            params: spec.params,
        };

        info!(%id, "strategy deployed");
        self.registry
            .insert(id.clone(), StrategyEntry { record, handle });
        self.publish();
        Ok(id)
    }

    /// All spec checks except the duplicate-id check; returns the normalised allocation.
    async fn check_spec(&self, spec: &DeploySpec) -> Result<Decimal, ConfigError> {
        if !spec.strategy.exists() {
            return Err(ConfigError::StrategyFileMissing(
                spec.strategy.display().to_string(),
            ));
        }
        if spec.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if spec.lookback == 0 {
            return Err(ConfigError::InvalidLookback);
        }

        let engine = self.resolve_engine_name(spec)?;
        if !self.engines.contains(&engine) {
            return Err(ConfigError::UnknownEngine(engine));
        }

        if !self.data.provider_names().contains(&spec.data_source) {
            return Err(ConfigError::UnknownProvider(spec.data_source.clone()));
        }

        let broker = self
            .brokers
            .get(&spec.broker)
            .ok_or_else(|| ConfigError::UnknownBroker(spec.broker.clone()))?;

        if spec.mode != TradeMode::Signals && !broker.capabilities.supports(OrderKind::Market) {
            return Err(ConfigError::BrokerIncapable(format!(
                "{} does not support market orders",
                spec.broker
            )));
        }

        spec.allocation
            .validate()
            .map_err(ConfigError::InvalidAllocation)?;

        let account = broker
            .adapter
            .account()
            .await
            .map_err(|err| ConfigError::AccountUnavailable(err.to_string()))?;

        if let Allocation::Fraction(fraction) = spec.allocation {
            let active_fraction: Decimal = self
                .active_entries(&spec.broker)
                .filter_map(|entry| match entry.record.allocation {
                    Allocation::Fraction(existing) => Some(existing),
                    Allocation::Notional { .. } => None,
                })
                .sum();
            if active_fraction + fraction > Decimal::ONE {
                return Err(ConfigError::InvalidAllocation(format!(
                    "fraction {fraction} pushes active total {active_fraction} above 1.0"
                )));
            }
        }

        let requested = spec.allocation.to_cash(account.equity);
        let allocated: Decimal = self
            .active_entries(&spec.broker)
            .map(|entry| entry.record.allocation_cash)
            .sum();
        let available = account.equity - allocated;
        if requested > available {
            return Err(ConfigError::AllocationExceedsEquity {
                requested: requested.to_string(),
                available: available.to_string(),
            });
        }

        Ok(requested)
    }

    fn resolve_engine_name(&self, spec: &DeploySpec) -> Result<String, ConfigError> {
        match &spec.engine {
            Some(engine) => {
                if self.engines.contains(engine) {
                    Ok(engine.clone())
                } else {
                    Err(ConfigError::UnknownEngine(engine.clone()))
                }
            }
            None => {
                let engines = self.engines.engines();
                match engines.as_slice() {
                    [only] => Ok(only.name.clone()),
                    _ => Err(ConfigError::EngineNotSpecified(format!(
                        "{} engines registered",
                        engines.len()
                    ))),
                }
            }
        }
    }

    /// Entries whose runner has not reached a terminal state, for one broker.
    fn active_entries<'a>(
        &'a self,
        broker: &'a str,
    ) -> impl Iterator<Item = &'a StrategyEntry> + 'a {
        self.registry.values().filter(move |entry| {
            entry.record.broker == broker && !entry.handle.view().status.is_terminal()
        })
    }

    fn merged_record(entry: &StrategyEntry) -> StrategyRecord {
        let view = entry.handle.view();
        let mut record = entry.record.clone();
        record.status = view.status;
        record.last_signal_time = view.last_signal.as_ref().map(|signal| signal.time);
        record.last_signal_kind = view.last_signal.as_ref().map(|signal| signal.value);
        record
    }

    pub fn list(&self) -> Vec<StrategyRecord> {
        self.registry.values().map(Self::merged_record).collect()
    }

    pub fn get(&self, id: &StrategyId) -> Option<StrategyRecord> {
        self.registry.get(id).map(Self::merged_record)
    }

    /// Last known statistics snapshot; available even after the strategy stopped.
    pub fn statistics(&self, id: &StrategyId) -> Option<StatisticsSnapshot> {
        self.registry
            .get(id)
            .map(|entry| entry.handle.view().statistics)
    }

    /// Current sub-ledger snapshot for one strategy.
    pub fn ledger(&self, id: &StrategyId) -> Option<crate::portfolio::SubLedger> {
        self.registry.get(id).map(|entry| entry.handle.view().ledger)
    }

    /// Aggregate ledger across every deployed strategy.
    pub fn aggregate(&self) -> AggregateLedger {
        let ledgers: Vec<_> = self
            .registry
            .values()
            .map(|entry| entry.handle.view().ledger)
            .collect();
        AggregateLedger::sum(ledgers.iter())
    }

    pub fn pause(&self, id: &StrategyId) -> Result<(), ConfigError> {
        self.command(id, RunnerCommand::Pause)
    }

    pub fn resume(&self, id: &StrategyId) -> Result<(), ConfigError> {
        self.command(id, RunnerCommand::Resume)
    }

    /// Stop a strategy. Stopping an already-stopped strategy succeeds.
    pub fn stop(&self, id: &StrategyId, options: StopOptions) -> Result<(), ConfigError> {
        self.command(id, RunnerCommand::Stop(options))
    }

    fn command(&self, id: &StrategyId, command: RunnerCommand) -> Result<(), ConfigError> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ConfigError::UnknownStrategy(id.clone()))?;

        if entry.handle.send(command).is_err() {
            // Runner already finished; commands against terminal strategies are no-ops
            warn!(%id, ?command, "command for finished runner ignored");
        }
        Ok(())
    }

    /// Remove a terminal strategy from the registry.
    pub fn remove(&mut self, id: &StrategyId) -> Result<(), ConfigError> {
        let entry = self
            .registry
            .get(id)
            .ok_or_else(|| ConfigError::UnknownStrategy(id.clone()))?;
        if !entry.handle.view().status.is_terminal() {
            return Err(ConfigError::StrategyStillActive(id.clone()));
        }

        self.registry.shift_remove(id);
        self.publish();
        Ok(())
    }

    /// Subscribe to registry snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistrySnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self) {
        let snapshot = RegistrySnapshot {
            sequence: self.snapshot_sequence.fetch_next(),
            time: self.clock.now(),
            strategies: self.list(),
        };
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Gracefully stop every strategy, then the gateways.
    pub async fn shutdown(mut self) -> Result<(), StrateQueueError> {
        info!("Supervisor shutting down");

        for entry in self.registry.values() {
            let _ = entry.handle.send(RunnerCommand::Stop(StopOptions::default()));
        }
        for (id, entry) in self.registry.drain(..) {
            match entry.handle.task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%id, %err, "runner finished with error"),
                Err(err) => warn!(%id, %err, "runner task panicked"),
            }
        }

        for (name, broker) in self.brokers.drain() {
            // Dropping the gateway handle closes its command channel
            drop(broker.gateway);
            match broker.task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(StrateQueueError::InvariantViolation(err)),
                Err(err) => warn!(broker = %name, %err, "gateway task panicked"),
            }
        }

        Ok(())
    }
}

/// Persist an uploaded strategy file into `dir`, returning the stored path.
pub fn persist_uploaded_strategy(
    dir: &Path,
    file_name: &str,
    contents: &[u8],
) -> Result<PathBuf, ConfigError> {
    std::fs::create_dir_all(dir)
        .map_err(|err| ConfigError::Upload(format!("create {}: {err}", dir.display())))?;
    let path = dir.join(file_name);
    std::fs::write(&path, contents)
        .map_err(|err| ConfigError::Upload(format!("write {}: {err}", path.display())))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uploaded_strategy_is_persisted() {
        let dir = std::env::temp_dir().join(format!("stratequeue-upload-{}", uuid::Uuid::new_v4()));

        let path = persist_uploaded_strategy(&dir, "momentum.py", b"def next(bar): pass\n").unwrap();
        assert_eq!(path, dir.join("momentum.py"));
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "def next(bar): pass\n"
        );

        let _ = std::fs::remove_dir_all(dir);
    }
}
