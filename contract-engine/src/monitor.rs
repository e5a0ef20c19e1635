//! Confirmation Monitor - Tracks transactions until they reach finality
//!
//! Each tracked transaction is polled against the chain data source on its
//! own schedule. Status changes are fanned out to registered handlers and,
//! optionally, to a bounded channel. The table is only reachable through
//! this type; readers always get copies.

use crate::{
    cancel::CancelToken,
    chain::ChainDataSource,
    error::{ChainError, EngineError},
    models::TransactionType,
    EngineResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Configuration for the confirmation monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Base polling interval per transaction
    pub check_interval_secs: u64,
    /// Confirmations needed before a transaction counts as final
    pub required_confirmations: u32,
    /// How long a transaction may stay unseen on chain before it is failed
    pub failure_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 120,
            required_confirmations: 6,
            failure_timeout_secs: 24 * 60 * 60,
        }
    }
}

impl MonitorConfig {
    fn interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.check_interval_secs.max(1) as i64)
    }
}

/// Monitoring status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    /// Not yet in a block
    Pending,
    /// In a block, below the required confirmations
    Confirming,
    /// At or above the required confirmations
    Confirmed,
    /// Never appeared on chain within the failure timeout
    Failed,
}

impl MonitorStatus {
    fn classify(confirmations: u32, required: u32) -> Self {
        if confirmations >= required {
            Self::Confirmed
        } else if confirmations > 0 {
            Self::Confirming
        } else {
            Self::Pending
        }
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirming => "confirming",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A transaction tracked by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredTransaction {
    pub tx_id: String,
    pub contract_id: String,
    pub tx_type: TransactionType,
    pub status: MonitorStatus,
    pub required_confirmations: u32,
    pub current_confirmations: u32,
    pub block_height: Option<u64>,
    pub amount_sats: u64,
    pub from_address: String,
    pub to_address: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_checked: DateTime<Utc>,
    pub next_check: DateTime<Utc>,
}

impl MonitoredTransaction {
    /// A pending transaction; timestamps are stamped by [`ConfirmationMonitor::add`]
    pub fn new<S: Into<String>>(
        tx_id: S,
        contract_id: S,
        tx_type: TransactionType,
        amount_sats: u64,
        required_confirmations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            tx_id: tx_id.into(),
            contract_id: contract_id.into(),
            tx_type,
            status: MonitorStatus::Pending,
            required_confirmations,
            current_confirmations: 0,
            block_height: None,
            amount_sats,
            from_address: String::new(),
            to_address: String::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            last_checked: now,
            next_check: now,
        }
    }

    pub fn with_addresses<S: Into<String>>(mut self, from_address: S, to_address: S) -> Self {
        self.from_address = from_address.into();
        self.to_address = to_address.into();
        self
    }
}

/// Kind of monitor event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TxStatusChanged,
    TxFullyConfirmed,
    TxFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TxStatusChanged => "tx_status_changed",
            Self::TxFullyConfirmed => "tx_fully_confirmed",
            Self::TxFailed => "tx_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by the monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub tx_id: String,
    pub contract_id: String,
    pub tx_type: TransactionType,
    pub block_height: Option<u64>,
    pub confirmations: u32,
    pub data: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// Which events a handler receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Kind(EventKind),
    /// Every event, after the kind-specific handlers
    All,
}

/// Receives monitor events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &MonitorEvent);
}

/// Adapter turning a plain closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&MonitorEvent) + Send + Sync,
{
    async fn handle(&self, event: &MonitorEvent) {
        (self.0)(event)
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&MonitorEvent) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Polls the chain for every tracked transaction
pub struct ConfirmationMonitor {
    config: MonitorConfig,
    chain: Arc<dyn ChainDataSource>,
    transactions: RwLock<HashMap<String, MonitoredTransaction>>,
    handlers: RwLock<Vec<(Subscription, Arc<dyn EventHandler>)>>,
    event_sink: RwLock<Option<mpsc::Sender<MonitorEvent>>>,
}

impl ConfirmationMonitor {
    /// Create a new confirmation monitor
    pub fn new(config: MonitorConfig, chain: Arc<dyn ChainDataSource>) -> Self {
        Self {
            config,
            chain,
            transactions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            event_sink: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start tracking a transaction
    pub async fn add(&self, mut tx: MonitoredTransaction) -> EngineResult<()> {
        if tx.tx_id.trim().is_empty() {
            return Err(EngineError::validation("transaction id cannot be empty"));
        }

        let now = Utc::now();
        tx.created_at = now;
        tx.last_checked = now;
        tx.next_check = now + self.config.interval();

        info!(
            "Monitoring {} transaction {} for contract {}",
            tx.tx_type, tx.tx_id, tx.contract_id
        );
        self.transactions.write().await.insert(tx.tx_id.clone(), tx);
        Ok(())
    }

    /// Copy of one tracked transaction
    pub async fn get(&self, tx_id: &str) -> EngineResult<MonitoredTransaction> {
        self.transactions
            .read()
            .await
            .get(tx_id)
            .cloned()
            .ok_or_else(|| EngineError::not_monitored(tx_id))
    }

    /// Stop tracking a transaction
    pub async fn remove(&self, tx_id: &str) -> EngineResult<MonitoredTransaction> {
        let removed = self
            .transactions
            .write()
            .await
            .remove(tx_id)
            .ok_or_else(|| EngineError::not_monitored(tx_id))?;
        debug!("Stopped monitoring {}", tx_id);
        Ok(removed)
    }

    /// Deep copy of the tracked set
    pub async fn snapshot(&self) -> HashMap<String, MonitoredTransaction> {
        self.transactions.read().await.clone()
    }

    /// Register a handler; handlers run in registration order
    pub async fn register_handler(&self, subscription: Subscription, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push((subscription, handler));
    }

    /// Also deliver every event to `sink`. Full or closed channels drop the event.
    pub async fn set_event_sink(&self, sink: mpsc::Sender<MonitorEvent>) {
        *self.event_sink.write().await = Some(sink);
    }

    /// Poll every transaction that is due now
    pub async fn poll_once(&self) -> Vec<MonitorEvent> {
        self.poll_due(Utc::now()).await
    }

    /// Poll every transaction whose next check is at or before `now`, then
    /// dispatch the resulting events. Returns the dispatched events.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Vec<MonitorEvent> {
        let due: Vec<MonitoredTransaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| tx.status != MonitorStatus::Failed && tx.next_check <= now)
            .cloned()
            .collect();

        let mut events = Vec::new();
        for tx in due {
            // Chain calls happen without holding the table lock
            let lookup = self.chain.get_transaction(&tx.tx_id).await;
            events.extend(self.apply_lookup(&tx.tx_id, lookup, now).await);
        }

        for event in &events {
            self.dispatch(event).await;
        }
        events
    }

    async fn apply_lookup(
        &self,
        tx_id: &str,
        lookup: Result<crate::chain::ChainTransaction, ChainError>,
        now: DateTime<Utc>,
    ) -> Vec<MonitorEvent> {
        let mut transactions = self.transactions.write().await;
        // Removed while we were talking to the chain
        let Some(tx) = transactions.get_mut(tx_id) else {
            return Vec::new();
        };
        tx.last_checked = now;

        let previous = tx.status;
        match lookup {
            Ok(chain_tx) => {
                tx.current_confirmations = chain_tx.confirmations;
                tx.block_height = chain_tx.block_height;
                tx.status = MonitorStatus::classify(chain_tx.confirmations, tx.required_confirmations);
            }
            Err(e) if e.is_not_found() => {
                let timeout = ChronoDuration::seconds(self.config.failure_timeout_secs as i64);
                if now - tx.created_at >= timeout {
                    warn!("Transaction {} not seen on chain within timeout", tx_id);
                    tx.status = MonitorStatus::Failed;
                }
            }
            Err(e) => {
                warn!("Failed to check transaction {}: {}", tx_id, e);
            }
        }

        let interval = self.config.interval();
        tx.next_check = now
            + match tx.status {
                MonitorStatus::Pending => interval / 2,
                MonitorStatus::Confirming | MonitorStatus::Failed => interval,
                MonitorStatus::Confirmed => interval * 5,
            };

        let mut events = Vec::new();
        if tx.status != previous {
            debug!("Transaction {} moved {} -> {}", tx_id, previous, tx.status);
            let mut data = BTreeMap::new();
            data.insert("old_status".to_string(), previous.to_string());
            data.insert("new_status".to_string(), tx.status.to_string());
            events.push(Self::event(EventKind::TxStatusChanged, tx, data, now));

            match tx.status {
                MonitorStatus::Confirmed => {
                    info!(
                        "Transaction {} fully confirmed with {} confirmations",
                        tx_id, tx.current_confirmations
                    );
                    events.push(Self::event(EventKind::TxFullyConfirmed, tx, BTreeMap::new(), now));
                }
                MonitorStatus::Failed => {
                    let mut data = BTreeMap::new();
                    data.insert("reason".to_string(), "not seen on chain".to_string());
                    events.push(Self::event(EventKind::TxFailed, tx, data, now));
                }
                _ => {}
            }
        }
        events
    }

    fn event(
        kind: EventKind,
        tx: &MonitoredTransaction,
        data: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
    ) -> MonitorEvent {
        MonitorEvent {
            kind,
            tx_id: tx.tx_id.clone(),
            contract_id: tx.contract_id.clone(),
            tx_type: tx.tx_type,
            block_height: tx.block_height,
            confirmations: tx.current_confirmations,
            data,
            timestamp,
        }
    }

    async fn dispatch(&self, event: &MonitorEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let registered = self.handlers.read().await;
            let specific = registered
                .iter()
                .filter(|(sub, _)| *sub == Subscription::Kind(event.kind));
            let wildcard = registered.iter().filter(|(sub, _)| *sub == Subscription::All);
            specific.chain(wildcard).map(|(_, h)| h.clone()).collect()
        };

        for handler in handlers {
            handler.handle(event).await;
        }

        if let Some(sink) = self.event_sink.read().await.as_ref() {
            match sink.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Event sink full, dropping {} for {}", event.kind, event.tx_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Event sink closed, dropping {} for {}", event.kind, event.tx_id);
                }
            }
        }
    }

    /// Poll on a timer until cancelled
    pub async fn run(&self, mut cancel: CancelToken) -> EngineResult<()> {
        let tick = Duration::from_secs((self.config.check_interval_secs / 2).max(1));
        let mut ticker = tokio::time::interval(tick);
        info!("Confirmation monitor started, ticking every {:?}", tick);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Confirmation monitor stopped");
                    return Err(EngineError::Cancelled);
                }
                _ = ticker.tick() => {
                    let events = self.poll_once().await;
                    if !events.is_empty() {
                        debug!("Monitor tick produced {} events", events.len());
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime
    pub fn start(self: Arc<Self>, cancel: CancelToken) -> JoinHandle<EngineResult<()>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
