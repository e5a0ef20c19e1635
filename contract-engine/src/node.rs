//! Contract Node - Wires the engines together and runs the background loop
//!
//! The node owns one instance of every component over a shared chain data
//! source, subscribes the escrow engine to the confirmation monitor, and
//! manages the monitor's polling task.

use crate::{
    cancel::{cancel_pair, CancelHandle},
    chain::{ChainDataSource, EsploraChainSource},
    config::NodeConfig,
    dispute_engine::DisputeEngine,
    error::EngineError,
    escort::ProofEscortService,
    escrow_engine::EscrowEngine,
    merkle_verifier::MerkleProofVerifier,
    monitor::ConfirmationMonitor,
    script_validator::ScriptValidator,
    EngineResult,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{info, warn};

/// Node health status
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub tip_height: Option<u64>,
    pub monitored_transactions: usize,
    pub pending_transitions: usize,
    pub monitor_running: bool,
    pub timestamp: DateTime<Utc>,
}

/// Main contract node that coordinates all components
pub struct ContractNode {
    config: NodeConfig,
    chain: Arc<dyn ChainDataSource>,
    script_validator: Arc<ScriptValidator>,
    verifier: Arc<MerkleProofVerifier>,
    monitor: Arc<ConfirmationMonitor>,
    escrow_engine: Arc<EscrowEngine>,
    dispute_engine: Arc<DisputeEngine>,
    escort: Arc<ProofEscortService>,
    monitor_task: Mutex<Option<(CancelHandle, JoinHandle<EngineResult<()>>)>>,
}

impl ContractNode {
    /// Create a node over an explicit chain data source
    pub async fn new(config: NodeConfig, chain: Arc<dyn ChainDataSource>) -> EngineResult<Self> {
        info!("Initializing contract node with all components");

        let script_validator = Arc::new(ScriptValidator::new(config.script.clone()));
        let verifier = Arc::new(MerkleProofVerifier::new(config.verifier.clone(), chain.clone()));
        let monitor = Arc::new(ConfirmationMonitor::new(config.monitor.clone(), chain.clone()));

        let escrow_engine = EscrowEngine::new(
            config.escrow.clone(),
            config.chain.network,
            script_validator.clone(),
            verifier.clone(),
            monitor.clone(),
        )
        .await;
        let dispute_engine = Arc::new(DisputeEngine::new(
            config.dispute.clone(),
            script_validator.clone(),
            verifier.clone(),
        ));
        let escort = Arc::new(ProofEscortService::new(config.escort.clone(), verifier.clone()));

        info!("Contract node initialized successfully");

        Ok(Self {
            config,
            chain,
            script_validator,
            verifier,
            monitor,
            escrow_engine,
            dispute_engine,
            escort,
            monitor_task: Mutex::new(None),
        })
    }

    /// Create a node backed by the configured Esplora endpoint
    pub async fn from_config(config: NodeConfig) -> EngineResult<Self> {
        let chain: Arc<dyn ChainDataSource> = Arc::new(EsploraChainSource::new(&config.chain)?);
        Self::new(config, chain).await
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn script_validator(&self) -> &Arc<ScriptValidator> {
        &self.script_validator
    }

    pub fn verifier(&self) -> &Arc<MerkleProofVerifier> {
        &self.verifier
    }

    pub fn monitor(&self) -> &Arc<ConfirmationMonitor> {
        &self.monitor
    }

    pub fn escrow_engine(&self) -> &Arc<EscrowEngine> {
        &self.escrow_engine
    }

    pub fn dispute_engine(&self) -> &Arc<DisputeEngine> {
        &self.dispute_engine
    }

    pub fn escort(&self) -> &Arc<ProofEscortService> {
        &self.escort
    }

    /// Start the confirmation monitor's polling loop
    pub async fn start(&self) -> EngineResult<()> {
        let mut task = self.monitor_task.lock().await;
        if task.is_some() {
            return Err(EngineError::internal("Confirmation monitor is already running"));
        }

        let (handle, token) = cancel_pair();
        let join = self.monitor.clone().start(token);
        *task = Some((handle, join));

        info!("Contract node started");
        Ok(())
    }

    /// Health check for the contract node
    pub async fn health_check(&self) -> EngineResult<NodeHealth> {
        let mut issues = Vec::new();

        let tip_height = match self.chain.get_tip_height().await {
            Ok(height) => Some(height),
            Err(e) => {
                issues.push(format!("Chain data source error: {}", e));
                None
            }
        };

        let monitor_running = match self.monitor_task.lock().await.as_ref() {
            Some((_, join)) if join.is_finished() => {
                issues.push("Confirmation monitor stopped unexpectedly".to_string());
                false
            }
            Some(_) => true,
            None => false,
        };

        Ok(NodeHealth {
            healthy: issues.is_empty(),
            issues,
            tip_height,
            monitored_transactions: self.monitor.snapshot().await.len(),
            pending_transitions: self.escrow_engine.pending_count().await,
            monitor_running,
            timestamp: Utc::now(),
        })
    }

    /// Stop background work and wait for it to finish
    pub async fn shutdown(&self) -> EngineResult<()> {
        info!("Shutting down contract node");

        if let Some((handle, join)) = self.monitor_task.lock().await.take() {
            handle.cancel();
            match join.await {
                Ok(Err(EngineError::Cancelled)) | Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Confirmation monitor exited with error: {}", e),
                Err(e) => warn!("Confirmation monitor task failed: {}", e),
            }
        }

        info!("Contract node shutdown complete");
        Ok(())
    }
}
