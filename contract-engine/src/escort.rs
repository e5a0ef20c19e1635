//! Proof Escort Service - Walks funding proofs to a terminal state
//!
//! Periodically refreshes and re-verifies a proof and reports what should
//! happen next, until the proof is confirmed, verification keeps failing,
//! or the caller cancels.

use crate::{
    cancel::CancelToken,
    error::EngineError,
    merkle_verifier::{MerkleProofVerifier, ProofVerification},
    models::{ConfirmationStatus, MerkleProof},
    EngineResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for the escort service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscortConfig {
    /// Default interval between checks
    pub check_interval_secs: u64,
    /// Consecutive verification failures before giving up
    pub max_retries: u32,
}

impl Default for EscortConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            max_retries: 3,
        }
    }
}

/// Where an escorted proof stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofState {
    /// Part of the stored report format. [`ProofEscortService::validate`]
    /// reports a provisional proof as `Confirming`.
    Provisional,
    Confirming,
    Confirmed,
    Failed,
    Unknown,
}

/// Recommended follow-up for an escorted proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    AwaitingConfirmation,
    MonitorContractExecution,
    VerifyProofStatus,
    ManualReviewRequired,
}

/// Escort report for one task's proof
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscortStatus {
    pub task_id: String,
    pub status: ProofState,
    pub last_checked: DateTime<Utc>,
    pub verification: ProofVerification,
    pub next_action: NextAction,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl EscortStatus {
    /// Confirmed and verified; nothing left to escort
    pub fn is_settled(&self) -> bool {
        self.status == ProofState::Confirmed && self.verification.valid
    }
}

/// Proof escort service
pub struct ProofEscortService {
    config: EscortConfig,
    verifier: Arc<MerkleProofVerifier>,
    /// Latest report per task
    statuses: RwLock<HashMap<String, EscortStatus>>,
}

impl ProofEscortService {
    /// Create a new escort service
    pub fn new(config: EscortConfig, verifier: Arc<MerkleProofVerifier>) -> Self {
        Self {
            config,
            verifier,
            statuses: RwLock::new(HashMap::new()),
        }
    }

    /// Verify a proof and map the outcome to a status and next action
    pub async fn validate(&self, task_id: &str, proof: Option<&MerkleProof>) -> EscortStatus {
        let verification = self.verifier.verify_proof(proof).await;

        let (status, next_action) = if verification.unreachable {
            (ProofState::Unknown, NextAction::VerifyProofStatus)
        } else if !verification.valid {
            (ProofState::Failed, NextAction::ManualReviewRequired)
        } else {
            match proof.map(|p| p.confirmation_status) {
                Some(ConfirmationStatus::Provisional) => {
                    (ProofState::Confirming, NextAction::AwaitingConfirmation)
                }
                Some(ConfirmationStatus::Confirmed) => {
                    (ProofState::Confirmed, NextAction::MonitorContractExecution)
                }
                None => (ProofState::Unknown, NextAction::VerifyProofStatus),
            }
        };

        EscortStatus {
            task_id: task_id.to_string(),
            status,
            last_checked: Utc::now(),
            verification,
            next_action,
            retry_count: 0,
            max_retries: self.config.max_retries,
        }
    }

    /// Refresh a proof against the chain
    pub async fn refresh(&self, proof: Option<&MerkleProof>) -> EngineResult<MerkleProof> {
        self.verifier.refresh_proof(proof).await
    }

    /// Validate proofs independently, keeping order and task ids
    pub async fn validate_batch(&self, proofs: &[(String, MerkleProof)]) -> Vec<EscortStatus> {
        let mut statuses = Vec::with_capacity(proofs.len());
        for (task_id, proof) in proofs {
            statuses.push(self.validate(task_id, Some(proof)).await);
        }
        statuses
    }

    /// Latest report recorded by [`monitor`](Self::monitor)
    pub async fn status(&self, task_id: &str) -> Option<EscortStatus> {
        self.statuses.read().await.get(task_id).cloned()
    }

    /// Refresh and re-validate on a timer until the proof is confirmed, fails
    /// `max_retries` times in a row, or `cancel` fires. Ticks where the chain
    /// cannot be reached are reported as `Unknown` and retried.
    pub async fn monitor(
        &self,
        task_id: &str,
        proof: MerkleProof,
        interval: Option<Duration>,
        mut cancel: CancelToken,
    ) -> EngineResult<EscortStatus> {
        let period = interval.unwrap_or(Duration::from_secs(self.config.check_interval_secs.max(1)));
        let mut ticker = tokio::time::interval(period);
        let mut current = proof;
        let mut failures = 0u32;

        info!("Escorting proof {} for task {}", current.tx_id, task_id);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stopped escorting task {}", task_id);
                    return Err(EngineError::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            match self.verifier.refresh_proof(Some(&current)).await {
                Ok(refreshed) => current = refreshed,
                Err(e) if e.is_retryable() => {
                    warn!("Could not refresh proof for task {}: {}", task_id, e)
                }
                Err(e) => return Err(e),
            }

            let mut status = self.validate(task_id, Some(&current)).await;
            if status.verification.unreachable {
                // Outages neither count as failures nor reset the streak
                debug!("Chain unreachable while escorting task {}", task_id);
            } else if status.verification.valid {
                failures = 0;
            } else {
                failures += 1;
            }
            status.retry_count = failures;
            self.statuses
                .write()
                .await
                .insert(task_id.to_string(), status.clone());

            if status.is_settled() {
                info!("Proof for task {} is confirmed", task_id);
                return Ok(status);
            }
            if failures >= self.config.max_retries {
                warn!(
                    "Giving up on task {} after {} failed verifications: {}",
                    task_id,
                    failures,
                    status.verification.error.clone().unwrap_or_default()
                );
                return Ok(status);
            }
            debug!("Task {} proof is {:?}, checking again", task_id, status.status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cancel::cancel_pair,
        chain::InMemoryChainSource,
        merkle_verifier::VerifierConfig,
    };

    fn tx_id(n: u8) -> String {
        hex::encode([n; 32])
    }

    async fn setup() -> (Arc<InMemoryChainSource>, ProofEscortService, MerkleProof) {
        let chain = Arc::new(InMemoryChainSource::new(100));
        chain.mine(&tx_id(1), 101).await;
        chain.mine(&tx_id(2), 101).await;

        let verifier = Arc::new(MerkleProofVerifier::new(VerifierConfig::default(), chain.clone()));
        let proof = verifier
            .build_proof(&tx_id(1), 50_000, "bc1qexample")
            .await
            .unwrap();
        let service = ProofEscortService::new(EscortConfig::default(), verifier);
        (chain, service, proof)
    }

    fn provisional(mut proof: MerkleProof) -> MerkleProof {
        proof.confirmation_status = ConfirmationStatus::Provisional;
        proof.confirmed_at = None;
        proof
    }

    fn broken(mut proof: MerkleProof) -> MerkleProof {
        proof.block_header_merkle_root = "00".repeat(32);
        proof
    }

    #[tokio::test]
    async fn test_validate_maps_states() {
        let (_, service, proof) = setup().await;

        let status = service.validate("task_1", Some(&proof)).await;
        assert_eq!(status.status, ProofState::Confirmed);
        assert_eq!(status.next_action, NextAction::MonitorContractExecution);
        assert!(status.is_settled());

        let status = service.validate("task_1", Some(&provisional(proof.clone()))).await;
        assert_eq!(status.status, ProofState::Confirming);
        assert_eq!(status.next_action, NextAction::AwaitingConfirmation);

        let status = service.validate("task_1", None).await;
        assert_eq!(status.status, ProofState::Failed);
        assert_eq!(status.next_action, NextAction::ManualReviewRequired);
        assert_eq!(status.verification.error.as_deref(), Some("proof is nil"));
        assert_eq!(status.max_retries, 3);
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_ids() {
        let (_, service, proof) = setup().await;
        let batch = vec![
            ("a".to_string(), broken(proof.clone())),
            ("b".to_string(), proof.clone()),
            ("c".to_string(), provisional(proof)),
        ];

        let statuses = service.validate_batch(&batch).await;
        let ids: Vec<&str> = statuses.iter().map(|s| s.task_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(statuses[0].status, ProofState::Failed);
        assert_eq!(statuses[1].status, ProofState::Confirmed);
        assert_eq!(statuses[2].status, ProofState::Confirming);
    }

    #[tokio::test]
    async fn test_refresh_upgrades_provisional_proof() {
        let (_, service, proof) = setup().await;
        let refreshed = service.refresh(Some(&provisional(proof))).await.unwrap();
        assert!(refreshed.is_confirmed());
        assert!(refreshed.confirmed_at.is_some());

        let err = service.refresh(None).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingProof(_)));
    }

    #[tokio::test]
    async fn test_monitor_stops_once_confirmed() {
        let (_, service, proof) = setup().await;
        let (_handle, token) = cancel_pair();

        let status = service
            .monitor("task_1", provisional(proof), Some(Duration::from_millis(10)), token)
            .await
            .unwrap();
        assert!(status.is_settled());
        assert_eq!(service.status("task_1").await.unwrap().status, ProofState::Confirmed);
    }

    #[tokio::test]
    async fn test_monitor_gives_up_after_retries() {
        let (_, service, proof) = setup().await;
        let (_handle, token) = cancel_pair();

        let status = service
            .monitor("task_1", broken(proof), Some(Duration::from_millis(10)), token)
            .await
            .unwrap();
        assert_eq!(status.status, ProofState::Failed);
        assert_eq!(status.next_action, NextAction::ManualReviewRequired);
        assert_eq!(status.retry_count, 3);
    }

    #[tokio::test]
    async fn test_outage_is_unknown_not_failed() {
        let (chain, service, proof) = setup().await;
        chain.set_unavailable(true).await;

        let status = service.validate("task_1", Some(&proof)).await;
        assert_eq!(status.status, ProofState::Unknown);
        assert_eq!(status.next_action, NextAction::VerifyProofStatus);
        assert!(status.verification.unreachable);
    }

    #[tokio::test]
    async fn test_monitor_rides_out_chain_outage() {
        let (chain, service, proof) = setup().await;
        let service = Arc::new(service);
        let (_handle, token) = cancel_pair();
        chain.set_unavailable(true).await;

        let task = tokio::spawn({
            let service = service.clone();
            async move {
                service
                    .monitor("task_1", provisional(proof), Some(Duration::from_millis(10)), token)
                    .await
            }
        });

        // Well past max_retries ticks
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!task.is_finished());
        let during = service.status("task_1").await.unwrap();
        assert_eq!(during.status, ProofState::Unknown);
        assert_eq!(during.retry_count, 0);

        chain.set_unavailable(false).await;
        let status = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(status.is_settled());
        assert_eq!(status.retry_count, 0);
    }

    #[test]
    fn test_stored_provisional_state_parses() {
        let state: ProofState = serde_json::from_str("\"provisional\"").unwrap();
        assert_eq!(state, ProofState::Provisional);
    }

    #[tokio::test]
    async fn test_monitor_cancellation() {
        let (_, service, proof) = setup().await;
        let service = Arc::new(service);
        let (handle, token) = cancel_pair();

        let task = tokio::spawn({
            let service = service.clone();
            async move {
                service
                    .monitor("task_1", broken(proof), Some(Duration::from_secs(3600)), token)
                    .await
            }
        });

        // First tick fires immediately and records one failure
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(service.status("task_1").await.unwrap().retry_count, 1);
    }
}
