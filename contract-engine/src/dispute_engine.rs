//! Dispute Engine - Evidence, arbitrator voting and resolution
//!
//! Disputes move `initiated → evidence_collection → voting → completed`.
//! Evidence that refers to the chain (transaction proofs, signatures) is
//! checked with the proof verifier and script validator when submitted;
//! the result is recorded on the evidence rather than rejecting it.

use crate::{
    error::EngineError,
    merkle_verifier::MerkleProofVerifier,
    models::{
        generate_id, AppealRequest, ArbitrationVote, Arbitrator, Dispute, DisputeEvidence,
        DisputeResolutionResult, DisputeStatus, DisputeType, EvidenceType, MerkleProof,
        VoteDecision,
    },
    script_validator::{is_valid_hex, ScriptValidator},
    EngineResult,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Weighted sums closer than this count as a tie
const TIE_EPSILON: f64 = 0.001;

/// Configuration for the dispute engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisputeEngineConfig {
    /// Evidence window after a dispute is filed
    pub dispute_window_days: i64,
    /// Appeal window after a resolution
    pub appeal_window_days: i64,
    /// Arbitrators assigned to each dispute
    pub panel_size: usize,
    /// Votes needed before a dispute can be resolved
    pub min_votes: usize,
}

impl Default for DisputeEngineConfig {
    fn default() -> Self {
        Self {
            dispute_window_days: 7,
            appeal_window_days: 14,
            panel_size: 3,
            min_votes: 3,
        }
    }
}

/// Dispute filing request
#[derive(Debug, Clone)]
pub struct CreateDisputeRequest {
    pub dispute_id: String,
    pub contract_id: String,
    pub initiator: String,
    pub respondent: String,
    pub dispute_type: String,
    pub description: String,
    pub disputed_amount_sats: u64,
}

/// Evidence submission
#[derive(Debug, Clone, Default)]
pub struct EvidenceSubmission {
    pub evidence_type: String,
    pub content: String,
    pub metadata: BTreeMap<String, String>,
    /// Defaults to 1.0
    pub weight: Option<f64>,
}

/// Arbitrator vote submission
#[derive(Debug, Clone)]
pub struct VoteSubmission {
    pub decision: String,
    pub reason: String,
    pub evidence_ids: Vec<String>,
    pub confidence: f64,
}

/// Main dispute engine
pub struct DisputeEngine {
    config: DisputeEngineConfig,
    validator: Arc<ScriptValidator>,
    verifier: Arc<MerkleProofVerifier>,
    /// In-memory dispute storage
    disputes: RwLock<HashMap<String, Dispute>>,
    /// Registered arbitrators by id
    arbitrators: RwLock<HashMap<String, Arbitrator>>,
}

impl DisputeEngine {
    /// Create a new dispute engine
    pub fn new(
        config: DisputeEngineConfig,
        validator: Arc<ScriptValidator>,
        verifier: Arc<MerkleProofVerifier>,
    ) -> Self {
        Self {
            config,
            validator,
            verifier,
            disputes: RwLock::new(HashMap::new()),
            arbitrators: RwLock::new(HashMap::new()),
        }
    }

    /// File a new dispute and assign its arbitrator panel
    pub async fn create_dispute(&self, request: CreateDisputeRequest) -> EngineResult<Dispute> {
        self.validate_dispute_request(&request)?;
        let dispute_type: DisputeType = request.dispute_type.parse()?;

        let panel = self
            .select_panel(&request.initiator, &request.respondent)
            .await;
        if panel.len() < self.config.panel_size {
            warn!(
                "Dispute {} has {} of {} arbitrators",
                request.dispute_id,
                panel.len(),
                self.config.panel_size
            );
        }

        let now = Utc::now();
        let dispute = Dispute {
            dispute_id: request.dispute_id,
            contract_id: request.contract_id,
            initiator: request.initiator,
            respondent: request.respondent,
            dispute_type,
            description: request.description,
            disputed_amount_sats: request.disputed_amount_sats,
            status: DisputeStatus::Initiated,
            evidence: Vec::new(),
            arbitrators: panel,
            votes: BTreeMap::new(),
            resolution: None,
            appeals: Vec::new(),
            created_at: now,
            deadline: now + Duration::days(self.config.dispute_window_days),
            resolved_at: None,
        };

        let mut disputes = self.disputes.write().await;
        if disputes.contains_key(&dispute.dispute_id) {
            return Err(EngineError::validation(format!(
                "Dispute {} already exists",
                dispute.dispute_id
            )));
        }
        disputes.insert(dispute.dispute_id.clone(), dispute.clone());

        info!(
            "Created {} dispute: {} on contract {}",
            dispute.dispute_type, dispute.dispute_id, dispute.contract_id
        );
        Ok(dispute)
    }

    fn validate_dispute_request(&self, request: &CreateDisputeRequest) -> EngineResult<()> {
        let required = [
            ("dispute id", &request.dispute_id),
            ("contract id", &request.contract_id),
            ("initiator", &request.initiator),
            ("respondent", &request.respondent),
            ("description", &request.description),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!("Dispute {} cannot be empty", field)));
            }
        }

        if request.initiator == request.respondent {
            return Err(EngineError::validation(
                "Initiator and respondent must be different parties",
            ));
        }

        Ok(())
    }

    /// Highest-reputation active arbitrators, ties broken by id. Parties to
    /// the dispute are never on their own panel.
    async fn select_panel(&self, initiator: &str, respondent: &str) -> Vec<String> {
        let arbitrators = self.arbitrators.read().await;
        let mut candidates: Vec<&Arbitrator> = arbitrators
            .values()
            .filter(|a| a.active && a.id != initiator && a.id != respondent)
            .collect();

        candidates.sort_by(|a, b| {
            b.reputation
                .total_cmp(&a.reputation)
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates
            .into_iter()
            .take(self.config.panel_size)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Attach evidence to an open dispute
    pub async fn submit_evidence(
        &self,
        dispute_id: &str,
        submitter: &str,
        submission: EvidenceSubmission,
    ) -> EngineResult<DisputeEvidence> {
        if submitter.trim().is_empty() {
            return Err(EngineError::validation("Evidence submitter cannot be empty"));
        }
        if submission.content.trim().is_empty() {
            return Err(EngineError::validation("Evidence content cannot be empty"));
        }
        let evidence_type: EvidenceType = submission.evidence_type.parse()?;
        let weight = submission.weight.unwrap_or(1.0);
        if !(weight > 0.0 && weight.is_finite()) {
            return Err(EngineError::validation("Evidence weight must be positive"));
        }

        self.ensure_accepting_evidence(&self.get_dispute(dispute_id).await?)?;

        let mut metadata = submission.metadata;
        let valid = self
            .check_evidence(evidence_type, &submission.content, &mut metadata)
            .await;

        let evidence = DisputeEvidence {
            id: generate_id("evidence"),
            submitter: submitter.to_string(),
            evidence_type,
            content: submission.content,
            metadata,
            submitted_at: Utc::now(),
            valid,
            weight,
        };

        let mut disputes = self.disputes.write().await;
        let dispute = disputes
            .get_mut(dispute_id)
            .ok_or_else(|| EngineError::not_found(format!("Dispute {} not found", dispute_id)))?;
        // Status may have moved while the evidence was being checked
        self.ensure_accepting_evidence(dispute)?;

        dispute.evidence.push(evidence.clone());
        if dispute.status == DisputeStatus::Initiated {
            dispute.status = DisputeStatus::EvidenceCollection;
        }

        info!(
            "Evidence {} ({}) submitted to dispute {} by {}, valid: {}",
            evidence.id, evidence.evidence_type, dispute_id, submitter, evidence.valid
        );
        Ok(evidence)
    }

    fn ensure_accepting_evidence(&self, dispute: &Dispute) -> EngineResult<()> {
        if !dispute.status.is_open() {
            return Err(EngineError::dispute(format!(
                "Dispute {} is already resolved",
                dispute.dispute_id
            )));
        }
        if Utc::now() > dispute.deadline {
            return Err(EngineError::dispute(format!(
                "Evidence window for dispute {} closed at {}",
                dispute.dispute_id, dispute.deadline
            )));
        }
        Ok(())
    }

    async fn check_evidence(
        &self,
        evidence_type: EvidenceType,
        content: &str,
        metadata: &mut BTreeMap<String, String>,
    ) -> bool {
        match evidence_type {
            EvidenceType::TransactionProof => match serde_json::from_str::<MerkleProof>(content) {
                Ok(proof) => {
                    let result = self.verifier.verify_proof(Some(&proof)).await;
                    if let Some(error) = result.error {
                        metadata.insert("validation_error".to_string(), error);
                    }
                    result.valid
                }
                Err(e) => {
                    metadata.insert("validation_error".to_string(), format!("invalid proof: {}", e));
                    false
                }
            },
            EvidenceType::Signature => {
                match (metadata.get("script_hex"), metadata.get("public_key")) {
                    (Some(script), Some(key)) => {
                        let result = self.validator.validate_p2pkh(script, content, key);
                        if let Some(error) = result.error {
                            metadata.insert("validation_error".to_string(), error);
                        }
                        result.valid
                    }
                    _ => is_valid_hex(content),
                }
            }
            _ => true,
        }
    }

    /// Record an arbitrator's vote, replacing any earlier vote by the same arbitrator
    pub async fn cast_vote(
        &self,
        dispute_id: &str,
        arbitrator_id: &str,
        vote: VoteSubmission,
    ) -> EngineResult<ArbitrationVote> {
        if arbitrator_id.trim().is_empty() {
            return Err(EngineError::validation("Arbitrator id cannot be empty"));
        }
        let decision: VoteDecision = vote.decision.parse()?;
        if vote.reason.trim().is_empty() {
            return Err(EngineError::validation("Vote reason cannot be empty"));
        }
        if !(0.0..=1.0).contains(&vote.confidence) {
            return Err(EngineError::validation(format!(
                "Vote confidence {} must be between 0 and 1",
                vote.confidence
            )));
        }

        let mut disputes = self.disputes.write().await;
        let dispute = disputes
            .get_mut(dispute_id)
            .ok_or_else(|| EngineError::not_found(format!("Dispute {} not found", dispute_id)))?;
        if !dispute.status.is_open() {
            return Err(EngineError::dispute(format!(
                "Dispute {} is already resolved",
                dispute_id
            )));
        }

        let vote = ArbitrationVote {
            arbitrator_id: arbitrator_id.to_string(),
            decision,
            reason: vote.reason,
            evidence_ids: vote.evidence_ids,
            confidence: vote.confidence,
            voted_at: Utc::now(),
        };
        dispute.votes.insert(arbitrator_id.to_string(), vote.clone());
        dispute.status = DisputeStatus::Voting;

        info!(
            "Arbitrator {} voted {} on dispute {}",
            arbitrator_id, decision, dispute_id
        );
        Ok(vote)
    }

    /// Tally the votes and close the dispute
    pub async fn resolve(&self, dispute_id: &str) -> EngineResult<DisputeResolutionResult> {
        let mut disputes = self.disputes.write().await;
        let dispute = disputes
            .get_mut(dispute_id)
            .ok_or_else(|| EngineError::not_found(format!("Dispute {} not found", dispute_id)))?;

        if !dispute.status.is_open() {
            return Err(EngineError::dispute(format!(
                "Dispute {} is already resolved",
                dispute_id
            )));
        }
        if dispute.votes.len() < self.config.min_votes {
            return Err(EngineError::dispute(format!(
                "Dispute {} needs at least {} votes to resolve, has {}",
                dispute_id,
                self.config.min_votes,
                dispute.votes.len()
            )));
        }

        let votes: Vec<ArbitrationVote> = dispute.votes.values().cloned().collect();
        let (decision, reason) = tally(&votes);
        let payout_split = payout_split(dispute, decision);

        let valid_evidence = dispute.evidence.iter().filter(|e| e.valid).count();
        let evidence_summary = format!(
            "{} evidence items submitted, {} valid",
            dispute.evidence.len(),
            valid_evidence
        );

        let now = Utc::now();
        let resolution = DisputeResolutionResult {
            decision,
            reason,
            payout_split,
            evidence_summary,
            votes,
            resolved_at: now,
            appeal_deadline: now + Duration::days(self.config.appeal_window_days),
        };

        dispute.status = DisputeStatus::Completed;
        dispute.resolved_at = Some(now);
        dispute.resolution = Some(resolution.clone());

        info!("Resolved dispute {}: {}", dispute_id, resolution.decision);
        Ok(resolution)
    }

    /// Register an arbitrator
    pub async fn add_arbitrator(&self, arbitrator: Arbitrator) -> EngineResult<()> {
        if arbitrator.id.trim().is_empty()
            || arbitrator.name.trim().is_empty()
            || arbitrator.public_key.trim().is_empty()
        {
            return Err(EngineError::validation(
                "Arbitrator id, name and public key are required",
            ));
        }
        if !(0.0..=10.0).contains(&arbitrator.reputation) {
            return Err(EngineError::validation(format!(
                "Arbitrator reputation {} must be between 0 and 10",
                arbitrator.reputation
            )));
        }
        if !(arbitrator.vote_weight > 0.0 && arbitrator.vote_weight <= 5.0) {
            return Err(EngineError::validation(format!(
                "Arbitrator vote weight {} must be in (0, 5]",
                arbitrator.vote_weight
            )));
        }

        let mut arbitrators = self.arbitrators.write().await;
        if arbitrators.contains_key(&arbitrator.id) {
            return Err(EngineError::validation(format!(
                "Arbitrator {} is already registered",
                arbitrator.id
            )));
        }
        info!("Registered arbitrator: {} ({})", arbitrator.id, arbitrator.name);
        arbitrators.insert(arbitrator.id.clone(), arbitrator);
        Ok(())
    }

    /// Record an appeal against a resolved dispute. The dispute stays closed.
    pub async fn appeal(
        &self,
        dispute_id: &str,
        reason: &str,
        evidence: Vec<String>,
    ) -> EngineResult<AppealRequest> {
        if reason.trim().is_empty() {
            return Err(EngineError::validation("Appeal reason cannot be empty"));
        }

        let mut disputes = self.disputes.write().await;
        let dispute = disputes
            .get_mut(dispute_id)
            .ok_or_else(|| EngineError::not_found(format!("Dispute {} not found", dispute_id)))?;

        let deadline = match (&dispute.status, &dispute.resolution) {
            (DisputeStatus::Completed, Some(resolution)) => resolution.appeal_deadline,
            _ => {
                return Err(EngineError::dispute(format!(
                    "Dispute {} has not been resolved",
                    dispute_id
                )))
            }
        };
        let now = Utc::now();
        if now > deadline {
            return Err(EngineError::dispute(format!(
                "Appeal window for dispute {} closed at {}",
                dispute_id, deadline
            )));
        }

        let appeal = AppealRequest {
            id: generate_id("appeal"),
            reason: reason.to_string(),
            evidence,
            requested_at: now,
        };
        dispute.appeals.push(appeal.clone());

        info!("Appeal {} filed against dispute {}", appeal.id, dispute_id);
        Ok(appeal)
    }

    /// Get a dispute by id
    pub async fn get_dispute(&self, dispute_id: &str) -> EngineResult<Dispute> {
        self.disputes
            .read()
            .await
            .get(dispute_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Dispute {} not found", dispute_id)))
    }

    /// Disputes filed against a contract, oldest first
    pub async fn disputes_for_contract(&self, contract_id: &str) -> Vec<Dispute> {
        let mut disputes: Vec<Dispute> = self
            .disputes
            .read()
            .await
            .values()
            .filter(|d| d.contract_id == contract_id)
            .cloned()
            .collect();
        disputes.sort_by_key(|d| d.created_at);
        disputes
    }

    /// Get a registered arbitrator
    pub async fn get_arbitrator(&self, arbitrator_id: &str) -> EngineResult<Arbitrator> {
        self.arbitrators
            .read()
            .await
            .get(arbitrator_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Arbitrator {} not found", arbitrator_id)))
    }
}

/// Confidence-weighted tally. Decisions are scanned in declaration order and
/// only a strictly greater sum displaces the leader, so exact ties go to the
/// earlier-declared decision.
fn tally(votes: &[ArbitrationVote]) -> (VoteDecision, String) {
    let scores: Vec<(VoteDecision, f64)> = VoteDecision::ALL
        .iter()
        .map(|decision| {
            let score: f64 = votes
                .iter()
                .filter(|v| v.decision == *decision)
                .map(|v| v.confidence)
                .sum();
            (*decision, score)
        })
        .collect();

    let mut winner = scores[0];
    for candidate in &scores[1..] {
        if candidate.1 > winner.1 {
            winner = *candidate;
        }
    }

    let tied: Vec<String> = scores
        .iter()
        .filter(|(decision, score)| {
            *decision != winner.0 && *score > 0.0 && (score - winner.1).abs() < TIE_EPSILON
        })
        .map(|(decision, _)| decision.to_string())
        .collect();

    let mut reason = format!(
        "{} selected with weighted score {:.3} from {} votes",
        winner.0,
        winner.1,
        votes.len()
    );
    if !tied.is_empty() {
        debug!("Tie between {} and {}", winner.0, tied.join(", "));
        reason.push_str(&format!(
            "; tied with {}, resolved by decision order",
            tied.join(", ")
        ));
    }

    (winner.0, reason)
}

fn payout_split(dispute: &Dispute, decision: VoteDecision) -> BTreeMap<String, u64> {
    let amount = dispute.disputed_amount_sats;
    let (initiator_pct, respondent_pct) = decision.payout_percentages();

    let initiator_share = amount * initiator_pct / 100;
    let respondent_share = if initiator_pct + respondent_pct == 100 {
        amount - initiator_share
    } else {
        amount * respondent_pct / 100
    };

    let mut split = BTreeMap::new();
    split.insert(dispute.initiator.clone(), initiator_share);
    split.insert(dispute.respondent.clone(), respondent_share);
    split
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::InMemoryChainSource,
        merkle_verifier::VerifierConfig,
        models::ProofNode,
    };

    fn engine() -> DisputeEngine {
        let chain = Arc::new(InMemoryChainSource::new(100));
        let verifier = MerkleProofVerifier::new(VerifierConfig { authoritative: true }, chain);
        DisputeEngine::new(
            DisputeEngineConfig::default(),
            Arc::new(ScriptValidator::default()),
            Arc::new(verifier),
        )
    }

    fn request(id: &str) -> CreateDisputeRequest {
        CreateDisputeRequest {
            dispute_id: id.to_string(),
            contract_id: "contract_1".to_string(),
            initiator: "alice".to_string(),
            respondent: "bob".to_string(),
            dispute_type: "non_delivery".to_string(),
            description: "Work was never delivered".to_string(),
            disputed_amount_sats: 100_000,
        }
    }

    fn arbitrator(id: &str, reputation: f64, active: bool) -> Arbitrator {
        Arbitrator {
            id: id.to_string(),
            name: format!("Arbitrator {}", id),
            public_key: format!("02{}", "ab".repeat(32)),
            reputation,
            specialties: vec![DisputeType::NonDelivery],
            active,
            vote_weight: 1.0,
        }
    }

    fn vote(decision: &str, confidence: f64) -> VoteSubmission {
        VoteSubmission {
            decision: decision.to_string(),
            reason: "Reviewed the evidence".to_string(),
            evidence_ids: Vec::new(),
            confidence,
        }
    }

    async fn voted(engine: &DisputeEngine, id: &str, votes: &[(&str, f64)]) {
        engine.create_dispute(request(id)).await.unwrap();
        for (index, (decision, confidence)) in votes.iter().enumerate() {
            engine
                .cast_vote(id, &format!("arb_{}", index), vote(decision, *confidence))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_dispute_validation() {
        let engine = engine();

        let mut same_party = request("d1");
        same_party.respondent = "alice".to_string();
        assert!(engine.create_dispute(same_party).await.is_err());

        let mut unknown_type = request("d1");
        unknown_type.dispute_type = "gossip".to_string();
        assert!(engine.create_dispute(unknown_type).await.is_err());

        let mut empty = request("d1");
        empty.description = "  ".to_string();
        assert!(engine.create_dispute(empty).await.is_err());

        let dispute = engine.create_dispute(request("d1")).await.unwrap();
        assert_eq!(dispute.status, DisputeStatus::Initiated);
        let window = dispute.deadline - Utc::now();
        assert!(window > Duration::days(6) && window <= Duration::days(7));

        assert!(engine.create_dispute(request("d1")).await.is_err());
    }

    #[tokio::test]
    async fn test_panel_prefers_reputation_then_id() {
        let engine = engine();
        engine.add_arbitrator(arbitrator("zed", 9.0, true)).await.unwrap();
        engine.add_arbitrator(arbitrator("amy", 9.0, true)).await.unwrap();
        engine.add_arbitrator(arbitrator("low", 2.0, true)).await.unwrap();
        engine.add_arbitrator(arbitrator("mid", 5.0, true)).await.unwrap();
        engine.add_arbitrator(arbitrator("off", 10.0, false)).await.unwrap();

        let dispute = engine.create_dispute(request("d1")).await.unwrap();
        assert_eq!(dispute.arbitrators, vec!["amy", "zed", "mid"]);
    }

    #[tokio::test]
    async fn test_add_arbitrator_validation() {
        let engine = engine();
        assert!(engine.add_arbitrator(arbitrator("a", 11.0, true)).await.is_err());

        let mut zero_weight = arbitrator("a", 5.0, true);
        zero_weight.vote_weight = 0.0;
        assert!(engine.add_arbitrator(zero_weight).await.is_err());

        let mut heavy = arbitrator("a", 5.0, true);
        heavy.vote_weight = 5.0;
        assert!(engine.add_arbitrator(heavy).await.is_ok());
        assert_eq!(engine.get_arbitrator("a").await.unwrap().vote_weight, 5.0);
        assert!(matches!(
            engine.get_arbitrator("missing").await.unwrap_err(),
            EngineError::NotFound(_)
        ));

        let mut nameless = arbitrator("b", 5.0, true);
        nameless.name = String::new();
        assert!(engine.add_arbitrator(nameless).await.is_err());
    }

    #[tokio::test]
    async fn test_evidence_submission() {
        let engine = engine();
        engine.create_dispute(request("d1")).await.unwrap();

        let empty = EvidenceSubmission {
            evidence_type: "text".to_string(),
            ..EvidenceSubmission::default()
        };
        assert!(engine.submit_evidence("d1", "alice", empty).await.is_err());

        let unknown = EvidenceSubmission {
            evidence_type: "rumour".to_string(),
            content: "heard it somewhere".to_string(),
            ..EvidenceSubmission::default()
        };
        assert!(engine.submit_evidence("d1", "alice", unknown).await.is_err());

        let text = EvidenceSubmission {
            evidence_type: "text".to_string(),
            content: "No files were delivered".to_string(),
            ..EvidenceSubmission::default()
        };
        let evidence = engine.submit_evidence("d1", "alice", text).await.unwrap();
        assert_eq!(evidence.weight, 1.0);
        assert!(evidence.valid);
        assert!(evidence.id.starts_with("evidence_"));

        let dispute = engine.get_dispute("d1").await.unwrap();
        assert_eq!(dispute.status, DisputeStatus::EvidenceCollection);
        assert_eq!(dispute.evidence.len(), 1);
    }

    #[tokio::test]
    async fn test_chain_evidence_is_checked() {
        let engine = engine();
        engine.create_dispute(request("d1")).await.unwrap();

        let proof = MerkleProof::provisional(
            "aa".repeat(32),
            100,
            "bb".repeat(32),
            vec![ProofNode::left("cc".repeat(32))],
            100_000,
            "bc1qexample".to_string(),
        );
        let good = EvidenceSubmission {
            evidence_type: "transaction_proof".to_string(),
            content: serde_json::to_string(&proof).unwrap(),
            ..EvidenceSubmission::default()
        };
        assert!(engine.submit_evidence("d1", "bob", good).await.unwrap().valid);

        let garbage = EvidenceSubmission {
            evidence_type: "transaction_proof".to_string(),
            content: "{not json".to_string(),
            ..EvidenceSubmission::default()
        };
        let evidence = engine.submit_evidence("d1", "bob", garbage).await.unwrap();
        assert!(!evidence.valid);
        assert!(evidence.metadata.contains_key("validation_error"));

        let mut metadata = BTreeMap::new();
        metadata.insert("script_hex".to_string(), format!("76a914{}88ac", "ab".repeat(20)));
        metadata.insert("public_key".to_string(), format!("02{}", "cd".repeat(32)));
        let signature = EvidenceSubmission {
            evidence_type: "signature".to_string(),
            content: "3044022000".to_string(),
            metadata,
            weight: Some(2.0),
        };
        let evidence = engine.submit_evidence("d1", "bob", signature).await.unwrap();
        assert!(evidence.valid);
        assert_eq!(evidence.weight, 2.0);

        let bad_signature = EvidenceSubmission {
            evidence_type: "signature".to_string(),
            content: "not-a-signature".to_string(),
            ..EvidenceSubmission::default()
        };
        assert!(!engine.submit_evidence("d1", "bob", bad_signature).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_vote_validation() {
        let engine = engine();
        engine.create_dispute(request("d1")).await.unwrap();

        assert!(engine.cast_vote("d1", "arb_1", vote("maybe", 0.5)).await.is_err());
        assert!(engine.cast_vote("d1", "arb_1", vote("favor_initiator", 1.5)).await.is_err());
        let mut no_reason = vote("favor_initiator", 0.5);
        no_reason.reason = String::new();
        assert!(engine.cast_vote("d1", "arb_1", no_reason).await.is_err());
        assert!(engine.cast_vote("missing", "arb_1", vote("favor_initiator", 0.5)).await.is_err());

        engine.cast_vote("d1", "arb_1", vote("favor_initiator", 0.5)).await.unwrap();
        engine.cast_vote("d1", "arb_1", vote("favor_respondent", 0.7)).await.unwrap();

        let dispute = engine.get_dispute("d1").await.unwrap();
        assert_eq!(dispute.status, DisputeStatus::Voting);
        assert_eq!(dispute.votes.len(), 1);
        assert_eq!(dispute.votes["arb_1"].decision, VoteDecision::FavorRespondent);
    }

    #[tokio::test]
    async fn test_resolve_needs_three_votes() {
        let engine = engine();
        voted(&engine, "d1", &[("favor_initiator", 0.8), ("favor_initiator", 0.8)]).await;

        let err = engine.resolve("d1").await.unwrap_err();
        assert!(err.to_string().contains("at least 3 votes"));
    }

    #[tokio::test]
    async fn test_concordant_votes_pay_initiator() {
        let engine = engine();
        voted(
            &engine,
            "d1",
            &[
                ("favor_initiator", 0.8),
                ("favor_initiator", 0.8),
                ("favor_initiator", 0.8),
            ],
        )
        .await;

        let resolution = engine.resolve("d1").await.unwrap();
        assert_eq!(resolution.decision, VoteDecision::FavorInitiator);
        assert_eq!(resolution.payout_split["alice"], 100_000);
        assert_eq!(resolution.payout_split["bob"], 0);
        assert_eq!(resolution.votes.len(), 3);

        let window = resolution.appeal_deadline - resolution.resolved_at;
        assert_eq!(window, Duration::days(14));

        let dispute = engine.get_dispute("d1").await.unwrap();
        assert_eq!(dispute.status, DisputeStatus::Completed);
        assert!(dispute.resolved_at.is_some());
        assert!(engine.resolve("d1").await.is_err());
        assert!(engine.cast_vote("d1", "arb_9", vote("no_action", 0.1)).await.is_err());
    }

    #[tokio::test]
    async fn test_ties_go_to_earlier_decision() {
        let engine = engine();
        voted(
            &engine,
            "d1",
            &[
                ("favor_respondent", 0.5),
                ("favor_respondent", 0.5),
                ("favor_initiator", 1.0),
            ],
        )
        .await;

        let resolution = engine.resolve("d1").await.unwrap();
        assert_eq!(resolution.decision, VoteDecision::FavorInitiator);
        assert!(resolution.reason.contains("tied with favor_respondent"));
    }

    #[tokio::test]
    async fn test_split_rounding_and_escalation() {
        let engine = engine();

        let mut odd = request("d1");
        odd.disputed_amount_sats = 1_001;
        engine.create_dispute(odd).await.unwrap();
        for arb in ["a", "b", "c"] {
            engine.cast_vote("d1", arb, vote("partial_refund", 0.9)).await.unwrap();
        }
        let resolution = engine.resolve("d1").await.unwrap();
        assert_eq!(resolution.payout_split["alice"], 500);
        assert_eq!(resolution.payout_split["bob"], 501);

        voted(&engine, "d2", &[("escalate", 0.9), ("escalate", 0.9), ("no_action", 0.2)]).await;
        let resolution = engine.resolve("d2").await.unwrap();
        assert_eq!(resolution.decision, VoteDecision::Escalate);
        assert_eq!(resolution.payout_split["alice"], 0);
        assert_eq!(resolution.payout_split["bob"], 0);
    }

    #[tokio::test]
    async fn test_appeals() {
        let engine = engine();
        voted(
            &engine,
            "d1",
            &[
                ("favor_respondent", 0.6),
                ("favor_respondent", 0.6),
                ("favor_initiator", 0.6),
            ],
        )
        .await;

        assert!(engine.appeal("d1", "New evidence", vec![]).await.is_err());
        engine.resolve("d1").await.unwrap();

        assert!(engine.appeal("d1", " ", vec![]).await.is_err());
        let appeal = engine
            .appeal("d1", "New evidence", vec!["evidence_x".to_string()])
            .await
            .unwrap();
        assert!(appeal.id.starts_with("appeal_"));

        let dispute = engine.get_dispute("d1").await.unwrap();
        assert_eq!(dispute.appeals.len(), 1);
        assert_eq!(dispute.status, DisputeStatus::Completed);
        assert_eq!(engine.disputes_for_contract("contract_1").await.len(), 1);
    }
}
