//! Core data models for the contract engine
//!
//! This module contains the persisted shapes exchanged with storage, the
//! escrow contract state machine, and the dispute/arbitration records.
//! Field names are the canonical JSON schema used by storage backends.

use crate::{error::EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Merkle proofs
// ---------------------------------------------------------------------------

/// Side on which a sibling hash sits when folding a proof path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofDirection {
    Left,
    Right,
    /// Anything else read from storage; rejected by structural validation
    #[serde(other)]
    Unknown,
}

/// One step of a Merkle inclusion path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub hash: String,
    pub direction: ProofDirection,
}

impl ProofNode {
    pub fn left<S: Into<String>>(hash: S) -> Self {
        Self {
            hash: hash.into(),
            direction: ProofDirection::Left,
        }
    }

    pub fn right<S: Into<String>>(hash: S) -> Self {
        Self {
            hash: hash.into(),
            direction: ProofDirection::Right,
        }
    }
}

/// Confirmation status of a funding proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationStatus {
    /// Seen but not yet known to be in the stated block
    Provisional,
    /// Included in the stated block
    Confirmed,
}

/// Merkle inclusion proof for a funding transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub tx_id: String,
    pub block_height: u64,
    pub block_header_merkle_root: String,
    pub proof_path: Vec<ProofNode>,
    pub funded_amount_sats: u64,
    pub funding_address: String,
    pub confirmation_status: ConfirmationStatus,
    pub seen_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl MerkleProof {
    /// Create a provisional proof, stamped as seen now
    pub fn provisional(
        tx_id: String,
        block_height: u64,
        block_header_merkle_root: String,
        proof_path: Vec<ProofNode>,
        funded_amount_sats: u64,
        funding_address: String,
    ) -> Self {
        Self {
            tx_id,
            block_height,
            block_header_merkle_root,
            proof_path,
            funded_amount_sats,
            funding_address,
            confirmation_status: ConfirmationStatus::Provisional,
            seen_at: Utc::now(),
            confirmed_at: None,
        }
    }

    /// Mark the proof confirmed at the given time
    pub fn confirm(&mut self, at: DateTime<Utc>) {
        self.confirmation_status = ConfirmationStatus::Confirmed;
        self.confirmed_at = Some(at);
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmation_status == ConfirmationStatus::Confirmed
    }
}

// ---------------------------------------------------------------------------
// Escrow contracts
// ---------------------------------------------------------------------------

/// Kind of locking script backing a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    /// 2-of-3 multisig between creator, worker and arbitrator
    Multisig,
    /// Single key spend after a CLTV lock height
    Timelock,
    /// Key-path Taproot spend
    Taproot,
}

impl ContractType {
    /// Signatures needed to authorize a claim
    pub fn required_signatures(&self) -> usize {
        match self {
            Self::Multisig => 2,
            Self::Timelock | Self::Taproot => 1,
        }
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Multisig => "multisig",
            Self::Timelock => "timelock",
            Self::Taproot => "taproot",
        };
        f.write_str(s)
    }
}

/// Contract state machine
///
/// `created → funded → active → completed`, with `expired` reachable from
/// `funded` and `active` through a refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    /// Script generated, awaiting funding
    Created,
    /// Funding confirmed on chain
    Funded,
    /// A participant's claim has been confirmed
    Active,
    /// Payouts confirmed, funds spent
    Completed,
    /// Funds refunded to the creator
    Expired,
}

impl ContractStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }

    /// Check if this state allows funding
    pub fn can_fund(&self) -> bool {
        matches!(self, Self::Created)
    }

    /// Check if this state allows claiming
    pub fn can_claim(&self) -> bool {
        matches!(self, Self::Funded | Self::Active)
    }

    /// Check if this state allows payouts
    pub fn can_payout(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if this state allows a refund
    pub fn can_refund(&self) -> bool {
        matches!(self, Self::Funded | Self::Active)
    }

    /// Validate a forward transition to `to_state`
    pub fn validate_transition(&self, to_state: ContractStatus) -> EngineResult<()> {
        let valid = matches!(
            (self, &to_state),
            (Self::Created, Self::Funded)
                | (Self::Funded, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Funded, Self::Expired)
                | (Self::Active, Self::Expired)
        );

        if valid {
            Ok(())
        } else {
            Err(EngineError::state_transition(
                self.to_string(),
                to_state.to_string(),
                "Invalid state transition".to_string(),
            ))
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Funded => "funded",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Role a participant plays in a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Creator,
    Worker,
    Arbitrator,
}

/// A party to an escrow contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowParticipant {
    pub name: String,
    pub public_key: String,
    pub role: ParticipantRole,
    pub share_percent: f64,
}

/// Kind of escrow transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Funding,
    Claim,
    Payout,
    Refund,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Funding => "funding",
            Self::Claim => "claim",
            Self::Payout => "payout",
            Self::Refund => "refund",
        };
        f.write_str(s)
    }
}

/// Settlement status of an escrow transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Failed,
}

/// A transaction moving funds into or out of an escrow contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub tx_id: String,
    pub tx_type: TransactionType,
    pub amount_sats: u64,
    pub from_address: String,
    pub to_address: String,
    pub signatures: Vec<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

/// An escrow contract and its settlement history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowContract {
    pub contract_id: String,
    pub script_hex: String,
    pub address: String,
    pub total_budget_sats: u64,
    pub participants: Vec<EscrowParticipant>,
    pub required_signatures: usize,
    /// Unix timestamp before which refunds are refused; 0 disables the check
    pub lock_time: u32,
    pub contract_type: ContractType,
    pub status: ContractStatus,
    pub transactions: Vec<EscrowTransaction>,
    pub merkle_proof: Option<MerkleProof>,
    pub created_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub spent_at: Option<DateTime<Utc>>,
}

impl EscrowContract {
    /// Find a participant by public key
    pub fn participant_by_pubkey(&self, public_key: &str) -> Option<&EscrowParticipant> {
        self.participants
            .iter()
            .find(|p| p.public_key.eq_ignore_ascii_case(public_key))
    }

    /// Find a participant by name
    pub fn participant_by_name(&self, name: &str) -> Option<&EscrowParticipant> {
        self.participants.iter().find(|p| p.name == name)
    }

    /// Find the still-pending record for a transaction id. A rebroadcast
    /// can share its id with an earlier failed record.
    pub fn pending_transaction_mut(&mut self, tx_id: &str) -> Option<&mut EscrowTransaction> {
        self.transactions
            .iter_mut()
            .find(|tx| tx.tx_id == tx_id && tx.status == TransactionStatus::Pending)
    }

    /// Transactions of one kind
    pub fn transactions_of(&self, tx_type: TransactionType) -> impl Iterator<Item = &EscrowTransaction> {
        self.transactions.iter().filter(move |tx| tx.tx_type == tx_type)
    }
}

// ---------------------------------------------------------------------------
// Disputes
// ---------------------------------------------------------------------------

macro_rules! string_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every value, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::validation(format!(
                        concat!("unknown ", $what, ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

/// What the dispute is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeType {
    WorkQuality,
    NonDelivery,
    PaymentDelay,
    Fraud,
    ContractBreach,
    Other,
}

string_enum!(DisputeType, "dispute type", {
    WorkQuality => "work_quality",
    NonDelivery => "non_delivery",
    PaymentDelay => "payment_delay",
    Fraud => "fraud",
    ContractBreach => "contract_breach",
    Other => "other",
});

/// Dispute lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    /// Filed, panel assigned
    Initiated,
    /// At least one piece of evidence submitted
    EvidenceCollection,
    /// At least one arbitrator vote recorded
    Voting,
    /// Resolved (terminal)
    Completed,
}

impl DisputeStatus {
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// Kind of evidence attached to a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Text,
    Image,
    Document,
    /// JSON-encoded `MerkleProof` of an on-chain payment
    TransactionProof,
    /// Hex signature over the disputed claim
    Signature,
    Communication,
}

string_enum!(EvidenceType, "evidence type", {
    Text => "text",
    Image => "image",
    Document => "document",
    TransactionProof => "transaction_proof",
    Signature => "signature",
    Communication => "communication",
});

/// Arbitrator decision. Declaration order is the tie-break order when tallying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    FavorInitiator,
    FavorRespondent,
    PartialRefund,
    FullRefund,
    NoAction,
    /// Hand the case to a wider review; no funds move
    Escalate,
}

string_enum!(VoteDecision, "vote decision", {
    FavorInitiator => "favor_initiator",
    FavorRespondent => "favor_respondent",
    PartialRefund => "partial_refund",
    FullRefund => "full_refund",
    NoAction => "no_action",
    Escalate => "escalate",
});

impl VoteDecision {
    /// Share of the disputed amount going to (initiator, respondent), in percent
    pub fn payout_percentages(&self) -> (u64, u64) {
        match self {
            Self::FavorInitiator | Self::FullRefund => (100, 0),
            Self::FavorRespondent => (0, 100),
            Self::PartialRefund | Self::NoAction => (50, 50),
            Self::Escalate => (0, 0),
        }
    }
}

/// A registered arbitrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arbitrator {
    pub id: String,
    pub name: String,
    pub public_key: String,
    /// 0.0 to 10.0
    pub reputation: f64,
    pub specialties: Vec<DisputeType>,
    pub active: bool,
    /// In (0, 5]
    pub vote_weight: f64,
}

/// A piece of evidence attached to a dispute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeEvidence {
    pub id: String,
    pub submitter: String,
    pub evidence_type: EvidenceType,
    pub content: String,
    pub metadata: BTreeMap<String, String>,
    pub submitted_at: DateTime<Utc>,
    pub valid: bool,
    pub weight: f64,
}

/// One arbitrator's vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationVote {
    pub arbitrator_id: String,
    pub decision: VoteDecision,
    pub reason: String,
    pub evidence_ids: Vec<String>,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub voted_at: DateTime<Utc>,
}

/// Outcome of a resolved dispute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisputeResolutionResult {
    pub decision: VoteDecision,
    pub reason: String,
    /// Participant → sats
    pub payout_split: BTreeMap<String, u64>,
    pub evidence_summary: String,
    pub votes: Vec<ArbitrationVote>,
    pub resolved_at: DateTime<Utc>,
    pub appeal_deadline: DateTime<Utc>,
}

/// A recorded appeal against a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppealRequest {
    pub id: String,
    pub reason: String,
    pub evidence: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

/// A dispute between two parties of a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    pub dispute_id: String,
    pub contract_id: String,
    pub initiator: String,
    pub respondent: String,
    pub dispute_type: DisputeType,
    pub description: String,
    pub disputed_amount_sats: u64,
    pub status: DisputeStatus,
    pub evidence: Vec<DisputeEvidence>,
    pub arbitrators: Vec<String>,
    /// Arbitrator id → vote; one vote per arbitrator
    pub votes: BTreeMap<String, ArbitrationVote>,
    pub resolution: Option<DisputeResolutionResult>,
    pub appeals: Vec<AppealRequest>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Generate a prefixed random identifier
pub fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}
