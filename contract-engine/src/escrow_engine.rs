//! Escrow Engine - Contract lifecycle on top of the script and proof engines
//!
//! Contracts move `created → funded → active → completed`, or to `expired`
//! through a refund. Operations only validate and enqueue: each transaction
//! is handed to the [`ConfirmationMonitor`] and the contract status is
//! flipped by [`EscrowEngine::apply_confirmation`] once the monitor reports
//! the transaction final. Nothing else writes contract status.

use crate::{
    chain::ChainNetwork,
    error::EngineError,
    merkle_verifier::{MerkleProofVerifier, ProofVerification},
    models::{
        generate_id, ContractStatus, ContractType, EscrowContract, EscrowParticipant,
        EscrowTransaction, ParticipantRole, TransactionStatus, TransactionType,
    },
    monitor::{
        ConfirmationMonitor, EventHandler, EventKind, MonitorEvent, MonitoredTransaction,
        Subscription,
    },
    script_validator::{
        build_multisig_script, build_taproot_script, build_timelock_script, decode_pubkey,
        is_valid_hex, taproot_key_commitment, ScriptParams, ScriptValidator,
    },
    EngineResult,
};
use async_trait::async_trait;
use bitcoin::hashes::{sha256d, Hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Weak},
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Configuration for the escrow engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowEngineConfig {
    /// Largest budget a single contract may lock
    pub max_budget_sats: u64,
}

impl Default for EscrowEngineConfig {
    fn default() -> Self {
        Self {
            max_budget_sats: 100_000_000, // 1 BTC
        }
    }
}

/// Contract creation request
#[derive(Debug, Clone)]
pub struct ContractConfig {
    pub contract_type: ContractType,
    pub participants: Vec<EscrowParticipant>,
    pub total_budget_sats: u64,
    /// Refund gate (unix time) and, for timelock contracts, the CLTV operand
    pub lock_time: u32,
}

/// Claim request
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub contract_id: String,
    pub claimant_pubkey: String,
    pub signatures: Vec<String>,
    /// Chain height for timelock claims; the validator default applies when absent
    pub current_height: Option<u32>,
    /// Required for taproot claims
    pub control_block: Option<String>,
}

/// One payout to a named participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub recipient: String,
    pub amount_sats: u64,
}

/// Why a contract is being refunded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Expired,
    Dispute,
    MutualAgreement,
    TechnicalIssue,
}

impl fmt::Display for RefundReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Expired => "expired",
            Self::Dispute => "dispute",
            Self::MutualAgreement => "mutual_agreement",
            Self::TechnicalIssue => "technical_issue",
        };
        f.write_str(s)
    }
}

impl FromStr for RefundReason {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expired" => Ok(Self::Expired),
            "dispute" => Ok(Self::Dispute),
            "mutual_agreement" => Ok(Self::MutualAgreement),
            "technical_issue" => Ok(Self::TechnicalIssue),
            other => Err(EngineError::validation(format!("invalid refund reason: {}", other))),
        }
    }
}

/// A transition waiting for its transaction to confirm
#[derive(Debug, Clone)]
struct PendingTransition {
    contract_id: String,
    tx_type: TransactionType,
    queued_at: DateTime<Utc>,
}

/// Main escrow engine
pub struct EscrowEngine {
    /// Configuration
    config: EscrowEngineConfig,
    network: ChainNetwork,
    validator: Arc<ScriptValidator>,
    verifier: Arc<MerkleProofVerifier>,
    monitor: Arc<ConfirmationMonitor>,
    /// In-memory contract storage
    contracts: RwLock<HashMap<String, EscrowContract>>,
    /// tx_id → queued transition. Lock order: `contracts` before `pending`.
    pending: RwLock<HashMap<String, PendingTransition>>,
}

/// Routes monitor events back into the engine
struct ConfirmationWatcher {
    engine: Weak<EscrowEngine>,
}

#[async_trait]
impl EventHandler for ConfirmationWatcher {
    async fn handle(&self, event: &MonitorEvent) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        if let Err(e) = engine.apply_confirmation(event).await {
            error!("Failed to apply confirmation for {}: {}", event.tx_id, e);
        }
    }
}

fn derive_tx_id(parts: &[&str]) -> String {
    sha256d::Hash::hash(parts.join("|").as_bytes()).to_string()
}

impl EscrowEngine {
    /// Create a new escrow engine and subscribe it to the monitor's
    /// confirmation and failure events
    pub async fn new(
        config: EscrowEngineConfig,
        network: ChainNetwork,
        validator: Arc<ScriptValidator>,
        verifier: Arc<MerkleProofVerifier>,
        monitor: Arc<ConfirmationMonitor>,
    ) -> Arc<Self> {
        info!("Initializing escrow engine on {:?}", network);

        let engine = Arc::new(Self {
            config,
            network,
            validator,
            verifier,
            monitor: monitor.clone(),
            contracts: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
        });

        for kind in [EventKind::TxFullyConfirmed, EventKind::TxFailed] {
            let watcher = Arc::new(ConfirmationWatcher {
                engine: Arc::downgrade(&engine),
            });
            monitor.register_handler(Subscription::Kind(kind), watcher).await;
        }

        engine
    }

    /// Create a new contract with its locking script and address
    pub async fn create(&self, request: ContractConfig) -> EngineResult<EscrowContract> {
        self.validate_create_request(&request)?;

        let script = self.build_script(&request)?;
        let address = bitcoin::Address::p2wsh(
            &bitcoin::ScriptBuf::from_bytes(script.clone()),
            self.network.to_bitcoin_network(),
        )
        .to_string();

        let contract = EscrowContract {
            contract_id: generate_id("contract"),
            script_hex: hex::encode(&script),
            address,
            total_budget_sats: request.total_budget_sats,
            required_signatures: request.contract_type.required_signatures(),
            participants: request.participants,
            lock_time: request.lock_time,
            contract_type: request.contract_type,
            status: ContractStatus::Created,
            transactions: Vec::new(),
            merkle_proof: None,
            created_at: Utc::now(),
            funded_at: None,
            spent_at: None,
        };

        info!(
            "Creating {} contract: {} ({} sats at {})",
            contract.contract_type, contract.contract_id, contract.total_budget_sats, contract.address
        );

        self.contracts
            .write()
            .await
            .insert(contract.contract_id.clone(), contract.clone());

        Ok(contract)
    }

    fn validate_create_request(&self, request: &ContractConfig) -> EngineResult<()> {
        if request.total_budget_sats == 0 {
            return Err(EngineError::validation("Budget must be greater than 0"));
        }
        if request.total_budget_sats > self.config.max_budget_sats {
            return Err(EngineError::validation(format!(
                "Budget {} sats exceeds maximum {}",
                request.total_budget_sats, self.config.max_budget_sats
            )));
        }

        let count = request.participants.len();
        match request.contract_type {
            ContractType::Multisig if count != 3 => {
                return Err(EngineError::validation(format!(
                    "multisig contracts need exactly 3 participants, got {}",
                    count
                )));
            }
            ContractType::Timelock if count != 1 => {
                return Err(EngineError::validation(format!(
                    "timelock contracts need exactly 1 participant, got {}",
                    count
                )));
            }
            ContractType::Taproot if count == 0 => {
                return Err(EngineError::validation(
                    "taproot contracts need at least 1 participant",
                ));
            }
            _ => {}
        }

        for participant in &request.participants {
            if participant.name.trim().is_empty() {
                return Err(EngineError::validation("Participant name cannot be empty"));
            }
            if !is_valid_hex(&participant.public_key) {
                return Err(EngineError::validation(format!(
                    "Participant {} has an invalid public key",
                    participant.name
                )));
            }
            if !(0.0..=100.0).contains(&participant.share_percent) {
                return Err(EngineError::validation(format!(
                    "Participant {} share must be between 0 and 100",
                    participant.name
                )));
            }
        }

        Ok(())
    }

    fn build_script(&self, request: &ContractConfig) -> EngineResult<Vec<u8>> {
        match request.contract_type {
            ContractType::Multisig => {
                let keys = request
                    .participants
                    .iter()
                    .map(|p| decode_pubkey(&p.public_key))
                    .collect::<EngineResult<Vec<_>>>()?;
                build_multisig_script(&keys)
            }
            ContractType::Timelock => {
                let participant = request
                    .participants
                    .first()
                    .ok_or_else(|| EngineError::validation("timelock contract has no participant"))?;
                let key = decode_pubkey(&participant.public_key)?;
                build_timelock_script(&key, request.lock_time)
            }
            ContractType::Taproot => {
                let keys = request
                    .participants
                    .iter()
                    .map(|p| {
                        hex::decode(&p.public_key)
                            .map_err(|e| EngineError::validation(format!("invalid public key: {}", e)))
                    })
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(build_taproot_script(&taproot_key_commitment(&keys)?))
            }
        }
    }

    /// Record a funding transaction and start watching it
    pub async fn fund(&self, contract_id: &str, funding_tx: &[u8]) -> EngineResult<EscrowTransaction> {
        if funding_tx.is_empty() {
            return Err(EngineError::validation("Funding transaction cannot be empty"));
        }
        let tx_id = sha256d::Hash::hash(funding_tx).to_string();

        let (transaction, contract_address) = {
            let mut contracts = self.contracts.write().await;
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| EngineError::not_found(format!("Contract {} not found", contract_id)))?;

            if !contract.status.can_fund() {
                return Err(EngineError::state_transition(
                    contract.status.to_string(),
                    ContractStatus::Funded.to_string(),
                    "contract is not awaiting funding".to_string(),
                ));
            }
            if contract.total_budget_sats == 0 {
                return Err(EngineError::validation("Contract budget must be greater than 0"));
            }
            if Self::has_pending(contract, &[TransactionType::Funding]) {
                return Err(EngineError::validation(format!(
                    "Contract {} already has a pending funding transaction",
                    contract_id
                )));
            }

            let transaction = EscrowTransaction {
                tx_id: tx_id.clone(),
                tx_type: TransactionType::Funding,
                amount_sats: contract.total_budget_sats,
                from_address: String::new(),
                to_address: contract.address.clone(),
                signatures: Vec::new(),
                status: TransactionStatus::Pending,
                created_at: Utc::now(),
            };
            contract.transactions.push(transaction.clone());
            self.enqueue(contract_id, &transaction).await;
            (transaction, contract.address.clone())
        };

        info!("Funding contract {} with {}", contract_id, tx_id);
        self.watch(contract_id, &transaction, contract_address).await?;
        Ok(transaction)
    }

    /// Authorize a participant's claim on a funded contract
    pub async fn claim(&self, request: ClaimRequest) -> EngineResult<EscrowTransaction> {
        let contract_id = request.contract_id.as_str();

        let (transaction, contract_address) = {
            let mut contracts = self.contracts.write().await;
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| EngineError::not_found(format!("Contract {} not found", contract_id)))?;

            if !contract.status.can_claim() {
                return Err(EngineError::state_transition(
                    contract.status.to_string(),
                    ContractStatus::Active.to_string(),
                    "contract is not available for claiming".to_string(),
                ));
            }

            let claimant = contract
                .participant_by_pubkey(&request.claimant_pubkey)
                .cloned()
                .ok_or_else(|| EngineError::validation("Claimant is not a contract participant"))?;

            if request.signatures.len() < contract.required_signatures {
                return Err(EngineError::validation(format!(
                    "Claim needs {} signatures, got {}",
                    contract.required_signatures,
                    request.signatures.len()
                )));
            }
            if let Some(index) = request.signatures.iter().position(|s| !is_valid_hex(s)) {
                return Err(EngineError::validation(format!(
                    "Signature {} is not valid hex",
                    index
                )));
            }
            if Self::has_pending(contract, &[TransactionType::Claim]) {
                return Err(EngineError::validation(format!(
                    "Contract {} already has a pending claim",
                    contract_id
                )));
            }

            let (script_type, params) = Self::claim_params(contract, &request)?;
            let result = self
                .validator
                .validate_contract_script(script_type, &contract.script_hex, &params);
            if !result.valid {
                return Err(EngineError::validation(format!(
                    "Script validation failed: {}",
                    result.error.unwrap_or_default()
                )));
            }

            let share = (contract.total_budget_sats as f64 * claimant.share_percent / 100.0) as u64;
            let amount_sats = if share == 0 { contract.total_budget_sats } else { share };

            let claim_count = contract.transactions_of(TransactionType::Claim).count().to_string();
            let transaction = EscrowTransaction {
                tx_id: derive_tx_id(&[
                    contract_id,
                    "claim",
                    &claim_count,
                    &claimant.public_key,
                    &request.signatures.join(","),
                ]),
                tx_type: TransactionType::Claim,
                amount_sats,
                from_address: contract.address.clone(),
                to_address: claimant.name.clone(),
                signatures: request.signatures.clone(),
                status: TransactionStatus::Pending,
                created_at: Utc::now(),
            };
            contract.transactions.push(transaction.clone());
            self.enqueue(contract_id, &transaction).await;
            (transaction, contract.address.clone())
        };

        info!("Claim on contract {} queued as {}", contract_id, transaction.tx_id);
        self.watch(contract_id, &transaction, contract_address).await?;
        Ok(transaction)
    }

    fn claim_params(
        contract: &EscrowContract,
        request: &ClaimRequest,
    ) -> EngineResult<(&'static str, ScriptParams)> {
        match contract.contract_type {
            ContractType::Multisig => Ok((
                "multisig_escrow",
                ScriptParams::Multisig {
                    signatures: request.signatures.clone(),
                    pubkeys: contract
                        .participants
                        .iter()
                        .map(|p| p.public_key.clone())
                        .collect(),
                },
            )),
            ContractType::Timelock => Ok((
                "timelock_refund",
                ScriptParams::Timelock {
                    current_height: request.current_height,
                },
            )),
            ContractType::Taproot => {
                let control_block = request
                    .control_block
                    .clone()
                    .ok_or_else(|| EngineError::validation("Taproot claims require a control block"))?;
                let signature = request
                    .signatures
                    .first()
                    .cloned()
                    .ok_or_else(|| EngineError::validation("Taproot claims require a signature"))?;
                Ok((
                    "taproot_contract",
                    ScriptParams::Taproot {
                        signature,
                        control_block,
                    },
                ))
            }
        }
    }

    /// Pay out an active contract to named participants
    pub async fn payout(&self, contract_id: &str, payouts: Vec<Payout>) -> EngineResult<Vec<EscrowTransaction>> {
        if payouts.is_empty() {
            return Err(EngineError::validation("At least one payout is required"));
        }

        let (transactions, contract_address) = {
            let mut contracts = self.contracts.write().await;
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| EngineError::not_found(format!("Contract {} not found", contract_id)))?;

            if !contract.status.can_payout() {
                return Err(EngineError::state_transition(
                    contract.status.to_string(),
                    ContractStatus::Completed.to_string(),
                    "contract is not active".to_string(),
                ));
            }

            let mut total: u64 = 0;
            for payout in &payouts {
                if contract.participant_by_name(&payout.recipient).is_none() {
                    return Err(EngineError::validation(format!(
                        "Payout recipient {} is not a participant",
                        payout.recipient
                    )));
                }
                if payout.amount_sats == 0 {
                    return Err(EngineError::validation(format!(
                        "Payout to {} must be greater than 0",
                        payout.recipient
                    )));
                }
                total = total
                    .checked_add(payout.amount_sats)
                    .ok_or_else(|| EngineError::validation("Payout total overflows"))?;
            }
            if total > contract.total_budget_sats {
                return Err(EngineError::validation(format!(
                    "Payout total {} sats exceeds budget {}",
                    total, contract.total_budget_sats
                )));
            }
            if Self::has_pending(contract, &[TransactionType::Payout, TransactionType::Refund]) {
                return Err(EngineError::validation(format!(
                    "Contract {} already has a pending payout or refund",
                    contract_id
                )));
            }

            let now = Utc::now();
            let sequence = contract.transactions_of(TransactionType::Payout).count();
            let mut transactions = Vec::with_capacity(payouts.len());
            for (index, payout) in payouts.iter().enumerate() {
                let transaction = EscrowTransaction {
                    tx_id: derive_tx_id(&[
                        contract_id,
                        "payout",
                        &(sequence + index).to_string(),
                        &payout.recipient,
                        &payout.amount_sats.to_string(),
                    ]),
                    tx_type: TransactionType::Payout,
                    amount_sats: payout.amount_sats,
                    from_address: contract.address.clone(),
                    to_address: payout.recipient.clone(),
                    signatures: Vec::new(),
                    status: TransactionStatus::Pending,
                    created_at: now,
                };
                contract.transactions.push(transaction.clone());
                self.enqueue(contract_id, &transaction).await;
                transactions.push(transaction);
            }
            (transactions, contract.address.clone())
        };

        info!(
            "Queued {} payouts for contract {}",
            transactions.len(),
            contract_id
        );
        for transaction in &transactions {
            self.watch(contract_id, transaction, contract_address.clone()).await?;
        }
        Ok(transactions)
    }

    /// Refund a funded or active contract to its creator
    pub async fn refund(&self, contract_id: &str, reason: &str) -> EngineResult<EscrowTransaction> {
        let reason: RefundReason = reason.parse()?;

        let (transaction, contract_address) = {
            let mut contracts = self.contracts.write().await;
            let contract = contracts
                .get_mut(contract_id)
                .ok_or_else(|| EngineError::not_found(format!("Contract {} not found", contract_id)))?;

            if !contract.status.can_refund() {
                return Err(EngineError::state_transition(
                    contract.status.to_string(),
                    ContractStatus::Expired.to_string(),
                    "contract cannot be refunded".to_string(),
                ));
            }
            if contract.lock_time > 0 && Utc::now().timestamp() < i64::from(contract.lock_time) {
                return Err(EngineError::validation(format!(
                    "Contract {} is locked until {}",
                    contract_id, contract.lock_time
                )));
            }
            if Self::has_pending(contract, &[TransactionType::Payout, TransactionType::Refund]) {
                return Err(EngineError::validation(format!(
                    "Contract {} already has a pending payout or refund",
                    contract_id
                )));
            }

            let recipient = contract
                .participants
                .iter()
                .find(|p| p.role == ParticipantRole::Creator)
                .or_else(|| contract.participants.first())
                .map(|p| p.name.clone())
                .unwrap_or_default();

            let refund_count = contract.transactions_of(TransactionType::Refund).count().to_string();
            let transaction = EscrowTransaction {
                tx_id: derive_tx_id(&[contract_id, "refund", &refund_count, &reason.to_string()]),
                tx_type: TransactionType::Refund,
                amount_sats: contract.total_budget_sats,
                from_address: contract.address.clone(),
                to_address: recipient,
                signatures: Vec::new(),
                status: TransactionStatus::Pending,
                created_at: Utc::now(),
            };
            contract.transactions.push(transaction.clone());
            self.enqueue(contract_id, &transaction).await;
            (transaction, contract.address.clone())
        };

        info!("Refunding contract {} ({})", contract_id, reason);
        self.watch(contract_id, &transaction, contract_address).await?;
        Ok(transaction)
    }

    fn has_pending(contract: &EscrowContract, types: &[TransactionType]) -> bool {
        contract
            .transactions
            .iter()
            .any(|tx| tx.status == TransactionStatus::Pending && types.contains(&tx.tx_type))
    }

    async fn enqueue(&self, contract_id: &str, transaction: &EscrowTransaction) {
        self.pending.write().await.insert(
            transaction.tx_id.clone(),
            PendingTransition {
                contract_id: contract_id.to_string(),
                tx_type: transaction.tx_type,
                queued_at: Utc::now(),
            },
        );
    }

    async fn watch(
        &self,
        contract_id: &str,
        transaction: &EscrowTransaction,
        contract_address: String,
    ) -> EngineResult<()> {
        let (from, to) = match transaction.tx_type {
            TransactionType::Funding => (transaction.from_address.clone(), contract_address),
            _ => (contract_address, transaction.to_address.clone()),
        };
        let monitored = MonitoredTransaction::new(
            transaction.tx_id.clone(),
            contract_id.to_string(),
            transaction.tx_type,
            transaction.amount_sats,
            self.monitor.config().required_confirmations,
        )
        .with_addresses(from, to);
        self.monitor.add(monitored).await
    }

    /// Apply a monitor event to the contract owning the transaction.
    /// Events for transactions this engine did not queue are ignored.
    pub async fn apply_confirmation(&self, event: &MonitorEvent) -> EngineResult<()> {
        if !matches!(event.kind, EventKind::TxFullyConfirmed | EventKind::TxFailed) {
            return Ok(());
        }

        let Some(transition) = self.pending.write().await.remove(&event.tx_id) else {
            debug!("No pending transition for {}", event.tx_id);
            return Ok(());
        };
        debug!(
            "Applying {} for {} {} queued at {}",
            event.kind, transition.tx_type, event.tx_id, transition.queued_at
        );

        if event.kind == EventKind::TxFailed {
            let mut contracts = self.contracts.write().await;
            if let Some(tx) = contracts
                .get_mut(&transition.contract_id)
                .and_then(|c| c.pending_transaction_mut(&event.tx_id))
            {
                tx.status = TransactionStatus::Failed;
            }
            warn!(
                "{} transaction {} for contract {} failed",
                transition.tx_type, event.tx_id, transition.contract_id
            );
            return Ok(());
        }

        // Proof construction talks to the chain, so it happens before the
        // contract lock is taken
        let proof = if transition.tx_type == TransactionType::Funding {
            let (amount, address) = {
                let contracts = self.contracts.read().await;
                let contract = contracts.get(&transition.contract_id).ok_or_else(|| {
                    EngineError::not_found(format!("Contract {} not found", transition.contract_id))
                })?;
                (contract.total_budget_sats, contract.address.clone())
            };
            match self.verifier.build_proof(&event.tx_id, amount, &address).await {
                Ok(proof) => Some(proof),
                Err(e) => {
                    warn!("Could not build funding proof for {}: {}", event.tx_id, e);
                    None
                }
            }
        } else {
            None
        };

        let mut contracts = self.contracts.write().await;
        let contract = contracts.get_mut(&transition.contract_id).ok_or_else(|| {
            EngineError::not_found(format!("Contract {} not found", transition.contract_id))
        })?;
        if let Some(tx) = contract.pending_transaction_mut(&event.tx_id) {
            tx.status = TransactionStatus::Confirmed;
        }

        let now = Utc::now();
        match transition.tx_type {
            TransactionType::Funding => {
                contract.status.validate_transition(ContractStatus::Funded)?;
                contract.status = ContractStatus::Funded;
                contract.funded_at = Some(now);
                contract.merkle_proof = proof;
                info!("Funded contract: {}", contract.contract_id);
            }
            TransactionType::Claim => {
                if contract.status == ContractStatus::Funded {
                    contract.status = ContractStatus::Active;
                }
                info!("Claim confirmed, contract {} is active", contract.contract_id);
            }
            TransactionType::Payout => {
                let outstanding = contract
                    .transactions_of(TransactionType::Payout)
                    .any(|tx| tx.status == TransactionStatus::Pending);
                if outstanding {
                    debug!("Contract {} still has unconfirmed payouts", contract.contract_id);
                } else {
                    contract.status.validate_transition(ContractStatus::Completed)?;
                    contract.status = ContractStatus::Completed;
                    contract.spent_at = Some(now);
                    info!("Completed contract: {}", contract.contract_id);
                }
            }
            TransactionType::Refund => {
                contract.status.validate_transition(ContractStatus::Expired)?;
                contract.status = ContractStatus::Expired;
                contract.spent_at = Some(now);
                info!("Refunded contract: {}", contract.contract_id);
            }
        }

        Ok(())
    }

    /// Get a contract by id
    pub async fn get_contract(&self, contract_id: &str) -> EngineResult<EscrowContract> {
        self.contracts
            .read()
            .await
            .get(contract_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("Contract {} not found", contract_id)))
    }

    /// All contracts, oldest first
    pub async fn list_contracts(&self) -> Vec<EscrowContract> {
        let mut contracts: Vec<EscrowContract> = self.contracts.read().await.values().cloned().collect();
        contracts.sort_by_key(|c| c.created_at);
        contracts
    }

    /// Number of transitions waiting on confirmations
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Verify the funding proof attached to a contract
    pub async fn verify_funding(&self, contract_id: &str) -> EngineResult<ProofVerification> {
        let proof = self.get_contract(contract_id).await?.merkle_proof;
        Ok(self.verifier.verify_proof(proof.as_ref()).await)
    }

    /// Refresh the funding proof against the chain and store the result
    pub async fn refresh_funding_proof(&self, contract_id: &str) -> EngineResult<EscrowContract> {
        let proof = self.get_contract(contract_id).await?.merkle_proof;
        let refreshed = self.verifier.refresh_proof(proof.as_ref()).await?;

        let mut contracts = self.contracts.write().await;
        let contract = contracts
            .get_mut(contract_id)
            .ok_or_else(|| EngineError::not_found(format!("Contract {} not found", contract_id)))?;
        contract.merkle_proof = Some(refreshed);
        Ok(contract.clone())
    }
}
