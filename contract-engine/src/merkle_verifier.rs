//! Merkle Proof Verifier - Validates funding inclusion proofs
//!
//! Recomputes a block's Merkle root from a transaction id and its proof
//! path and cross-checks the result against the chain data source.
//!
//! Each folding step is a single SHA-256 over the concatenated byte strings,
//! not Bitcoin's double SHA-256. Stored proofs were produced with this
//! scheme, so it must stay as is until the proof format is versioned.

use crate::{
    chain::ChainDataSource,
    error::{ChainError, EngineError},
    models::{ConfirmationStatus, MerkleProof, ProofDirection, ProofNode},
    EngineResult,
};
use bitcoin::hashes::{sha256, Hash};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info, warn};

/// Configuration for the proof verifier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Trust a structurally valid proof without consulting the chain
    /// (offline and test deployments)
    pub authoritative: bool,
}

/// Outcome of verifying one proof. `valid == false` is a normal answer.
///
/// `unreachable` is set when the chain data source could not be consulted.
/// Such a proof is not known to be bad and should be checked again later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofVerification {
    pub valid: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub unreachable: bool,
    pub details: BTreeMap<String, String>,
}

impl ProofVerification {
    fn accepted(details: BTreeMap<String, String>) -> Self {
        Self {
            valid: true,
            error: None,
            unreachable: false,
            details,
        }
    }

    fn rejected<S: Into<String>>(error: S, details: BTreeMap<String, String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            unreachable: false,
            details,
        }
    }

    /// Chain lookup failed; unknown objects still count as a rejection
    fn fetch_failed(what: &str, error: &ChainError, details: BTreeMap<String, String>) -> Self {
        Self {
            valid: false,
            error: Some(format!("failed to fetch {}: {}", what, error)),
            unreachable: !error.is_not_found(),
            details,
        }
    }
}

/// Hash two nodes into their parent: `SHA256(left || right)`
pub fn hash_pair(left: &[u8], right: &[u8]) -> [u8; 32] {
    let mut data = Vec::with_capacity(left.len() + right.len());
    data.extend_from_slice(left);
    data.extend_from_slice(right);
    sha256::Hash::hash(&data).to_byte_array()
}

/// Fold a proof path onto a transaction id and return the root as lowercase hex
pub fn recompute_root(tx_id: &str, path: &[ProofNode]) -> Result<String, String> {
    let mut current =
        hex::decode(tx_id).map_err(|e| format!("invalid transaction id hex: {}", e))?;

    for (index, node) in path.iter().enumerate() {
        let sibling = hex::decode(&node.hash)
            .map_err(|e| format!("invalid hash hex at proof node {}: {}", index, e))?;

        current = match node.direction {
            ProofDirection::Left => hash_pair(&sibling, &current).to_vec(),
            ProofDirection::Right => hash_pair(&current, &sibling).to_vec(),
            ProofDirection::Unknown => {
                return Err(format!("invalid direction at proof node {}", index));
            }
        };
    }

    Ok(hex::encode(current))
}

/// Structural checks that need no chain access
pub fn validate_structure(proof: &MerkleProof) -> Result<(), String> {
    if proof.tx_id.trim().is_empty() {
        return Err("transaction id is empty".to_string());
    }
    if proof.block_height == 0 {
        return Err("block height must be greater than 0".to_string());
    }
    if proof.block_header_merkle_root.trim().is_empty() {
        return Err("block header merkle root is empty".to_string());
    }
    if proof.proof_path.is_empty() {
        return Err("proof path is empty".to_string());
    }

    for (index, node) in proof.proof_path.iter().enumerate() {
        if node.hash.trim().is_empty() {
            return Err(format!("proof node {} has an empty hash", index));
        }
        if node.direction == ProofDirection::Unknown {
            return Err(format!(
                "proof node {} has an invalid direction (expected left or right)",
                index
            ));
        }
    }

    Ok(())
}

/// Main proof verifier
pub struct MerkleProofVerifier {
    config: VerifierConfig,
    chain: Arc<dyn ChainDataSource>,
}

impl MerkleProofVerifier {
    /// Create a new verifier over a chain data source
    pub fn new(config: VerifierConfig, chain: Arc<dyn ChainDataSource>) -> Self {
        Self { config, chain }
    }

    /// Whether proofs are trusted without chain access
    pub fn is_authoritative(&self) -> bool {
        self.config.authoritative
    }

    /// Verify a single proof
    pub async fn verify_proof(&self, proof: Option<&MerkleProof>) -> ProofVerification {
        let mut details = BTreeMap::new();

        let proof = match proof {
            Some(proof) => proof,
            None => return ProofVerification::rejected("proof is nil", details),
        };

        details.insert("tx_id".to_string(), proof.tx_id.clone());
        details.insert("block_height".to_string(), proof.block_height.to_string());

        if let Err(reason) = validate_structure(proof) {
            return ProofVerification::rejected(format!("invalid proof structure: {}", reason), details);
        }

        if self.config.authoritative {
            details.insert("mode".to_string(), "authoritative".to_string());
            return ProofVerification::accepted(details);
        }
        details.insert("mode".to_string(), "chain".to_string());

        let tx = match self.chain.get_transaction(&proof.tx_id).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!("Cannot fetch transaction {}: {}", proof.tx_id, e);
                return ProofVerification::fetch_failed("transaction", &e, details);
            }
        };
        details.insert("confirmations".to_string(), tx.confirmations.to_string());

        let header = match self.chain.get_block_header(proof.block_height).await {
            Ok(header) => header,
            Err(e) => {
                warn!("Cannot fetch block header {}: {}", proof.block_height, e);
                return ProofVerification::fetch_failed("block header", &e, details);
            }
        };

        let computed = match recompute_root(&proof.tx_id, &proof.proof_path) {
            Ok(root) => root,
            Err(reason) => return ProofVerification::rejected(reason, details),
        };
        details.insert("computed_root".to_string(), computed.clone());

        if !computed.eq_ignore_ascii_case(&proof.block_header_merkle_root) {
            return ProofVerification::rejected(
                "computed merkle root does not match claimed root",
                details,
            );
        }

        if !proof
            .block_header_merkle_root
            .eq_ignore_ascii_case(&header.merkle_root)
        {
            return ProofVerification::rejected(
                "claimed merkle root does not match block header",
                details,
            );
        }

        if proof.confirmation_status == ConfirmationStatus::Confirmed {
            if proof.confirmed_at.is_none() {
                return ProofVerification::rejected(
                    "confirmed proof is missing its confirmed_at timestamp",
                    details,
                );
            }
            if tx.block_height != Some(proof.block_height) {
                return ProofVerification::rejected(
                    format!(
                        "transaction not found in block {}",
                        proof.block_height
                    ),
                    details,
                );
            }
        }

        debug!("Verified proof for {}", proof.tx_id);
        ProofVerification::accepted(details)
    }

    /// Verify proofs independently, preserving order
    pub async fn verify_batch(&self, proofs: &[MerkleProof]) -> Vec<ProofVerification> {
        let mut results = Vec::with_capacity(proofs.len());
        for proof in proofs {
            results.push(self.verify_proof(Some(proof)).await);
        }
        results
    }

    /// Re-read chain data and upgrade a provisional proof whose transaction
    /// is now in the stated block. Returns an updated copy.
    pub async fn refresh_proof(&self, proof: Option<&MerkleProof>) -> EngineResult<MerkleProof> {
        let proof = proof.ok_or_else(|| EngineError::missing_proof("cannot refresh a nil proof"))?;
        let mut refreshed = proof.clone();

        let tx = self.chain.get_transaction(&proof.tx_id).await?;

        if refreshed.confirmation_status == ConfirmationStatus::Provisional
            && tx.block_height == Some(proof.block_height)
        {
            refreshed.confirm(Utc::now());
            info!(
                "Proof for {} confirmed in block {}",
                proof.tx_id, proof.block_height
            );
        }

        Ok(refreshed)
    }

    /// Verify a sequence of proofs that must sit at strictly increasing heights
    pub async fn validate_chain(&self, proofs: &[MerkleProof]) -> ProofVerification {
        let mut details = BTreeMap::new();
        details.insert("length".to_string(), proofs.len().to_string());

        if proofs.is_empty() {
            return ProofVerification::rejected("proof chain is empty", details);
        }

        for (index, proof) in proofs.iter().enumerate() {
            let result = self.verify_proof(Some(proof)).await;
            if !result.valid {
                let mut rejected = ProofVerification::rejected(
                    format!(
                        "proof {} is invalid: {}",
                        index,
                        result.error.unwrap_or_default()
                    ),
                    details,
                );
                rejected.unreachable = result.unreachable;
                return rejected;
            }

            if index > 0 && proof.block_height <= proofs[index - 1].block_height {
                return ProofVerification::rejected(
                    format!(
                        "proof {} at height {} does not follow height {}",
                        index,
                        proof.block_height,
                        proofs[index - 1].block_height
                    ),
                    details,
                );
            }
        }

        ProofVerification::accepted(details)
    }

    /// Build a proof for a mined transaction from the chain's Merkle path
    pub async fn build_proof(
        &self,
        tx_id: &str,
        funded_amount_sats: u64,
        funding_address: &str,
    ) -> EngineResult<MerkleProof> {
        let path = self.chain.get_merkle_path(tx_id).await?;
        let header = self.chain.get_block_header(path.block_height).await?;

        let proof_path = path.to_proof_path();
        let root = recompute_root(tx_id, &proof_path).map_err(EngineError::validation)?;
        if !root.eq_ignore_ascii_case(&header.merkle_root) {
            return Err(EngineError::validation(format!(
                "Merkle path for {} does not reach the root of block {}",
                tx_id, path.block_height
            )));
        }

        let mut proof = MerkleProof::provisional(
            tx_id.to_string(),
            path.block_height,
            root,
            proof_path,
            funded_amount_sats,
            funding_address.to_string(),
        );

        let tx = self.chain.get_transaction(tx_id).await?;
        if tx.block_height == Some(path.block_height) {
            proof.confirm(Utc::now());
        }

        Ok(proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChainSource;

    fn tx_id(n: u8) -> String {
        hex::encode([n; 32])
    }

    async fn setup(authoritative: bool) -> (Arc<InMemoryChainSource>, MerkleProofVerifier) {
        let chain = Arc::new(InMemoryChainSource::new(100));
        chain.mine(&tx_id(1), 90).await;
        chain.mine(&tx_id(2), 90).await;
        chain.mine(&tx_id(3), 95).await;
        let verifier = MerkleProofVerifier::new(VerifierConfig { authoritative }, chain.clone());
        (chain, verifier)
    }

    #[test]
    fn test_recompute_root_single_sha256() {
        let leaf = [1u8; 32];
        let sibling = [2u8; 32];
        let expected = hex::encode(sha256::Hash::hash(&[leaf, sibling].concat()).to_byte_array());

        let root = recompute_root(&hex::encode(leaf), &[ProofNode::right(hex::encode(sibling))]).unwrap();
        assert_eq!(root, expected);

        let flipped = recompute_root(&hex::encode(leaf), &[ProofNode::left(hex::encode(sibling))]).unwrap();
        assert_ne!(flipped, expected);
    }

    #[test]
    fn test_structure_rejects_bad_nodes() {
        let mut proof = MerkleProof::provisional(
            tx_id(1),
            10,
            "ab".to_string(),
            vec![ProofNode::left("")],
            1,
            String::new(),
        );
        assert!(validate_structure(&proof).unwrap_err().contains("empty hash"));

        proof.proof_path = vec![ProofNode {
            hash: "ab".to_string(),
            direction: ProofDirection::Unknown,
        }];
        assert!(validate_structure(&proof).unwrap_err().contains("invalid direction"));

        proof.block_height = 0;
        assert!(validate_structure(&proof).is_err());
    }

    #[tokio::test]
    async fn test_nil_proof_is_invalid() {
        let (_, verifier) = setup(false).await;
        let result = verifier.verify_proof(None).await;
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("proof is nil"));
    }

    #[tokio::test]
    async fn test_built_proof_verifies() {
        let (_, verifier) = setup(false).await;
        let proof = verifier.build_proof(&tx_id(2), 10_000, "bc1qfund").await.unwrap();

        assert!(proof.is_confirmed());
        assert_eq!(
            recompute_root(&proof.tx_id, &proof.proof_path).unwrap(),
            proof.block_header_merkle_root
        );

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(result.valid, "{:?}", result.error);
        assert_eq!(result.details.get("confirmations").map(String::as_str), Some("11"));
    }

    #[tokio::test]
    async fn test_verification_is_idempotent() {
        let (_, verifier) = setup(false).await;
        let proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();

        let first = verifier.verify_proof(Some(&proof)).await;
        let second = verifier.verify_proof(Some(&proof)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_tampered_path_rejected() {
        let (_, verifier) = setup(false).await;
        let mut proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        proof.proof_path[0].hash = tx_id(9);

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(!result.valid);
        assert_eq!(
            result.error.as_deref(),
            Some("computed merkle root does not match claimed root")
        );
    }

    #[tokio::test]
    async fn test_root_from_other_block_rejected() {
        let (_, verifier) = setup(false).await;
        let mut proof = verifier.build_proof(&tx_id(3), 10_000, "bc1qfund").await.unwrap();
        // Self-consistent proof that claims the wrong block
        proof.block_height = 90;

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(!result.valid);
        assert_eq!(
            result.error.as_deref(),
            Some("claimed merkle root does not match block header")
        );
    }

    #[tokio::test]
    async fn test_confirmed_without_timestamp_rejected() {
        let (_, verifier) = setup(false).await;
        let mut proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        proof.confirmed_at = None;

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("confirmed_at"));
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let (_, verifier) = setup(true).await;
        let mut proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        proof.proof_path.clear();

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("proof path is empty"));
    }

    #[tokio::test]
    async fn test_authoritative_mode_skips_chain() {
        let (chain, verifier) = setup(true).await;
        let proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        chain.set_unavailable(true).await;

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(result.valid);
        assert_eq!(result.details.get("mode").map(String::as_str), Some("authoritative"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported_not_raised() {
        let (chain, verifier) = setup(false).await;
        let proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        chain.set_unavailable(true).await;

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(!result.valid);
        assert!(result.unreachable);
        assert!(result.error.unwrap().starts_with("failed to fetch transaction"));

        let chained = verifier.validate_chain(&[proof]).await;
        assert!(chained.unreachable);
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_an_outage() {
        let (_, verifier) = setup(false).await;
        let mut proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        proof.tx_id = tx_id(7);

        let result = verifier.verify_proof(Some(&proof)).await;
        assert!(!result.valid);
        assert!(!result.unreachable);
    }

    #[tokio::test]
    async fn test_refresh_upgrades_provisional() {
        let (_, verifier) = setup(false).await;
        let mut proof = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        proof.confirmation_status = ConfirmationStatus::Provisional;
        proof.confirmed_at = None;

        let refreshed = verifier.refresh_proof(Some(&proof)).await.unwrap();
        assert!(refreshed.is_confirmed());
        assert!(refreshed.confirmed_at.is_some());
        // Original untouched
        assert_eq!(proof.confirmation_status, ConfirmationStatus::Provisional);
    }

    #[tokio::test]
    async fn test_refresh_nil_proof_is_error() {
        let (_, verifier) = setup(false).await;
        let err = verifier.refresh_proof(None).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingProof(_)));
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let (_, verifier) = setup(false).await;
        let good = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        let mut bad = good.clone();
        bad.proof_path.clear();

        let results = verifier.verify_batch(&[bad, good]).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].valid);
        assert!(results[1].valid);
    }

    #[tokio::test]
    async fn test_validate_chain_requires_increasing_heights() {
        let (_, verifier) = setup(false).await;
        let early = verifier.build_proof(&tx_id(1), 10_000, "bc1qfund").await.unwrap();
        let late = verifier.build_proof(&tx_id(3), 10_000, "bc1qfund").await.unwrap();

        assert!(verifier.validate_chain(&[early.clone(), late.clone()]).await.valid);

        let result = verifier.validate_chain(&[late, early]).await;
        assert!(!result.valid);
        assert!(result.error.unwrap().contains("does not follow"));

        assert!(!verifier.validate_chain(&[]).await.valid);
    }
}
