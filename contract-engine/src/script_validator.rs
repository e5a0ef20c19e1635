//! Script Validator - Pattern-level validation of locking scripts
//!
//! Recognizes P2PKH, 2-of-3 multisig, CLTV timelock and key-path Taproot
//! scripts by their opcode layout. Nothing is executed and signatures are
//! only checked for well-formedness. Every check is a decision function:
//! failures come back as a [`ValidationResult`], never as an error.
//!
//! The builders at the bottom produce the scripts the escrow engine locks
//! funds with, in the same layouts the validators recognize.

use crate::{error::EngineError, merkle_verifier::hash_pair, EngineResult};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

mod opcodes {
    pub const OP_2: u8 = 0x52;
    pub const OP_3: u8 = 0x53;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
    pub const OP_PUSHBYTES_20: u8 = 0x14;
    pub const OP_PUSHBYTES_32: u8 = 0x20;
    pub const OP_PUSHBYTES_75: u8 = 0x4b;
}

use opcodes::*;

/// Configuration for the script validator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptValidatorConfig {
    /// Chain height assumed for timelock checks when the caller gives none
    pub default_chain_height: u32,
}

impl Default for ScriptValidatorConfig {
    fn default() -> Self {
        Self {
            default_chain_height: 800_000,
        }
    }
}

/// Script layout recognized by a validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    P2pkh,
    Multisig,
    Timelock,
    Taproot,
}

/// Result of a script validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub error: Option<String>,
    pub script_type: Option<ScriptType>,
    pub required_signatures: Option<usize>,
    pub timelock: Option<u32>,
}

impl ValidationResult {
    fn ok(script_type: ScriptType) -> Self {
        Self {
            valid: true,
            error: None,
            script_type: Some(script_type),
            required_signatures: None,
            timelock: None,
        }
    }

    fn fail<S: Into<String>>(script_type: Option<ScriptType>, error: S) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
            script_type,
            required_signatures: None,
            timelock: None,
        }
    }
}

/// Contract script families accepted by [`ScriptValidator::validate_contract_script`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptContractType {
    MultisigEscrow,
    TimelockRefund,
    TaprootContract,
}

impl ScriptContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultisigEscrow => "multisig_escrow",
            Self::TimelockRefund => "timelock_refund",
            Self::TaprootContract => "taproot_contract",
        }
    }
}

impl fmt::Display for ScriptContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptContractType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multisig_escrow" => Ok(Self::MultisigEscrow),
            "timelock_refund" => Ok(Self::TimelockRefund),
            "taproot_contract" => Ok(Self::TaprootContract),
            other => Err(format!("unknown contract type: {}", other)),
        }
    }
}

/// Spending parameters, one shape per contract script family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptParams {
    Multisig {
        signatures: Vec<String>,
        pubkeys: Vec<String>,
    },
    Timelock {
        current_height: Option<u32>,
    },
    Taproot {
        signature: String,
        control_block: String,
    },
}

/// Non-empty, even-length hex
pub fn is_valid_hex(s: &str) -> bool {
    !s.is_empty() && hex::decode(s).is_ok()
}

/// Whether `needles` occur in `haystack` in order (not necessarily adjacent)
fn contains_in_order(haystack: &[u8], needles: &[u8]) -> bool {
    let mut remaining = haystack.iter();
    needles
        .iter()
        .all(|needle| remaining.any(|byte| byte == needle))
}

/// Merkle root over a list of byte strings: pairwise `SHA256(a || b)`,
/// duplicating the last node of odd-sized levels. A single leaf is its own root.
pub fn merkle_root_of_list(leaves: &[Vec<u8>]) -> Option<Vec<u8>> {
    if leaves.is_empty() {
        return None;
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]).to_vec())
            .collect();
    }

    level.pop()
}

/// Stateless script validator
#[derive(Debug, Clone, Default)]
pub struct ScriptValidator {
    config: ScriptValidatorConfig,
}

impl ScriptValidator {
    /// Create a new script validator
    pub fn new(config: ScriptValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a pay-to-pubkey-hash spend
    pub fn validate_p2pkh(&self, script_hex: &str, signature_hex: &str, pubkey_hex: &str) -> ValidationResult {
        let kind = Some(ScriptType::P2pkh);

        let script = match hex::decode(script_hex) {
            Ok(script) if !script.is_empty() => script,
            _ => return ValidationResult::fail(kind, "script is not valid hex"),
        };
        if !is_valid_hex(signature_hex) {
            return ValidationResult::fail(kind, "signature is not valid hex");
        }
        if !is_valid_hex(pubkey_hex) {
            return ValidationResult::fail(kind, "public key is not valid hex");
        }

        let pattern = [OP_DUP, OP_HASH160, OP_PUSHBYTES_20, OP_EQUALVERIFY, OP_CHECKSIG];
        if !contains_in_order(&script, &pattern) {
            return ValidationResult::fail(kind, "script does not match the P2PKH pattern");
        }

        ValidationResult::ok(ScriptType::P2pkh)
    }

    /// Validate a 2-of-3 multisig escrow spend
    pub fn validate_multisig_escrow(
        &self,
        script_hex: &str,
        signatures: &[String],
        pubkeys: &[String],
    ) -> ValidationResult {
        let kind = Some(ScriptType::Multisig);

        let script = match hex::decode(script_hex) {
            Ok(script) if !script.is_empty() => script,
            _ => return ValidationResult::fail(kind, "script is not valid hex"),
        };
        if signatures.len() < 2 {
            return ValidationResult::fail(
                kind,
                format!("multisig escrow requires at least 2 signatures, got {}", signatures.len()),
            );
        }
        if pubkeys.len() != 3 {
            return ValidationResult::fail(
                kind,
                format!("multisig escrow requires exactly 3 public keys, got {}", pubkeys.len()),
            );
        }
        if let Some(index) = signatures.iter().position(|s| !is_valid_hex(s)) {
            return ValidationResult::fail(kind, format!("signature {} is not valid hex", index));
        }
        if let Some(index) = pubkeys.iter().position(|k| !is_valid_hex(k)) {
            return ValidationResult::fail(kind, format!("public key {} is not valid hex", index));
        }

        if !contains_in_order(&script, &[OP_2, OP_3, OP_CHECKMULTISIG]) {
            return ValidationResult::fail(kind, "script does not match the 2-of-3 multisig pattern");
        }

        ValidationResult {
            required_signatures: Some(2),
            ..ValidationResult::ok(ScriptType::Multisig)
        }
    }

    /// Validate a CLTV timelock against the current chain height
    pub fn validate_timelock(&self, script_hex: &str, current_height: u32) -> ValidationResult {
        let kind = Some(ScriptType::Timelock);

        let script = match hex::decode(script_hex) {
            Ok(script) if !script.is_empty() => script,
            _ => return ValidationResult::fail(kind, "script is not valid hex"),
        };

        let marker = match script.iter().position(|b| *b == OP_CHECKLOCKTIMEVERIFY) {
            Some(marker) => marker,
            None => return ValidationResult::fail(kind, "script has no CHECKLOCKTIMEVERIFY opcode"),
        };

        let lock_bytes: [u8; 4] = match script.get(marker + 1..marker + 5).map(<[u8; 4]>::try_from) {
            Some(Ok(bytes)) => bytes,
            _ => return ValidationResult::fail(kind, "script is too short to hold a lock height"),
        };
        let lock_height = u32::from_be_bytes(lock_bytes);

        if current_height < lock_height {
            return ValidationResult {
                timelock: Some(lock_height),
                ..ValidationResult::fail(
                    kind,
                    format!(
                        "timelock not expired: current height {} is below lock height {}",
                        current_height, lock_height
                    ),
                )
            };
        }

        ValidationResult {
            timelock: Some(lock_height),
            ..ValidationResult::ok(ScriptType::Timelock)
        }
    }

    /// Validate a key-path Taproot spend
    pub fn validate_taproot(&self, script_hex: &str, signature_hex: &str, control_block_hex: &str) -> ValidationResult {
        let kind = Some(ScriptType::Taproot);

        let script = match hex::decode(script_hex) {
            Ok(script) if !script.is_empty() => script,
            _ => return ValidationResult::fail(kind, "script is not valid hex"),
        };
        if !is_valid_hex(signature_hex) {
            return ValidationResult::fail(kind, "signature is not valid hex");
        }
        if !is_valid_hex(control_block_hex) {
            return ValidationResult::fail(kind, "control block is not valid hex");
        }
        if script[0] != OP_PUSHBYTES_32 || script.len() < 33 {
            return ValidationResult::fail(kind, "script is not a key-path taproot commitment");
        }

        ValidationResult {
            required_signatures: Some(1),
            ..ValidationResult::ok(ScriptType::Taproot)
        }
    }

    /// Dispatch to the validator for `contract_type`
    pub fn validate_contract_script(
        &self,
        contract_type: &str,
        script_hex: &str,
        params: &ScriptParams,
    ) -> ValidationResult {
        let contract_type = match contract_type.parse::<ScriptContractType>() {
            Ok(contract_type) => contract_type,
            Err(_) => return ValidationResult::fail(None, "unknown contract type"),
        };

        match (contract_type, params) {
            (ScriptContractType::MultisigEscrow, ScriptParams::Multisig { signatures, pubkeys }) => {
                self.validate_multisig_escrow(script_hex, signatures, pubkeys)
            }
            (ScriptContractType::TimelockRefund, ScriptParams::Timelock { current_height }) => {
                let height = current_height.unwrap_or(self.config.default_chain_height);
                self.validate_timelock(script_hex, height)
            }
            (ScriptContractType::TaprootContract, ScriptParams::Taproot { signature, control_block }) => {
                self.validate_taproot(script_hex, signature, control_block)
            }
            (contract_type, _) => ValidationResult::fail(
                None,
                format!("parameters do not match contract type {}", contract_type),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Script builders
// ---------------------------------------------------------------------------

fn push_data(script: &mut Vec<u8>, data: &[u8]) -> EngineResult<()> {
    if data.is_empty() || data.len() > OP_PUSHBYTES_75 as usize {
        return Err(EngineError::validation(format!(
            "cannot push {} bytes with a direct push",
            data.len()
        )));
    }
    script.push(data.len() as u8);
    script.extend_from_slice(data);
    Ok(())
}

/// Decode a participant key, accepting compressed or uncompressed SEC encodings
pub fn decode_pubkey(pubkey_hex: &str) -> EngineResult<Vec<u8>> {
    let key = hex::decode(pubkey_hex)
        .map_err(|e| EngineError::validation(format!("public key {} is not valid hex: {}", pubkey_hex, e)))?;
    match key.len() {
        33 | 65 => Ok(key),
        other => Err(EngineError::validation(format!(
            "public key must be 33 or 65 bytes, got {}",
            other
        ))),
    }
}

/// `OP_2 <pk1> <pk2> <pk3> OP_3 OP_CHECKMULTISIG`
pub fn build_multisig_script(pubkeys: &[Vec<u8>]) -> EngineResult<Vec<u8>> {
    if pubkeys.len() != 3 {
        return Err(EngineError::validation(format!(
            "2-of-3 multisig needs exactly 3 keys, got {}",
            pubkeys.len()
        )));
    }

    let mut script = vec![OP_2];
    for key in pubkeys {
        push_data(&mut script, key)?;
    }
    script.push(OP_3);
    script.push(OP_CHECKMULTISIG);
    Ok(script)
}

/// `OP_CLTV <lock height, 4 bytes big-endian> OP_DROP <pk> OP_CHECKSIG`
pub fn build_timelock_script(pubkey: &[u8], lock_height: u32) -> EngineResult<Vec<u8>> {
    let mut script = vec![OP_CHECKLOCKTIMEVERIFY];
    script.extend_from_slice(&lock_height.to_be_bytes());
    script.push(OP_DROP);
    push_data(&mut script, pubkey)?;
    script.push(OP_CHECKSIG);
    Ok(script)
}

/// Taproot key commitment: the x-only key of a single participant, or the
/// Merkle root over all participants' x-only keys
pub fn taproot_key_commitment(pubkeys: &[Vec<u8>]) -> EngineResult<[u8; 32]> {
    let x_only = pubkeys
        .iter()
        .map(|key| match key.len() {
            32 => Ok(key.clone()),
            33 => Ok(key[1..].to_vec()),
            other => Err(EngineError::validation(format!(
                "taproot keys must be 32 or 33 bytes, got {}",
                other
            ))),
        })
        .collect::<EngineResult<Vec<_>>>()?;

    let root = merkle_root_of_list(&x_only)
        .ok_or_else(|| EngineError::validation("taproot contract needs at least one key"))?;

    <[u8; 32]>::try_from(root.as_slice())
        .map_err(|_| EngineError::internal("taproot commitment is not 32 bytes"))
}

/// `PUSH32 <key commitment> OP_CHECKSIG`
pub fn build_taproot_script(commitment: &[u8; 32]) -> Vec<u8> {
    let mut script = vec![OP_PUSHBYTES_32];
    script.extend_from_slice(commitment);
    script.push(OP_CHECKSIG);
    script
}
