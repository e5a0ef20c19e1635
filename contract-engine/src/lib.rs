//! Bitcoin-backed escrow contract engine for task marketplaces
//!
//! This crate implements the money-safety core underneath a task marketplace:
//! - Locking-script pattern validation (P2PKH, 2-of-3 multisig, CLTV, key-path Taproot)
//! - Merkle inclusion proof verification against a chain data source
//! - Escrow contract lifecycle (create, fund, claim, payout, refund)
//! - Dispute arbitration with weighted voting and payout splitting
//! - Background confirmation monitoring and proof escort services

pub mod cancel;
pub mod chain;
pub mod config;
pub mod dispute_engine;
pub mod error;
pub mod escort;
pub mod escrow_engine;
pub mod merkle_verifier;
pub mod models;
pub mod monitor;
pub mod node;
pub mod script_validator;

use error::EngineError;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
