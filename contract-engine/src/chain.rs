//! Chain data sources
//!
//! The engine never talks to a node directly. Everything it needs to know
//! about the chain (confirmations, block headers, Merkle paths) comes through
//! [`ChainDataSource`]. Two implementations ship with the crate: an Esplora
//! REST client and an in-process chain for offline and regtest operation.

use crate::{
    error::{ChainError, EngineError},
    merkle_verifier::{hash_pair, recompute_root},
    models::ProofNode,
    EngineResult,
};
use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tokio::sync::RwLock;
use tracing::debug;

/// Bitcoin network the node operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainNetwork {
    Mainnet,
    Testnet,
    Regtest,
}

impl ChainNetwork {
    /// Public Esplora endpoint, if there is one
    pub fn api_url(&self) -> Option<&'static str> {
        match self {
            Self::Mainnet => Some("https://blockstream.info/api"),
            Self::Testnet => Some("https://blockstream.info/testnet/api"),
            Self::Regtest => None,
        }
    }

    /// Get the bitcoin crate Network type
    pub fn to_bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Self::Mainnet => bitcoin::Network::Bitcoin,
            Self::Testnet => bitcoin::Network::Testnet,
            Self::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// Configuration for the chain data source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub network: ChainNetwork,
    /// Overrides the public endpoint for the network (self-hosted Esplora)
    pub esplora_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            network: ChainNetwork::Mainnet,
            esplora_url: None,
            request_timeout_secs: 30,
        }
    }
}

/// A transaction output as reported by the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value_sats: u64,
    pub script_pubkey_hex: String,
    pub address: Option<String>,
}

/// Chain view of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub tx_id: String,
    /// 0 while in the mempool
    pub confirmations: u32,
    /// Height of the including block, if mined
    pub block_height: Option<u64>,
    pub outputs: Vec<TxOutput>,
}

/// Block header fields the engine cares about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
}

/// Merkle branch for a transaction, in Esplora's shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerklePath {
    pub block_height: u64,
    /// Sibling hashes from the leaf level up
    pub siblings: Vec<String>,
    /// Index of the transaction within the block
    pub position: u64,
}

impl MerklePath {
    /// Convert into directed proof nodes. Bit `i` of the position set means
    /// the running hash is a right child at level `i`, so the sibling is on the left.
    pub fn to_proof_path(&self) -> Vec<ProofNode> {
        self.siblings
            .iter()
            .enumerate()
            .map(|(level, sibling)| {
                if (self.position >> level) & 1 == 1 {
                    ProofNode::left(sibling.clone())
                } else {
                    ProofNode::right(sibling.clone())
                }
            })
            .collect()
    }
}

/// Read access to chain data
#[async_trait]
pub trait ChainDataSource: Send + Sync {
    /// Look up a transaction and its confirmation count
    async fn get_transaction(&self, tx_id: &str) -> Result<ChainTransaction, ChainError>;

    /// Look up the header of the block at `height`
    async fn get_block_header(&self, height: u64) -> Result<BlockHeader, ChainError>;

    /// Merkle branch proving a mined transaction's inclusion
    async fn get_merkle_path(&self, tx_id: &str) -> Result<MerklePath, ChainError>;

    /// Current chain tip height
    async fn get_tip_height(&self) -> Result<u64, ChainError>;
}

// ---------------------------------------------------------------------------
// Esplora
// ---------------------------------------------------------------------------

/// Chain data source backed by an Esplora (Blockstream compatible) REST API
pub struct EsploraChainSource {
    api_base: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EsploraTx {
    txid: String,
    vout: Vec<EsploraVout>,
    status: EsploraStatus,
}

#[derive(Deserialize)]
struct EsploraVout {
    scriptpubkey: String,
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Deserialize)]
struct EsploraBlock {
    id: String,
    merkle_root: String,
    timestamp: i64,
}

#[derive(Deserialize)]
struct EsploraMerkleProof {
    block_height: u64,
    merkle: Vec<String>,
    pos: u64,
}

impl EsploraChainSource {
    /// Create a client for the configured network or custom endpoint
    pub fn new(config: &ChainConfig) -> EngineResult<Self> {
        let api_base = match &config.esplora_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => config
                .network
                .api_url()
                .ok_or_else(|| {
                    EngineError::validation(
                        "No public Esplora endpoint for regtest; set chain.esplora_url",
                    )
                })?
                .to_string(),
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { api_base, client })
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ChainError> {
        let url = format!("{}{}", self.api_base, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ChainError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ChainError> {
        self.get(path)
            .await?
            .json()
            .await
            .map_err(|e| ChainError::Parse(e.to_string()))
    }

    async fn get_text(&self, path: &str) -> Result<String, ChainError> {
        self.get(path)
            .await?
            .text()
            .await
            .map(|text| text.trim().to_string())
            .map_err(|e| ChainError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ChainDataSource for EsploraChainSource {
    async fn get_transaction(&self, tx_id: &str) -> Result<ChainTransaction, ChainError> {
        let tx: EsploraTx = self.get_json(&format!("/tx/{}", tx_id)).await?;

        let (confirmations, block_height) = match (tx.status.confirmed, tx.status.block_height) {
            (true, Some(height)) => {
                let tip = self.get_tip_height().await?;
                let confirmations = tip.saturating_sub(height) + 1;
                (u32::try_from(confirmations).unwrap_or(u32::MAX), Some(height))
            }
            _ => (0, None),
        };

        Ok(ChainTransaction {
            tx_id: tx.txid,
            confirmations,
            block_height,
            outputs: tx
                .vout
                .into_iter()
                .map(|out| TxOutput {
                    value_sats: out.value,
                    script_pubkey_hex: out.scriptpubkey,
                    address: out.scriptpubkey_address,
                })
                .collect(),
        })
    }

    async fn get_block_header(&self, height: u64) -> Result<BlockHeader, ChainError> {
        let hash = self.get_text(&format!("/block-height/{}", height)).await?;
        let block: EsploraBlock = self.get_json(&format!("/block/{}", hash)).await?;

        let timestamp = DateTime::from_timestamp(block.timestamp, 0)
            .ok_or_else(|| ChainError::Parse(format!("Invalid block timestamp {}", block.timestamp)))?;

        Ok(BlockHeader {
            hash: block.id,
            merkle_root: block.merkle_root,
            timestamp,
        })
    }

    async fn get_merkle_path(&self, tx_id: &str) -> Result<MerklePath, ChainError> {
        let proof: EsploraMerkleProof = self
            .get_json(&format!("/tx/{}/merkle-proof", tx_id))
            .await?;

        Ok(MerklePath {
            block_height: proof.block_height,
            siblings: proof.merkle,
            position: proof.pos,
        })
    }

    async fn get_tip_height(&self) -> Result<u64, ChainError> {
        let text = self.get_text("/blocks/tip/height").await?;
        text.parse()
            .map_err(|e| ChainError::Parse(format!("Invalid height: {}", e)))
    }
}

// ---------------------------------------------------------------------------
// In-process chain
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ChainState {
    tip_height: u64,
    unavailable: bool,
    transactions: HashMap<String, StoredTx>,
    /// Height → transaction ids in block order, coinbase first
    blocks: HashMap<u64, Vec<String>>,
}

#[derive(Debug, Clone)]
struct StoredTx {
    block_height: Option<u64>,
    outputs: Vec<TxOutput>,
}

/// In-process chain for offline operation and tests
///
/// Blocks are built on demand: every block gets a synthetic coinbase at
/// index 0, and headers and Merkle paths are derived from the block's
/// transaction list with the same pairwise hashing the verifier uses.
#[derive(Debug, Default)]
pub struct InMemoryChainSource {
    state: RwLock<ChainState>,
}

impl InMemoryChainSource {
    /// Create a chain whose tip is at `tip_height`
    pub fn new(tip_height: u64) -> Self {
        Self {
            state: RwLock::new(ChainState {
                tip_height,
                ..ChainState::default()
            }),
        }
    }

    /// Add an unconfirmed transaction to the mempool
    pub async fn broadcast(&self, tx_id: &str, outputs: Vec<TxOutput>) {
        self.state.write().await.transactions.insert(
            tx_id.to_string(),
            StoredTx {
                block_height: None,
                outputs,
            },
        );
    }

    /// Mine a transaction into the block at `block_height`, adding it to the
    /// mempool first if needed. The tip moves up to the block if it was lower.
    pub async fn mine(&self, tx_id: &str, block_height: u64) {
        let mut state = self.state.write().await;

        let entry = state
            .transactions
            .entry(tx_id.to_string())
            .or_insert_with(|| StoredTx {
                block_height: None,
                outputs: Vec::new(),
            });
        entry.block_height = Some(block_height);

        let block = state
            .blocks
            .entry(block_height)
            .or_insert_with(|| vec![coinbase_id(block_height)]);
        if !block.iter().any(|id| id == tx_id) {
            block.push(tx_id.to_string());
        }

        if state.tip_height < block_height {
            state.tip_height = block_height;
        }
    }

    /// Set the chain tip
    pub async fn set_tip(&self, height: u64) {
        self.state.write().await.tip_height = height;
    }

    /// Move the tip forward by `blocks`
    pub async fn advance(&self, blocks: u64) {
        self.state.write().await.tip_height += blocks;
    }

    /// Make every call fail with a transport error
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.write().await.unavailable = unavailable;
    }

    fn check_available(state: &ChainState) -> Result<(), ChainError> {
        if state.unavailable {
            Err(ChainError::Transport("chain source unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn coinbase_id(height: u64) -> String {
    let digest = sha256::Hash::hash(format!("coinbase:{}", height).as_bytes());
    hex::encode(digest.to_byte_array())
}

fn decode_leaf(tx_id: &str) -> Result<Vec<u8>, ChainError> {
    hex::decode(tx_id).map_err(|e| ChainError::Parse(format!("Invalid tx id {}: {}", tx_id, e)))
}

/// Sibling hashes for the leaf at `index`, leaf level first
fn branch_for(leaves: &[Vec<u8>], mut index: usize) -> Vec<String> {
    let mut level: Vec<Vec<u8>> = leaves.to_vec();
    let mut siblings = Vec::new();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }
        let sibling = if index % 2 == 0 { index + 1 } else { index - 1 };
        siblings.push(hex::encode(&level[sibling]));

        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]).to_vec())
            .collect();
        index /= 2;
    }

    siblings
}

#[async_trait]
impl ChainDataSource for InMemoryChainSource {
    async fn get_transaction(&self, tx_id: &str) -> Result<ChainTransaction, ChainError> {
        let state = self.state.read().await;
        Self::check_available(&state)?;

        let tx = state
            .transactions
            .get(tx_id)
            .ok_or_else(|| ChainError::NotFound(format!("transaction {}", tx_id)))?;

        let confirmations = match tx.block_height {
            Some(height) if state.tip_height >= height => {
                u32::try_from(state.tip_height - height + 1).unwrap_or(u32::MAX)
            }
            _ => 0,
        };

        Ok(ChainTransaction {
            tx_id: tx_id.to_string(),
            confirmations,
            block_height: tx.block_height,
            outputs: tx.outputs.clone(),
        })
    }

    async fn get_block_header(&self, height: u64) -> Result<BlockHeader, ChainError> {
        let state = self.state.read().await;
        Self::check_available(&state)?;

        let block = state
            .blocks
            .get(&height)
            .ok_or_else(|| ChainError::NotFound(format!("block {}", height)))?;

        let first = block
            .first()
            .ok_or_else(|| ChainError::NotFound(format!("block {}", height)))?;
        let merkle_root = match branch_for_tx(block, first)? {
            Some(path) => recompute_root(first, &path.to_proof_path())
                .map_err(ChainError::Parse)?,
            None => first.clone(),
        };

        let hash = sha256::Hash::hash(format!("{}:{}", merkle_root, height).as_bytes());

        Ok(BlockHeader {
            hash: hex::encode(hash.to_byte_array()),
            merkle_root,
            timestamp: Utc::now(),
        })
    }

    async fn get_merkle_path(&self, tx_id: &str) -> Result<MerklePath, ChainError> {
        let state = self.state.read().await;
        Self::check_available(&state)?;

        let height = state
            .transactions
            .get(tx_id)
            .and_then(|tx| tx.block_height)
            .ok_or_else(|| ChainError::NotFound(format!("mined transaction {}", tx_id)))?;

        let block = state
            .blocks
            .get(&height)
            .ok_or_else(|| ChainError::NotFound(format!("block {}", height)))?;

        let mut path = branch_for_tx(block, tx_id)?
            .ok_or_else(|| ChainError::NotFound(format!("transaction {} in block {}", tx_id, height)))?;
        path.block_height = height;
        Ok(path)
    }

    async fn get_tip_height(&self) -> Result<u64, ChainError> {
        let state = self.state.read().await;
        Self::check_available(&state)?;
        Ok(state.tip_height)
    }
}

fn branch_for_tx(block: &[String], tx_id: &str) -> Result<Option<MerklePath>, ChainError> {
    let position = match block.iter().position(|id| id == tx_id) {
        Some(position) => position,
        None => return Ok(None),
    };
    let leaves = block
        .iter()
        .map(|id| decode_leaf(id))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(MerklePath {
        block_height: 0,
        siblings: branch_for(&leaves, position),
        position: position as u64,
    }))
}
