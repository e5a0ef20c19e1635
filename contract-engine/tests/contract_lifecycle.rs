//! End-to-end contract flows against the in-process chain

use chrono::{Duration, Utc};
use contract_engine::{
    chain::{ChainDataSource, InMemoryChainSource},
    config::NodeConfig,
    dispute_engine::{CreateDisputeRequest, EvidenceSubmission, VoteSubmission},
    escort::{NextAction, ProofState},
    escrow_engine::{ClaimRequest, ContractConfig, Payout},
    models::{
        Arbitrator, ContractStatus, ContractType, DisputeStatus, DisputeType, EscrowParticipant,
        ParticipantRole, TransactionStatus, VoteDecision,
    },
    monitor::{EventKind, MonitorStatus},
    node::ContractNode,
};
use std::sync::Arc;
use tokio::sync::mpsc;

fn key(n: u8) -> String {
    format!("02{}", hex::encode([n; 32]))
}

fn participants() -> Vec<EscrowParticipant> {
    [
        ("alice", 1, ParticipantRole::Creator, 0.0),
        ("bob", 2, ParticipantRole::Worker, 95.0),
        ("carol", 3, ParticipantRole::Arbitrator, 5.0),
    ]
    .into_iter()
    .map(|(name, n, role, share)| EscrowParticipant {
        name: name.to_string(),
        public_key: key(n),
        role,
        share_percent: share,
    })
    .collect()
}

async fn setup() -> (Arc<InMemoryChainSource>, ContractNode) {
    let chain = Arc::new(InMemoryChainSource::new(800_000));
    let node = ContractNode::new(NodeConfig::default(), chain.clone())
        .await
        .unwrap();
    (chain, node)
}

/// Mine a transaction, bury it and run one monitor pass
async fn confirm(chain: &InMemoryChainSource, node: &ContractNode, tx_id: &str) {
    let height = chain.get_tip_height().await.unwrap() + 1;
    chain.mine(tx_id, height).await;
    chain.advance(6).await;
    node.monitor().poll_due(Utc::now() + Duration::hours(1)).await;
}

async fn funded_contract(chain: &InMemoryChainSource, node: &ContractNode, raw_tx: &[u8]) -> String {
    let contract = node
        .escrow_engine()
        .create(ContractConfig {
            contract_type: ContractType::Multisig,
            participants: participants(),
            total_budget_sats: 250_000,
            lock_time: 0,
        })
        .await
        .unwrap();

    let funding = node
        .escrow_engine()
        .fund(&contract.contract_id, raw_tx)
        .await
        .unwrap();
    confirm(chain, node, &funding.tx_id).await;
    contract.contract_id
}

#[tokio::test]
async fn test_full_escrow_lifecycle() {
    let (chain, node) = setup().await;
    let engine = node.escrow_engine();

    let (sink, mut events) = mpsc::channel(64);
    node.monitor().set_event_sink(sink).await;

    let contract_id = funded_contract(&chain, &node, b"funding transaction bytes").await;

    let contract = engine.get_contract(&contract_id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Funded);
    let proof = contract.merkle_proof.clone().expect("funding proof attached");
    assert_eq!(proof.funding_address, contract.address);

    let funding_tx = &contract.transactions[0].tx_id;
    let tracked = node.monitor().get(funding_tx).await.unwrap();
    assert_eq!(tracked.status, MonitorStatus::Confirmed);
    assert_eq!(tracked.to_address, contract.address);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::TxFullyConfirmed));

    let escorted = node.escort().validate(&contract_id, Some(&proof)).await;
    assert_eq!(escorted.status, ProofState::Confirmed);
    assert_eq!(escorted.next_action, NextAction::MonitorContractExecution);

    let claim = engine
        .claim(ClaimRequest {
            contract_id: contract_id.clone(),
            claimant_pubkey: key(2),
            signatures: vec!["304402aa".to_string(), "304402bb".to_string()],
            current_height: None,
            control_block: None,
        })
        .await
        .unwrap();
    assert_eq!(claim.amount_sats, 237_500);
    confirm(&chain, &node, &claim.tx_id).await;
    assert_eq!(
        engine.get_contract(&contract_id).await.unwrap().status,
        ContractStatus::Active
    );

    let payouts = engine
        .payout(
            &contract_id,
            vec![
                Payout {
                    recipient: "bob".to_string(),
                    amount_sats: 237_500,
                },
                Payout {
                    recipient: "carol".to_string(),
                    amount_sats: 12_500,
                },
            ],
        )
        .await
        .unwrap();
    for payout in &payouts {
        confirm(&chain, &node, &payout.tx_id).await;
    }

    let contract = engine.get_contract(&contract_id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Completed);
    assert!(contract
        .transactions
        .iter()
        .all(|tx| tx.status == TransactionStatus::Confirmed));
    assert_eq!(engine.pending_count().await, 0);

    let health = node.health_check().await.unwrap();
    assert!(health.healthy);
    assert_eq!(health.monitored_transactions, 4);
}

#[tokio::test]
async fn test_dispute_ends_in_refund() {
    let (chain, node) = setup().await;
    let contract_id = funded_contract(&chain, &node, b"disputed funding").await;
    let contract = node.escrow_engine().get_contract(&contract_id).await.unwrap();

    let disputes = node.dispute_engine();
    for (id, reputation) in [("arb_a", 9.5), ("arb_b", 8.0), ("arb_c", 7.5), ("arb_d", 3.0)] {
        disputes
            .add_arbitrator(Arbitrator {
                id: id.to_string(),
                name: id.to_uppercase(),
                public_key: key(9),
                reputation,
                specialties: vec![DisputeType::NonDelivery],
                active: true,
                vote_weight: 1.0,
            })
            .await
            .unwrap();
    }

    let dispute = disputes
        .create_dispute(CreateDisputeRequest {
            dispute_id: "dispute_1".to_string(),
            contract_id: contract_id.clone(),
            initiator: "alice".to_string(),
            respondent: "bob".to_string(),
            dispute_type: "non_delivery".to_string(),
            description: "Nothing was delivered before the deadline".to_string(),
            disputed_amount_sats: contract.total_budget_sats,
        })
        .await
        .unwrap();
    assert_eq!(dispute.arbitrators, vec!["arb_a", "arb_b", "arb_c"]);

    let proof = contract.merkle_proof.clone().unwrap();
    let evidence = disputes
        .submit_evidence(
            "dispute_1",
            "alice",
            EvidenceSubmission {
                evidence_type: "transaction_proof".to_string(),
                content: serde_json::to_string(&proof).unwrap(),
                ..EvidenceSubmission::default()
            },
        )
        .await
        .unwrap();
    assert!(evidence.valid, "{:?}", evidence.metadata);

    for arbitrator in &dispute.arbitrators {
        disputes
            .cast_vote(
                "dispute_1",
                arbitrator,
                VoteSubmission {
                    decision: "full_refund".to_string(),
                    reason: "Funding proven, no delivery shown".to_string(),
                    evidence_ids: vec![evidence.id.clone()],
                    confidence: 0.9,
                },
            )
            .await
            .unwrap();
    }

    let resolution = disputes.resolve("dispute_1").await.unwrap();
    assert_eq!(resolution.decision, VoteDecision::FullRefund);
    assert_eq!(resolution.payout_split["alice"], 250_000);
    assert_eq!(resolution.payout_split["bob"], 0);
    assert_eq!(
        disputes.get_dispute("dispute_1").await.unwrap().status,
        DisputeStatus::Completed
    );

    let refund = node
        .escrow_engine()
        .refund(&contract_id, "dispute")
        .await
        .unwrap();
    confirm(&chain, &node, &refund.tx_id).await;

    let contract = node.escrow_engine().get_contract(&contract_id).await.unwrap();
    assert_eq!(contract.status, ContractStatus::Expired);
    assert!(contract.spent_at.is_some());
}
