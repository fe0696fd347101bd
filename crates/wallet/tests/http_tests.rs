use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use httpmock::prelude::*;
use serde_json::json;

use tidepool_wallet::prover::ProofError;
use tidepool_wallet::relay::{Paymaster, UserOperation};
use tidepool_wallet::remote_log::RemoteLogError;
use tidepool_wallet::tracking::TxReceipt;
use tidepool_wallet::{
    HttpIndexerStatus, HttpProofGenerator, IndexerStatus, JsonRpcClient, PaymasterClient,
    ProofGenerator, ReceiptSource, RemoteLog, RpcReceiptSource, RpcRemoteLog, TrackingError,
    WithdrawalProofInputs,
};

fn proof_body() -> serde_json::Value {
    json!({
        "proof": {
            "pi_a": ["1", "2", "1"],
            "pi_b": [["3", "4"], ["5", "6"], ["1", "0"]],
            "pi_c": ["7", "8", "1"]
        },
        "publicSignals": ["1", "2", "3", "4", "5", "6", "7", "8"]
    })
}

#[tokio::test]
async fn test_indexer_status() {
    let server = MockServer::start();
    let status = server.mock(|when, then| {
        when.method(GET).path("/status");
        then.status(200)
            .json_body(json!({"latestIndexedBlock": 120, "healthy": true}));
    });

    let indexer = HttpIndexerStatus::new(server.url("/"));
    let health = indexer.status().await.unwrap();

    assert_eq!(health.latest_indexed_block, 120);
    assert!(health.healthy);
    status.assert_hits(1);
}

#[tokio::test]
async fn test_indexer_status_unavailable() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/status");
        then.status(503);
    });

    let err = HttpIndexerStatus::new(server.base_url())
        .status()
        .await
        .unwrap_err();
    assert!(matches!(err, TrackingError::Indexer(_)));
}

#[tokio::test]
async fn test_receipt_from_rpc() {
    let server = MockServer::start();
    let receipt = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"method": "eth_getTransactionReceipt"}"#);
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"blockNumber": "0x64", "status": "0x1"}
        }));
    });

    let source = RpcReceiptSource::new(JsonRpcClient::new(server.url("/")));
    let got = source
        .wait_for_receipt(B256::repeat_byte(0x01), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(
        got,
        TxReceipt {
            block_number: 100,
            success: true
        }
    );
    receipt.assert_hits(1);
}

#[tokio::test]
async fn test_unmined_receipt_times_out() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/");
        then.status(200)
            .json_body(json!({"jsonrpc": "2.0", "id": 1, "result": null}));
    });

    let source = RpcReceiptSource::new(JsonRpcClient::new(server.url("/")))
        .with_poll_interval(Duration::from_millis(20));
    let err = source
        .wait_for_receipt(B256::repeat_byte(0x02), Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(matches!(err, TrackingError::ReceiptTimeout { .. }));
}

#[tokio::test]
async fn test_asp_root_and_labels() {
    let server = MockServer::start();
    let root = server.mock(|when, then| {
        when.method(GET).path("/asp/1234");
        then.status(200)
            .json_body(json!({"root": "0xa5", "cid": "bafylabels"}));
    });
    let labels = server.mock(|when, then| {
        when.method(GET).path("/ipfs/bafylabels");
        then.status(200).json_body(json!({"labels": ["7", "0x2a"]}));
    });

    let log = RpcRemoteLog::new(server.url("/rpc"), server.base_url(), server.base_url());
    let asp = log.asp_root(U256::from(1234u64)).await.unwrap();
    assert_eq!(asp.root, U256::from(0xa5u64));
    assert_eq!(asp.cid, "bafylabels");

    let approved = log.asp_labels(&asp.cid).await.unwrap();
    assert_eq!(approved, vec![U256::from(7u64), U256::from(42u64)]);
    root.assert_hits(1);
    labels.assert_hits(1);
}

#[tokio::test]
async fn test_missing_label_list() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/ipfs/gone");
        then.status(404);
    });

    let log = RpcRemoteLog::new(server.url("/rpc"), server.base_url(), server.base_url());
    let err = log.asp_labels("gone").await.unwrap_err();

    assert!(matches!(err, RemoteLogError::NotFound(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_fetch_events_pages_by_block() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"method": "eth_blockNumber"}"#);
        then.status(200)
            .json_body(json!({"jsonrpc": "2.0", "id": 1, "result": "0x1f"}));
    });
    let logs = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"method": "eth_getLogs"}"#);
        then.status(200)
            .json_body(json!({"jsonrpc": "2.0", "id": 2, "result": []}));
    });

    let log = RpcRemoteLog::new(server.url("/"), server.base_url(), server.base_url());
    let pool = Address::repeat_byte(0x70);

    let page = log.fetch_events(pool, 0, 16).await.unwrap();
    assert!(page.events.is_empty());
    assert_eq!(page.next_cursor, 16);
    assert!(page.has_more);

    let page = log.fetch_events(pool, 16, 16).await.unwrap();
    assert_eq!(page.next_cursor, 32);
    assert!(!page.has_more);

    // nothing past the head
    let page = log.fetch_events(pool, 32, 16).await.unwrap();
    assert_eq!(page.next_cursor, 32);
    logs.assert_hits(2);
}

#[tokio::test]
async fn test_proof_service_round_trip() {
    let server = MockServer::start();
    let prove = server.mock(|when, then| {
        when.method(POST)
            .path("/withdraw")
            .json_body_partial(r#"{"withdrawnValue": "5"}"#);
        then.status(200).json_body(proof_body());
    });

    let prover = HttpProofGenerator::new(server.base_url());
    let mut inputs = WithdrawalProofInputs::default();
    inputs.withdrawn_value = "5".into();
    let response = prover.generate_withdrawal_proof(&inputs).await.unwrap();

    assert_eq!(response.public_signals.len(), 8);
    assert_eq!(response.proof.pi_a[0], "1");
    prove.assert_hits(1);
}

#[tokio::test]
async fn test_proof_service_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/withdraw/crosschain");
        then.status(500).body("witness generation failed");
    });

    let prover = HttpProofGenerator::new(server.base_url());
    let err = prover
        .generate_crosschain_withdrawal_proof(&WithdrawalProofInputs::default())
        .await
        .unwrap_err();

    match err {
        ProofError::Generator(message) => assert!(message.contains("witness generation failed")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_paymaster_stub_data() {
    let server = MockServer::start();
    let stub = server.mock(|when, then| {
        when.method(POST)
            .path("/")
            .json_body_partial(r#"{"method": "pm_getPaymasterStubData"}"#);
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "paymaster": "0x5050505050505050505050505050505050505050",
                "paymasterData": "0x00",
                "paymasterVerificationGasLimit": "0xea60"
            }
        }));
    });

    let paymaster = PaymasterClient::new(
        JsonRpcClient::new(server.url("/")),
        Address::repeat_byte(0xee),
        1,
    );
    let data = paymaster.stub_data(&UserOperation::default()).await.unwrap();

    assert_eq!(data.paymaster, Address::repeat_byte(0x50));
    assert_eq!(data.paymaster_data, Bytes::from(vec![0x00]));
    assert_eq!(
        data.paymaster_verification_gas_limit,
        Some(U256::from(60_000u64))
    );
    stub.assert_hits(1);
}
