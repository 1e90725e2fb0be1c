//! Storage failures surfacing through client results

mod common;

use common::{fast_settings, item, TestNetwork, REGISTER_TIMEOUT};
use ledger_node::item::{ErrorCode, Transaction};
use ledger_node::ledger::ItemState;

#[tokio::test]
async fn test_exhausted_retries_yield_undefined_with_storage_error() {
    let net = TestNetwork::start(1, fast_settings(1));

    // another writer holds the database for the whole registration
    let blocker = rusqlite::Connection::open(net.ledger_path(0)).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let tx = Transaction::single(item("blocked write")).unwrap();
    let result = net.node(0).register(&tx.pack().unwrap(), REGISTER_TIMEOUT).await.unwrap();

    assert_eq!(result.state, ItemState::Undefined);
    assert!(
        result.errors.iter().any(|e| e.code == ErrorCode::Storage),
        "{:?}",
        result.errors
    );

    // the node recovers once the database is free again
    blocker.execute_batch("ROLLBACK").unwrap();
    let retry = net.node(0).register(&tx.pack().unwrap(), REGISTER_TIMEOUT).await.unwrap();
    assert_eq!(retry.state, ItemState::Approved, "{:?}", retry.errors);
}

#[tokio::test]
async fn test_broken_ledger_yields_storage_error() {
    let net = TestNetwork::start(1, fast_settings(1));

    let conn = rusqlite::Connection::open(net.ledger_path(0)).unwrap();
    conn.execute_batch("DROP TABLE ledger").unwrap();

    let tx = Transaction::single(item("no table")).unwrap();
    let result = net.node(0).register(&tx.pack().unwrap(), REGISTER_TIMEOUT).await.unwrap();

    assert_eq!(result.state, ItemState::Undefined);
    assert_eq!(result.errors[0].code, ErrorCode::Storage);
}
