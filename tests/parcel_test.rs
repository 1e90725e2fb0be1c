//! Parcel scenarios: payload approval gated on its payment

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_settings, item, wait_for_state, TestNetwork, REGISTER_TIMEOUT};
use chrono::Utc;
use ledger_node::item::{BasicCheck, ErrorCode, ErrorRecord, Item, ItemCheck, ItemId, Parcel, Transaction};
use ledger_node::ledger::ItemState;

/// Rejects every item whose body is `unpaid`, on top of the basic checks.
struct RejectUnpaid;

impl ItemCheck for RejectUnpaid {
    fn check(&self, tx: &Transaction) -> Result<(), Vec<ErrorRecord>> {
        BasicCheck.check(tx)?;
        if tx.root().body == b"unpaid" {
            return Err(vec![ErrorRecord::new(
                ErrorCode::Payment,
                tx.root_id().short(),
                "insufficient funds",
            )]);
        }
        Ok(())
    }
}

fn parcel(payment: &str, payload: &str) -> Parcel {
    Parcel::new(
        Transaction::single(item(payment)).unwrap(),
        Transaction::single(item(payload)).unwrap(),
    )
    .unwrap()
}

fn paid_settings() -> ledger_node::ConsensusSettings {
    let mut settings = fast_settings(4);
    settings.free_registrations = false;
    settings
}

#[tokio::test]
async fn test_parcel_payload_approved_after_payment() {
    let net = TestNetwork::start(4, paid_settings());
    let parcel = parcel("payment", "payload");
    let payment_id = parcel.payment().root_id();
    let payload_id = parcel.payload().root_id();

    let parcel_id = net
        .node(0)
        .register_parcel(&parcel.pack().unwrap(), REGISTER_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(parcel_id, parcel.id());

    assert_eq!(net.node(0).get_state(&payment_id).await.unwrap().state, ItemState::Approved);
    assert_eq!(net.node(0).get_state(&payload_id).await.unwrap().state, ItemState::Approved);

    for node in &net.nodes[1..] {
        let payload = wait_for_state(node, &payload_id, ItemState::Approved, Duration::from_secs(5)).await;
        assert_eq!(payload.state, ItemState::Approved, "on {}", node.id());
    }
}

#[tokio::test]
async fn test_parcel_payload_declined_when_payment_fails() {
    let mut net = TestNetwork::prepare(4, paid_settings()).with_checker(Arc::new(RejectUnpaid));
    net.start_all();
    let parcel = parcel("unpaid", "payload for free");

    net.node(0)
        .register_parcel(&parcel.pack().unwrap(), REGISTER_TIMEOUT)
        .await
        .unwrap();

    let node = net.node(0);
    assert_eq!(
        node.get_state(&parcel.payment().root_id()).await.unwrap().state,
        ItemState::Declined
    );
    assert_eq!(
        node.get_state(&parcel.payload().root_id()).await.unwrap().state,
        ItemState::Declined
    );
}

#[tokio::test]
async fn test_undecodable_parcel_is_an_error() {
    let net = TestNetwork::start(1, fast_settings(1));
    assert!(net.node(0).register_parcel(b"garbage", REGISTER_TIMEOUT).await.is_err());
}

/// A payment that spends `previous` and creates a change item.
fn spending(previous: &Item, body: &str) -> (Transaction, ItemId) {
    let change = item("change");
    let change_id = change.id().unwrap();
    let mut payment = Item::revision_of(previous, body).unwrap();
    payment.new_items.push(change_id);
    (Transaction::new(payment, vec![change]).unwrap(), change_id)
}

/// Network where every ledger already holds `previous` as approved.
fn with_previous_payment(previous: &Item) -> TestNetwork {
    let net = TestNetwork::prepare(4, paid_settings());
    let previous_id = previous.id().unwrap();
    let now = Utc::now();
    for ledger in &net.ledgers {
        ledger
            .create(&previous_id, ItemState::Approved, now, now + chrono::Duration::days(30))
            .unwrap();
    }
    net
}

#[tokio::test]
async fn test_spent_payment_revokes_previous_and_approves_change() {
    let previous = item("payment v1");
    let previous_id = previous.id().unwrap();
    let mut net = with_previous_payment(&previous);
    net.start_all();

    let (payment, change_id) = spending(&previous, "payment v2");
    let parcel = Parcel::new(payment, Transaction::single(item("paid payload")).unwrap()).unwrap();
    net.node(0)
        .register_parcel(&parcel.pack().unwrap(), REGISTER_TIMEOUT)
        .await
        .unwrap();

    let wait = Duration::from_secs(5);
    for node in &net.nodes {
        let payload = wait_for_state(node, &parcel.payload().root_id(), ItemState::Approved, wait).await;
        assert_eq!(payload.state, ItemState::Approved, "payload on {}", node.id());
        let payment = wait_for_state(node, &parcel.payment().root_id(), ItemState::Approved, wait).await;
        assert_eq!(payment.state, ItemState::Approved, "payment on {}", node.id());
        assert_eq!(
            wait_for_state(node, &previous_id, ItemState::Revoked, wait).await.state,
            ItemState::Revoked,
            "previous payment on {}",
            node.id()
        );
        assert_eq!(
            wait_for_state(node, &change_id, ItemState::Approved, wait).await.state,
            ItemState::Approved,
            "change on {}",
            node.id()
        );
    }
}

#[tokio::test]
async fn test_failed_payment_keeps_previous_and_drops_change() {
    let previous = item("payment v1");
    let previous_id = previous.id().unwrap();
    let mut net = with_previous_payment(&previous);
    net.start_all();
    for i in 1..4 {
        net.set_online(i, false);
    }

    let (payment, change_id) = spending(&previous, "payment v2");
    let parcel = Parcel::new(payment, Transaction::single(item("unpaid payload")).unwrap()).unwrap();
    net.node(0)
        .register_parcel(&parcel.pack().unwrap(), REGISTER_TIMEOUT)
        .await
        .unwrap();

    let node = net.node(0);
    assert_eq!(
        node.get_state(&parcel.payment().root_id()).await.unwrap().state,
        ItemState::Declined
    );
    assert_eq!(
        node.get_state(&parcel.payload().root_id()).await.unwrap().state,
        ItemState::Declined
    );
    let ledger = &net.ledgers[0];
    let kept = ledger.get_record(&previous_id).unwrap().unwrap();
    assert_eq!(kept.state, ItemState::Approved);
    assert_eq!(kept.locked_by_record_id, None);
    assert!(ledger.get_record(&change_id).unwrap().is_none());
}
