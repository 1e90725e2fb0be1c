//! Parcel processor
//!
//! Runs the payment and payload processors side by side. The payload may
//! only be approved once the payment is; a failed payment forces the payload
//! to DECLINED whatever its own tally says. With free registrations enabled
//! the payload is not held back, but a failed payment still declines a
//! payload that is still voting.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{info, warn};

use super::item::{self, ItemOptions};
use super::{NodeContext, ProcessorEvent, ProcessorHandle};
use crate::item::{ItemId, Parcel};
use crate::ledger::{ItemResult, ItemState};
use crate::vote::Vote;

#[derive(Clone)]
pub struct ParcelHandle {
    pub payment_id: ItemId,
    pub payload_id: ItemId,
    payment: ProcessorHandle,
    payload: ProcessorHandle,
    done: watch::Receiver<bool>,
}

impl ParcelHandle {
    /// Results of payment and payload once the parcel is finished.
    pub async fn finished(&self) -> (ItemResult, ItemResult) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
        (self.payment.current(), self.payload.current())
    }

    fn deliver(&self, vote: Vote) {
        let target = if vote.item_id == self.payment_id {
            &self.payment
        } else {
            &self.payload
        };
        target.deliver(ProcessorEvent::Vote(vote));
    }
}

/// Start processing `parcel`, or route `votes` to the one already running.
pub fn spawn(ctx: &Arc<NodeContext>, parcel: Arc<Parcel>, packed: Vec<u8>, votes: Vec<Vote>) -> ParcelHandle {
    let parcel_id = parcel.id();
    let payment_id = parcel.payment().root_id();
    let payload_id = parcel.payload().root_id();

    if let Some(handle) = ctx.parcels.get(&parcel_id).map(|h| h.clone()) {
        for vote in votes {
            handle.deliver(vote);
        }
        return handle;
    }

    let free = ctx.settings.current().free_registrations;
    let (payment_votes, payload_votes): (Vec<Vote>, Vec<Vote>) =
        votes.into_iter().partition(|vote| vote.item_id == payment_id);

    let payment = item::spawn(
        ctx,
        Arc::new(parcel.payment().clone()),
        ItemOptions {
            parcel: Some(parcel_id),
            gated: false,
            initial_votes: payment_votes,
        },
    );
    let payload = item::spawn(
        ctx,
        Arc::new(parcel.payload().clone()),
        ItemOptions {
            parcel: Some(parcel_id),
            gated: !free,
            initial_votes: payload_votes
                .into_iter()
                .filter(|vote| vote.item_id == payload_id)
                .collect(),
        },
    );

    let (done_tx, done_rx) = watch::channel(false);
    let handle = ParcelHandle {
        payment_id,
        payload_id,
        payment: payment.clone(),
        payload: payload.clone(),
        done: done_rx,
    };
    let handle = match ctx.parcels.entry(parcel_id) {
        Entry::Occupied(existing) => return existing.get().clone(),
        Entry::Vacant(slot) => {
            slot.insert(handle.clone());
            handle
        }
    };

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let keep_until = parcel.payment().expires_at().max(parcel.payload().expires_at());
        if let Err(e) = ctx.store("put_parcel", |l| l.put_item(&parcel_id, &packed, keep_until)).await {
            warn!(parcel = %parcel_id.short(), error = %e, "Failed to store parcel copy");
        }

        let payment_result = payment.finished().await;
        let paid = payment_result.state == ItemState::Approved;
        payload.deliver(ProcessorEvent::PaymentResolved(paid));

        let payload_result = payload.finished().await;
        info!(
            parcel = %parcel_id.short(),
            payment = %payment_result.state,
            payload = %payload_result.state,
            "Parcel processed"
        );
        let _ = done_tx.send(true);
        ctx.parcels.remove(&parcel_id);
    });

    handle
}
