//! Per-item consensus processors
//!
//! - [`item`]: voting state machine for one transaction
//! - [`parcel`]: payment + payload pair, payload gated on the payment
//! - [`resync`]: recover an item's state from peers without voting
//!
//! Processors are tokio tasks registered in the shared [`NodeContext`] by
//! item id, so at most one runs per id. Completion is published through a
//! watch channel that closes when the processor task ends.

pub mod item;
pub mod parcel;
pub mod resync;

pub use resync::ResyncOutcome;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;

use crate::consensus::SettingsHandle;
use crate::error::LedgerError;
use crate::item::{ErrorRecord, ItemCheck, ItemId};
use crate::ledger::{ItemResult, ItemState, Ledger};
use crate::network::{NodeId, PeerChannel};
use crate::signing::VoteSigner;
use crate::vote::Vote;

/// Events delivered to a running item processor.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    Vote(Vote),
    /// Outcome of the payment this item's parcel depends on.
    PaymentResolved(bool),
}

#[derive(Clone)]
pub struct ProcessorHandle {
    events: mpsc::Sender<ProcessorEvent>,
    result: watch::Receiver<ItemResult>,
}

impl ProcessorHandle {
    /// Queue an event. Returns false if the processor has finished or its
    /// queue is full.
    pub fn deliver(&self, event: ProcessorEvent) -> bool {
        self.events.try_send(event).is_ok()
    }

    pub fn current(&self) -> ItemResult {
        self.result.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.events.is_closed()
    }

    /// Result once the processor finishes.
    pub async fn finished(&self) -> ItemResult {
        let mut rx = self.result.clone();
        while rx.changed().await.is_ok() {}
        let result = rx.borrow().clone();
        result
    }

    /// Result when the processor finishes or `timeout` elapses, whichever
    /// comes first.
    pub async fn wait(&self, timeout: Duration) -> ItemResult {
        match tokio::time::timeout(timeout, self.finished()).await {
            Ok(result) => result,
            Err(_) => self.current(),
        }
    }

    fn same_processor(&self, other: &mpsc::Sender<ProcessorEvent>) -> bool {
        self.events.same_channel(other)
    }
}

/// Reasons a finished processor gave for its decision. The ledger only
/// keeps the state, so these are held for a while after the processor ends.
pub(crate) struct Reasons {
    pub state: ItemState,
    pub errors: Vec<ErrorRecord>,
    pub recorded: Instant,
}

/// Everything processors share within one node.
pub struct NodeContext {
    pub node_id: NodeId,
    pub ledger: Arc<Ledger>,
    pub channel: Arc<dyn PeerChannel>,
    pub signer: Arc<dyn VoteSigner>,
    pub checker: Arc<dyn ItemCheck>,
    pub settings: SettingsHandle,
    pub is_testnet: bool,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) processors: DashMap<ItemId, ProcessorHandle>,
    pub(crate) parcels: DashMap<ItemId, parcel::ParcelHandle>,
    pub(crate) resyncs: DashMap<ItemId, resync::ResyncHandle>,
    pub(crate) reasons: DashMap<ItemId, Reasons>,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        ledger: Arc<Ledger>,
        channel: Arc<dyn PeerChannel>,
        signer: Arc<dyn VoteSigner>,
        checker: Arc<dyn ItemCheck>,
        settings: SettingsHandle,
        is_testnet: bool,
        max_processors: usize,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            node_id,
            ledger,
            channel,
            signer,
            checker,
            settings,
            is_testnet,
            workers: Arc::new(Semaphore::new(max_processors.max(1))),
            processors: DashMap::new(),
            parcels: DashMap::new(),
            resyncs: DashMap::new(),
            reasons: DashMap::new(),
            shutdown,
        }
    }

    /// Run a ledger operation under the ledger's retry policy.
    pub async fn store<T, F>(&self, what: &str, mut op: F) -> Result<T, LedgerError>
    where
        F: FnMut(&Ledger) -> Result<T, LedgerError>,
    {
        let ledger = &self.ledger;
        ledger.retry().run(what, || op(ledger)).await
    }

    pub fn processor(&self, item_id: &ItemId) -> Option<ProcessorHandle> {
        self.processors.get(item_id).map(|h| h.clone())
    }

    pub(crate) fn remember_reasons(&self, item_id: ItemId, result: &ItemResult) {
        if result.errors.is_empty() {
            return;
        }
        self.reasons.insert(
            item_id,
            Reasons {
                state: result.state,
                errors: result.errors.clone(),
                recorded: Instant::now(),
            },
        );
    }

    /// Attach the remembered reasons to a ledger result, as long as the
    /// ledger still holds the state they explain.
    pub(crate) fn with_reasons(&self, item_id: &ItemId, result: ItemResult) -> ItemResult {
        if !result.errors.is_empty() {
            return result;
        }
        let errors = match self.reasons.get(item_id) {
            Some(reasons) if reasons.state == result.state => reasons.errors.clone(),
            _ => return result,
        };
        result.with_errors(errors)
    }

    /// Drop reasons recorded longer than `max_age` ago. Returns how many.
    pub(crate) fn forget_reasons(&self, max_age: Duration) -> usize {
        let before = self.reasons.len();
        self.reasons.retain(|_, reasons| reasons.recorded.elapsed() < max_age);
        before.saturating_sub(self.reasons.len())
    }

    pub fn active_processors(&self) -> usize {
        self.processors.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown is requested.
    pub(crate) async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}
