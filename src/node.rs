//! Ledger node
//!
//! Ties the ledger, peer channel and processors together.
//!
//! Handles:
//! - client operations: register, register_parcel, get_state, resync
//! - inbound dispatch: votes to processors, resync queries and answers,
//!   item and parcel fetches for items first seen through a vote
//! - start-up sanitation of records a crash left pending or locked
//! - periodic maintenance: expired item copies and stale vote buffers

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::consensus::{ConsensusSettings, Quorum, SettingsHandle};
use crate::error::{LedgerError, NodeError};
use crate::item::{ErrorCode, ErrorRecord, ItemCheck, ItemId, Parcel, Transaction};
use crate::ledger::{ItemResult, ItemState, Ledger};
use crate::network::{Inbound, NodeId, PeerChannel, PeerMessage};
use crate::processor::item::{self, release_ops, ItemOptions};
use crate::processor::resync::{self, ResyncAnswer};
use crate::processor::{parcel, NodeContext, ProcessorEvent, ResyncOutcome};
use crate::signing::VoteSigner;
use crate::vote::Vote;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);
const REASONS_RETENTION: Duration = Duration::from_secs(600);

/// Votes held per unknown item while its copy is being fetched.
const MAX_BUFFERED_VOTES: usize = 256;

/// Everything a node is built from.
pub struct NodeParts {
    pub node_id: NodeId,
    pub ledger: Arc<Ledger>,
    pub channel: Arc<dyn PeerChannel>,
    pub inbound: mpsc::Receiver<Inbound>,
    pub signer: Arc<dyn VoteSigner>,
    pub checker: Arc<dyn ItemCheck>,
    pub settings: SettingsHandle,
    pub is_testnet: bool,
    pub max_processors: usize,
}

/// What start-up sanitation did.
#[derive(Debug, Default)]
pub struct SanitationReport {
    pub resynced: Vec<(ItemId, ResyncOutcome)>,
    pub released: usize,
}

/// Votes for an item this node has not seen yet.
struct PendingFetch {
    votes: Vec<Vote>,
    first_seen: Instant,
    requested_at: Option<Instant>,
}

pub struct Node {
    ctx: Arc<NodeContext>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start dispatching inbound messages and run start-up sanitation in the
    /// background.
    pub fn start(parts: NodeParts) -> Arc<Self> {
        let ctx = Arc::new(NodeContext::new(
            parts.node_id,
            parts.ledger,
            parts.channel,
            parts.signer,
            parts.checker,
            parts.settings,
            parts.is_testnet,
            parts.max_processors,
        ));
        let pending = Arc::new(DashMap::new());

        let dispatcher = Dispatcher {
            ctx: ctx.clone(),
            pending: pending.clone(),
        };
        let mut tasks = vec![tokio::spawn(dispatcher.run(parts.inbound))];
        tasks.push(tokio::spawn(maintenance(ctx.clone(), pending)));

        let sanitizing = ctx.clone();
        tasks.push(tokio::spawn(async move {
            match sanitize(&sanitizing).await {
                Ok(report) if report.resynced.is_empty() && report.released == 0 => {}
                Ok(report) => info!(
                    resynced = report.resynced.len(),
                    released = report.released,
                    "Start-up sanitation finished"
                ),
                Err(e) => warn!(error = %e, "Start-up sanitation failed"),
            }
        }));

        let settings = ctx.settings.current();
        info!(
            node = %ctx.node_id,
            peers = ctx.channel.peers().len(),
            positive = settings.quorum.positive,
            negative = settings.quorum.negative,
            testnet = ctx.is_testnet,
            "Ledger node started"
        );
        Arc::new(Self { ctx, tasks })
    }

    pub fn id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ctx.ledger
    }

    pub fn settings(&self) -> Arc<ConsensusSettings> {
        self.ctx.settings.current()
    }

    pub fn active_processors(&self) -> usize {
        self.ctx.active_processors()
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.ctx.is_shutting_down() {
            return Err(NodeError::ShuttingDown);
        }
        Ok(())
    }

    // =========================================================================
    // Client operations
    // =========================================================================

    /// Register a standalone packed transaction and wait up to `timeout` for
    /// a decision. Returns the pending result if the timeout passes first.
    pub async fn register(&self, packed: &[u8], timeout: Duration) -> Result<ItemResult, NodeError> {
        self.ensure_running()?;
        let tx = match Transaction::unpack(packed) {
            Ok(tx) => tx,
            Err(e) => {
                debug!(error = %e, "Rejected undecodable registration");
                return Ok(self.rejected(ErrorRecord::new(ErrorCode::BadValue, "item", e.to_string())));
            }
        };
        if !self.ctx.settings.current().free_registrations {
            let item_id = tx.root_id();
            let known = self.get_state(&item_id).await?;
            if known.state != ItemState::Undefined {
                return Ok(known);
            }
            return Ok(self.rejected(ErrorRecord::new(
                ErrorCode::FreeRegistration,
                item_id.short(),
                "registration outside a parcel is not allowed",
            )));
        }
        self.register_transaction(Arc::new(tx), timeout).await
    }

    /// Register an already decoded transaction, bypassing the free
    /// registration gate at the entry point. Peers still apply it when voting.
    pub async fn register_transaction(&self, tx: Arc<Transaction>, timeout: Duration) -> Result<ItemResult, NodeError> {
        self.ensure_running()?;
        let handle = item::spawn(&self.ctx, tx, ItemOptions::default());
        Ok(handle.wait(timeout).await)
    }

    /// Start processing a packed parcel and wait up to `timeout` for it to
    /// finish. Returns the parcel id; poll the payment and payload with
    /// [`Node::get_state`].
    pub async fn register_parcel(&self, packed: &[u8], timeout: Duration) -> Result<ItemId, NodeError> {
        self.ensure_running()?;
        let incoming = Parcel::unpack(packed)?;
        let parcel_id = incoming.id();
        let handle = parcel::spawn(&self.ctx, Arc::new(incoming), packed.to_vec(), Vec::new());
        if tokio::time::timeout(timeout, handle.finished()).await.is_err() {
            debug!(parcel = %parcel_id.short(), "Parcel still processing");
        }
        Ok(parcel_id)
    }

    /// Current state of an item: the live result while it is being voted
    /// on here, the ledger's otherwise.
    pub async fn get_state(&self, item_id: &ItemId) -> Result<ItemResult, NodeError> {
        if let Some(handle) = self.ctx.processor(item_id) {
            return Ok(handle.current());
        }
        let result = self.ctx.store("item_result", |l| l.item_result(item_id)).await?;
        Ok(self.ctx.with_reasons(item_id, result).with_testnet(self.ctx.is_testnet))
    }

    /// Wait up to `timeout` for a running processor to finish, then report
    /// the item's state.
    pub async fn wait_item(&self, item_id: &ItemId, timeout: Duration) -> Result<ItemResult, NodeError> {
        if let Some(handle) = self.ctx.processor(item_id) {
            let result = handle.wait(timeout).await;
            if !handle.is_finished() {
                return Ok(result);
            }
        }
        self.get_state(item_id).await
    }

    /// Resync `item_id` in the background.
    pub fn resync_item(&self, item_id: ItemId) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let outcome = resync::resync_with_retries(&ctx, item_id).await;
            debug!(item = %item_id.short(), ?outcome, "Background resync finished");
        });
    }

    /// Resync `item_id`, retrying unresolved attempts, and report the outcome.
    pub async fn resync(&self, item_id: ItemId) -> ResyncOutcome {
        resync::resync_with_retries(&self.ctx, item_id).await
    }

    /// Resolve records left pending or locked, e.g. by a crash.
    pub async fn sanitize(&self) -> Result<SanitationReport, NodeError> {
        Ok(sanitize(&self.ctx).await?)
    }

    /// Recompute thresholds for a network of `total_nodes`. Processors that
    /// are already running keep the settings they started with.
    pub fn reconfigure(&self, total_nodes: usize) -> Arc<ConsensusSettings> {
        self.ctx.settings.update(|settings| settings.quorum = Quorum::for_network(total_nodes))
    }

    /// Stop dispatching and ask every processor to stop.
    pub fn shutdown(&self) {
        self.ctx.shutdown.send_replace(true);
        for task in &self.tasks {
            task.abort();
        }
        info!(node = %self.ctx.node_id, active = self.ctx.active_processors(), "Ledger node stopped");
    }

    fn rejected(&self, reason: ErrorRecord) -> ItemResult {
        ItemResult::undefined()
            .with_errors(vec![reason])
            .with_testnet(self.ctx.is_testnet)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// =============================================================================
// Dispatch
// =============================================================================

struct Dispatcher {
    ctx: Arc<NodeContext>,
    pending: Arc<DashMap<ItemId, PendingFetch>>,
}

impl Dispatcher {
    async fn run(self, mut inbound: mpsc::Receiver<Inbound>) {
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(Inbound { from, message }) => self.handle(from, message).await,
                    None => break,
                },
                _ = self.ctx.shutdown_requested() => break,
            }
        }
        debug!(node = %self.ctx.node_id, "Dispatcher stopped");
    }

    async fn handle(&self, from: NodeId, message: PeerMessage) {
        let kind = message.kind();
        let handled = match message {
            PeerMessage::Vote {
                vote,
                parcel,
                needs_answer,
            } => self.on_vote(from, vote, parcel, needs_answer).await,
            PeerMessage::ResyncQuery { item_id } => self.on_resync_query(from, item_id).await,
            PeerMessage::ResyncAnswer {
                item_id,
                result,
                environment,
            } => {
                if let Some(handle) = self.ctx.resyncs.get(&item_id).map(|h| h.clone()) {
                    handle.deliver(from, ResyncAnswer { result, environment });
                }
                Ok(())
            }
            PeerMessage::GetItem { item_id } => self.on_fetch(from, item_id, false).await,
            PeerMessage::GetParcel { parcel_id } => self.on_fetch(from, parcel_id, true).await,
            PeerMessage::Item { item_id, packed } => self.on_item(item_id, packed),
            PeerMessage::Parcel { parcel_id, packed } => self.on_parcel(parcel_id, packed),
        };
        if let Err(e) = handled {
            warn!(peer = %from, kind, error = %e, "Failed to handle peer message");
        }
    }

    async fn on_vote(
        &self,
        from: NodeId,
        vote: Vote,
        parcel: Option<ItemId>,
        needs_answer: bool,
    ) -> Result<(), LedgerError> {
        if vote.voter != from {
            debug!(peer = %from, voter = %vote.voter, "Vote relayed by another node, ignoring");
            return Ok(());
        }
        let item_id = vote.item_id;
        if let Some(handle) = self.ctx.processor(&item_id) {
            handle.deliver(ProcessorEvent::Vote(vote));
            return Ok(());
        }

        let record = self.ctx.store("get_record", |l| l.get_record(&item_id)).await?;
        match record.map(|r| r.state) {
            Some(state) if state.is_terminal() || state == ItemState::Locked => {
                if needs_answer {
                    // the voter is still collecting: tell it how this node decided
                    let positive = matches!(state, ItemState::Approved | ItemState::Locked | ItemState::Revoked);
                    let answer = Vote::signed(self.ctx.signer.as_ref(), item_id, positive);
                    let message = PeerMessage::Vote {
                        vote: answer,
                        parcel,
                        needs_answer: false,
                    };
                    if let Err(e) = self.ctx.channel.send(from, message).await {
                        debug!(peer = %from, error = %e, "Failed to answer vote");
                    }
                }
                Ok(())
            }
            Some(ItemState::Pending | ItemState::PendingPositive | ItemState::PendingNegative) => {
                if self.restart_from_copy(item_id, parcel, vote.clone())? {
                    return Ok(());
                }
                self.buffer_and_fetch(from, item_id, parcel, vote).await;
                Ok(())
            }
            _ => {
                self.buffer_and_fetch(from, item_id, parcel, vote).await;
                Ok(())
            }
        }
    }

    /// Restart a processor for a pending item whose copy this node kept.
    fn restart_from_copy(&self, item_id: ItemId, parcel_id: Option<ItemId>, vote: Vote) -> Result<bool, LedgerError> {
        if let Some(parcel_id) = parcel_id {
            if let Some(packed) = self.ctx.ledger.get_item(&parcel_id)? {
                if let Ok(stored) = Parcel::unpack(&packed) {
                    debug!(parcel = %parcel_id.short(), "Restarting parcel from stored copy");
                    parcel::spawn(&self.ctx, Arc::new(stored), packed, vec![vote]);
                    return Ok(true);
                }
            }
            return Ok(false);
        }
        match self.ctx.ledger.get_item(&item_id)?.map(|packed| Transaction::unpack(&packed)) {
            Some(Ok(tx)) => {
                debug!(item = %item_id.short(), "Restarting item from stored copy");
                item::spawn(
                    &self.ctx,
                    Arc::new(tx),
                    ItemOptions {
                        initial_votes: vec![vote],
                        ..ItemOptions::default()
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Hold the vote and ask the voter for the item (or its parcel).
    async fn buffer_and_fetch(&self, from: NodeId, item_id: ItemId, parcel: Option<ItemId>, vote: Vote) {
        let key = parcel.unwrap_or(item_id);
        let resend_after = self.ctx.settings.current().vote_resend_interval;
        let request = {
            let mut entry = self.pending.entry(key).or_insert_with(|| PendingFetch {
                votes: Vec::new(),
                first_seen: Instant::now(),
                requested_at: None,
            });
            if entry.votes.len() < MAX_BUFFERED_VOTES {
                entry.votes.push(vote);
            }
            let due = entry.requested_at.map_or(true, |at| at.elapsed() >= resend_after);
            if due {
                entry.requested_at = Some(Instant::now());
            }
            due
        };
        if !request {
            return;
        }

        let message = match parcel {
            Some(parcel_id) => PeerMessage::GetParcel { parcel_id },
            None => PeerMessage::GetItem { item_id },
        };
        debug!(peer = %from, item = %key.short(), kind = message.kind(), "Fetching unknown item");
        if let Err(e) = self.ctx.channel.send(from, message).await {
            debug!(peer = %from, error = %e, "Fetch request failed");
        }
    }

    async fn on_resync_query(&self, from: NodeId, item_id: ItemId) -> Result<(), LedgerError> {
        let result = match self.ctx.processor(&item_id) {
            Some(handle) => handle.current(),
            None => self.ctx.store("item_result", |l| l.item_result(&item_id)).await?,
        };
        let environment = if result.state.is_approved() {
            self.ctx.store("get_environment", |l| l.get_environment(&item_id)).await?
        } else {
            None
        };
        let answer = PeerMessage::ResyncAnswer {
            item_id,
            result: result.with_testnet(self.ctx.is_testnet),
            environment,
        };
        if let Err(e) = self.ctx.channel.send(from, answer).await {
            debug!(peer = %from, error = %e, "Failed to answer resync query");
        }
        Ok(())
    }

    async fn on_fetch(&self, from: NodeId, id: ItemId, is_parcel: bool) -> Result<(), LedgerError> {
        let Some(packed) = self.ctx.store("get_item", |l| l.get_item(&id)).await? else {
            debug!(peer = %from, item = %id.short(), "Requested item not kept here");
            return Ok(());
        };
        let message = if is_parcel {
            PeerMessage::Parcel { parcel_id: id, packed }
        } else {
            PeerMessage::Item { item_id: id, packed }
        };
        if let Err(e) = self.ctx.channel.send(from, message).await {
            debug!(peer = %from, error = %e, "Failed to send item copy");
        }
        Ok(())
    }

    fn on_item(&self, item_id: ItemId, packed: Vec<u8>) -> Result<(), LedgerError> {
        let tx = match Transaction::unpack(&packed) {
            Ok(tx) if tx.root_id() == item_id => tx,
            Ok(tx) => {
                warn!(expected = %item_id.short(), actual = %tx.root_id().short(), "Fetched item has wrong id");
                return Ok(());
            }
            Err(e) => {
                warn!(item = %item_id.short(), error = %e, "Fetched item does not decode");
                return Ok(());
            }
        };
        let Some((_, fetch)) = self.pending.remove(&item_id) else {
            return Ok(());
        };
        item::spawn(
            &self.ctx,
            Arc::new(tx),
            ItemOptions {
                initial_votes: fetch.votes,
                ..ItemOptions::default()
            },
        );
        Ok(())
    }

    fn on_parcel(&self, parcel_id: ItemId, packed: Vec<u8>) -> Result<(), LedgerError> {
        let fetched = match Parcel::unpack(&packed) {
            Ok(fetched) if fetched.id() == parcel_id => fetched,
            Ok(_) => {
                warn!(parcel = %parcel_id.short(), "Fetched parcel has wrong id");
                return Ok(());
            }
            Err(e) => {
                warn!(parcel = %parcel_id.short(), error = %e, "Fetched parcel does not decode");
                return Ok(());
            }
        };
        let Some((_, fetch)) = self.pending.remove(&parcel_id) else {
            return Ok(());
        };
        parcel::spawn(&self.ctx, Arc::new(fetched), packed, fetch.votes);
        Ok(())
    }
}

// =============================================================================
// Maintenance
// =============================================================================

async fn maintenance(ctx: Arc<NodeContext>, pending: Arc<DashMap<ItemId, PendingFetch>>) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = ctx.shutdown_requested() => break,
        }

        match ctx.store("purge_expired_items", |l| l.purge_expired_items(Utc::now())).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "Purged expired item copies"),
            Err(e) => warn!(error = %e, "Failed to purge item copies"),
        }

        let stale_after = ctx.settings.current().max_election_time * 2;
        let before = pending.len();
        pending.retain(|_, fetch| fetch.first_seen.elapsed() < stale_after);
        let dropped = before.saturating_sub(pending.len());
        if dropped > 0 {
            debug!(dropped, "Dropped votes for items never fetched");
        }

        let forgotten = ctx.forget_reasons(REASONS_RETENTION);
        if forgotten > 0 {
            debug!(forgotten, "Forgot decision reasons");
        }
    }
}

// =============================================================================
// Sanitation
// =============================================================================

async fn sanitize(ctx: &Arc<NodeContext>) -> Result<SanitationReport, LedgerError> {
    let mut report = SanitationReport::default();

    let unfinished = ctx.store("find_unfinished", |l| l.find_unfinished()).await?;
    for record in unfinished {
        if ctx.processor(&record.item_id).is_some() {
            continue;
        }
        let outcome = resync::resync_with_retries(ctx, record.item_id).await;
        if !outcome.is_resolved() {
            warn!(item = %record.item_id.short(), ?outcome, "Pending record left unresolved");
        }
        report.resynced.push((record.item_id, outcome));
    }

    let locked = ctx.store("find_locked", |l| l.find_locked()).await?;
    let mut holders: Vec<i64> = locked.iter().filter_map(|r| r.locked_by_record_id).collect();
    holders.sort_unstable();
    holders.dedup();

    for holder_id in holders {
        let holder = ctx.store("get_record_by_id", |l| l.get_record_by_id(holder_id)).await?;
        let holder_approved = match &holder {
            Some(h) if ctx.processor(&h.item_id).is_some() => continue,
            Some(h) if h.state.is_approved() => true,
            Some(h) if h.state.is_terminal() => false,
            Some(_) => continue,
            None => false,
        };

        let held: Vec<ItemId> = locked
            .iter()
            .filter(|r| r.locked_by_record_id == Some(holder_id))
            .map(|r| r.item_id)
            .collect();
        let ledger = ctx.ledger.clone();
        let _scope = ledger.scope(holder.iter().map(|h| h.item_id).chain(held.iter().copied())).await;

        let released = ctx
            .store("release_stale_locks", |l| {
                let ops = release_ops(l, holder_id, holder_approved)?;
                l.apply(&ops)?;
                Ok(ops.len())
            })
            .await?;
        if released > 0 {
            info!(
                holder = ?holder.as_ref().map(|h| h.item_id.short()),
                holder_approved,
                released = held.len(),
                "Released stale locks"
            );
            report.released += held.len();
        }
    }
    Ok(report)
}
