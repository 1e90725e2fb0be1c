//! Item processor
//!
//! Drives one transaction from first sight to a committed decision:
//!
//! 1. find or create the ledger record; already decided items replay their result
//! 2. resync revoked/referenced ids unknown to this node
//! 3. validate locally and take revision/creation locks
//! 4. vote, broadcast, and collect peer votes until a threshold is crossed or
//!    the election deadline passes (fail closed: DECLINED)
//! 5. commit the decision and every dependent record in one ledger batch

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{resync, NodeContext, ProcessorEvent, ProcessorHandle};
use crate::consensus::ConsensusSettings;
use crate::error::{ItemError, LedgerError};
use crate::item::{ErrorCode, ErrorRecord, ItemId, Transaction};
use crate::ledger::{
    whole_seconds, BatchOp, CreationLock, Environment, ItemResult, ItemState, Ledger, RevisionLock, StateRecord,
};
use crate::network::PeerMessage;
use crate::vote::{Decision, Vote, VoteTally};

const EVENT_QUEUE: usize = 1024;

/// How an item entered this node.
#[derive(Debug, Clone, Default)]
pub struct ItemOptions {
    /// Parcel this item belongs to.
    pub parcel: Option<ItemId>,
    /// Approval also requires the parcel's payment to be approved.
    pub gated: bool,
    /// Votes that arrived before the processor existed.
    pub initial_votes: Vec<Vote>,
}

/// Start a processor for `tx`, or hand the votes to the one already running.
pub fn spawn(ctx: &Arc<NodeContext>, tx: Arc<Transaction>, options: ItemOptions) -> ProcessorHandle {
    let item_id = tx.root_id();
    match ctx.processors.entry(item_id) {
        Entry::Occupied(existing) => {
            let handle = existing.get().clone();
            drop(existing);
            for vote in options.initial_votes {
                handle.deliver(ProcessorEvent::Vote(vote));
            }
            handle
        }
        Entry::Vacant(slot) => {
            let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
            let (result_tx, result_rx) = watch::channel(pending_result(ctx));
            let handle = ProcessorHandle {
                events: events_tx.clone(),
                result: result_rx,
            };
            slot.insert(handle.clone());

            let processor = ItemProcessor {
                ctx: ctx.clone(),
                item_id,
                tx,
                settings: ctx.settings.current(),
                parcel: options.parcel,
                payment: if options.gated { Payment::Waiting } else { Payment::NotRequired },
                initial_votes: options.initial_votes,
                events: events_rx,
                own_events: events_tx,
                result: result_tx,
                tally: VoteTally::new(),
                reached: None,
                own_vote: None,
                errors: Vec::new(),
                started: Instant::now(),
            };
            tokio::spawn(processor.run());
            handle
        }
    }
}

fn pending_result(ctx: &NodeContext) -> ItemResult {
    let mut result = ItemResult::undefined().with_testnet(ctx.is_testnet);
    result.state = ItemState::Pending;
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Payment {
    NotRequired,
    Waiting,
    Approved,
    Declined,
}

enum Verdict {
    Approve,
    Decline(Option<ErrorRecord>),
}

enum Abort {
    Shutdown,
    Ledger(LedgerError),
    Item(ItemError),
}

impl From<LedgerError> for Abort {
    fn from(e: LedgerError) -> Self {
        Abort::Ledger(e)
    }
}

impl From<ItemError> for Abort {
    fn from(e: ItemError) -> Self {
        Abort::Item(e)
    }
}

struct ItemProcessor {
    ctx: Arc<NodeContext>,
    item_id: ItemId,
    tx: Arc<Transaction>,
    settings: Arc<ConsensusSettings>,
    parcel: Option<ItemId>,
    payment: Payment,
    initial_votes: Vec<Vote>,
    events: mpsc::Receiver<ProcessorEvent>,
    own_events: mpsc::Sender<ProcessorEvent>,
    result: watch::Sender<ItemResult>,
    tally: VoteTally,
    reached: Option<Decision>,
    own_vote: Option<Vote>,
    errors: Vec<ErrorRecord>,
    started: Instant,
}

impl ItemProcessor {
    async fn run(mut self) {
        let _permit = self.ctx.workers.clone().acquire_owned().await.ok();
        // the election clock starts once a worker slot is free
        self.started = Instant::now();

        let result = match self.process().await {
            Ok(result) => result,
            Err(Abort::Shutdown) => {
                debug!(item = %self.item_id.short(), "Processor stopped by shutdown");
                self.result.borrow().clone()
            }
            Err(Abort::Ledger(e)) => {
                error!(item = %self.item_id.short(), error = %e, "Storage failure, abandoning item");
                ItemResult::undefined().with_errors(vec![ErrorRecord::new(
                    ErrorCode::Storage,
                    self.item_id.short(),
                    e.to_string(),
                )])
            }
            Err(Abort::Item(e)) => {
                warn!(item = %self.item_id.short(), error = %e, "Unusable item");
                ItemResult::undefined().with_errors(vec![ErrorRecord::new(
                    ErrorCode::BadValue,
                    self.item_id.short(),
                    e.to_string(),
                )])
            }
        };

        let result = result.with_testnet(self.ctx.is_testnet);
        self.ctx.remember_reasons(self.item_id, &result);
        self.result.send_replace(result);
        let own = self.own_events.clone();
        self.ctx
            .processors
            .remove_if(&self.item_id, |_, handle| handle.same_processor(&own));
    }

    fn publish(&mut self, result: ItemResult) {
        self.result.send_replace(result.with_testnet(self.ctx.is_testnet));
    }

    async fn process(&mut self) -> Result<ItemResult, Abort> {
        let item_id = self.item_id;
        let ledger = self.ctx.ledger.clone();

        let mut record = {
            let _scope = ledger.scope([item_id]).await;
            self.ctx.store("find_or_create", |l| l.find_or_create(&item_id)).await?
        };

        if !matches!(
            record.state,
            ItemState::Pending | ItemState::PendingPositive | ItemState::PendingNegative
        ) {
            debug!(item = %item_id.short(), state = %record.state, "Item already decided");
            return Ok(self.ctx.store("item_result", |l| l.item_result(&item_id)).await?);
        }

        let packed = self.tx.pack()?;
        let keep_until = self.tx.expires_at();
        self.ctx
            .store("put_item", |l| l.put_item(&item_id, &packed, keep_until))
            .await?;
        self.publish(ItemResult::from_record(&record, true));

        self.resync_dependencies().await;

        let positive = self.check_and_lock(&record).await?;
        record.state = if positive {
            ItemState::PendingPositive
        } else {
            ItemState::PendingNegative
        };
        {
            let _scope = ledger.scope([item_id]).await;
            let voting = record.clone();
            self.ctx.store("save_vote_state", |l| l.save(&voting)).await?;
        }
        self.publish(ItemResult::from_record(&record, true).with_errors(self.errors.clone()));

        let vote = Vote::signed(self.ctx.signer.as_ref(), item_id, positive);
        self.tally.record(self.ctx.node_id, positive);
        self.own_vote = Some(vote.clone());
        info!(
            item = %item_id.short(),
            positive,
            parcel = ?self.parcel.map(|p| p.short()),
            "Voted on item"
        );
        self.ctx
            .channel
            .broadcast(PeerMessage::Vote {
                vote,
                parcel: self.parcel,
                needs_answer: true,
            })
            .await;

        let mut latest_positive = positive;
        for vote in std::mem::take(&mut self.initial_votes) {
            if let Some(p) = self.accept_vote(vote) {
                latest_positive = p;
            }
        }

        let verdict = self.await_verdict(latest_positive).await?;
        self.commit(verdict, record).await
    }

    /// Resync every revoked or referenced id this node has never seen.
    async fn resync_dependencies(&mut self) {
        let mut wanted: BTreeSet<ItemId> = self.tx.revoking_ids();
        wanted.extend(self.tx.reference_ids());

        let mut missing = Vec::new();
        for id in wanted {
            match self.ctx.ledger.get_record(&id) {
                Ok(None) => missing.push(id),
                Ok(Some(_)) => {}
                Err(e) => warn!(item = %id.short(), error = %e, "Dependency lookup failed"),
            }
        }
        if missing.is_empty() {
            return;
        }

        debug!(item = %self.item_id.short(), missing = missing.len(), "Resyncing unknown dependencies");
        let ctx = self.ctx.clone();
        let resyncs = missing.into_iter().map(|id| {
            let ctx = ctx.clone();
            async move { (id, resync::resync(&ctx, id).await) }
        });
        for (id, outcome) in futures::future::join_all(resyncs).await {
            debug!(item = %id.short(), ?outcome, "Dependency resync finished");
        }
    }

    /// Local validation plus lock acquisition. Returns the local vote.
    async fn check_and_lock(&mut self, record: &StateRecord) -> Result<bool, Abort> {
        let mut errors = Vec::new();

        if let Err(rejections) = self.ctx.checker.check(&self.tx) {
            errors.extend(rejections);
        }
        if self.parcel.is_none() && !self.settings.free_registrations {
            errors.push(ErrorRecord::new(
                ErrorCode::FreeRegistration,
                self.item_id.short(),
                "registration outside a parcel is not allowed",
            ));
        }
        for reference in self.tx.reference_ids() {
            let state = self
                .ctx
                .store("get_record", |l| l.get_record(&reference))
                .await?
                .map(|r| r.state);
            if !state.is_some_and(ItemState::is_approved) {
                errors.push(ErrorRecord::new(
                    ErrorCode::BadReference,
                    reference.short(),
                    "referenced item is not approved",
                ));
            }
        }

        if errors.is_empty() {
            errors.extend(self.acquire_locks(record).await?);
        }

        if !errors.is_empty() {
            info!(
                item = %self.item_id.short(),
                reasons = errors.len(),
                first = %errors[0],
                "Local check failed"
            );
        }
        let positive = errors.is_empty();
        self.errors = errors;
        Ok(positive)
    }

    /// Lock every revoked id for revision and every created id for creation.
    /// On any failure the locks taken so far are released.
    async fn acquire_locks(&mut self, record: &StateRecord) -> Result<Vec<ErrorRecord>, Abort> {
        let revoking = self.tx.revoking_ids();
        let creating = self.tx.new_item_ids();
        if revoking.is_empty() && creating.is_empty() {
            return Ok(Vec::new());
        }

        let ledger = self.ctx.ledger.clone();
        let _scope = ledger.scope(revoking.iter().chain(creating.iter()).copied()).await;

        let mut errors = Vec::new();
        for id in &revoking {
            let lock = self.ctx.store("lock_for_revision", |l| l.lock_for_revision(id, record)).await?;
            match lock {
                RevisionLock::Acquired(_) => {}
                RevisionLock::AlreadyLocked => {
                    warn!(item = %self.item_id.short(), revoking = %id.short(), "Revoked item is locked by another revision");
                    errors.push(ErrorRecord::new(
                        ErrorCode::LockConflict,
                        id.short(),
                        "item is locked by another pending revision",
                    ));
                    break;
                }
                RevisionLock::Unavailable => {
                    errors.push(ErrorRecord::new(
                        ErrorCode::BadReference,
                        id.short(),
                        "revoked item is not approved",
                    ));
                    break;
                }
            }
        }

        if errors.is_empty() {
            for id in &creating {
                let lock = self.ctx.store("lock_for_creation", |l| l.lock_for_creation(id, record)).await?;
                if lock == CreationLock::Conflict {
                    warn!(item = %self.item_id.short(), new_item = %id.short(), "New item already exists");
                    errors.push(ErrorRecord::new(ErrorCode::LockConflict, id.short(), "new item already exists"));
                    break;
                }
            }
        }

        if !errors.is_empty() {
            let holder = record.record_id;
            self.ctx
                .store("release_locks", |l| {
                    let ops = release_ops(l, holder, false)?;
                    l.apply(&ops)
                })
                .await?;
        }
        Ok(errors)
    }

    /// Count a peer vote. Returns its polarity if it was new and valid.
    fn accept_vote(&mut self, vote: Vote) -> Option<bool> {
        if vote.item_id != self.item_id || vote.voter == self.ctx.node_id {
            return None;
        }
        if !vote.verify(self.ctx.signer.as_ref()) {
            warn!(item = %self.item_id.short(), peer = %vote.voter, "Rejected vote with bad signature");
            return None;
        }
        if !self.tally.record(vote.voter, vote.positive) {
            return None;
        }
        debug!(
            item = %self.item_id.short(),
            peer = %vote.voter,
            positive = vote.positive,
            yes = self.tally.positive(),
            no = self.tally.negative(),
            "Vote received"
        );
        Some(vote.positive)
    }

    fn evaluate(&mut self, latest_positive: bool) -> Option<Verdict> {
        if self.payment == Payment::Declined {
            return Some(Verdict::Decline(Some(ErrorRecord::new(
                ErrorCode::Payment,
                self.item_id.short(),
                "parcel payment was not approved",
            ))));
        }
        if self.reached.is_none() {
            self.reached = self.tally.decision(&self.settings.quorum, latest_positive);
        }
        match self.reached? {
            Decision::Approve if self.payment == Payment::Waiting => None,
            Decision::Approve => Some(Verdict::Approve),
            Decision::Decline => Some(Verdict::Decline(None)),
        }
    }

    async fn await_verdict(&mut self, mut latest_positive: bool) -> Result<Verdict, Abort> {
        // a gated payload also waits for its payment's election
        let election = if self.payment == Payment::Waiting {
            self.settings.max_election_time * 2
        } else {
            self.settings.max_election_time
        };
        let deadline = self.started + election;
        let period = self.settings.vote_resend_interval;
        let mut resend = tokio::time::interval_at(Instant::now() + period, period);
        let ctx = self.ctx.clone();

        loop {
            if let Some(verdict) = self.evaluate(latest_positive) {
                return Ok(verdict);
            }
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(ProcessorEvent::Vote(vote)) => {
                        if let Some(positive) = self.accept_vote(vote) {
                            latest_positive = positive;
                        }
                    }
                    Some(ProcessorEvent::PaymentResolved(approved)) => {
                        debug!(item = %self.item_id.short(), approved, "Payment resolved");
                        self.payment = match (self.payment, approved) {
                            (_, false) => Payment::Declined,
                            (Payment::NotRequired, true) => Payment::NotRequired,
                            (_, true) => Payment::Approved,
                        };
                    }
                    None => return Err(Abort::Shutdown),
                },
                _ = resend.tick() => self.resend_vote().await,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        item = %self.item_id.short(),
                        yes = self.tally.positive(),
                        no = self.tally.negative(),
                        "No consensus before deadline"
                    );
                    return Ok(Verdict::Decline(Some(ErrorRecord::new(
                        ErrorCode::QuorumTimeout,
                        self.item_id.short(),
                        format!("no consensus within {:?}", election),
                    ))));
                }
                _ = ctx.shutdown_requested() => return Err(Abort::Shutdown),
            }
        }
    }

    /// Re-send our vote to every peer that has not voted yet.
    async fn resend_vote(&mut self) {
        let Some(vote) = self.own_vote.clone() else {
            return;
        };
        let silent: Vec<_> = self
            .ctx
            .channel
            .peers()
            .into_iter()
            .filter(|peer| !self.tally.has_voted(*peer))
            .collect();
        if silent.is_empty() {
            return;
        }
        let channel = self.ctx.channel.clone();
        let parcel = self.parcel;
        let sends = silent.into_iter().map(|peer| {
            let channel = channel.clone();
            let message = PeerMessage::Vote {
                vote: vote.clone(),
                parcel,
                needs_answer: true,
            };
            async move { channel.send(peer, message).await }
        });
        futures::future::join_all(sends).await;
    }

    async fn commit(&mut self, verdict: Verdict, record: StateRecord) -> Result<ItemResult, Abort> {
        let item_id = self.item_id;
        let revoking = self.tx.revoking_ids();
        let creating = self.tx.new_item_ids();

        let ledger = self.ctx.ledger.clone();
        let _scope = ledger
            .scope(std::iter::once(item_id).chain(revoking.iter().copied()).chain(creating.iter().copied()))
            .await;

        let tx = self.tx.clone();
        let verdict = match verdict {
            Verdict::Approve => match self
                .ctx
                .store("check_settled", |l| approval_conflict(l, &tx))
                .await?
            {
                Some(conflict) => {
                    warn!(item = %item_id.short(), reason = %conflict, "Approval conflicts with a settled record, declining");
                    Verdict::Decline(Some(conflict))
                }
                None => Verdict::Approve,
            },
            decline => decline,
        };
        let approve = matches!(verdict, Verdict::Approve);

        let ops = self
            .ctx
            .store("plan_commit", |l| {
                if approve {
                    approve_ops(l, &tx, &record)
                } else {
                    decline_ops(l, &record)
                }
            })
            .await?;
        self.ctx.store("commit", |l| l.apply(&ops)).await?;

        let mut errors = Vec::new();
        if let Verdict::Decline(reason) = verdict {
            errors.extend(reason);
            errors.extend(self.errors.iter().cloned());
        }

        let final_record = self
            .ctx
            .store("get_record", |l| l.get_record(&item_id))
            .await?
            .unwrap_or(record);
        info!(
            item = %item_id.short(),
            state = %final_record.state,
            yes = self.tally.positive(),
            no = self.tally.negative(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Item decided"
        );
        Ok(ItemResult::from_record(&final_record, true).with_errors(errors))
    }
}

/// A network approval wins over locks other pending items hold here; it only
/// conflicts with records that already settled: a revoked item that can no
/// longer be revoked, or a new item that already exists.
fn approval_conflict(ledger: &Ledger, tx: &Transaction) -> Result<Option<ErrorRecord>, LedgerError> {
    for id in tx.revoking_ids() {
        let Some(revoked) = ledger.get_record(&id)? else {
            continue;
        };
        if revoked.state == ItemState::Revoked || !revoked.state.can_transition_to(ItemState::Revoked) {
            return Ok(Some(ErrorRecord::new(
                ErrorCode::LockConflict,
                id.short(),
                format!("revoked item is {}", revoked.state),
            )));
        }
    }
    for id in tx.new_item_ids() {
        let Some(created) = ledger.get_record(&id)? else {
            continue;
        };
        if !created.state.is_pending() {
            return Ok(Some(ErrorRecord::new(
                ErrorCode::LockConflict,
                id.short(),
                format!("new item is {}", created.state),
            )));
        }
    }
    Ok(None)
}

/// Approval: the item and its new items become APPROVED, revoked items
/// REVOKED. Records that can no longer take the transition are left alone.
fn approve_ops(ledger: &Ledger, tx: &Transaction, record: &StateRecord) -> Result<Vec<BatchOp>, LedgerError> {
    let now = whole_seconds(Utc::now());
    let mut ops = Vec::new();

    let mut main = ledger.get_record(&tx.root_id())?.unwrap_or_else(|| record.clone());
    main.state = ItemState::Approved;
    main.locked_by_record_id = None;
    main.expires_at = whole_seconds(tx.root().expires_at);
    ops.push(BatchOp::Put(main));

    for id in tx.revoking_ids() {
        match ledger.get_record(&id)? {
            Some(mut revoked) if revoked.state.can_transition_to(ItemState::Revoked) => {
                revoked.state = ItemState::Revoked;
                revoked.locked_by_record_id = None;
                ops.push(BatchOp::Put(revoked));
            }
            Some(other) => {
                warn!(item = %id.short(), state = %other.state, "Cannot revoke item in this state");
                continue;
            }
            None => ops.push(BatchOp::Put(StateRecord {
                record_id: 0,
                item_id: id,
                state: ItemState::Revoked,
                created_at: now,
                expires_at: now + ledger.pending_ttl(),
                locked_by_record_id: None,
            })),
        }
        ops.push(BatchOp::RemoveEnvironment(id));
    }

    let mut approved = vec![tx.root_id()];
    for id in tx.new_item_ids() {
        let expires_at = tx.get(&id).map(|item| whole_seconds(item.expires_at)).unwrap_or(main_expiry(tx));
        match ledger.get_record(&id)? {
            Some(mut created) if created.state.can_transition_to(ItemState::Approved) => {
                created.state = ItemState::Approved;
                created.locked_by_record_id = None;
                created.expires_at = expires_at;
                ops.push(BatchOp::Put(created));
            }
            Some(other) => {
                warn!(item = %id.short(), state = %other.state, "Cannot approve new item in this state");
                continue;
            }
            None => ops.push(BatchOp::Put(StateRecord {
                record_id: 0,
                item_id: id,
                state: ItemState::Approved,
                created_at: now,
                expires_at,
                locked_by_record_id: None,
            })),
        }
        approved.push(id);
    }

    for id in approved {
        if let Some(item) = tx.get(&id) {
            if let Some(data) = &item.environment {
                ops.push(BatchOp::PutEnvironment(Environment {
                    item_id: id,
                    origin: item.origin_or(id),
                    data: data.clone(),
                }));
            }
        }
    }
    Ok(ops)
}

fn main_expiry(tx: &Transaction) -> chrono::DateTime<Utc> {
    whole_seconds(tx.root().expires_at)
}

/// Decline: the item becomes DECLINED and everything it locked is released.
fn decline_ops(ledger: &Ledger, record: &StateRecord) -> Result<Vec<BatchOp>, LedgerError> {
    let mut main = ledger.get_record(&record.item_id)?.unwrap_or_else(|| record.clone());
    main.state = ItemState::Declined;
    main.locked_by_record_id = None;
    let holder = main.record_id;
    let mut ops = vec![BatchOp::Put(main)];
    ops.extend(release_ops(ledger, holder, false)?);
    Ok(ops)
}

/// Finalize every record locked by `holder`. If the holder was approved the
/// revision locks become REVOKED and creation locks APPROVED; otherwise
/// revision locks return to APPROVED and creation locks are destroyed.
pub(crate) fn release_ops(ledger: &Ledger, holder: i64, holder_approved: bool) -> Result<Vec<BatchOp>, LedgerError> {
    let mut ops = Vec::new();
    for mut locked in ledger.records_locked_by(holder)? {
        match (locked.state, holder_approved) {
            (ItemState::Locked, true) => {
                locked.state = ItemState::Revoked;
                locked.locked_by_record_id = None;
                ops.push(BatchOp::RemoveEnvironment(locked.item_id));
                ops.push(BatchOp::Put(locked));
            }
            (ItemState::Locked, false) => {
                locked.state = ItemState::Approved;
                locked.locked_by_record_id = None;
                ops.push(BatchOp::Put(locked));
            }
            (ItemState::LockedForCreation, true) => {
                locked.state = ItemState::Approved;
                locked.locked_by_record_id = None;
                ops.push(BatchOp::Put(locked));
            }
            (ItemState::LockedForCreation, false) => ops.push(BatchOp::Destroy(locked.item_id)),
            (state, _) => {
                debug!(item = %locked.item_id.short(), %state, "Stale lock holder reference");
            }
        }
    }
    Ok(ops)
}
