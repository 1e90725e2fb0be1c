//! Resync processor
//!
//! Recovers this node's view of one item by asking every peer for its state.
//! When at least `resync_break` peers report the same settled state, and no
//! other state is reported as often, that state is adopted directly with the
//! mean of the agreeing peers' timestamps. Nothing is held locked while the
//! answers are collected; the item scope is only taken to apply the result.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::item::release_ops;
use super::NodeContext;
use crate::error::LedgerError;
use crate::item::ItemId;
use crate::ledger::{BatchOp, Environment, ItemResult, ItemState, Ledger, StateRecord};
use crate::network::{NodeId, PeerMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// The peers' state was written to the ledger.
    Adopted(ItemState),
    /// The local state was left as it is: already settled, being voted on
    /// here, or not allowed to move to the peers' state.
    Kept(ItemState),
    /// Too few answers or no clear majority; try again later.
    Unresolved(String),
}

impl ResyncOutcome {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ResyncOutcome::Unresolved(_))
    }
}

/// One peer's answer to a resync query.
#[derive(Debug, Clone)]
pub struct ResyncAnswer {
    pub result: ItemResult,
    pub environment: Option<Environment>,
}

#[derive(Clone)]
pub struct ResyncHandle {
    answers: mpsc::Sender<(NodeId, ResyncAnswer)>,
    outcome: watch::Receiver<Option<ResyncOutcome>>,
}

impl ResyncHandle {
    pub fn deliver(&self, from: NodeId, answer: ResyncAnswer) -> bool {
        self.answers.try_send((from, answer)).is_ok()
    }

    async fn outcome(&self) -> ResyncOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(published) => published.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| ResyncOutcome::Unresolved("aborted".into()))
    }
}

/// State the agreeing peers settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    pub state: ItemState,
    pub votes: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub environment: Option<Environment>,
}

/// Decide what the answers agree on. Pending answers do not count; LOCKED
/// counts as APPROVED.
pub fn agreement(item_id: &ItemId, answers: &[ResyncAnswer], resync_break: usize) -> Result<Agreement, String> {
    let mut by_state: BTreeMap<ItemState, Vec<&ResyncAnswer>> = BTreeMap::new();
    for answer in answers {
        let state = match answer.result.state {
            ItemState::Locked => ItemState::Approved,
            state if state.is_pending() => continue,
            state => state,
        };
        by_state.entry(state).or_default().push(answer);
    }

    let best = by_state.values().map(Vec::len).max().unwrap_or(0);
    if best < resync_break.max(1) {
        return Err(format!("{} settled answers, need {}", best, resync_break));
    }
    let mut leaders = by_state.iter().filter(|(_, agreeing)| agreeing.len() == best);
    let Some((state, agreeing)) = leaders.next() else {
        return Err("no answers".into());
    };
    if leaders.next().is_some() {
        return Err(format!("peers disagree with {} answers each", best));
    }

    let count = agreeing.len() as i128;
    let mean = |secs: fn(&ResyncAnswer) -> i64| {
        let total: i128 = agreeing.iter().map(|a| secs(*a) as i128).sum();
        Utc.timestamp_opt(total.div_euclid(count) as i64, 0).single().unwrap_or_default()
    };
    let created_at = mean(|a| a.result.created_at.timestamp());
    let expires_at = mean(|a| a.result.expires_at.timestamp());

    let mut environments: HashMap<&Environment, usize> = HashMap::new();
    for env in agreeing.iter().filter_map(|a| a.environment.as_ref()) {
        if env.item_id == *item_id {
            *environments.entry(env).or_default() += 1;
        }
    }
    let environment = environments
        .into_iter()
        .max_by(|(a, a_count), (b, b_count)| a_count.cmp(b_count).then_with(|| b.data.cmp(&a.data)))
        .map(|(env, _)| env.clone());

    Ok(Agreement {
        state: *state,
        votes: agreeing.len(),
        created_at,
        expires_at,
        environment,
    })
}

/// Resync `item_id` once, joining a resync already in flight.
pub async fn resync(ctx: &Arc<NodeContext>, item_id: ItemId) -> ResyncOutcome {
    let handle = match ctx.resyncs.entry(item_id) {
        Entry::Occupied(existing) => existing.get().clone(),
        Entry::Vacant(slot) => {
            let (answers_tx, answers_rx) = mpsc::channel(256);
            let (outcome_tx, outcome_rx) = watch::channel(None);
            let handle = ResyncHandle {
                answers: answers_tx,
                outcome: outcome_rx,
            };
            slot.insert(handle.clone());

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let outcome = match attempt(&ctx, item_id, answers_rx).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(item = %item_id.short(), error = %e, "Resync failed on storage");
                        ResyncOutcome::Unresolved(e.to_string())
                    }
                };
                outcome_tx.send_replace(Some(outcome));
                ctx.resyncs.remove(&item_id);
            });
            handle
        }
    };
    handle.outcome().await
}

/// Resync with up to `max_resync_attempts` tries while the answer is unresolved.
pub async fn resync_with_retries(ctx: &Arc<NodeContext>, item_id: ItemId) -> ResyncOutcome {
    let attempts = ctx.settings.current().max_resync_attempts.max(1);
    let mut outcome = ResyncOutcome::Unresolved("not attempted".into());
    for attempt in 1..=attempts {
        outcome = resync(ctx, item_id).await;
        if outcome.is_resolved() || ctx.is_shutting_down() {
            break;
        }
        debug!(item = %item_id.short(), attempt, ?outcome, "Resync unresolved");
        if attempt < attempts {
            let pause = ctx.settings.current().vote_resend_interval * attempt;
            tokio::time::sleep(pause).await;
        }
    }
    outcome
}

async fn attempt(
    ctx: &Arc<NodeContext>,
    item_id: ItemId,
    mut answers: mpsc::Receiver<(NodeId, ResyncAnswer)>,
) -> Result<ResyncOutcome, LedgerError> {
    if let Some(processor) = ctx.processor(&item_id) {
        return Ok(ResyncOutcome::Kept(processor.current().state));
    }
    let local = ctx.store("get_record", |l| l.get_record(&item_id)).await?;
    if let Some(record) = &local {
        if !resync_may_change(record.state) || held_by_active(ctx, record)? {
            return Ok(ResyncOutcome::Kept(record.state));
        }
    }

    let settings = ctx.settings.current();
    let peers = ctx.channel.peers();
    if peers.is_empty() {
        return Ok(ResyncOutcome::Unresolved("no peers".into()));
    }

    debug!(item = %item_id.short(), peers = peers.len(), "Resync started");
    ctx.channel.broadcast(PeerMessage::ResyncQuery { item_id }).await;

    let deadline = Instant::now() + settings.resync_time;
    let period = settings.vote_resend_interval.max(Duration::from_millis(10));
    let mut requery = tokio::time::interval_at(Instant::now() + period, period);
    let mut replies: HashMap<NodeId, ResyncAnswer> = HashMap::new();

    while replies.len() < peers.len() {
        tokio::select! {
            answer = answers.recv() => match answer {
                Some((from, answer)) if peers.contains(&from) => {
                    replies.insert(from, answer);
                }
                Some((from, _)) => debug!(peer = %from, "Resync answer from unknown peer"),
                None => break,
            },
            _ = requery.tick() => {
                for peer in peers.iter().filter(|p| !replies.contains_key(p)) {
                    let _ = ctx.channel.send(*peer, PeerMessage::ResyncQuery { item_id }).await;
                }
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = ctx.shutdown_requested() => {
                return Ok(ResyncOutcome::Unresolved("shutting down".into()));
            }
        }
    }

    let answers: Vec<ResyncAnswer> = replies.into_values().collect();
    let agreement = match agreement(&item_id, &answers, settings.quorum.resync_break) {
        Ok(agreement) => agreement,
        Err(reason) => {
            warn!(item = %item_id.short(), answers = answers.len(), %reason, "Resync unresolved");
            return Ok(ResyncOutcome::Unresolved(reason));
        }
    };

    adopt(ctx, item_id, agreement).await
}

/// States a resync is allowed to overwrite.
fn resync_may_change(local: ItemState) -> bool {
    !matches!(local, ItemState::Declined | ItemState::Revoked | ItemState::Discarded)
}

fn adoptable(local: ItemState, remote: ItemState) -> bool {
    match local {
        ItemState::Undefined | ItemState::Pending | ItemState::PendingPositive | ItemState::PendingNegative => true,
        ItemState::LockedForCreation => matches!(remote, ItemState::Approved | ItemState::Undefined),
        ItemState::Approved | ItemState::Locked => matches!(remote, ItemState::Approved | ItemState::Revoked),
        _ => false,
    }
}

/// Whether a lock on `record` belongs to an item still voting on this node.
fn held_by_active(ctx: &NodeContext, record: &StateRecord) -> Result<bool, LedgerError> {
    let Some(holder) = record.locked_by_record_id else {
        return Ok(false);
    };
    Ok(ctx
        .ledger
        .get_record_by_id(holder)?
        .is_some_and(|h| ctx.processor(&h.item_id).is_some()))
}

async fn adopt(ctx: &Arc<NodeContext>, item_id: ItemId, agreement: Agreement) -> Result<ResyncOutcome, LedgerError> {
    let locked_ids: Vec<ItemId> = match ctx.store("get_record", |l| l.get_record(&item_id)).await? {
        Some(record) => ctx
            .store("records_locked_by", |l| l.records_locked_by(record.record_id))
            .await?
            .into_iter()
            .map(|r| r.item_id)
            .collect(),
        None => Vec::new(),
    };

    let ledger = ctx.ledger.clone();
    let _scope = ledger.scope(std::iter::once(item_id).chain(locked_ids)).await;

    if let Some(processor) = ctx.processor(&item_id) {
        return Ok(ResyncOutcome::Kept(processor.current().state));
    }

    let local = ctx.store("get_record", |l| l.get_record(&item_id)).await?;
    let current = local.as_ref().map(|r| r.state).unwrap_or(ItemState::Undefined);
    let held = match &local {
        Some(record) => held_by_active(ctx, record)?,
        None => false,
    };
    if held || !adoptable(current, agreement.state) {
        debug!(item = %item_id.short(), local = %current, remote = %agreement.state, "Keeping local state");
        return Ok(ResyncOutcome::Kept(current));
    }

    let ops = ctx
        .store("plan_resync", |l| adoption_ops(l, item_id, local.as_ref(), &agreement))
        .await?;
    ctx.store("apply_resync", |l| l.apply(&ops)).await?;

    info!(
        item = %item_id.short(),
        from = %current,
        to = %agreement.state,
        peers = agreement.votes,
        "Resync adopted peer state"
    );
    Ok(ResyncOutcome::Adopted(agreement.state))
}

fn adoption_ops(
    ledger: &Ledger,
    item_id: ItemId,
    local: Option<&StateRecord>,
    agreement: &Agreement,
) -> Result<Vec<BatchOp>, LedgerError> {
    let mut ops = Vec::new();

    if agreement.state == ItemState::Undefined {
        // nobody knows the item: drop our unfinished record and its locks
        if let Some(record) = local.filter(|r| !r.state.is_terminal()) {
            ops.extend(release_ops(ledger, record.record_id, false)?);
            ops.push(BatchOp::Destroy(item_id));
        }
        return Ok(ops);
    }

    ops.push(BatchOp::Put(StateRecord {
        record_id: local.map(|r| r.record_id).unwrap_or(0),
        item_id,
        state: agreement.state,
        created_at: agreement.created_at,
        expires_at: agreement.expires_at,
        locked_by_record_id: None,
    }));

    match agreement.state {
        ItemState::Approved => {
            if let Some(env) = &agreement.environment {
                ops.push(BatchOp::PutEnvironment(env.clone()));
            }
        }
        ItemState::Revoked | ItemState::Declined | ItemState::Discarded => {
            ops.push(BatchOp::RemoveEnvironment(item_id));
        }
        _ => {}
    }

    if let Some(record) = local {
        ops.extend(release_ops(
            ledger,
            record.record_id,
            agreement.state == ItemState::Approved,
        )?);
    }
    Ok(ops)
}
