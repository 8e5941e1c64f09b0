//! Reconciliation state machine.
//!
//! The coordinator turns local changes into outbound envelopes and applies
//! inbound envelopes to the local store. It runs the request/response
//! reconciliation cycle with at most one session open at a time.
//!
//! ```text
//! Idle ──reconcile──▶ AwaitingResponse{seq} ──syncResponse──▶ ApplyingRemote ──▶ Idle
//!   ▲                        │                                     │
//!   └──── Failed(reason) ◀───┴── unavailable / timeout / write ────┘
//! ```
//!
//! The watermark only advances after a confirmed apply, so an interrupted
//! session is retried wholesale on the next tick.

use crate::adaptation::AdaptationEngine;
use crate::channel::{ChannelState, DeliveryOutcome, DeliveryReceipt, InboundHandler, MessageChannel};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::retry::{PendingEnvelope, PushOutcome, RetryQueue};
use crate::store::{EntityStore, StoreQuery};
use parking_lot::{Mutex, RwLock};
use slumber_codec::{ShapeMismatch, Timestamp};
use slumber_sync_protocol::{
    resolve, AdaptationData, ChangeEvent, Conflict, ConflictResolution, Decoded, EntityId,
    EntityKind, Envelope, FullDataSync, MessageType, SyncMessage, SyncRecord, SyncRequest,
    SyncResponse, Version,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Coordinator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No session open and no remote apply in progress.
    Idle,
    /// A `syncRequest` is out; waiting for the matching response.
    AwaitingResponse {
        /// Sequence of the open session.
        sequence: u64,
    },
    /// Writing remote winners to the store.
    ApplyingRemote,
    /// The last session failed. Transient: the coordinator returns to `Idle`.
    Failed(String),
}

impl CoordinatorState {
    /// Returns true while a request/response is in flight.
    pub fn is_awaiting_response(&self) -> bool {
        matches!(self, CoordinatorState::AwaitingResponse { .. })
    }
}

/// What started a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileTrigger {
    /// A local mutation.
    LocalChange,
    /// The background scheduler woke up.
    SchedulerTick,
    /// The peer became reachable again.
    Reconnected,
    /// Explicit request from the host application.
    Manual,
}

impl ReconcileTrigger {
    /// Name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileTrigger::LocalChange => "local-change",
            ReconcileTrigger::SchedulerTick => "scheduler-tick",
            ReconcileTrigger::Reconnected => "reconnected",
            ReconcileTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for ReconcileTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every received record was well-formed and applied or already current.
    Succeeded,
    /// Some received records were malformed and skipped.
    PartiallyFailed {
        /// Number of skipped records.
        rejected: usize,
    },
    /// The session did not complete; nothing was applied.
    Failed(String),
}

/// One completed reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationSession {
    /// Monotonically increasing per device.
    pub sequence: u64,
    /// What started the session.
    pub trigger: ReconcileTrigger,
    /// Local instant the session opened; the watermark advances to it.
    pub started_at: Timestamp,
    /// Entities sent or written during the session.
    pub touched: BTreeSet<EntityId>,
    /// How the session ended.
    pub outcome: SessionOutcome,
}

impl ReconciliationSession {
    /// Returns true unless the session failed outright.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, SessionOutcome::Failed(_))
    }
}

/// Result of applying one set of remote records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Entities written, in payload order.
    pub applied: Vec<EntityId>,
    /// Records whose local copy was already current.
    pub unchanged: usize,
    /// Malformed records that were skipped.
    pub rejected: Vec<ShapeMismatch>,
    /// Divergent copies settled by the resolver.
    pub conflicts: Vec<Conflict>,
}

/// Running counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Sessions opened.
    pub sessions_started: u64,
    /// Sessions that applied every received record.
    pub sessions_succeeded: u64,
    /// Sessions that skipped malformed records.
    pub sessions_partially_failed: u64,
    /// Sessions that failed.
    pub sessions_failed: u64,
    /// Reconcile attempts refused because a session was open.
    pub session_conflicts: u64,
    /// Remote records written.
    pub entities_applied: u64,
    /// Malformed remote records skipped.
    pub entities_rejected: u64,
    /// Divergent copies settled.
    pub conflicts_resolved: u64,
    /// Envelopes handed to the channel.
    pub envelopes_sent: u64,
    /// Envelopes received from the channel.
    pub envelopes_received: u64,
    /// Inbound envelopes with an unrecognized tag.
    pub unrecognized_messages: u64,
    /// Change events queued for retry.
    pub retries_queued: u64,
    /// Change events dropped after their final attempt or evicted from a full queue.
    pub retries_dropped: u64,
    /// Inbound envelopes lost because the pump stopped or an apply aborted.
    pub inbound_dropped: u64,
    /// Most recent failure.
    pub last_error: Option<String>,
}

/// What happened to a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the channel.
    Sent,
    /// The peer was unreachable; queued for retry.
    Queued,
    /// Not sent and not queued.
    Dropped,
}

struct OpenSession {
    sequence: u64,
    responder: Option<oneshot::Sender<Decoded<SyncResponse>>>,
}

/// Orchestrates synchronization between the local store and the peer.
pub struct SyncCoordinator<C: MessageChannel, S: EntityStore> {
    config: SyncConfig,
    channel: Arc<C>,
    store: Arc<S>,
    state: watch::Sender<CoordinatorState>,
    session: Mutex<Option<OpenSession>>,
    next_sequence: AtomicU64,
    apply_gate: tokio::sync::Mutex<()>,
    retries: RetryQueue,
    stats: Arc<RwLock<SyncStats>>,
    last_session: RwLock<Option<ReconciliationSession>>,
    adaptation: Option<Arc<dyn AdaptationEngine>>,
    adaptation_tx: watch::Sender<Option<AdaptationData>>,
}

/// Releases the session slot if a session future is dropped mid-flight.
struct SessionGuard<'a, C: MessageChannel, S: EntityStore> {
    owner: &'a SyncCoordinator<C, S>,
    sequence: u64,
    armed: bool,
}

impl<C: MessageChannel, S: EntityStore> Drop for SessionGuard<'_, C, S> {
    fn drop(&mut self) {
        if self.armed && self.owner.close_session(self.sequence) {
            warn!(
                device = %self.owner.config.device_name,
                sequence = self.sequence,
                "reconciliation abandoned before completion"
            );
            {
                let mut stats = self.owner.stats.write();
                stats.sessions_failed += 1;
                stats.last_error = Some("session abandoned".into());
            }
            self.owner.set_state(CoordinatorState::Idle);
        }
    }
}

/// Returns the state to `Idle` once an out-of-session apply ends, however it ends.
struct ApplyGuard<'a, C: MessageChannel, S: EntityStore> {
    owner: &'a SyncCoordinator<C, S>,
    armed: bool,
}

impl<C: MessageChannel, S: EntityStore> Drop for ApplyGuard<'_, C, S> {
    fn drop(&mut self) {
        if self.armed && self.owner.session.lock().is_none() {
            self.owner.state.send_if_modified(|state| {
                if *state == CoordinatorState::ApplyingRemote {
                    *state = CoordinatorState::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }
}

impl<C: MessageChannel, S: EntityStore> SyncCoordinator<C, S> {
    /// Creates a coordinator over a channel and a store.
    pub fn new(config: SyncConfig, channel: Arc<C>, store: Arc<S>) -> Self {
        let retries = RetryQueue::new(config.retry_queue_capacity, config.retry.clone());
        let (state, _) = watch::channel(CoordinatorState::Idle);
        let (adaptation_tx, _) = watch::channel(None);
        Self {
            config,
            channel,
            store,
            state,
            session: Mutex::new(None),
            next_sequence: AtomicU64::new(0),
            apply_gate: tokio::sync::Mutex::new(()),
            retries,
            stats: Arc::new(RwLock::new(SyncStats::default())),
            last_session: RwLock::new(None),
            adaptation: None,
            adaptation_tx,
        }
    }

    /// Runs `engine` after remote sleep entries are applied.
    pub fn with_adaptation_engine(mut self, engine: Arc<dyn AdaptationEngine>) -> Self {
        self.adaptation = Some(engine);
        self
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The channel.
    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    /// The store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Current state.
    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    /// Observes state changes.
    pub fn watch_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Channel state derived from reachability and the session slot.
    pub fn channel_state(&self) -> ChannelState {
        ChannelState::from_parts(self.channel.is_reachable(), self.session.lock().is_some())
    }

    /// Counters so far.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The most recently finished session.
    pub fn last_session(&self) -> Option<ReconciliationSession> {
        self.last_session.read().clone()
    }

    /// Start of the last successful session, for "last synced at" displays.
    pub async fn last_synced_at(&self) -> SyncResult<Option<Timestamp>> {
        let watermark = self.store.current_watermark().await?;
        Ok((watermark > Timestamp::EPOCH).then_some(watermark))
    }

    /// Change events waiting for the peer.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Observes adaptation results computed after remote sleep entries land.
    pub fn watch_adaptation(&self) -> watch::Receiver<Option<AdaptationData>> {
        self.adaptation_tx.subscribe()
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state.send_replace(state);
    }

    fn open_session(&self) -> SyncResult<(u64, oneshot::Receiver<Decoded<SyncResponse>>)> {
        let mut slot = self.session.lock();
        if let Some(open) = slot.as_ref() {
            let open_sequence = open.sequence;
            drop(slot);
            self.stats.write().session_conflicts += 1;
            warn!(
                device = %self.config.device_name,
                open_sequence,
                "reconciliation refused, a session is already open"
            );
            return Err(SyncError::SessionConflict { open_sequence });
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let (responder, response_rx) = oneshot::channel();
        *slot = Some(OpenSession {
            sequence,
            responder: Some(responder),
        });
        drop(slot);
        self.set_state(CoordinatorState::AwaitingResponse { sequence });
        Ok((sequence, response_rx))
    }

    fn close_session(&self, sequence: u64) -> bool {
        let mut slot = self.session.lock();
        if slot.as_ref().map(|open| open.sequence) == Some(sequence) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn record_session(&self, session: ReconciliationSession) {
        {
            let mut stats = self.stats.write();
            match &session.outcome {
                SessionOutcome::Succeeded => stats.sessions_succeeded += 1,
                SessionOutcome::PartiallyFailed { .. } => stats.sessions_partially_failed += 1,
                SessionOutcome::Failed(reason) => {
                    stats.sessions_failed += 1;
                    stats.last_error = Some(reason.clone());
                }
            }
        }
        *self.last_session.write() = Some(session);
    }

    /// Runs one reconciliation cycle.
    ///
    /// Sends a `syncRequest` with every local change after the watermark,
    /// waits for the matching `syncResponse`, applies the winners and then
    /// advances the watermark to the session start. Fails with
    /// [`SyncError::SessionConflict`] if a session is already open.
    pub async fn reconcile(&self, trigger: ReconcileTrigger) -> SyncResult<ReconciliationSession> {
        let (sequence, response_rx) = self.open_session()?;
        let mut guard = SessionGuard {
            owner: self,
            sequence,
            armed: true,
        };
        let started_at = Timestamp::now();
        self.stats.write().sessions_started += 1;
        info!(
            device = %self.config.device_name,
            sequence,
            %trigger,
            "reconciliation started"
        );

        let result = self.run_session(sequence, started_at, response_rx).await;
        guard.armed = false;
        self.close_session(sequence);

        match result {
            Ok((sent, report)) => {
                let outcome = if report.rejected.is_empty() {
                    SessionOutcome::Succeeded
                } else {
                    SessionOutcome::PartiallyFailed {
                        rejected: report.rejected.len(),
                    }
                };
                let touched = sent.into_iter().chain(report.applied).collect();
                let session = ReconciliationSession {
                    sequence,
                    trigger,
                    started_at,
                    touched,
                    outcome,
                };
                info!(
                    device = %self.config.device_name,
                    sequence,
                    touched = session.touched.len(),
                    outcome = ?session.outcome,
                    "reconciliation finished"
                );
                self.set_state(CoordinatorState::Idle);
                self.record_session(session.clone());
                Ok(session)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    device = %self.config.device_name,
                    sequence,
                    error = %reason,
                    "reconciliation failed"
                );
                self.set_state(CoordinatorState::Failed(reason.clone()));
                self.record_session(ReconciliationSession {
                    sequence,
                    trigger,
                    started_at,
                    touched: BTreeSet::new(),
                    outcome: SessionOutcome::Failed(reason),
                });
                self.set_state(CoordinatorState::Idle);
                Err(err)
            }
        }
    }

    async fn run_session(
        &self,
        sequence: u64,
        started_at: Timestamp,
        response_rx: oneshot::Receiver<Decoded<SyncResponse>>,
    ) -> SyncResult<(Vec<EntityId>, ApplyReport)> {
        let watermark = self.store.current_watermark().await?;
        let entities = self.store.fetch(StoreQuery::ChangedSince(watermark)).await?;
        let sent: Vec<EntityId> = entities.iter().map(SyncRecord::id).collect();

        let request = SyncRequest {
            sequence,
            watermark,
            entities,
        };
        let receipt = self.send_envelope(request.into_envelope(Timestamp::now()))?;
        debug!(
            device = %self.config.device_name,
            sequence,
            %watermark,
            entities = sent.len(),
            "sync request sent"
        );

        let response = self.await_response(receipt, response_rx).await?;
        self.set_state(CoordinatorState::ApplyingRemote);
        let report = self
            .apply_records(response.message.entities, response.rejected)
            .await?;
        self.store
            .advance_watermark(started_at)
            .await
            .map_err(into_store_error)?;
        Ok((sent, report))
    }

    async fn await_response(
        &self,
        receipt: DeliveryReceipt,
        mut response_rx: oneshot::Receiver<Decoded<SyncResponse>>,
    ) -> SyncResult<Decoded<SyncResponse>> {
        let timeout = self.config.response_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let delivery = receipt.outcome();
        tokio::pin!(delivery);
        let mut delivered = false;

        loop {
            tokio::select! {
                response = &mut response_rx => {
                    return response.map_err(|_| SyncError::ChannelClosed);
                }
                outcome = &mut delivery, if !delivered => match outcome {
                    DeliveryOutcome::Delivered => delivered = true,
                    DeliveryOutcome::Unreachable => return Err(SyncError::ChannelUnavailable),
                    DeliveryOutcome::Rejected(reason) => return Err(SyncError::Rejected(reason)),
                },
                () = &mut deadline => return Err(SyncError::Timeout(timeout)),
            }
        }
    }

    fn send_envelope(&self, envelope: Envelope) -> SyncResult<DeliveryReceipt> {
        let receipt = self.channel.send(envelope)?;
        self.stats.write().envelopes_sent += 1;
        Ok(receipt)
    }

    /// Handles one inbound envelope.
    ///
    /// Unrecognized tags are rejected with
    /// [`SyncError::UnrecognizedMessageType`] and cause no mutation.
    pub async fn handle_inbound(&self, envelope: Envelope) -> SyncResult<()> {
        self.stats.write().envelopes_received += 1;
        if let MessageType::Unrecognized(tag) = envelope.message_type() {
            self.stats.write().unrecognized_messages += 1;
            warn!(
                device = %self.config.device_name,
                tag = %tag,
                "ignoring envelope with unrecognized message type"
            );
            return Err(SyncError::UnrecognizedMessageType(tag.clone()));
        }

        let decoded = match SyncMessage::from_envelope(&envelope) {
            Ok(decoded) => decoded,
            Err(err) => {
                let err = SyncError::from(err);
                if matches!(err, SyncError::ShapeMismatch(_)) {
                    self.stats.write().entities_rejected += 1;
                }
                debug!(
                    device = %self.config.device_name,
                    message_type = %envelope.message_type(),
                    error = %err,
                    "inbound envelope dropped"
                );
                return Err(err);
            }
        };

        match decoded.message {
            SyncMessage::Request(request) => self.answer_request(request, decoded.rejected).await,
            SyncMessage::Response(response) => {
                self.deliver_response(Decoded {
                    message: response,
                    rejected: decoded.rejected,
                });
                Ok(())
            }
            SyncMessage::FullData(full) => self
                .apply_remote_records(full.entities, decoded.rejected)
                .await
                .map(|_| ()),
            SyncMessage::Change(event) => self
                .apply_remote_records(vec![event.into_record()], decoded.rejected)
                .await
                .map(|_| ()),
        }
    }

    /// Decodes and applies any entity-carrying envelope without opening a session.
    ///
    /// Applying the same envelope twice leaves the store as the first apply did.
    pub async fn apply_remote(&self, envelope: &Envelope) -> SyncResult<ApplyReport> {
        let decoded = SyncMessage::from_envelope(envelope)?;
        let records = match decoded.message {
            SyncMessage::Request(request) => request.entities,
            SyncMessage::Response(response) => response.entities,
            SyncMessage::FullData(full) => full.entities,
            SyncMessage::Change(event) => vec![event.into_record()],
        };
        self.apply_remote_records(records, decoded.rejected).await
    }

    fn deliver_response(&self, decoded: Decoded<SyncResponse>) {
        let sequence = decoded.message.sequence;
        let responder = {
            let mut slot = self.session.lock();
            match slot.as_mut() {
                Some(open) if open.sequence == sequence => open.responder.take(),
                _ => None,
            }
        };
        match responder {
            Some(responder) => {
                if responder.send(decoded).is_err() {
                    debug!(sequence, "session closed before its response was handed over");
                }
            }
            None => debug!(
                device = %self.config.device_name,
                sequence,
                "ignoring response without a matching open session"
            ),
        }
    }

    async fn answer_request(
        &self,
        request: SyncRequest,
        rejected: Vec<ShapeMismatch>,
    ) -> SyncResult<()> {
        let SyncRequest {
            sequence,
            watermark,
            entities,
        } = request;
        let received: HashMap<EntityId, Version> = entities
            .iter()
            .map(|record| (record.id(), record.version()))
            .collect();

        self.apply_remote_records(entities, rejected).await?;

        let reply: Vec<SyncRecord> = self
            .store
            .fetch(StoreQuery::ChangedSince(watermark))
            .await?
            .into_iter()
            .filter(|record| received.get(&record.id()) != Some(&record.version()))
            .collect();
        debug!(
            device = %self.config.device_name,
            sequence,
            entities = reply.len(),
            "answering sync request"
        );
        let response = SyncResponse {
            sequence,
            entities: reply,
        };
        self.send_envelope(response.into_envelope(Timestamp::now()))?;
        Ok(())
    }

    async fn apply_remote_records(
        &self,
        records: Vec<SyncRecord>,
        rejected: Vec<ShapeMismatch>,
    ) -> SyncResult<ApplyReport> {
        let entered = self.state.send_if_modified(|state| {
            if *state == CoordinatorState::Idle {
                *state = CoordinatorState::ApplyingRemote;
                true
            } else {
                false
            }
        });
        let _applying = ApplyGuard {
            owner: self,
            armed: entered,
        };
        self.apply_records(records, rejected).await
    }

    /// Resolves each record against the store and writes the winners in one batch.
    async fn apply_records(
        &self,
        records: Vec<SyncRecord>,
        rejected: Vec<ShapeMismatch>,
    ) -> SyncResult<ApplyReport> {
        let gate = self.apply_gate.lock().await;
        let mut report = ApplyReport {
            rejected,
            ..ApplyReport::default()
        };
        let mut winners: Vec<SyncRecord> = Vec::new();
        let mut positions: HashMap<EntityId, usize> = HashMap::new();

        for remote in records {
            let id = remote.id();
            if let Some(&index) = positions.get(&id) {
                if resolve(Some(&winners[index]), Some(&remote))
                    == Some(ConflictResolution::AcceptRemote)
                {
                    winners[index] = remote;
                } else {
                    report.unchanged += 1;
                }
                continue;
            }

            let local = self.store.fetch(StoreQuery::ById(id)).await?.into_iter().next();
            if let Some(conflict) = local.as_ref().and_then(|l| Conflict::detect(l, &remote)) {
                report.conflicts.push(conflict);
            }
            match resolve(local.as_ref(), Some(&remote)) {
                Some(ConflictResolution::AcceptRemote) => {
                    positions.insert(id, winners.len());
                    winners.push(remote);
                }
                _ => report.unchanged += 1,
            }
        }

        report.applied = winners.iter().map(SyncRecord::id).collect();
        let sleep_changed = winners
            .iter()
            .any(|record| record.kind() == EntityKind::SleepEntry);
        if !winners.is_empty() {
            self.store
                .upsert_batch(winners)
                .await
                .map_err(into_store_error)?;
        }
        drop(gate);

        for mismatch in &report.rejected {
            debug!(device = %self.config.device_name, %mismatch, "skipped malformed record");
        }
        {
            let mut stats = self.stats.write();
            stats.entities_applied += report.applied.len() as u64;
            stats.entities_rejected += report.rejected.len() as u64;
            stats.conflicts_resolved += report.conflicts.len() as u64;
        }
        if sleep_changed {
            self.refresh_adaptation().await;
        }
        Ok(report)
    }

    async fn refresh_adaptation(&self) {
        let Some(engine) = self.adaptation.clone() else {
            return;
        };
        match self.store.fetch(StoreQuery::Kind(EntityKind::SleepEntry)).await {
            Ok(records) => {
                let entries: Vec<_> = records
                    .into_iter()
                    .filter_map(|record| match record {
                        SyncRecord::SleepEntry(entry) => Some(entry),
                        _ => None,
                    })
                    .collect();
                let computed = panic::catch_unwind(AssertUnwindSafe(|| {
                    engine.compute_adaptation(&entries)
                }));
                let Ok(data) = computed else {
                    warn!(
                        device = %self.config.device_name,
                        entries = entries.len(),
                        "adaptation engine panicked, keeping previous result"
                    );
                    return;
                };
                debug!(
                    device = %self.config.device_name,
                    progress = data.progress,
                    score = data.score,
                    "adaptation recomputed"
                );
                self.adaptation_tx.send_replace(Some(data));
            }
            Err(err) => warn!(error = %err, "could not load sleep entries for adaptation"),
        }
    }

    /// Persists a local mutation and sends it to the peer as a change event.
    ///
    /// If the peer is unreachable the event is queued and resent by
    /// [`flush_retries`](Self::flush_retries). No session is opened; use
    /// [`commit_local_change`](Self::commit_local_change) to follow the event
    /// with a [`ReconcileTrigger::LocalChange`] reconciliation.
    pub async fn on_local_change(
        &self,
        message_type: MessageType,
        record: impl Into<SyncRecord>,
    ) -> SyncResult<Dispatch> {
        let event = ChangeEvent::new(message_type, record.into())?;
        {
            let _gate = self.apply_gate.lock().await;
            self.store
                .upsert(event.record().clone())
                .await
                .map_err(into_store_error)?;
        }
        debug!(
            device = %self.config.device_name,
            message_type = %event.message_type(),
            id = %event.record().id(),
            "local change recorded"
        );
        let pending = PendingEnvelope {
            envelope: event.into_envelope(Timestamp::now()),
            attempts: 0,
        };
        Ok(self.dispatch(pending))
    }

    /// Records a local mutation, then reconciles with trigger `LocalChange`.
    ///
    /// The session only runs when the change event went out. A queued event
    /// waits for the reconnect path instead. A failed or refused session is
    /// logged and left to the next trigger; [`last_session`](Self::last_session)
    /// reports how it ended.
    pub async fn commit_local_change(
        &self,
        message_type: MessageType,
        record: impl Into<SyncRecord>,
    ) -> SyncResult<Dispatch> {
        let dispatch = self.on_local_change(message_type, record).await?;
        if dispatch == Dispatch::Sent {
            if let Err(err) = self.reconcile(ReconcileTrigger::LocalChange).await {
                debug!(
                    device = %self.config.device_name,
                    error = %err,
                    "local change reconciliation did not complete"
                );
            }
        }
        Ok(dispatch)
    }

    fn dispatch(&self, mut pending: PendingEnvelope) -> Dispatch {
        pending.attempts += 1;
        match self.send_envelope(pending.envelope.clone()) {
            Ok(receipt) => {
                self.watch_receipt(receipt, pending);
                Dispatch::Sent
            }
            Err(err) if err.is_retryable() => self.queue_retry(pending),
            Err(err) => {
                warn!(error = %err, "change event dropped");
                Dispatch::Dropped
            }
        }
    }

    fn queue_retry(&self, pending: PendingEnvelope) -> Dispatch {
        let outcome = self.retries.push(pending);
        record_push(&mut self.stats.write(), outcome);
        if outcome.is_queued() {
            Dispatch::Queued
        } else {
            Dispatch::Dropped
        }
    }

    fn watch_receipt(&self, receipt: DeliveryReceipt, pending: PendingEnvelope) {
        let retries = self.retries.clone();
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            match receipt.outcome().await {
                DeliveryOutcome::Delivered => {}
                DeliveryOutcome::Unreachable => {
                    let outcome = retries.push(pending);
                    record_push(&mut stats.write(), outcome);
                }
                DeliveryOutcome::Rejected(reason) => {
                    warn!(%reason, "peer rejected change event");
                }
            }
        });
    }

    /// Resends queued change events. Returns how many were handed to the channel.
    ///
    /// Each event is dropped once it has used `RetryConfig::max_attempts`.
    pub fn flush_retries(&self) -> usize {
        let mut pending = self.retries.drain().into_iter();
        let mut sent = 0;
        while let Some(next) = pending.next() {
            if !self.channel.is_reachable() {
                let remaining: Vec<PendingEnvelope> = std::iter::once(next).chain(pending).collect();
                for item in remaining.into_iter().rev() {
                    self.retries.push_front(item);
                }
                break;
            }
            if self.dispatch(next) == Dispatch::Sent {
                sent += 1;
            }
        }
        if sent > 0 {
            info!(device = %self.config.device_name, sent, "flushed queued change events");
        }
        sent
    }

    /// Pushes every local entity to the peer as `fullDataSync` envelopes.
    ///
    /// Returns the number of envelopes sent.
    pub async fn send_full_data_sync(&self) -> SyncResult<usize> {
        let records = self.store.fetch(StoreQuery::All).await?;
        let now = Timestamp::now();
        let mut sent = 0;
        for chunk in records.chunks(self.config.max_entities_per_envelope.max(1)) {
            let message = FullDataSync {
                entities: chunk.to_vec(),
            };
            self.send_envelope(message.into_envelope(now))?;
            sent += 1;
        }
        info!(
            device = %self.config.device_name,
            entities = records.len(),
            envelopes = sent,
            "full data sync sent"
        );
        Ok(sent)
    }

    /// Registers the channel handler and spawns the task that applies inbound envelopes.
    pub fn spawn_inbound_pump(self: &Arc<Self>) -> SyncResult<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let stats = Arc::clone(&self.stats);
        let device = self.config.device_name.clone();
        let handler: InboundHandler = Arc::new(move |envelope| {
            if let Err(mpsc::error::SendError(envelope)) = tx.send(envelope) {
                stats.write().inbound_dropped += 1;
                warn!(device = %device, tag = %envelope.message_type(), "inbound pump stopped, envelope dropped");
            }
        });
        self.channel.on_receive(handler)?;

        let coordinator = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(this) = coordinator.upgrade() else {
                    break;
                };
                let device = this.config.device_name.clone();
                // A panicking apply loses one envelope; the pump keeps running.
                let apply = tokio::spawn(async move { this.handle_inbound(envelope).await });
                match apply.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(device = %device, error = %err, "inbound envelope not applied");
                    }
                    Err(err) => {
                        if let Some(this) = coordinator.upgrade() {
                            this.stats.write().inbound_dropped += 1;
                        }
                        warn!(device = %device, error = %err, "inbound apply task aborted");
                    }
                }
            }
        }))
    }

    /// Spawns the task that flushes retries and reconciles when the peer comes back.
    pub fn spawn_reachability_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut reachability = self.channel.reachability();
        let coordinator = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut was_reachable = *reachability.borrow_and_update();
            while reachability.changed().await.is_ok() {
                let reachable = *reachability.borrow_and_update();
                let Some(this) = coordinator.upgrade() else {
                    break;
                };
                if reachable && !was_reachable {
                    info!(device = %this.config.device_name, "peer reachable");
                    this.flush_retries();
                    if this.config.reconcile_on_reconnect {
                        if let Err(err) = this.reconcile(ReconcileTrigger::Reconnected).await {
                            debug!(
                                device = %this.config.device_name,
                                error = %err,
                                "reconnect reconciliation did not complete"
                            );
                        }
                    }
                } else if !reachable && was_reachable {
                    info!(device = %this.config.device_name, "peer unreachable");
                }
                was_reachable = reachable;
            }
        })
    }
}

fn record_push(stats: &mut SyncStats, outcome: PushOutcome) {
    if outcome.is_queued() {
        stats.retries_queued += 1;
    }
    stats.retries_dropped += outcome.lost();
}

fn into_store_error(err: SyncError) -> SyncError {
    match err {
        SyncError::StoreWriteFailed(_) => err,
        other => SyncError::store_write(other.to_string()),
    }
}

impl<C: MessageChannel, S: EntityStore> fmt::Debug for SyncCoordinator<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("device", &self.config.device_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
