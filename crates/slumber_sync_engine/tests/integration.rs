//! End-to-end reconciliation between two in-memory devices.

use slumber_codec::{Payload, Timestamp};
use slumber_sync_engine::{
    BackgroundScheduler, BackgroundTask, ChannelState, CoordinatorState, DeliveryOutcome,
    Dispatch, MemoryChannel, MemoryStore, MessageChannel, RatingAdaptation, ReconcileTrigger,
    SessionOutcome, SyncConfig, SyncCoordinator, SyncError, TaskKind, TaskReport, TokioHost,
};
use slumber_sync_protocol::{
    encode_entity_set, Envelope, MessageType, SleepEntry, SleepType, SyncRecord, SyncRequest,
    SyncResponse, UserPreferences,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Coordinator = SyncCoordinator<MemoryChannel, MemoryStore>;

fn config(name: &str) -> SyncConfig {
    SyncConfig::new(name)
        .with_response_timeout(Duration::from_secs(2))
        .with_reconcile_on_reconnect(false)
}

fn device(channel: MemoryChannel, config: SyncConfig) -> Arc<Coordinator> {
    let coordinator = Arc::new(SyncCoordinator::new(
        config,
        Arc::new(channel),
        Arc::new(MemoryStore::new()),
    ));
    coordinator.spawn_inbound_pump().unwrap();
    coordinator
}

fn paired() -> (Arc<Coordinator>, Arc<Coordinator>) {
    let (phone, watch) = MemoryChannel::pair("phone", "watch");
    (device(phone, config("phone")), device(watch, config("watch")))
}

/// A phone whose companion records what it receives and never answers.
fn silent_peer(
    config: SyncConfig,
) -> (Arc<Coordinator>, MemoryChannel, mpsc::UnboundedReceiver<Envelope>) {
    let (phone, watch) = MemoryChannel::pair("phone", "watch");
    let (tx, rx) = mpsc::unbounded_channel();
    watch
        .on_receive(Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        }))
        .unwrap();
    (device(phone, config), watch, rx)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn at(base: Timestamp, secs: u64) -> Timestamp {
    base.saturating_add(Duration::from_secs(secs))
}

fn rated_night(base: Timestamp, rating: u8) -> SleepEntry {
    let mut entry = SleepEntry::completed(
        at(base, 1),
        at(base, 8 * 3600),
        SleepType::Core,
        at(base, 1),
    );
    entry.rate(rating, at(base, 2));
    entry
}

fn rating_on(device: &Coordinator, entry: &SleepEntry) -> Option<u8> {
    device
        .store()
        .get(&entry.meta.id)
        .and_then(|record| record.as_sleep_entry().and_then(|e| e.rating))
}

#[tokio::test]
async fn offline_entry_reaches_companion_after_reconnect() {
    let (phone_end, watch_end) = MemoryChannel::pair("phone", "watch");
    let phone = device(
        phone_end,
        config("phone").with_reconcile_on_reconnect(true),
    );
    let watch = device(watch_end, config("watch"));
    phone.spawn_reachability_watcher();

    phone.channel().set_reachable(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(phone.channel_state(), ChannelState::Disconnected);

    let entry = rated_night(Timestamp::now(), 4);
    let dispatch = phone
        .on_local_change(MessageType::SleepEntryAdded, entry.clone())
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::Queued);
    assert!(watch.store().is_empty());

    phone.channel().set_reachable(true);
    eventually(|| watch.store().get(&entry.meta.id).is_some()).await;
    eventually(|| phone.last_session().is_some_and(|s| s.is_success())).await;

    let replica = watch.store().get(&entry.meta.id).unwrap();
    let replica = replica.as_sleep_entry().unwrap();
    assert_eq!(replica.rating, Some(4));
    assert_eq!(replica.start_time, entry.start_time);
    assert_eq!(replica.end_time, entry.end_time);
    assert_eq!(replica, &entry);
    assert_eq!(phone.pending_retries(), 0);
    assert_eq!(
        phone.last_session().unwrap().trigger,
        ReconcileTrigger::Reconnected
    );
}

async fn concurrent_edit(phone_rating_later: bool) {
    let (phone, watch) = paired();
    let base = Timestamp::now();
    let entry = rated_night(base, 2);
    phone
        .on_local_change(MessageType::SleepEntryAdded, entry.clone())
        .await
        .unwrap();
    eventually(|| watch.store().get(&entry.meta.id).is_some()).await;

    phone.channel().set_reachable(false);
    let (phone_at, watch_at) = if phone_rating_later { (20, 10) } else { (10, 20) };

    let mut on_phone = entry.clone();
    on_phone.rate(3, at(base, phone_at));
    let mut on_watch = entry.clone();
    on_watch.rate(5, at(base, watch_at));
    assert_eq!(
        phone
            .on_local_change(MessageType::QualityRated, on_phone)
            .await
            .unwrap(),
        Dispatch::Queued
    );
    assert_eq!(
        watch
            .on_local_change(MessageType::QualityRated, on_watch)
            .await
            .unwrap(),
        Dispatch::Queued
    );

    phone.channel().set_reachable(true);
    phone.flush_retries();
    watch.flush_retries();
    let session = phone.reconcile(ReconcileTrigger::Manual).await.unwrap();
    assert_eq!(session.outcome, SessionOutcome::Succeeded);

    let expected = if phone_rating_later { Some(3) } else { Some(5) };
    eventually(|| rating_on(&phone, &entry) == expected && rating_on(&watch, &entry) == expected)
        .await;
    assert_eq!(
        phone.store().get(&entry.meta.id),
        watch.store().get(&entry.meta.id)
    );
}

#[tokio::test]
async fn concurrent_edits_converge_on_later_companion_edit() {
    concurrent_edit(false).await;
}

#[tokio::test]
async fn concurrent_edits_converge_on_later_phone_edit() {
    concurrent_edit(true).await;
}

#[tokio::test]
async fn unrecognized_message_type_is_ignored() {
    let (phone, watch) = paired();
    let entry = rated_night(Timestamp::now(), 5);
    let record = SyncRecord::from(entry.clone());
    let bogus = Envelope::new(
        MessageType::from_tag("bogus"),
        Payload::new().with("entities", encode_entity_set([&record])),
        Timestamp::now(),
    );

    let err = watch.handle_inbound(bogus.clone()).await.unwrap_err();
    assert_eq!(err, SyncError::UnrecognizedMessageType("bogus".into()));

    assert_eq!(
        phone.channel().send(bogus).unwrap().outcome().await,
        DeliveryOutcome::Delivered
    );
    eventually(|| watch.stats().unrecognized_messages == 2).await;
    assert!(watch.store().is_empty());
    assert_eq!(watch.store().write_count(), 0);
    assert_eq!(watch.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn scheduler_tick_during_open_session_is_refused() {
    let (phone, _watch_end, mut requests) = silent_peer(config("phone"));

    let session = tokio::spawn({
        let phone = Arc::clone(&phone);
        async move { phone.reconcile(ReconcileTrigger::LocalChange).await }
    });
    let request = requests.recv().await.unwrap();
    let request = SyncRequest::from_envelope(&request).unwrap().message;
    assert_eq!(
        phone.state(),
        CoordinatorState::AwaitingResponse {
            sequence: request.sequence
        }
    );

    let (host, _tasks) = TokioHost::new(Duration::from_secs(5));
    let host = Arc::new(host);
    let scheduler = BackgroundScheduler::new(Arc::clone(&phone), Arc::clone(&host), phone.config());
    let (task, report) = BackgroundTask::new(TaskKind::Reconcile, Duration::from_secs(5));
    assert_eq!(scheduler.handle_task(task).await, TaskReport::Failed);
    assert_eq!(report.await.unwrap(), TaskReport::Failed);
    assert_eq!(host.wakeups().len(), 1);
    assert_eq!(phone.stats().session_conflicts, 1);
    assert_eq!(
        phone.state(),
        CoordinatorState::AwaitingResponse {
            sequence: request.sequence
        }
    );

    let remote = rated_night(Timestamp::now(), 3);
    let response = SyncResponse {
        sequence: request.sequence,
        entities: vec![remote.clone().into()],
    };
    assert_eq!(
        phone
            .channel()
            .inject(&response.into_envelope(Timestamp::now()))
            .unwrap(),
        DeliveryOutcome::Delivered
    );

    let session = session.await.unwrap().unwrap();
    assert_eq!(session.sequence, request.sequence);
    assert_eq!(session.outcome, SessionOutcome::Succeeded);
    assert!(session.touched.contains(&remote.meta.id));
    assert_eq!(
        phone.store().get(&remote.meta.id),
        Some(SyncRecord::from(remote))
    );
    assert_eq!(phone.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn applying_the_same_envelope_twice_changes_nothing() {
    let (phone, _watch) = paired();
    let base = Timestamp::now();
    let records: Vec<SyncRecord> = vec![
        rated_night(base, 4).into(),
        rated_night(at(base, 86_400), 2).into(),
        UserPreferences::new(base).into(),
    ];
    let envelope = slumber_sync_protocol::FullDataSync {
        entities: records.clone(),
    }
    .into_envelope(base);

    let first = phone.apply_remote(&envelope).await.unwrap();
    assert_eq!(first.applied.len(), 3);
    let writes = phone.store().write_count();
    let snapshot = phone.store().snapshot();

    let second = phone.apply_remote(&envelope).await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.unchanged, 3);
    assert!(second.conflicts.is_empty());
    assert_eq!(phone.store().write_count(), writes);
    assert_eq!(phone.store().snapshot(), snapshot);
}

#[tokio::test]
async fn watermark_survives_failed_sessions() {
    let (phone, _watch) = paired();
    phone
        .on_local_change(MessageType::SleepEntryAdded, rated_night(Timestamp::now(), 4))
        .await
        .unwrap();

    phone.reconcile(ReconcileTrigger::Manual).await.unwrap();
    let first = phone.store().watermark();
    assert!(first > Timestamp::EPOCH);
    assert_eq!(phone.last_synced_at().await.unwrap(), Some(first));

    phone.store().set_fail_writes(true);
    let err = phone.reconcile(ReconcileTrigger::Manual).await.unwrap_err();
    assert!(matches!(err, SyncError::StoreWriteFailed(_)));
    assert_eq!(phone.store().watermark(), first);

    phone.store().set_fail_writes(false);
    phone.channel().set_reachable(false);
    let err = phone.reconcile(ReconcileTrigger::Manual).await.unwrap_err();
    assert_eq!(err, SyncError::ChannelUnavailable);
    assert_eq!(phone.store().watermark(), first);

    phone.channel().set_reachable(true);
    phone.reconcile(ReconcileTrigger::Manual).await.unwrap();
    assert!(phone.store().watermark() >= first);
    assert_eq!(phone.stats().sessions_failed, 2);
}

#[tokio::test]
async fn one_malformed_record_does_not_spoil_nine_valid() {
    let (phone, _watch_end, mut requests) = silent_peer(config("phone"));
    let session = tokio::spawn({
        let phone = Arc::clone(&phone);
        async move { phone.reconcile(ReconcileTrigger::Manual).await }
    });
    let request = requests.recv().await.unwrap();
    let sequence = SyncRequest::from_envelope(&request).unwrap().message.sequence;

    let base = Timestamp::now();
    let valid: Vec<SyncRecord> = (0..9)
        .map(|day| rated_night(at(base, day * 86_400), 3).into())
        .collect();
    let mut entities = encode_entity_set(&valid);
    entities.insert(
        "000009",
        Payload::new()
            .with("kind", "sleepEntry")
            .with("sleepType", "core"),
    );
    let payload = Payload::new()
        .with("sequence", i64::try_from(sequence).unwrap())
        .with("entities", entities);
    let response = Envelope::new(MessageType::SyncResponse, payload, base);
    phone.channel().inject(&response).unwrap();

    let session = session.await.unwrap().unwrap();
    assert_eq!(session.outcome, SessionOutcome::PartiallyFailed { rejected: 1 });
    assert_eq!(phone.store().len(), 9);
    assert_eq!(phone.stats().entities_rejected, 1);
    assert_eq!(phone.stats().entities_applied, 9);
}

#[tokio::test]
async fn late_response_after_timeout_is_ignored() {
    let (phone, _watch_end, mut requests) =
        silent_peer(config("phone").with_response_timeout(Duration::from_millis(50)));

    let err = phone.reconcile(ReconcileTrigger::Manual).await.unwrap_err();
    assert_eq!(err, SyncError::Timeout(Duration::from_millis(50)));
    let request = requests.recv().await.unwrap();
    let sequence = SyncRequest::from_envelope(&request).unwrap().message.sequence;

    let late = SyncResponse {
        sequence,
        entities: vec![rated_night(Timestamp::now(), 5).into()],
    };
    phone
        .channel()
        .inject(&late.into_envelope(Timestamp::now()))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(phone.store().is_empty());
    assert_eq!(phone.store().watermark(), Timestamp::EPOCH);
    assert_eq!(phone.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn full_data_sync_is_chunked() {
    let (phone_end, watch_end) = MemoryChannel::pair("phone", "watch");
    let phone = device(phone_end, config("phone").with_max_entities_per_envelope(2));
    let watch = device(watch_end, config("watch"));

    let base = Timestamp::now();
    for day in 0..5 {
        phone
            .on_local_change(
                MessageType::SleepEntryAdded,
                rated_night(at(base, day * 86_400), 4),
            )
            .await
            .unwrap();
    }
    eventually(|| watch.store().len() == 5).await;

    let envelopes = phone.send_full_data_sync().await.unwrap();
    assert_eq!(envelopes, 3);
    let full_syncs = phone
        .channel()
        .sent_message_types()
        .into_iter()
        .filter(|t| *t == MessageType::FullDataSync)
        .count();
    assert_eq!(full_syncs, 3);
    eventually(|| watch.stats().envelopes_received == 8).await;
    assert_eq!(watch.store().snapshot(), phone.store().snapshot());
}

#[tokio::test]
async fn remote_sleep_entries_refresh_adaptation() {
    let (phone_end, watch_end) = MemoryChannel::pair("phone", "watch");
    let phone = device(phone_end, config("phone"));
    let watch = Arc::new(
        SyncCoordinator::new(
            config("watch"),
            Arc::new(watch_end),
            Arc::new(MemoryStore::new()),
        )
        .with_adaptation_engine(Arc::new(RatingAdaptation { target_entries: 2 })),
    );
    watch.spawn_inbound_pump().unwrap();
    let mut adaptation = watch.watch_adaptation();

    phone
        .on_local_change(MessageType::SleepEntryAdded, rated_night(Timestamp::now(), 5))
        .await
        .unwrap();

    let data = adaptation.wait_for(Option::is_some).await.unwrap().clone();
    let data = data.unwrap();
    assert_eq!(data.progress, 0.5);
    assert_eq!(data.score, 100.0);
}

#[tokio::test]
async fn extreme_timestamps_do_not_stop_the_inbound_pump() {
    let (_phone_end, watch_end) = MemoryChannel::pair("phone", "watch");
    let watch = Arc::new(
        SyncCoordinator::new(
            config("watch"),
            Arc::new(watch_end),
            Arc::new(MemoryStore::new()),
        )
        .with_adaptation_engine(Arc::new(RatingAdaptation::default())),
    );
    watch.spawn_inbound_pump().unwrap();
    let mut adaptation = watch.watch_adaptation();

    let now = Timestamp::now();
    let endless = SleepEntry::completed(
        Timestamp::from_millis(-5_000_000_000_000_000_000),
        Timestamp::from_millis(5_000_000_000_000_000_000),
        SleepType::Core,
        now,
    );
    let full = slumber_sync_protocol::FullDataSync {
        entities: vec![endless.clone().into()],
    };
    assert_eq!(
        watch.channel().inject(&full.into_envelope(now)).unwrap(),
        DeliveryOutcome::Delivered
    );

    let data = adaptation.wait_for(Option::is_some).await.unwrap().clone();
    assert_eq!(data.unwrap().adaptation_day, u32::MAX);
    assert!(watch.store().get(&endless.meta.id).is_some());
    assert_eq!(watch.state(), CoordinatorState::Idle);

    let next = rated_night(now, 3);
    let full = slumber_sync_protocol::FullDataSync {
        entities: vec![next.clone().into()],
    };
    watch.channel().inject(&full.into_envelope(now)).unwrap();
    eventually(|| rating_on(&watch, &next) == Some(3)).await;
    assert_eq!(watch.stats().inbound_dropped, 0);
}

#[tokio::test]
async fn unrecognized_message_during_open_session_changes_nothing() {
    let (phone, _watch_end, mut requests) = silent_peer(config("phone"));

    let session = tokio::spawn({
        let phone = Arc::clone(&phone);
        async move { phone.reconcile(ReconcileTrigger::Manual).await }
    });
    let request = requests.recv().await.unwrap();
    let sequence = SyncRequest::from_envelope(&request).unwrap().message.sequence;

    let smuggled = rated_night(Timestamp::now(), 1);
    let record = SyncRecord::from(smuggled.clone());
    let bogus = Envelope::new(
        MessageType::from_tag("bogus"),
        Payload::new()
            .with("sequence", sequence as i64)
            .with("entities", encode_entity_set([&record])),
        Timestamp::now(),
    );
    assert_eq!(
        phone.channel().inject(&bogus).unwrap(),
        DeliveryOutcome::Delivered
    );
    eventually(|| phone.stats().unrecognized_messages == 1).await;

    assert_eq!(phone.state(), CoordinatorState::AwaitingResponse { sequence });
    assert_eq!(phone.store().write_count(), 0);
    assert!(phone.store().get(&smuggled.meta.id).is_none());
    assert!(!session.is_finished());

    let remote = rated_night(Timestamp::now(), 4);
    let response = SyncResponse {
        sequence,
        entities: vec![remote.clone().into()],
    };
    phone
        .channel()
        .inject(&response.into_envelope(Timestamp::now()))
        .unwrap();

    let session = session.await.unwrap().unwrap();
    assert_eq!(session.sequence, sequence);
    assert_eq!(session.outcome, SessionOutcome::Succeeded);
    assert_eq!(rating_on(&phone, &remote), Some(4));
    assert!(phone.store().get(&smuggled.meta.id).is_none());
    assert_eq!(phone.state(), CoordinatorState::Idle);
}

#[tokio::test]
async fn committed_local_change_opens_a_session() {
    let (phone, watch) = paired();
    let entry = rated_night(Timestamp::now(), 2);

    let dispatch = phone
        .commit_local_change(MessageType::SleepEntryAdded, entry.clone())
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::Sent);

    let session = phone.last_session().unwrap();
    assert_eq!(session.trigger, ReconcileTrigger::LocalChange);
    assert_eq!(session.outcome, SessionOutcome::Succeeded);
    assert_eq!(phone.state(), CoordinatorState::Idle);
    eventually(|| rating_on(&watch, &entry) == Some(2)).await;
}

#[tokio::test]
async fn committed_change_while_offline_waits_for_reconnect() {
    let (phone, _watch) = paired();
    phone.channel().set_reachable(false);

    let dispatch = phone
        .commit_local_change(MessageType::SleepEntryAdded, rated_night(Timestamp::now(), 4))
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::Queued);
    assert!(phone.last_session().is_none());
    assert_eq!(phone.pending_retries(), 1);
    assert_eq!(phone.stats().sessions_started, 0);
}
