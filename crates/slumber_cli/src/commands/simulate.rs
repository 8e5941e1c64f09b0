//! Simulate command implementation.

use super::settings::SettingsFile;
use serde::Serialize;
use slumber_codec::Timestamp;
use slumber_sync_engine::{
    MemoryChannel, MemoryStore, ReconcileTrigger, ReconciliationSession, SessionOutcome,
    SyncConfig, SyncCoordinator, SyncStats,
};
use slumber_sync_protocol::{MessageType, SleepEntry, SleepType, SyncRecord, UserPreferences};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

type Device = SyncCoordinator<MemoryChannel, MemoryStore>;

const NIGHT: Duration = Duration::from_secs(8 * 60 * 60);
const DAY_SECS: u64 = 24 * 60 * 60;

/// Summary printed by `slumber simulate`.
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    /// Whether both stores ended up identical.
    pub converged: bool,
    /// The phone-initiated reconciliation.
    pub session: SessionReport,
    /// Primary device.
    pub phone: DeviceReport,
    /// Companion device.
    pub companion: DeviceReport,
}

/// One reconciliation session.
#[derive(Debug, Serialize)]
pub struct SessionReport {
    /// Session sequence.
    pub sequence: u64,
    /// What started it.
    pub trigger: String,
    /// Outcome label.
    pub outcome: String,
    /// Entities sent or written.
    pub touched: usize,
}

/// State of one device after the run.
#[derive(Debug, Serialize)]
pub struct DeviceReport {
    /// Device name.
    pub name: String,
    /// Records held.
    pub records: usize,
    /// Sleep entries held.
    pub sleep_entries: usize,
    /// Average rating across held entries.
    pub average_rating: Option<f64>,
    /// Watermark in seconds since the epoch.
    pub watermark: f64,
    /// Engine counters.
    pub stats: StatsReport,
}

/// Engine counters.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    /// Sessions opened.
    pub sessions_started: u64,
    /// Sessions failed.
    pub sessions_failed: u64,
    /// Remote records written.
    pub entities_applied: u64,
    /// Malformed records skipped.
    pub entities_rejected: u64,
    /// Divergent copies settled.
    pub conflicts_resolved: u64,
    /// Envelopes sent.
    pub envelopes_sent: u64,
    /// Envelopes received.
    pub envelopes_received: u64,
    /// Change events queued for retry.
    pub retries_queued: u64,
}

impl From<SyncStats> for StatsReport {
    fn from(stats: SyncStats) -> Self {
        Self {
            sessions_started: stats.sessions_started,
            sessions_failed: stats.sessions_failed,
            entities_applied: stats.entities_applied,
            entities_rejected: stats.entities_rejected,
            conflicts_resolved: stats.conflicts_resolved,
            envelopes_sent: stats.envelopes_sent,
            envelopes_received: stats.envelopes_received,
            retries_queued: stats.retries_queued,
        }
    }
}

impl From<&ReconciliationSession> for SessionReport {
    fn from(session: &ReconciliationSession) -> Self {
        let outcome = match &session.outcome {
            SessionOutcome::Succeeded => "succeeded".to_string(),
            SessionOutcome::PartiallyFailed { rejected } => format!("partially-failed ({rejected} rejected)"),
            SessionOutcome::Failed(reason) => format!("failed: {reason}"),
        };
        Self {
            sequence: session.sequence,
            trigger: session.trigger.to_string(),
            outcome,
            touched: session.touched.len(),
        }
    }
}

fn device(channel: MemoryChannel, config: SyncConfig) -> Result<Arc<Device>, Box<dyn std::error::Error>> {
    let device = Arc::new(SyncCoordinator::new(
        config,
        Arc::new(channel),
        Arc::new(MemoryStore::new()),
    ));
    device.spawn_inbound_pump()?;
    Ok(device)
}

fn report(device: &Device) -> DeviceReport {
    let records = device.store().snapshot();
    let ratings: Vec<f64> = records
        .iter()
        .filter_map(SyncRecord::as_sleep_entry)
        .filter_map(|entry| entry.rating)
        .map(f64::from)
        .collect();
    let average_rating =
        (!ratings.is_empty()).then(|| ratings.iter().sum::<f64>() / ratings.len() as f64);
    DeviceReport {
        name: device.config().device_name.clone(),
        records: records.len(),
        sleep_entries: records.iter().filter(|r| r.as_sleep_entry().is_some()).count(),
        average_rating,
        watermark: device.store().watermark().as_secs_f64(),
        stats: device.stats().into(),
    }
}

async fn converge(phone: &Device, companion: &Device, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if phone.store().snapshot() == companion.store().snapshot() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Runs the simulation.
///
/// Logs `entries` rated nights on the phone and a preferences change on the
/// companion, optionally while the pair is disconnected, then reconciles.
pub async fn run(
    entries: usize,
    offline: bool,
    settings: &SettingsFile,
) -> Result<SimulationReport, Box<dyn std::error::Error>> {
    let phone_config = settings.sync_config(settings.phone_name());
    let window = phone_config.response_timeout;
    let (phone_end, companion_end) =
        MemoryChannel::pair(settings.phone_name(), settings.companion_name());
    let phone = device(phone_end, phone_config)?;
    let companion = device(companion_end, settings.sync_config(settings.companion_name()))?;

    if offline {
        info!("Disconnecting {}", settings.companion_name());
        phone.channel().set_reachable(false);
    }

    let first_night = Timestamp::now();
    for night in 0..entries {
        let start = first_night.saturating_add(Duration::from_secs(night as u64 * DAY_SECS));
        let end = start.saturating_add(NIGHT);
        let mut entry = SleepEntry::completed(start, end, SleepType::Core, end);
        let rating = u8::try_from(night % 5).unwrap_or(0) + 1;
        entry.rate(rating, end);
        phone
            .on_local_change(MessageType::SleepEntryAdded, entry)
            .await?;
    }
    let mut preferences = UserPreferences::new(first_night);
    preferences.set_target_sleep_hours(7.5, first_night);
    companion
        .on_local_change(MessageType::UserPreferencesUpdate, preferences)
        .await?;
    info!(
        "Logged {} nights, {} change events waiting",
        entries,
        phone.pending_retries() + companion.pending_retries()
    );

    let trigger = if offline {
        info!("Reconnecting {}", settings.companion_name());
        phone.channel().set_reachable(true);
        phone.flush_retries();
        companion.flush_retries();
        ReconcileTrigger::Reconnected
    } else {
        ReconcileTrigger::Manual
    };

    let session = phone.reconcile(trigger).await?;
    let converged = converge(&phone, &companion, window).await;
    info!(
        "Session {} finished, stores {}",
        session.sequence,
        if converged { "converged" } else { "diverged" }
    );

    Ok(SimulationReport {
        converged,
        session: SessionReport::from(&session),
        phone: report(&phone),
        companion: report(&companion),
    })
}
