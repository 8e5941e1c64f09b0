//! Domain records eligible for synchronization.
//!
//! Each record carries an [`EntityMeta`] and implements [`PayloadCodec`].
//! Derived values (sleep duration, total scheduled sleep) are computed from
//! transported fields and never read from the wire.

use crate::identity::{decode_entity_id, EntityId, EntityMeta};
use slumber_codec::{Payload, PayloadCodec, ShapeMismatch, Timestamp, Value, ValueKind};
use std::time::Duration;

const KEY_START_TIME: &str = "startTime";
const KEY_END_TIME: &str = "endTime";
const KEY_RATING: &str = "rating";
const KEY_SLEEP_TYPE: &str = "sleepType";
const KEY_NOTES: &str = "notes";

const KEY_NAME: &str = "name";
const KEY_SCHEDULE_TYPE: &str = "scheduleType";
const KEY_IS_ACTIVE: &str = "isActive";
const KEY_BLOCKS: &str = "blocks";
const KEY_START_MINUTE: &str = "startMinute";
const KEY_DURATION_MINUTES: &str = "durationMinutes";
const KEY_IS_CORE: &str = "isCore";

const KEY_SCHEDULE_ID: &str = "scheduleId";
const KEY_DATA: &str = "data";
const KEY_PROGRESS: &str = "progress";
const KEY_ADAPTATION_DAY: &str = "adaptationDay";
const KEY_SCORE: &str = "score";

const KEY_NOTIFICATIONS_ENABLED: &str = "notificationsEnabled";
const KEY_REMINDER_LEAD_MINUTES: &str = "reminderLeadMinutes";
const KEY_TARGET_SLEEP_HOURS: &str = "targetSleepHours";

/// Minutes in a day; schedule blocks must start inside it.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Formats the key of the `index`th element of a nested list-like map.
///
/// Zero padding keeps canonical key order equal to list order.
pub(crate) fn index_key(index: usize) -> String {
    format!("{index:06}")
}

fn decode_u32(payload: &Payload, key: &str) -> Result<u32, ShapeMismatch> {
    u32::try_from(payload.require_integer(key)?)
        .map_err(|_| ShapeMismatch::invalid(key, ValueKind::Integer))
}

/// Whether a sleep period is the main sleep or a nap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SleepType {
    /// Main sleep block.
    #[default]
    Core,
    /// Short daytime sleep.
    Nap,
}

impl SleepType {
    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            SleepType::Core => "core",
            SleepType::Nap => "nap",
        }
    }

    fn decode(payload: &Payload, key: &str) -> Result<Self, ShapeMismatch> {
        match payload.require_text(key)? {
            "core" => Ok(SleepType::Core),
            "nap" => Ok(SleepType::Nap),
            _ => Err(ShapeMismatch::invalid(key, ValueKind::Text)),
        }
    }
}

/// One logged sleep period.
#[derive(Debug, Clone, PartialEq)]
pub struct SleepEntry {
    /// Identity and version.
    pub meta: EntityMeta,
    /// When sleep began.
    pub start_time: Timestamp,
    /// When sleep ended, if it has.
    pub end_time: Option<Timestamp>,
    /// Quality rating from 1 to 5.
    pub rating: Option<u8>,
    /// Core sleep or nap.
    pub sleep_type: SleepType,
    /// Free-form notes.
    pub notes: Option<String>,
}

impl SleepEntry {
    /// Highest accepted rating.
    pub const MAX_RATING: u8 = 5;

    /// Starts a new sleep period at `now`.
    pub fn start(now: Timestamp, sleep_type: SleepType) -> Self {
        Self {
            meta: EntityMeta::new(now),
            start_time: now,
            end_time: None,
            rating: None,
            sleep_type,
            notes: None,
        }
    }

    /// A completed entry, as logged after the fact.
    pub fn completed(
        start_time: Timestamp,
        end_time: Timestamp,
        sleep_type: SleepType,
        now: Timestamp,
    ) -> Self {
        Self {
            end_time: Some(end_time),
            start_time,
            ..Self::start(now, sleep_type)
        }
    }

    /// Ends the sleep period.
    pub fn finish(&mut self, end_time: Timestamp, now: Timestamp) {
        self.end_time = Some(end_time);
        self.meta.touch(now);
    }

    /// Rates the sleep quality, clamping into `1..=5`.
    pub fn rate(&mut self, rating: u8, now: Timestamp) {
        self.rating = Some(rating.clamp(1, Self::MAX_RATING));
        self.meta.touch(now);
    }

    /// Replaces the notes.
    pub fn annotate(&mut self, notes: impl Into<String>, now: Timestamp) {
        self.notes = Some(notes.into());
        self.meta.touch(now);
    }

    /// Time asleep. `None` while the period is open or if it ends before it starts.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time?.duration_since(self.start_time)
    }

    /// Returns true once the period has ended.
    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }
}

impl PayloadCodec for SleepEntry {
    fn encode(&self) -> Payload {
        let mut payload = Payload::new();
        self.meta.encode_into(&mut payload);
        payload.insert(KEY_START_TIME, self.start_time);
        payload.insert_opt(KEY_END_TIME, self.end_time);
        payload.insert_opt(KEY_RATING, self.rating.map(u32::from));
        payload.insert(KEY_SLEEP_TYPE, self.sleep_type.as_str());
        payload.insert_opt(KEY_NOTES, self.notes.clone());
        payload
    }

    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch> {
        let rating = match payload.optional_integer(KEY_RATING)? {
            None => None,
            Some(raw) => Some(
                u8::try_from(raw)
                    .ok()
                    .filter(|r| (1..=Self::MAX_RATING).contains(r))
                    .ok_or_else(|| ShapeMismatch::invalid(KEY_RATING, ValueKind::Integer))?,
            ),
        };
        Ok(Self {
            meta: EntityMeta::decode_from(payload)?,
            start_time: payload.require_timestamp(KEY_START_TIME)?,
            end_time: payload.optional_timestamp(KEY_END_TIME)?,
            rating,
            sleep_type: SleepType::decode(payload, KEY_SLEEP_TYPE)?,
            notes: payload.optional_text(KEY_NOTES)?.map(str::to_string),
        })
    }
}

/// The polyphasic pattern a schedule follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleType {
    /// One core block.
    Monophasic,
    /// Core plus one nap, or two cores.
    Biphasic,
    /// Shortened core plus naps.
    Everyman,
    /// Naps only, evenly spaced.
    Uberman,
    /// Four short naps.
    Dymaxion,
    /// User-defined blocks.
    Custom,
}

impl ScheduleType {
    /// Wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Monophasic => "monophasic",
            ScheduleType::Biphasic => "biphasic",
            ScheduleType::Everyman => "everyman",
            ScheduleType::Uberman => "uberman",
            ScheduleType::Dymaxion => "dymaxion",
            ScheduleType::Custom => "custom",
        }
    }

    fn decode(payload: &Payload, key: &str) -> Result<Self, ShapeMismatch> {
        Ok(match payload.require_text(key)? {
            "monophasic" => ScheduleType::Monophasic,
            "biphasic" => ScheduleType::Biphasic,
            "everyman" => ScheduleType::Everyman,
            "uberman" => ScheduleType::Uberman,
            "dymaxion" => ScheduleType::Dymaxion,
            "custom" => ScheduleType::Custom,
            _ => return Err(ShapeMismatch::invalid(key, ValueKind::Text)),
        })
    }
}

/// One sleep block inside a daily schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SleepBlock {
    /// Minutes after midnight the block starts.
    pub start_minute: u32,
    /// Length of the block.
    pub duration_minutes: u32,
    /// Core sleep rather than a nap.
    pub is_core: bool,
}

impl SleepBlock {
    fn encode(&self) -> Payload {
        Payload::new()
            .with(KEY_START_MINUTE, self.start_minute)
            .with(KEY_DURATION_MINUTES, self.duration_minutes)
            .with(KEY_IS_CORE, self.is_core)
    }

    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch> {
        let start_minute = decode_u32(payload, KEY_START_MINUTE)?;
        if start_minute >= MINUTES_PER_DAY {
            return Err(ShapeMismatch::invalid(KEY_START_MINUTE, ValueKind::Integer));
        }
        Ok(Self {
            start_minute,
            duration_minutes: decode_u32(payload, KEY_DURATION_MINUTES)?,
            is_core: payload.require_bool(KEY_IS_CORE)?,
        })
    }
}

/// A named daily sleep schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct SleepSchedule {
    /// Identity and version.
    pub meta: EntityMeta,
    /// Display name.
    pub name: String,
    /// Pattern family.
    pub schedule_type: ScheduleType,
    /// Whether this is the schedule the user currently follows.
    pub is_active: bool,
    /// Blocks in the order the user arranged them.
    pub blocks: Vec<SleepBlock>,
}

impl SleepSchedule {
    /// Creates an inactive schedule.
    pub fn new(
        name: impl Into<String>,
        schedule_type: ScheduleType,
        blocks: Vec<SleepBlock>,
        now: Timestamp,
    ) -> Self {
        Self {
            meta: EntityMeta::new(now),
            name: name.into(),
            schedule_type,
            is_active: false,
            blocks,
        }
    }

    /// Marks the schedule active or inactive.
    pub fn set_active(&mut self, active: bool, now: Timestamp) {
        self.is_active = active;
        self.meta.touch(now);
    }

    /// Replaces the blocks.
    pub fn set_blocks(&mut self, blocks: Vec<SleepBlock>, now: Timestamp) {
        self.blocks = blocks;
        self.meta.touch(now);
    }

    /// Scheduled sleep per day.
    pub fn total_sleep_minutes(&self) -> u32 {
        self.blocks
            .iter()
            .map(|b| b.duration_minutes)
            .fold(0, u32::saturating_add)
    }
}

impl PayloadCodec for SleepSchedule {
    fn encode(&self) -> Payload {
        let blocks: Payload = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| (index_key(i), Value::Map(block.encode())))
            .collect();

        let mut payload = Payload::new();
        self.meta.encode_into(&mut payload);
        payload.insert(KEY_NAME, self.name.as_str());
        payload.insert(KEY_SCHEDULE_TYPE, self.schedule_type.as_str());
        payload.insert(KEY_IS_ACTIVE, self.is_active);
        payload.insert(KEY_BLOCKS, blocks);
        payload
    }

    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch> {
        let mut blocks = Vec::new();
        for (key, value) in payload.require_map(KEY_BLOCKS)? {
            let block = match value.as_map() {
                Some(map) => SleepBlock::decode(map).map_err(|e| e.nested_in(key)),
                None => Err(ShapeMismatch::wrong_kind(
                    key.as_str(),
                    ValueKind::Map,
                    value.kind(),
                )),
            }
            .map_err(|e| e.nested_in(KEY_BLOCKS))?;
            blocks.push(block);
        }

        Ok(Self {
            meta: EntityMeta::decode_from(payload)?,
            name: payload.require_text(KEY_NAME)?.to_string(),
            schedule_type: ScheduleType::decode(payload, KEY_SCHEDULE_TYPE)?,
            is_active: payload.require_bool(KEY_IS_ACTIVE)?,
            blocks,
        })
    }
}

/// Output of the adaptation-scoring engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptationData {
    /// Fraction of the adaptation completed, `0.0..=1.0`.
    pub progress: f64,
    /// Days since the schedule was activated.
    pub adaptation_day: u32,
    /// Adherence score, `0.0..=100.0`.
    pub score: f64,
}

impl AdaptationData {
    fn encode(&self) -> Payload {
        Payload::new()
            .with(KEY_PROGRESS, self.progress)
            .with(KEY_ADAPTATION_DAY, self.adaptation_day)
            .with(KEY_SCORE, self.score)
    }

    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch> {
        Ok(Self {
            progress: payload.require_double(KEY_PROGRESS)?,
            adaptation_day: decode_u32(payload, KEY_ADAPTATION_DAY)?,
            score: payload.require_double(KEY_SCORE)?,
        })
    }
}

/// Adaptation progress recorded against one schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSnapshot {
    /// Identity and version.
    pub meta: EntityMeta,
    /// Schedule the progress belongs to.
    pub schedule_id: EntityId,
    /// Latest computed progress.
    pub data: AdaptationData,
}

impl AdaptationSnapshot {
    /// Creates a snapshot.
    pub fn new(schedule_id: EntityId, data: AdaptationData, now: Timestamp) -> Self {
        Self {
            meta: EntityMeta::new(now),
            schedule_id,
            data,
        }
    }

    /// Replaces the progress data with a freshly computed value.
    pub fn update(&mut self, data: AdaptationData, now: Timestamp) {
        self.data = data;
        self.meta.touch(now);
    }
}

impl PayloadCodec for AdaptationSnapshot {
    fn encode(&self) -> Payload {
        let mut payload = Payload::new();
        self.meta.encode_into(&mut payload);
        payload.insert(KEY_SCHEDULE_ID, self.schedule_id.to_string());
        payload.insert(KEY_DATA, self.data.encode());
        payload
    }

    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch> {
        Ok(Self {
            meta: EntityMeta::decode_from(payload)?,
            schedule_id: decode_entity_id(payload, KEY_SCHEDULE_ID)?,
            data: AdaptationData::decode(payload.require_map(KEY_DATA)?)
                .map_err(|e| e.nested_in(KEY_DATA))?,
        })
    }
}

/// User-level settings shared across both devices.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPreferences {
    /// Identity and version.
    pub meta: EntityMeta,
    /// Whether sleep reminders fire.
    pub notifications_enabled: bool,
    /// How long before a block the reminder fires.
    pub reminder_lead_minutes: u32,
    /// Desired total sleep per day.
    pub target_sleep_hours: f64,
}

impl UserPreferences {
    /// Default preferences for a fresh install.
    pub fn new(now: Timestamp) -> Self {
        Self {
            meta: EntityMeta::new(now),
            notifications_enabled: true,
            reminder_lead_minutes: 15,
            target_sleep_hours: 8.0,
        }
    }

    /// Sets the daily sleep target.
    pub fn set_target_sleep_hours(&mut self, hours: f64, now: Timestamp) {
        self.target_sleep_hours = hours;
        self.meta.touch(now);
    }
}

impl PayloadCodec for UserPreferences {
    fn encode(&self) -> Payload {
        let mut payload = Payload::new();
        self.meta.encode_into(&mut payload);
        payload.insert(KEY_NOTIFICATIONS_ENABLED, self.notifications_enabled);
        payload.insert(KEY_REMINDER_LEAD_MINUTES, self.reminder_lead_minutes);
        payload.insert(KEY_TARGET_SLEEP_HOURS, self.target_sleep_hours);
        payload
    }

    fn decode(payload: &Payload) -> Result<Self, ShapeMismatch> {
        Ok(Self {
            meta: EntityMeta::decode_from(payload)?,
            notifications_enabled: payload.require_bool(KEY_NOTIFICATIONS_ENABLED)?,
            reminder_lead_minutes: decode_u32(payload, KEY_REMINDER_LEAD_MINUTES)?,
            target_sleep_hours: payload.require_double(KEY_TARGET_SLEEP_HOURS)?,
        })
    }
}
