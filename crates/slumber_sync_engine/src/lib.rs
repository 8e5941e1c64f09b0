//! # Slumber Sync Engine
//!
//! Keeps a phone and its paired companion device in agreement about the
//! user's sleep data.
//!
//! This crate provides:
//! - The [`MessageChannel`] transport abstraction and an in-memory pair
//! - The [`EntityStore`] abstraction and an in-memory store
//! - [`SyncCoordinator`], the reconciliation state machine
//! - [`BackgroundScheduler`] for periodic wake-ups
//! - A bounded retry queue for change events sent while offline
//! - The [`AdaptationEngine`] hook
//!
//! ## Reconciliation
//!
//! Each device sends a `syncRequest` carrying every local change after its
//! watermark. The peer applies the winners, answers with its own changes
//! and the requester applies those in turn. Conflicts are settled by
//! last-write-wins on `lastUpdated`, with `syncId` breaking exact ties.
//!
//! ## Key Invariants
//!
//! - At most one session is open per device
//! - The watermark only moves forward, and only after a confirmed apply
//! - Applying the same payload twice changes nothing
//! - Malformed records are skipped without failing their siblings
//! - Unrecognized message types never mutate the store

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adaptation;
mod channel;
mod config;
mod coordinator;
mod error;
mod retry;
mod scheduler;
mod store;

pub use adaptation::{AdaptationEngine, RatingAdaptation};
pub use channel::{
    ChannelState, DeliveryOutcome, DeliveryReceipt, InboundHandler, MemoryChannel, MessageChannel,
};
pub use config::{RetryConfig, SyncConfig};
pub use coordinator::{
    ApplyReport, CoordinatorState, Dispatch, ReconcileTrigger, ReconciliationSession,
    SessionOutcome, SyncCoordinator, SyncStats,
};
pub use error::{SyncError, SyncResult};
pub use retry::{PendingEnvelope, PushOutcome, RetryQueue};
pub use scheduler::{
    BackgroundScheduler, BackgroundTask, Reconciler, SchedulerHost, TaskCompletion, TaskKind,
    TaskReport, TokioHost, RECONCILE_TASK_ID,
};
pub use store::{EntityStore, MemoryStore, StoreQuery};
