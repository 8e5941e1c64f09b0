//! Message channel abstraction and an in-memory paired implementation.
//!
//! A channel delivers envelopes to the paired device best-effort. It holds
//! no outbound queue: sending while the peer is unreachable fails at once
//! and the caller decides whether to retry.

use crate::error::{SyncError, SyncResult};
use parking_lot::{Mutex, RwLock};
use slumber_sync_protocol::{Envelope, MessageType};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

/// Callback invoked for every inbound envelope, in transport delivery order.
pub type InboundHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Final result of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The peer accepted the envelope.
    Delivered,
    /// The peer could not be reached before delivery completed.
    Unreachable,
    /// The peer received the envelope and refused it.
    Rejected(String),
}

/// Completes once the transport knows the fate of a sent envelope.
pub struct DeliveryReceipt {
    rx: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryReceipt {
    /// Creates a receipt and the sender that resolves it.
    ///
    /// Dropping the sender resolves the receipt as [`DeliveryOutcome::Unreachable`].
    pub fn channel() -> (oneshot::Sender<DeliveryOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A receipt that is already resolved.
    pub fn resolved(outcome: DeliveryOutcome) -> Self {
        let (tx, receipt) = Self::channel();
        let _ = tx.send(outcome);
        receipt
    }

    /// Waits for the outcome.
    pub async fn outcome(self) -> DeliveryOutcome {
        self.rx.await.unwrap_or(DeliveryOutcome::Unreachable)
    }
}

impl fmt::Debug for DeliveryReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryReceipt").finish_non_exhaustive()
    }
}

/// Transport between the two devices.
pub trait MessageChannel: Send + Sync + 'static {
    /// Starts delivering an envelope. Returns without waiting for delivery.
    ///
    /// Fails fast with [`SyncError::ChannelUnavailable`] when the peer is
    /// unreachable.
    fn send(&self, envelope: Envelope) -> SyncResult<DeliveryReceipt>;

    /// Registers the single inbound handler. A second registration fails.
    fn on_receive(&self, handler: InboundHandler) -> SyncResult<()>;

    /// Current reachability of the peer.
    fn is_reachable(&self) -> bool;

    /// Observes reachability changes.
    fn reachability(&self) -> watch::Receiver<bool>;
}

/// Coarse channel state as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// The peer is unreachable.
    Disconnected,
    /// Reachable, no request/response in flight.
    ReachableIdle,
    /// Reachable, a request/response is in flight.
    ReachableBusy,
}

impl ChannelState {
    /// Derives the state from reachability and whether a session is open.
    pub fn from_parts(reachable: bool, session_open: bool) -> Self {
        match (reachable, session_open) {
            (false, _) => ChannelState::Disconnected,
            (true, false) => ChannelState::ReachableIdle,
            (true, true) => ChannelState::ReachableBusy,
        }
    }
}

struct WireFrame {
    bytes: Vec<u8>,
    delivered: oneshot::Sender<DeliveryOutcome>,
}

/// Receiving side of one [`MemoryChannel`] end.
struct Endpoint {
    name: String,
    handler: RwLock<Option<InboundHandler>>,
    reject_reason: RwLock<Option<String>>,
    received: AtomicU64,
}

impl Endpoint {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            handler: RwLock::new(None),
            reject_reason: RwLock::new(None),
            received: AtomicU64::new(0),
        })
    }

    fn deliver(&self, envelope: Envelope) -> DeliveryOutcome {
        if let Some(reason) = self.reject_reason.read().clone() {
            return DeliveryOutcome::Rejected(reason);
        }
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                handler(envelope);
                DeliveryOutcome::Delivered
            }
            None => DeliveryOutcome::Rejected(format!("{} has no inbound handler", self.name)),
        }
    }
}

/// One end of an in-process channel pair.
///
/// Envelopes cross the pair in wire form, so every delivery exercises the
/// CBOR encoder and decoder. Both ends share one reachability flag.
pub struct MemoryChannel {
    local: Arc<Endpoint>,
    outbound: mpsc::UnboundedSender<WireFrame>,
    link: Arc<watch::Sender<bool>>,
    sent: Mutex<Vec<MessageType>>,
}

impl MemoryChannel {
    /// Creates a connected pair of ends.
    ///
    /// Must be called inside a Tokio runtime: each end's inbound delivery
    /// runs on a spawned task.
    pub fn pair(a_name: &str, b_name: &str) -> (Self, Self) {
        let (link, _) = watch::channel(true);
        let link = Arc::new(link);

        let a = Endpoint::new(a_name);
        let b = Endpoint::new(b_name);
        let (to_b, b_inbox) = mpsc::unbounded_channel();
        let (to_a, a_inbox) = mpsc::unbounded_channel();
        Self::spawn_delivery(Arc::clone(&b), b_inbox, Arc::clone(&link));
        Self::spawn_delivery(Arc::clone(&a), a_inbox, Arc::clone(&link));

        (
            Self {
                local: a,
                outbound: to_b,
                link: Arc::clone(&link),
                sent: Mutex::new(Vec::new()),
            },
            Self {
                local: b,
                outbound: to_a,
                link,
                sent: Mutex::new(Vec::new()),
            },
        )
    }

    fn spawn_delivery(
        endpoint: Arc<Endpoint>,
        mut inbox: mpsc::UnboundedReceiver<WireFrame>,
        link: Arc<watch::Sender<bool>>,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                let outcome = if !*link.borrow() {
                    DeliveryOutcome::Unreachable
                } else {
                    match Envelope::from_wire(&frame.bytes) {
                        Ok(envelope) => endpoint.deliver(envelope),
                        Err(err) => DeliveryOutcome::Rejected(err.to_string()),
                    }
                };
                trace!(endpoint = %endpoint.name, ?outcome, "frame delivered");
                let _ = frame.delivered.send(outcome);
            }
        });
    }

    /// Name of this end.
    pub fn name(&self) -> &str {
        &self.local.name
    }

    /// Connects or disconnects the pair. Affects both ends.
    pub fn set_reachable(&self, reachable: bool) {
        let previous = self.link.send_replace(reachable);
        if previous != reachable {
            debug!(endpoint = %self.local.name, reachable, "link reachability changed");
        }
    }

    /// Makes this end refuse inbound envelopes with `reason`, or accept them again.
    pub fn set_reject_inbound(&self, reason: Option<String>) {
        *self.local.reject_reason.write() = reason;
    }

    /// Hands wire bytes to this end's inbound handler as though the peer sent them.
    pub fn inject_wire(&self, bytes: &[u8]) -> SyncResult<DeliveryOutcome> {
        let envelope = Envelope::from_wire(bytes)?;
        Ok(self.local.deliver(envelope))
    }

    /// Hands an envelope to this end's inbound handler, round-tripping it through the wire form.
    pub fn inject(&self, envelope: &Envelope) -> SyncResult<DeliveryOutcome> {
        self.inject_wire(&envelope.to_wire()?)
    }

    /// Message types sent from this end, in send order.
    pub fn sent_message_types(&self) -> Vec<MessageType> {
        self.sent.lock().clone()
    }

    /// Number of envelopes delivered to this end's handler.
    pub fn received_count(&self) -> u64 {
        self.local.received.load(Ordering::Relaxed)
    }
}

impl MessageChannel for MemoryChannel {
    fn send(&self, envelope: Envelope) -> SyncResult<DeliveryReceipt> {
        if !self.is_reachable() {
            return Err(SyncError::ChannelUnavailable);
        }
        let bytes = envelope.to_wire()?;
        let (delivered, receipt) = DeliveryReceipt::channel();
        self.outbound
            .send(WireFrame { bytes, delivered })
            .map_err(|_| SyncError::ChannelClosed)?;
        self.sent.lock().push(envelope.message_type().clone());
        Ok(receipt)
    }

    fn on_receive(&self, handler: InboundHandler) -> SyncResult<()> {
        let mut slot = self.local.handler.write();
        if slot.is_some() {
            return Err(SyncError::HandlerAlreadyRegistered);
        }
        *slot = Some(handler);
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        *self.link.borrow()
    }

    fn reachability(&self) -> watch::Receiver<bool> {
        self.link.subscribe()
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("name", &self.local.name)
            .field("reachable", &self.is_reachable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slumber_codec::{Payload, Timestamp};

    fn envelope(tag: &str) -> Envelope {
        Envelope::new(
            MessageType::from_tag(tag),
            Payload::new().with("k", 1i64),
            Timestamp::from_secs(10),
        )
    }

    fn collecting_handler() -> (InboundHandler, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: InboundHandler = Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn delivers_to_peer_handler() {
        let (a, b) = MemoryChannel::pair("a", "b");
        let (handler, mut rx) = collecting_handler();
        b.on_receive(handler).unwrap();

        let receipt = a.send(envelope("syncRequest")).unwrap();
        assert_eq!(receipt.outcome().await, DeliveryOutcome::Delivered);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, envelope("syncRequest"));
        assert_eq!(b.received_count(), 1);
        assert_eq!(a.sent_message_types(), vec![MessageType::SyncRequest]);
    }

    #[tokio::test]
    async fn unreachable_send_fails_fast() {
        let (a, b) = MemoryChannel::pair("a", "b");
        b.set_reachable(false);
        assert!(!a.is_reachable());
        assert_eq!(
            a.send(envelope("syncRequest")).unwrap_err(),
            SyncError::ChannelUnavailable
        );
        assert!(a.sent_message_types().is_empty());
    }

    #[tokio::test]
    async fn second_handler_is_refused() {
        let (a, _b) = MemoryChannel::pair("a", "b");
        let (first, _rx1) = collecting_handler();
        let (second, _rx2) = collecting_handler();
        a.on_receive(first).unwrap();
        assert_eq!(
            a.on_receive(second).unwrap_err(),
            SyncError::HandlerAlreadyRegistered
        );
    }

    #[tokio::test]
    async fn missing_handler_rejects() {
        let (a, _b) = MemoryChannel::pair("a", "b");
        let outcome = a.send(envelope("syncRequest")).unwrap().outcome().await;
        assert!(matches!(outcome, DeliveryOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn reject_injection() {
        let (a, b) = MemoryChannel::pair("a", "b");
        let (handler, _rx) = collecting_handler();
        b.on_receive(handler).unwrap();
        b.set_reject_inbound(Some("busy".into()));

        let outcome = a.send(envelope("fullDataSync")).unwrap().outcome().await;
        assert_eq!(outcome, DeliveryOutcome::Rejected("busy".into()));
        assert_eq!(b.received_count(), 0);
    }

    #[tokio::test]
    async fn reachability_is_observable() {
        let (a, b) = MemoryChannel::pair("a", "b");
        let mut watcher = a.reachability();
        b.set_reachable(false);
        watcher.changed().await.unwrap();
        assert!(!*watcher.borrow());
    }

    #[tokio::test]
    async fn inject_preserves_unrecognized_tag() {
        let (a, _b) = MemoryChannel::pair("a", "b");
        let (handler, mut rx) = collecting_handler();
        a.on_receive(handler).unwrap();

        assert_eq!(
            a.inject(&envelope("bogus")).unwrap(),
            DeliveryOutcome::Delivered
        );
        let received = rx.recv().await.unwrap();
        assert!(received.message_type().is_unrecognized());
    }

    #[test]
    fn channel_state_derivation() {
        assert_eq!(ChannelState::from_parts(false, true), ChannelState::Disconnected);
        assert_eq!(ChannelState::from_parts(true, false), ChannelState::ReachableIdle);
        assert_eq!(ChannelState::from_parts(true, true), ChannelState::ReachableBusy);
    }
}
