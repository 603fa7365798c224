use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use cosync_common::time::epoch_millis;
use cosync_common::types::{ConnectionId, DocumentId, FieldPath, MessageId};
use cosync_protocol::{Frame, ACK_TIMEOUT_MS, BATCH_INTERVAL_MS, MAX_RETRIES};
use cosync_replica::FieldValue;

use crate::coordinator::SyncCoordinator;

/// Transport seam between the delivery layer and the connection registry.
/// The gateway implements this over its client table.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Hand an encoded frame to a connection's write loop. `false` when the
    /// connection is gone.
    async fn send(&self, connection_id: &str, frame: String) -> bool;

    /// Whether the connection is still authenticated. Gates resends.
    async fn is_active(&self, connection_id: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Coalescing window per document.
    pub batch_interval: Duration,
    /// Wait per transmission before a resend.
    pub ack_timeout: Duration,
    /// Total transmissions per `(connection, message)` before giving up.
    pub max_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(BATCH_INTERVAL_MS),
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MS),
            max_retries: MAX_RETRIES,
        }
    }
}

struct PendingAck {
    document_id: DocumentId,
    attempts: u32,
    _sent_at: u64,
    /// The exact encoded frame; resends repeat it byte-for-byte so the
    /// message id never changes and client-side dedup stays meaningful.
    frame: String,
}

/// Outbound half of the replication engine: coalesces accepted writes into
/// one delta frame per document per batch window, then tracks each
/// per-subscriber send until it is ACKed or retries are exhausted.
pub struct DeliveryLayer {
    coordinator: Arc<SyncCoordinator>,
    sink: Arc<dyn DeliverySink>,
    config: DeliveryConfig,
    /// Handle to ourselves for the timer tasks; set once in `new`.
    weak_self: std::sync::Weak<DeliveryLayer>,
    /// Batch presence doubles as the armed-timer flag: at most one flush
    /// timer exists per document.
    batches: Mutex<HashMap<DocumentId, BTreeMap<FieldPath, FieldValue>>>,
    pending_acks: Mutex<HashMap<(ConnectionId, MessageId), PendingAck>>,
}

impl DeliveryLayer {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        sink: Arc<dyn DeliverySink>,
        config: DeliveryConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            coordinator,
            sink,
            config,
            weak_self: weak_self.clone(),
            batches: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(HashMap::new()),
        })
    }

    /// Merge one authoritative field value into the document's pending
    /// batch; `None` means the field ended up deleted and travels as a
    /// tombstone. The first write in a window arms the flush timer.
    pub async fn enqueue(
        &self,
        document_id: &str,
        field: &str,
        authoritative: Option<serde_json::Value>,
    ) {
        let value = match authoritative {
            Some(v) => FieldValue::Value(v),
            None => FieldValue::Tombstone,
        };

        let mut batches = self.batches.lock().await;
        match batches.entry(document_id.to_string()) {
            Entry::Occupied(mut entry) => {
                // Later writes overwrite earlier ones within the window.
                entry.get_mut().insert(field.to_string(), value);
            }
            Entry::Vacant(entry) => {
                entry.insert(BTreeMap::from([(field.to_string(), value)]));
                let Some(this) = self.weak_self.upgrade() else {
                    return;
                };
                let document_id = document_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(this.config.batch_interval).await;
                    this.flush(&document_id).await;
                });
            }
        }
    }

    /// Broadcast the pending batch for a document to every subscriber,
    /// including the writer, so senders observe LWW resolution of their own
    /// conflicting writes.
    pub async fn flush(&self, document_id: &str) {
        let Some(fields) = self.batches.lock().await.remove(document_id) else {
            return;
        };

        let clock = self.coordinator.get_vector_clock(document_id).await;
        let subscribers = self.coordinator.get_subscribers(document_id).await;
        debug!(
            document_id,
            fields = fields.len(),
            subscribers = subscribers.len(),
            "delivery: flushing batch"
        );

        for connection_id in subscribers {
            let frame = Frame::delta(document_id, fields.clone(), clock.clone());
            let message_id = frame.id().to_string();
            let encoded = frame.encode();

            self.pending_acks.lock().await.insert(
                (connection_id.clone(), message_id.clone()),
                PendingAck {
                    document_id: document_id.to_string(),
                    attempts: 1,
                    _sent_at: epoch_millis(),
                    frame: encoded.clone(),
                },
            );

            if self.sink.send(&connection_id, encoded).await {
                self.arm_ack_timer(connection_id, message_id);
            } else {
                self.pending_acks
                    .lock()
                    .await
                    .remove(&(connection_id, message_id));
            }
        }
    }

    fn arm_ack_timer(&self, connection_id: ConnectionId, message_id: MessageId) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(this.config.ack_timeout).await;
            this.handle_ack_timeout(connection_id, message_id).await;
        });
    }

    async fn handle_ack_timeout(&self, connection_id: ConnectionId, message_id: MessageId) {
        let key = (connection_id, message_id);

        // The alarm may fire after cancellation; table membership decides.
        let (attempts, document_id) = {
            let acks = self.pending_acks.lock().await;
            match acks.get(&key) {
                Some(entry) => (entry.attempts, entry.document_id.clone()),
                None => return,
            }
        };

        if attempts >= self.config.max_retries {
            if self.pending_acks.lock().await.remove(&key).is_some() {
                warn!(
                    connection_id = %key.0,
                    message_id = %key.1,
                    document_id,
                    attempts,
                    "delivery: retries exhausted, delta lost for subscriber"
                );
            }
            return;
        }

        if !self.sink.is_active(&key.0).await {
            if self.pending_acks.lock().await.remove(&key).is_some() {
                debug!(connection_id = %key.0, "delivery: connection inactive, dropping pending delta");
            }
            return;
        }

        // Resend the identical frame under the same message id.
        let frame = {
            let mut acks = self.pending_acks.lock().await;
            let Some(entry) = acks.get_mut(&key) else {
                return;
            };
            entry.attempts += 1;
            entry._sent_at = epoch_millis();
            entry.frame.clone()
        };
        debug!(
            connection_id = %key.0,
            message_id = %key.1,
            attempt = attempts + 1,
            "delivery: resending delta"
        );
        self.sink.send(&key.0, frame).await;
        self.arm_ack_timer(key.0, key.1);
    }

    /// Retire a pending send. ACKs for unknown ids are silently ignored.
    pub async fn ack_received(&self, connection_id: &str, message_id: &str) {
        let removed = self
            .pending_acks
            .lock()
            .await
            .remove(&(connection_id.to_string(), message_id.to_string()));
        if removed.is_none() {
            debug!(connection_id, message_id, "delivery: ack for unknown message");
        }
    }

    /// Drop every pending send owned by a closed connection.
    pub async fn cancel_connection(&self, connection_id: &str) {
        self.pending_acks
            .lock()
            .await
            .retain(|(conn, _), _| conn != connection_id);
    }

    pub async fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().await.len()
    }

    pub async fn pending_batch_count(&self) -> usize {
        self.batches.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ConnectionId, String)>>,
        inactive: AtomicBool,
    }

    impl RecordingSink {
        async fn frames_for(&self, connection_id: &str) -> Vec<String> {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|(conn, _)| conn == connection_id)
                .map(|(_, frame)| frame.clone())
                .collect()
        }
    }

    #[async_trait]
    impl DeliverySink for RecordingSink {
        async fn send(&self, connection_id: &str, frame: String) -> bool {
            self.sent
                .lock()
                .await
                .push((connection_id.to_string(), frame));
            true
        }

        async fn is_active(&self, _connection_id: &str) -> bool {
            !self.inactive.load(Ordering::SeqCst)
        }
    }

    async fn delivery_with_subscribers(
        subscribers: &[&str],
    ) -> (Arc<DeliveryLayer>, Arc<SyncCoordinator>, Arc<RecordingSink>) {
        let coordinator = Arc::new(SyncCoordinator::new(None));
        for connection_id in subscribers {
            coordinator.subscribe("d1", connection_id).await;
        }
        let sink = Arc::new(RecordingSink::default());
        let delivery = DeliveryLayer::new(
            Arc::clone(&coordinator),
            sink.clone() as Arc<dyn DeliverySink>,
            DeliveryConfig::default(),
        );
        (delivery, coordinator, sink)
    }

    fn decode_delta(frame: &str) -> (String, BTreeMap<String, FieldValue>) {
        match cosync_protocol::parse_frame(frame) {
            Ok(Frame::Delta {
                id, delta, ..
            }) => (id, delta),
            other => panic!("expected delta frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_writes_coalesces_into_one_frame() {
        let (delivery, coordinator, sink) = delivery_with_subscribers(&["conn-1"]).await;

        // Ten writes inside one window, including an overwrite of f0.
        for i in 0..10u64 {
            let field = format!("f{i}");
            let authoritative = coordinator
                .set_field("d1", &field, FieldValue::Value(json!(i)), "c1", Some(1000 + i))
                .await;
            delivery.enqueue("d1", &field, authoritative).await;
        }
        let authoritative = coordinator
            .set_field("d1", "f0", FieldValue::Value(json!("final")), "c1", Some(2000))
            .await;
        delivery.enqueue("d1", "f0", authoritative).await;

        tokio::time::sleep(Duration::from_millis(60)).await;

        let frames = sink.frames_for("conn-1").await;
        assert_eq!(frames.len(), 1, "batcher must emit exactly one frame");
        let (_, delta) = decode_delta(&frames[0]);
        assert_eq!(delta.len(), 10);
        assert_eq!(delta.get("f0"), Some(&FieldValue::Value(json!("final"))));
        assert_eq!(delta.get("f9"), Some(&FieldValue::Value(json!(9))));
        assert_eq!(delivery.pending_batch_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_subscriber_gets_its_own_message_id() {
        let (delivery, coordinator, sink) = delivery_with_subscribers(&["conn-1", "conn-2"]).await;
        let authoritative = coordinator
            .set_field("d1", "x", FieldValue::Value(json!(1)), "c1", Some(1000))
            .await;
        delivery.enqueue("d1", "x", authoritative).await;

        tokio::time::sleep(Duration::from_millis(60)).await;

        let first = sink.frames_for("conn-1").await;
        let second = sink.frames_for("conn-2").await;
        assert_eq!((first.len(), second.len()), (1, 1));
        let (id_one, _) = decode_delta(&first[0]);
        let (id_two, _) = decode_delta(&second[0]);
        assert_ne!(id_one, id_two);

        delivery.ack_received("conn-1", &id_one).await;
        delivery.ack_received("conn-2", &id_two).await;
        assert_eq!(delivery.pending_ack_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_delta_is_resent_identically_then_acked() {
        let (delivery, coordinator, sink) = delivery_with_subscribers(&["conn-1"]).await;
        let authoritative = coordinator
            .set_field("d1", "x", FieldValue::Value(json!("v")), "c1", Some(1000))
            .await;
        delivery.enqueue("d1", "x", authoritative).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.frames_for("conn-1").await.len(), 1);

        // Subscriber never saw it; the ACK timeout elapses and the server
        // resends the byte-identical frame.
        tokio::time::sleep(Duration::from_millis(ACK_TIMEOUT_MS + 50)).await;
        let frames = sink.frames_for("conn-1").await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], frames[1]);

        let (message_id, _) = decode_delta(&frames[1]);
        delivery.ack_received("conn-1", &message_id).await;
        assert_eq!(delivery.pending_ack_count().await, 0);

        // No further resend after the ACK.
        tokio::time::sleep(Duration::from_millis(ACK_TIMEOUT_MS + 50)).await;
        assert_eq!(sink.frames_for("conn-1").await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (delivery, coordinator, sink) = delivery_with_subscribers(&["conn-1"]).await;
        let authoritative = coordinator
            .set_field("d1", "x", FieldValue::Value(json!("v")), "c1", Some(1000))
            .await;
        delivery.enqueue("d1", "x", authoritative).await;

        // Never ACK: transmissions stop at max_retries and the entry drops.
        tokio::time::sleep(Duration::from_millis(
            BATCH_INTERVAL_MS + (MAX_RETRIES as u64 + 2) * (ACK_TIMEOUT_MS + 50),
        ))
        .await;

        let frames = sink.frames_for("conn-1").await;
        assert_eq!(frames.len(), MAX_RETRIES as usize);
        assert!(frames.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(delivery.pending_ack_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_connections_stop_retrying() {
        let (delivery, coordinator, sink) = delivery_with_subscribers(&["conn-1"]).await;
        let authoritative = coordinator
            .set_field("d1", "x", FieldValue::Value(json!("v")), "c1", Some(1000))
            .await;
        delivery.enqueue("d1", "x", authoritative).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        sink.inactive.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(2 * (ACK_TIMEOUT_MS + 50))).await;

        assert_eq!(sink.frames_for("conn-1").await.len(), 1);
        assert_eq!(delivery.pending_ack_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_acks_are_ignored_and_close_cancels() {
        let (delivery, coordinator, _sink) = delivery_with_subscribers(&["conn-1"]).await;
        delivery.ack_received("conn-1", "no-such-message").await;

        let authoritative = coordinator
            .set_field("d1", "x", FieldValue::Value(json!(1)), "c1", Some(1000))
            .await;
        delivery.enqueue("d1", "x", authoritative).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(delivery.pending_ack_count().await, 1);

        delivery.cancel_connection("conn-1").await;
        assert_eq!(delivery.pending_ack_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_receives_its_own_authoritative_echo() {
        // The writer is subscribed too and must see the resolved value of a
        // write it lost.
        let (delivery, coordinator, sink) = delivery_with_subscribers(&["writer", "other"]).await;
        coordinator
            .set_field("d1", "x", FieldValue::Value(json!("winner")), "c-z", Some(2000))
            .await;
        let authoritative = coordinator
            .set_field("d1", "x", FieldValue::Value(json!("loser")), "c-a", Some(1000))
            .await;
        delivery.enqueue("d1", "x", authoritative).await;

        tokio::time::sleep(Duration::from_millis(60)).await;

        let frames = sink.frames_for("writer").await;
        assert_eq!(frames.len(), 1);
        let (_, delta) = decode_delta(&frames[0]);
        assert_eq!(delta.get("x"), Some(&FieldValue::Value(json!("winner"))));
    }
}
