//! Per-device message tracker.
//!
//! The tracker sits between the broker consumer and the device actor. It
//! keeps the FIFO of in-flight message ids, gates the actor so processing
//! follows broker order, and owns crash recovery: when the actor dies, every
//! unacked broker delivery is handed back so the broker redelivers it. The
//! broker itself is the write-ahead log; the tracker never persists
//! anything.

use crate::bridge::{Acknowledger, DeliveryTag};
use bytes::Bytes;
use dataplant_error::{DupError, DupResult};
use dataplant_models::constants::{BASE_BACKOFF, RANDOM_BACKOFF_SECS};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Handle to a running tracker task. Cheap to clone.
#[derive(Clone)]
pub struct MessageTracker {
    tx: mpsc::UnboundedSender<Command>,
}

/// Held by the registered data updater; dropping it (normally or through a
/// panic unwinding the actor task) is the tracker's DOWN signal.
pub struct TrackerGuard {
    _alive: oneshot::Sender<()>,
}

enum Command {
    Register {
        monitor: oneshot::Receiver<()>,
        reply: oneshot::Sender<()>,
    },
    Track {
        message_id: Bytes,
        tag: DeliveryTag,
    },
    CanProcess {
        message_id: Bytes,
        reply: oneshot::Sender<bool>,
    },
    Ack {
        message_id: Bytes,
    },
    Discard {
        message_id: Bytes,
    },
}

enum TrackerState {
    New,
    Accepting,
    WaitingDelivery {
        message_id: Bytes,
        reply: oneshot::Sender<bool>,
    },
    WaitingCleanup {
        monitor: oneshot::Receiver<()>,
        reply: oneshot::Sender<()>,
    },
}

impl MessageTracker {
    /// Spawn a tracker with the production recovery backoff.
    pub fn spawn(acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self::spawn_with_backoff(acknowledger, BASE_BACKOFF, RANDOM_BACKOFF_SECS)
    }

    /// Spawn with an explicit backoff, used by tests to avoid sleeping.
    pub fn spawn_with_backoff(
        acknowledger: Arc<dyn Acknowledger>,
        base_backoff: Duration,
        random_backoff_secs: u64,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = TrackerTask {
            state: TrackerState::New,
            queue: VecDeque::new(),
            ids: HashMap::new(),
            monitor: None,
            acknowledger,
            base_backoff,
            random_backoff_secs,
        };
        tokio::spawn(task.run(rx));
        MessageTracker { tx }
    }

    /// Register the calling data updater; resolves once the tracker accepts
    /// it (immediately when fresh, after cleanup when replacing a dead
    /// instance). The returned guard must be kept alive for the lifetime of
    /// the updater.
    pub async fn register_data_updater(&self) -> DupResult<TrackerGuard> {
        let (alive_tx, alive_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Register {
                monitor: alive_rx,
                reply: reply_tx,
            })
            .map_err(|_| DupError::MessageTrackerFailure)?;
        reply_rx
            .await
            .map_err(|_| DupError::MessageTrackerFailure)?;
        Ok(TrackerGuard { _alive: alive_tx })
    }

    pub fn track_delivery(&self, message_id: Bytes, tag: DeliveryTag) -> DupResult<()> {
        self.tx
            .send(Command::Track { message_id, tag })
            .map_err(|_| DupError::MessageTrackerFailure)
    }

    /// Resolves to `true` when `message_id` is the queue head with a live
    /// delivery, `false` when another message holds the head. The reply is
    /// deferred while the delivery has not been tracked yet (or was handed
    /// back and not yet redelivered).
    pub async fn can_process_message(&self, message_id: Bytes) -> DupResult<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::CanProcess {
                message_id,
                reply: reply_tx,
            })
            .map_err(|_| DupError::MessageTrackerFailure)?;
        reply_rx.await.map_err(|_| DupError::MessageTrackerFailure)
    }

    pub fn ack_delivery(&self, message_id: Bytes) -> DupResult<()> {
        self.tx
            .send(Command::Ack { message_id })
            .map_err(|_| DupError::MessageTrackerFailure)
    }

    pub fn discard(&self, message_id: Bytes) -> DupResult<()> {
        self.tx
            .send(Command::Discard { message_id })
            .map_err(|_| DupError::MessageTrackerFailure)
    }
}

struct TrackerTask {
    state: TrackerState,
    queue: VecDeque<Bytes>,
    ids: HashMap<Bytes, DeliveryTag>,
    monitor: Option<oneshot::Receiver<()>>,
    acknowledger: Arc<dyn Acknowledger>,
    base_backoff: Duration,
    random_backoff_secs: u64,
}

async fn wait_down(monitor: &mut Option<oneshot::Receiver<()>>) {
    match monitor {
        // The guard sender is never used to send; completion means drop.
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

impl TrackerTask {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.handle(cmd).await {
                            error!(error = %e, "message tracker stopping on broker failure");
                            return;
                        }
                    }
                    None => return,
                },
                _ = wait_down(&mut self.monitor) => {
                    self.monitor = None;
                    self.on_data_updater_down().await;
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command) -> DupResult<()> {
        match cmd {
            Command::Register { monitor, reply } => self.handle_register(monitor, reply),
            Command::Track { message_id, tag } => self.handle_track(message_id, tag),
            Command::CanProcess { message_id, reply } => {
                self.handle_can_process(message_id, reply)
            }
            Command::Ack { message_id } => self.handle_settle(message_id, true).await,
            Command::Discard { message_id } => self.handle_settle(message_id, false).await,
        }
    }

    fn handle_register(
        &mut self,
        monitor: oneshot::Receiver<()>,
        reply: oneshot::Sender<()>,
    ) -> DupResult<()> {
        match self.state {
            TrackerState::New => {
                self.monitor = Some(monitor);
                self.state = TrackerState::Accepting;
                let _ = reply.send(());
            }
            _ => {
                // A previous updater is still registered; defer until its
                // DOWN has been processed.
                self.state = TrackerState::WaitingCleanup { monitor, reply };
            }
        }
        Ok(())
    }

    fn handle_track(&mut self, message_id: Bytes, tag: DeliveryTag) -> DupResult<()> {
        match self.ids.get(&message_id) {
            None => {
                self.queue.push_back(message_id.clone());
                self.ids.insert(message_id.clone(), tag);
            }
            Some(DeliveryTag::Requeued(_)) => {
                // Redelivery of a handed-back message: adopt the new tag,
                // keep the original queue position.
                self.ids.insert(message_id.clone(), tag);
            }
            Some(_) => {
                debug!("duplicate delivery of an in-flight message, ignoring");
                return Ok(());
            }
        }

        if let TrackerState::WaitingDelivery { message_id: wanted, .. } = &self.state {
            let satisfied = self.queue.front() == Some(wanted)
                && matches!(
                    self.ids.get(wanted),
                    Some(DeliveryTag::Broker(_) | DeliveryTag::Injected(_))
                );
            if satisfied {
                let state = std::mem::replace(&mut self.state, TrackerState::Accepting);
                if let TrackerState::WaitingDelivery { reply, .. } = state {
                    let _ = reply.send(true);
                }
            }
        }
        Ok(())
    }

    fn handle_can_process(
        &mut self,
        message_id: Bytes,
        reply: oneshot::Sender<bool>,
    ) -> DupResult<()> {
        if !matches!(self.state, TrackerState::Accepting) {
            warn!("can_process_message outside accepting state");
            let _ = reply.send(false);
            return Ok(());
        }

        match self.queue.front() {
            Some(head) if *head == message_id => match self.ids.get(&message_id) {
                Some(DeliveryTag::Broker(_) | DeliveryTag::Injected(_)) => {
                    let _ = reply.send(true);
                }
                _ => {
                    self.state = TrackerState::WaitingDelivery { message_id, reply };
                }
            },
            Some(_) => {
                let _ = reply.send(false);
            }
            None => {
                // Not tracked yet; hold the reply until the delivery shows
                // up.
                self.state = TrackerState::WaitingDelivery { message_id, reply };
            }
        }
        Ok(())
    }

    async fn handle_settle(&mut self, message_id: Bytes, ack: bool) -> DupResult<()> {
        if self.queue.front() != Some(&message_id) {
            warn!(ack, "settle for a non-head message, ignoring");
            return Ok(());
        }
        self.queue.pop_front();
        match self.ids.remove(&message_id) {
            Some(DeliveryTag::Broker(tag)) => {
                if ack {
                    self.acknowledger.ack(tag).await?;
                } else {
                    self.acknowledger.discard(tag).await?;
                }
            }
            Some(DeliveryTag::Injected(_)) => {}
            Some(DeliveryTag::Requeued(_)) => {
                warn!("settled a message already handed back to the broker");
            }
            None => {}
        }
        Ok(())
    }

    async fn on_data_updater_down(&mut self) {
        let mids: Vec<Bytes> = self.queue.iter().cloned().collect();
        for mid in mids {
            if let Some(DeliveryTag::Broker(tag)) = self.ids.get(&mid) {
                let tag = *tag;
                if let Err(e) = self.acknowledger.requeue(tag).await {
                    error!(error = %e, tag, "failed to requeue delivery after crash");
                }
                self.ids.insert(mid, DeliveryTag::Requeued(tag));
            }
        }

        // Injected entries carried their content in the dead actor's
        // mailbox; the broker can never redeliver them, so they leave the
        // queue entirely.
        let ids = &self.ids;
        self.queue
            .retain(|mid| !matches!(ids.get(mid), Some(DeliveryTag::Injected(_))));
        self.ids
            .retain(|_, tag| !matches!(tag, DeliveryTag::Injected(_)));

        if !self.queue.is_empty() {
            let jitter = rand::thread_rng().gen_range(0..=self.random_backoff_secs);
            tokio::time::sleep(self.base_backoff + Duration::from_secs(jitter)).await;
        }

        match std::mem::replace(&mut self.state, TrackerState::New) {
            TrackerState::WaitingCleanup { monitor, reply } => {
                self.monitor = Some(monitor);
                self.state = TrackerState::Accepting;
                let _ = reply.send(());
            }
            _ => {
                self.state = TrackerState::New;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum Op {
        Ack(u64),
        Discard(u64),
        Requeue(u64),
    }

    #[derive(Default)]
    struct RecordingAcknowledger {
        ops: Mutex<Vec<Op>>,
    }

    impl RecordingAcknowledger {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Acknowledger for RecordingAcknowledger {
        async fn ack(&self, delivery_tag: u64) -> DupResult<()> {
            self.ops.lock().unwrap().push(Op::Ack(delivery_tag));
            Ok(())
        }
        async fn discard(&self, delivery_tag: u64) -> DupResult<()> {
            self.ops.lock().unwrap().push(Op::Discard(delivery_tag));
            Ok(())
        }
        async fn requeue(&self, delivery_tag: u64) -> DupResult<()> {
            self.ops.lock().unwrap().push(Op::Requeue(delivery_tag));
            Ok(())
        }
    }

    fn tracker(ack: &Arc<RecordingAcknowledger>) -> MessageTracker {
        MessageTracker::spawn_with_backoff(ack.clone(), Duration::ZERO, 0)
    }

    async fn settled(ack: &Arc<RecordingAcknowledger>, expected: usize) {
        for _ in 0..200 {
            if ack.ops().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {expected} acknowledger ops, got {:?}", ack.ops());
    }

    #[tokio::test]
    async fn ordering_gate() {
        let ack = Arc::new(RecordingAcknowledger::default());
        let tracker = tracker(&ack);
        let _guard = tracker.register_data_updater().await.unwrap();

        tracker
            .track_delivery(Bytes::from_static(b"m1"), DeliveryTag::Broker(1))
            .unwrap();
        tracker
            .track_delivery(Bytes::from_static(b"m2"), DeliveryTag::Broker(2))
            .unwrap();

        assert!(tracker
            .can_process_message(Bytes::from_static(b"m1"))
            .await
            .unwrap());
        assert!(!tracker
            .can_process_message(Bytes::from_static(b"m2"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ack_settles_in_order() {
        let ack = Arc::new(RecordingAcknowledger::default());
        let tracker = tracker(&ack);
        let _guard = tracker.register_data_updater().await.unwrap();

        tracker
            .track_delivery(Bytes::from_static(b"m1"), DeliveryTag::Broker(1))
            .unwrap();
        tracker
            .track_delivery(Bytes::from_static(b"m2"), DeliveryTag::Broker(2))
            .unwrap();
        tracker.ack_delivery(Bytes::from_static(b"m1")).unwrap();
        tracker.discard(Bytes::from_static(b"m2")).unwrap();

        settled(&ack, 2).await;
        assert_eq!(ack.ops(), vec![Op::Ack(1), Op::Discard(2)]);
    }

    #[tokio::test]
    async fn crash_requeues_all_unacked() {
        let ack = Arc::new(RecordingAcknowledger::default());
        let tracker = tracker(&ack);
        let guard = tracker.register_data_updater().await.unwrap();

        tracker
            .track_delivery(Bytes::from_static(b"m1"), DeliveryTag::Broker(1))
            .unwrap();
        tracker
            .track_delivery(Bytes::from_static(b"m2"), DeliveryTag::Broker(2))
            .unwrap();

        drop(guard);
        settled(&ack, 2).await;
        assert_eq!(ack.ops(), vec![Op::Requeue(1), Op::Requeue(2)]);

        // A fresh updater can register and the redelivered messages are
        // processable once tracked again.
        let _guard = tracker.register_data_updater().await.unwrap();
        tracker
            .track_delivery(Bytes::from_static(b"m1"), DeliveryTag::Broker(3))
            .unwrap();
        assert!(tracker
            .can_process_message(Bytes::from_static(b"m1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn requeued_head_defers_until_redelivery() {
        let ack = Arc::new(RecordingAcknowledger::default());
        let tracker = tracker(&ack);
        let guard = tracker.register_data_updater().await.unwrap();
        tracker
            .track_delivery(Bytes::from_static(b"m1"), DeliveryTag::Broker(1))
            .unwrap();
        drop(guard);

        let _guard = tracker.register_data_updater().await.unwrap();

        let t = tracker.clone();
        let pending =
            tokio::spawn(async move { t.can_process_message(Bytes::from_static(b"m1")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        tracker
            .track_delivery(Bytes::from_static(b"m1"), DeliveryTag::Broker(7))
            .unwrap();
        assert!(pending.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn injected_messages_skip_the_broker() {
        let ack = Arc::new(RecordingAcknowledger::default());
        let tracker = tracker(&ack);
        let _guard = tracker.register_data_updater().await.unwrap();

        let mid = Bytes::from_static(b"injected");
        tracker
            .track_delivery(mid.clone(), DeliveryTag::Injected(Uuid::new_v4()))
            .unwrap();
        assert!(tracker.can_process_message(mid.clone()).await.unwrap());
        tracker.ack_delivery(mid).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ack.ops().is_empty());
    }

    #[tokio::test]
    async fn register_while_busy_waits_for_cleanup() {
        let ack = Arc::new(RecordingAcknowledger::default());
        let tracker = tracker(&ack);
        let guard = tracker.register_data_updater().await.unwrap();
        tracker
            .track_delivery(Bytes::from_static(b"m1"), DeliveryTag::Broker(1))
            .unwrap();

        let t = tracker.clone();
        let second = tokio::spawn(async move { t.register_data_updater().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        drop(guard);
        let _new_guard = second.await.unwrap().unwrap();
        assert_eq!(ack.ops(), vec![Op::Requeue(1)]);
    }
}
