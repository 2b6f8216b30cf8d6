use planforge_core::{Event, EventBusSettings, EventKind, Metrics, PlanforgeError, PlanforgeResult};
use planforge_store::StateStore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// What a subscriber wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberFilter {
    /// Every event of every job.
    All,
    /// Events of one job.
    Job(Uuid),
}

impl SubscriberFilter {
    fn matches(self, event: &Event) -> bool {
        match self {
            SubscriberFilter::All => true,
            SubscriberFilter::Job(job_id) => event.job_id == job_id,
        }
    }
}

struct SubscriberSlot {
    filter: SubscriberFilter,
    tx: mpsc::Sender<Event>,
    missed_heartbeats: u8,
}

/// A live event stream handle.
///
/// Replayed history (for job subscriptions with `from_seq`) is yielded
/// before live events. Because the live channel is registered before the
/// history read, an event landing in between may be delivered twice; the
/// per-job sequence number is the deduplication key.
pub struct Subscription {
    /// Subscriber identity, usable for diagnostics.
    pub id: Uuid,
    replay: VecDeque<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// The next event, or `None` once the bus has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        self.rx.try_recv().ok()
    }
}

/// Append-only event log with live fan-out.
pub struct EventBus {
    store: Arc<dyn StateStore>,
    metrics: Arc<Metrics>,
    subscribers: RwLock<HashMap<Uuid, SubscriberSlot>>,
    buffer: usize,
    heartbeat: Duration,
}

impl EventBus {
    /// Creates a bus over the given store.
    pub fn new(
        store: Arc<dyn StateStore>,
        metrics: Arc<Metrics>,
        settings: &EventBusSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            metrics,
            subscribers: RwLock::new(HashMap::new()),
            buffer: settings.subscriber_buffer.max(1),
            heartbeat: Duration::from_secs(settings.heartbeat_seconds.max(1)),
        })
    }

    /// Durably appends the event, then fans it out to live subscribers.
    ///
    /// The returned event carries its assigned sequence number. Transient
    /// append failures are retried with bounded backoff; fan-out problems
    /// only drop the affected subscriber, never the publish.
    pub async fn publish(&self, event: Event) -> PlanforgeResult<Event> {
        let mut attempt = 0u32;
        let event = loop {
            match self.store.append_event(event.clone()).await {
                Ok(event) => break event,
                Err(PlanforgeError::TransientBackend(reason)) if attempt < 3 => {
                    attempt += 1;
                    warn!(%reason, attempt, "Transient append failure, retrying");
                    tokio::time::sleep(Duration::from_millis(50 << attempt)).await;
                }
                Err(e) => return Err(e),
            }
        };
        Metrics::incr(&self.metrics.events_published);
        self.fan_out(&event).await;
        Ok(event)
    }

    /// Fans out an event that was already durably appended elsewhere (the
    /// truth-record transaction appends inside the store transaction and
    /// hands the stored event here).
    pub async fn broadcast_appended(&self, event: &Event) {
        Metrics::incr(&self.metrics.events_published);
        self.fan_out(event).await;
    }

    async fn fan_out(&self, event: &Event) {
        let mut dropped = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, slot) in subscribers.iter() {
                if !slot.filter.matches(event) {
                    continue;
                }
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(subscriber = %id, "Subscriber buffer full, dropping subscription");
                        // Best-effort marker so the client can tell it lagged.
                        let marker = Event::new(event.job_id, EventKind::Heartbeat)
                            .with_payload(serde_json::json!({"lagged": true}));
                        let _ = slot.tx.try_send(marker);
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
                }
            }
        }
        self.remove_subscribers(&dropped).await;
    }

    async fn remove_subscribers(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write().await;
        for id in ids {
            if subscribers.remove(id).is_some() {
                Metrics::gauge_add(&self.metrics.subscribers, -1);
                debug!(subscriber = %id, "Subscription closed");
            }
        }
    }

    /// Registers a live subscription, optionally replaying a job's history
    /// from a sequence number first.
    ///
    /// Replay is only meaningful for job subscriptions; an `All` filter
    /// ignores `from_seq` and streams live only.
    pub async fn subscribe(
        &self,
        filter: SubscriberFilter,
        from_seq: Option<u64>,
    ) -> PlanforgeResult<Subscription> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.buffer);
        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(
                id,
                SubscriberSlot {
                    filter,
                    tx,
                    missed_heartbeats: 0,
                },
            );
        }
        Metrics::gauge_add(&self.metrics.subscribers, 1);

        // Live registration happens before the history read so nothing is
        // missed in between; duplicates are the client's to drop by seq.
        let replay = match (filter, from_seq) {
            (SubscriberFilter::Job(job_id), Some(from_seq)) => self
                .store
                .events_for_job(job_id, from_seq, usize::MAX)
                .await?
                .into(),
            _ => VecDeque::new(),
        };

        Ok(Subscription { id, replay, rx })
    }

    /// Paged history read for audit and late-joining clients.
    pub async fn history(
        &self,
        job_id: Uuid,
        from_seq: u64,
        limit: usize,
    ) -> PlanforgeResult<Vec<Event>> {
        self.store.events_for_job(job_id, from_seq, limit).await
    }

    /// Number of live subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Starts the keep-alive loop: pushes a heartbeat to every subscriber
    /// each tick and closes subscriptions that miss two in a row.
    ///
    /// Heartbeats are not persisted; they exist for liveness only.
    pub fn start_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bus.heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut dropped = Vec::new();
                {
                    let mut subscribers = bus.subscribers.write().await;
                    for (id, slot) in subscribers.iter_mut() {
                        let job_id = match slot.filter {
                            SubscriberFilter::Job(job_id) => job_id,
                            SubscriberFilter::All => Uuid::nil(),
                        };
                        let beat = Event::new(job_id, EventKind::Heartbeat);
                        match slot.tx.try_send(beat) {
                            Ok(()) => slot.missed_heartbeats = 0,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                slot.missed_heartbeats += 1;
                                if slot.missed_heartbeats >= 2 {
                                    dropped.push(*id);
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
                        }
                    }
                }
                bus.remove_subscribers(&dropped).await;
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use planforge_core::Job;
    use planforge_store::MemoryStateStore;
    use std::collections::HashMap as StdHashMap;

    fn bus_with_buffer(buffer: usize) -> (Arc<EventBus>, Arc<dyn StateStore>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let settings = EventBusSettings {
            subscriber_buffer: buffer,
            heartbeat_seconds: 15,
        };
        let bus = EventBus::new(Arc::clone(&store), Arc::new(Metrics::new()), &settings);
        (bus, store)
    }

    async fn seed_job(store: &Arc<dyn StateStore>) -> Uuid {
        let job = Job::new("p1", "reqs", StdHashMap::new());
        store.insert_job(&job).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_publish_is_durable_before_fanout() {
        let (bus, store) = bus_with_buffer(8);
        let job_id = seed_job(&store).await;

        let published = bus
            .publish(Event::new(job_id, EventKind::JobCreated))
            .await
            .unwrap();
        assert_eq!(published.seq, 1);

        // No subscriber existed; the durable log still has the event.
        let history = store.events_for_job(job_id, 0, 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_live_events() {
        let (bus, store) = bus_with_buffer(8);
        let job_id = seed_job(&store).await;

        let mut sub = bus
            .subscribe(SubscriberFilter::Job(job_id), None)
            .await
            .unwrap();
        bus.publish(Event::new(job_id, EventKind::StageEntered))
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::StageEntered);
        assert_eq!(event.seq, 1);
    }

    #[tokio::test]
    async fn test_job_filter_excludes_other_jobs() {
        let (bus, store) = bus_with_buffer(8);
        let job_a = seed_job(&store).await;
        let job_b = Uuid::new_v4();

        let mut sub = bus
            .subscribe(SubscriberFilter::Job(job_a), None)
            .await
            .unwrap();
        bus.publish(Event::new(job_b, EventKind::JobCreated))
            .await
            .unwrap();
        bus.publish(Event::new(job_a, EventKind::JobCreated))
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.job_id, job_a);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let (bus, store) = bus_with_buffer(8);
        let job_id = seed_job(&store).await;

        bus.publish(Event::new(job_id, EventKind::JobCreated))
            .await
            .unwrap();
        bus.publish(Event::new(job_id, EventKind::StageEntered))
            .await
            .unwrap();

        let mut sub = bus
            .subscribe(SubscriberFilter::Job(job_id), Some(0))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);

        bus.publish(Event::new(job_id, EventKind::JobCompleted))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_replay_from_mid_sequence() {
        let (bus, store) = bus_with_buffer(8);
        let job_id = seed_job(&store).await;
        for _ in 0..5 {
            bus.publish(Event::new(job_id, EventKind::Heartbeat))
                .await
                .unwrap();
        }

        let mut sub = bus
            .subscribe(SubscriberFilter::Job(job_id), Some(3))
            .await
            .unwrap();
        assert_eq!(sub.recv().await.unwrap().seq, 3);
        assert_eq!(sub.recv().await.unwrap().seq, 4);
        assert_eq!(sub.recv().await.unwrap().seq, 5);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let (bus, store) = bus_with_buffer(1);
        let job_id = seed_job(&store).await;

        let _sub = bus
            .subscribe(SubscriberFilter::Job(job_id), None)
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count().await, 1);

        // Fill the single-slot buffer, then overflow it.
        bus.publish(Event::new(job_id, EventKind::Heartbeat))
            .await
            .unwrap();
        bus.publish(Event::new(job_id, EventKind::Heartbeat))
            .await
            .unwrap();

        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_reaped_on_publish() {
        let (bus, store) = bus_with_buffer(8);
        let job_id = seed_job(&store).await;

        let sub = bus
            .subscribe(SubscriberFilter::Job(job_id), None)
            .await
            .unwrap();
        drop(sub);
        bus.publish(Event::new(job_id, EventKind::Heartbeat))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
