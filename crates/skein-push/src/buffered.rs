//! Queue pushes per session and flush them as one write per session on a
//! fixed period.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use skein_session::{SessionEvent, SessionId, SessionRegistry};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{BroadcastFilter, PushScheduler, PushTarget, ScheduleError, broadcast_targets};

struct Shared {
    registry: Arc<SessionRegistry>,
    filter: Option<BroadcastFilter>,
    queues: DashMap<SessionId, Vec<Bytes>>,
    /// Serialises flushes so two drains never reorder one session's batches.
    flush_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl Shared {
    fn enqueue(&self, sid: SessionId, packet: Bytes) {
        self.queues.entry(sid).or_default().push(packet);
    }

    async fn flush(&self) -> usize {
        let _guard = self.flush_lock.lock().await;

        let drained: Vec<(SessionId, Vec<Bytes>)> = self
            .queues
            .iter_mut()
            .filter_map(|mut entry| {
                if entry.is_empty() {
                    None
                } else {
                    Some((*entry.key(), std::mem::take(entry.value_mut())))
                }
            })
            .collect();
        self.queues.retain(|_, queue| !queue.is_empty());

        let mut flushed = 0;
        for (sid, batch) in drained {
            if self.registry.send_batch(sid, batch).await {
                flushed += 1;
            } else {
                self.queues.remove(&sid);
            }
        }
        flushed
    }
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Per-session queues drained by a periodic flush task.
pub struct BufferedScheduler {
    shared: Arc<Shared>,
    flush_interval: Duration,
    worker: Mutex<Option<Worker>>,
}

impl BufferedScheduler {
    /// Scheduler flushing every `flush_interval` once started.
    pub fn new(
        registry: Arc<SessionRegistry>,
        filter: Option<BroadcastFilter>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                filter,
                queues: DashMap::new(),
                flush_lock: Mutex::new(()),
                stopped: AtomicBool::new(false),
            }),
            flush_interval,
            worker: Mutex::new(None),
        }
    }

    /// Drain every queue now. Returns how many sessions received a batch.
    pub async fn flush(&self) -> usize {
        self.shared.flush().await
    }

    /// Messages waiting for `sid`.
    pub fn pending(&self, sid: SessionId) -> usize {
        self.shared.queues.get(&sid).map_or(0, |q| q.len())
    }
}

async fn flush_loop(shared: Arc<Shared>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.flush().await;
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn close_listener(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Closed { session, .. }) => {
                    shared.queues.remove(&session.id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("[{}] buffered scheduler missed {missed} session events", shared.registry.server_id());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl PushScheduler for BufferedScheduler {
    fn name(&self) -> &'static str {
        "buffered"
    }

    async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        self.shared.stopped.store(false, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = self.shared.registry.subscribe();
        let tasks = vec![
            tokio::spawn(flush_loop(
                Arc::clone(&self.shared),
                self.flush_interval,
                shutdown_rx.clone(),
            )),
            tokio::spawn(close_listener(Arc::clone(&self.shared), events, shutdown_rx)),
        ];
        *worker = Some(Worker { shutdown_tx, tasks });
        tracing::info!(
            "[{}] buffered scheduler started, flush every {:?}",
            self.shared.registry.server_id(),
            self.flush_interval
        );
    }

    async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.shutdown_tx.send(true);
            for task in worker.tasks {
                let _ = task.await;
            }
        }
        let flushed = self.shared.flush().await;
        tracing::info!(
            "[{}] buffered scheduler stopped, final flush reached {flushed} sessions",
            self.shared.registry.server_id()
        );
    }

    async fn schedule(&self, packet: Bytes, target: PushTarget) -> Result<usize, ScheduleError> {
        if packet.is_empty() {
            return Err(ScheduleError::EmptyMessage);
        }
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(ScheduleError::Stopped(self.name()));
        }

        let registry = &self.shared.registry;
        let sids = match target {
            PushTarget::Sessions(sids) => {
                let mut live = Vec::with_capacity(sids.len());
                for sid in sids {
                    if registry.contains(sid).await {
                        live.push(sid);
                    }
                }
                live
            }
            PushTarget::Broadcast(opts) => {
                broadcast_targets(registry, self.shared.filter.as_ref(), &packet, &opts).await
            }
        };

        for sid in &sids {
            self.shared.enqueue(*sid, packet.clone());
        }
        Ok(sids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::{BroadcastFilter, BroadcastOptions};
    use serde_json::{Value, json};
    use skein_session::Session;

    const PERIOD: Duration = Duration::from_millis(20);

    #[tokio::test(start_paused = true)]
    async fn test_one_tick_flushes_one_ordered_batch() {
        let reg = registry();
        let sink = add(&reg, 1).await;
        let scheduler = BufferedScheduler::new(reg, None, PERIOD);
        scheduler.start().await;

        let m1 = Bytes::from_static(b"m1");
        let m2 = Bytes::from_static(b"m2");
        let target = PushTarget::Sessions(vec![SessionId(1)]);
        scheduler.schedule(m1.clone(), target.clone()).await.unwrap();
        scheduler.schedule(m2.clone(), target).await.unwrap();
        assert!(sink.writes().is_empty());
        assert_eq!(scheduler.pending(SessionId(1)), 2);

        tokio::time::sleep(PERIOD + Duration::from_millis(5)).await;

        assert_eq!(sink.writes(), vec![vec![m1, m2]]);
        assert_eq!(scheduler.pending(SessionId(1)), 0);
        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_session_queue_is_dropped() {
        let reg = registry();
        let sink = add(&reg, 1).await;
        let scheduler = BufferedScheduler::new(reg.clone(), None, PERIOD);
        scheduler.start().await;

        scheduler
            .schedule(
                Bytes::from_static(b"m"),
                PushTarget::Sessions(vec![SessionId(1)]),
            )
            .await
            .unwrap();
        reg.remove(SessionId(1)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(scheduler.pending(SessionId(1)), 0);
        tokio::time::sleep(PERIOD * 2).await;
        assert!(sink.writes().is_empty());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_flushes_and_rejects_further_pushes() {
        let reg = registry();
        let sink = add(&reg, 1).await;
        let scheduler = BufferedScheduler::new(reg, None, Duration::from_secs(60));
        scheduler.start().await;

        scheduler
            .schedule(
                Bytes::from_static(b"last"),
                PushTarget::Sessions(vec![SessionId(1)]),
            )
            .await
            .unwrap();
        scheduler.stop().await;

        assert_eq!(sink.writes(), vec![vec![Bytes::from_static(b"last")]]);
        assert_eq!(
            scheduler
                .schedule(
                    Bytes::from_static(b"late"),
                    PushTarget::Sessions(vec![SessionId(1)]),
                )
                .await,
            Err(ScheduleError::Stopped("buffered"))
        );
    }

    #[tokio::test]
    async fn test_broadcast_queues_each_session() {
        let reg = registry();
        let a = add(&reg, 1).await;
        let b = add(&reg, 2).await;
        let scheduler = BufferedScheduler::new(reg, None, PERIOD);

        let queued = scheduler
            .schedule(
                Bytes::from_static(b"all"),
                PushTarget::Broadcast(BroadcastOptions::default()),
            )
            .await
            .unwrap();
        assert_eq!(queued, 2);

        assert_eq!(scheduler.flush().await, 2);
        assert_eq!(a.writes().len(), 1);
        assert_eq!(b.writes().len(), 1);
        assert_eq!(scheduler.flush().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_filter_limits_queued_sessions() {
        let reg = registry();
        let alice = add(&reg, 1).await;
        let bob = add(&reg, 2).await;
        reg.bind(SessionId(1), "alice".into()).await.unwrap();
        reg.bind(SessionId(2), "bob".into()).await.unwrap();
        let allow_listed: BroadcastFilter =
            Arc::new(|session: &Session, _: &[u8], param: Option<&Value>| {
                let uid = session.uid().map(|u| u.as_str().to_string());
                param
                    .and_then(|p| p["uids"].as_array())
                    .is_some_and(|uids| uids.iter().any(|u| u.as_str() == uid.as_deref()))
            });
        let scheduler = BufferedScheduler::new(reg, Some(allow_listed), PERIOD);

        let opts = BroadcastOptions {
            bound_only: true,
            filter_param: Some(json!({ "uids": ["bob"] })),
        };
        let queued = scheduler
            .schedule(Bytes::from_static(b"news"), PushTarget::Broadcast(opts))
            .await
            .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(scheduler.pending(SessionId(1)), 0);
        assert_eq!(scheduler.pending(SessionId(2)), 1);

        assert_eq!(scheduler.flush().await, 1);
        assert!(alice.writes().is_empty());
        assert_eq!(bob.writes(), vec![vec![Bytes::from_static(b"news")]]);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_queued() {
        let scheduler = BufferedScheduler::new(registry(), None, PERIOD);
        let queued = scheduler
            .schedule(
                Bytes::from_static(b"m"),
                PushTarget::Sessions(vec![SessionId(7)]),
            )
            .await
            .unwrap();
        assert_eq!(queued, 0);
        assert_eq!(scheduler.pending(SessionId(7)), 0);
    }
}
