//! Send every push as soon as it is scheduled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use skein_session::SessionRegistry;

use crate::{BroadcastFilter, PushScheduler, PushTarget, ScheduleError, broadcast_targets};

/// Immediate delivery.
pub struct DirectScheduler {
    registry: Arc<SessionRegistry>,
    filter: Option<BroadcastFilter>,
    stopped: AtomicBool,
}

impl DirectScheduler {
    /// Scheduler writing straight to the sessions in `registry`.
    pub fn new(registry: Arc<SessionRegistry>, filter: Option<BroadcastFilter>) -> Self {
        Self {
            registry,
            filter,
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PushScheduler for DirectScheduler {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    async fn schedule(&self, packet: Bytes, target: PushTarget) -> Result<usize, ScheduleError> {
        if packet.is_empty() {
            return Err(ScheduleError::EmptyMessage);
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(ScheduleError::Stopped(self.name()));
        }

        let sids = match target {
            PushTarget::Sessions(sids) => sids,
            PushTarget::Broadcast(opts) => {
                broadcast_targets(&self.registry, self.filter.as_ref(), &packet, &opts).await
            }
        };

        let mut delivered = 0;
        for sid in sids {
            if self.registry.send_message(sid, packet.clone()).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}
