//! Push scheduling: decide whether an encoded message goes out now or is
//! queued per session and flushed on a timer.
//!
//! Both policies deliver messages for one session in the order they were
//! scheduled. Callers pass already-encoded DATA packets; the scheduler never
//! looks inside them except to hand them to a [`BroadcastFilter`].

mod buffered;
mod direct;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use skein_config::{PushConfig, SchedulerKind};
use skein_session::{Session, SessionId, SessionRegistry};

pub use buffered::BufferedScheduler;
pub use direct::DirectScheduler;

/// Predicate applied to each candidate session of a broadcast.
///
/// Arguments are the session, the encoded packet and the caller's filter
/// parameter.
pub type BroadcastFilter = Arc<dyn Fn(&Session, &[u8], Option<&Value>) -> bool + Send + Sync>;

/// Broadcast selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastOptions {
    /// Only sessions bound to a user.
    pub bound_only: bool,
    /// Passed through to the broadcast filter.
    pub filter_param: Option<Value>,
}

/// Recipients of one scheduled push.
#[derive(Debug, Clone, PartialEq)]
pub enum PushTarget {
    /// The listed sessions. Unknown ids are skipped.
    Sessions(Vec<SessionId>),
    /// Every session on this server that passes the options and filter.
    Broadcast(BroadcastOptions),
}

/// Errors raised while scheduling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// Nothing to send.
    #[error("empty message")]
    EmptyMessage,

    /// The scheduler was stopped.
    #[error("scheduler {0} is stopped")]
    Stopped(&'static str),
}

/// A push delivery policy.
#[async_trait]
pub trait PushScheduler: Send + Sync {
    /// Policy name, for logs.
    fn name(&self) -> &'static str;

    /// Start background work, if any.
    async fn start(&self);

    /// Stop background work and deliver anything still pending.
    async fn stop(&self);

    /// Deliver or queue `packet` for `target`.
    ///
    /// Returns how many sessions the packet was handed to.
    async fn schedule(&self, packet: Bytes, target: PushTarget) -> Result<usize, ScheduleError>;
}

/// Build the scheduler selected by `config`.
pub fn create_scheduler(
    config: &PushConfig,
    registry: Arc<SessionRegistry>,
    filter: Option<BroadcastFilter>,
) -> Arc<dyn PushScheduler> {
    match config.scheduler {
        SchedulerKind::Direct => Arc::new(DirectScheduler::new(registry, filter)),
        SchedulerKind::Buffered => Arc::new(BufferedScheduler::new(
            registry,
            filter,
            config.flush_interval(),
        )),
    }
}

/// Collect the sessions a broadcast reaches.
pub(crate) async fn broadcast_targets(
    registry: &SessionRegistry,
    filter: Option<&BroadcastFilter>,
    packet: &[u8],
    opts: &BroadcastOptions,
) -> Vec<SessionId> {
    let mut out = Vec::new();
    let mut visit = |session: &Session| {
        let pass = filter.is_none_or(|f| f(session, packet, opts.filter_param.as_ref()));
        if pass {
            out.push(session.id());
        }
    };
    if opts.bound_only {
        registry.for_each_bound_session(&mut visit).await;
    } else {
        registry.for_each_session(&mut visit).await;
    }
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use skein_session::{ServerId, SessionConfig, SessionId, SessionRegistry, SessionSink};

    /// Records every write as one entry: a batch counts as a single write.
    #[derive(Default)]
    pub struct RecordingSink {
        pub writes: Mutex<Vec<Vec<Bytes>>>,
    }

    impl RecordingSink {
        pub fn writes(&self) -> Vec<Vec<Bytes>> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl SessionSink for RecordingSink {
        fn send(&self, packet: Bytes) -> bool {
            self.writes.lock().unwrap().push(vec![packet]);
            true
        }

        fn send_batch(&self, packets: Vec<Bytes>) -> bool {
            self.writes.lock().unwrap().push(packets);
            true
        }

        fn kick(&self, _reason: &str) {}

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    pub fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            ServerId::from("connector-1"),
            SessionConfig::default(),
        ))
    }

    pub async fn add(reg: &SessionRegistry, sid: u64) -> Arc<RecordingSink> {
        let sink = Arc::new(RecordingSink::default());
        reg.create(SessionId(sid), reg.server_id().clone(), sink.clone())
            .await;
        sink
    }
}
