//! Addressing layer: sessions by id and by user, named channels, and
//! connection statistics. Nothing here touches the network; sessions reach
//! their sockets through [`SessionSink`].

pub mod channel;
pub mod ids;
pub mod registry;
pub mod session;
pub mod stats;
pub mod store;

pub use channel::{AddOutcome, Channel, ChannelMember, ChannelRegistry};
pub use ids::{ServerId, SessionId, Uid};
pub use registry::{SessionConfig, SessionError, SessionRegistry};
pub use session::{FrontendSession, Session, SessionEvent, SessionSink};
pub use stats::{ConnectionStats, LoginInfo, StatisticsInfo};
pub use store::{ChannelStore, MemoryChannelStore, StoreError};
