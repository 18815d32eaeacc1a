//! Cluster fan-out: pushes addressed to users on other frontend servers,
//! and the frontend entry points those pushes land on.

pub mod error;
pub mod fanout;
pub mod frontend;
pub mod rpc;

pub use error::FanoutError;
pub use fanout::ClusterFanout;
pub use frontend::FrontendRemote;
pub use rpc::{
    PushMsgsReply, RemoteClient, RemoteMessage, RpcError, ServerDirectory, ServerInfo,
    StaticDirectory,
};
