use skein_connector::ConnectorError;
use skein_session::Uid;

/// Errors raised by cross-server pushes.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("uids should not be empty")]
    EmptyRecipients,

    #[error("can not send empty message")]
    EmptyMessage,

    #[error("channel {0} does not exist")]
    NoSuchChannel(String),

    #[error("channel {0} is not running now")]
    ChannelDestroyed(String),

    /// Every group failed. `fails` holds the uids that were not reached.
    #[error("all uids push message fail")]
    AllGroupsFailed { fails: Vec<Uid> },

    #[error("broadcast fails")]
    BroadcastFailed,

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}
