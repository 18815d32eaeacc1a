//! Connection and login statistics for one frontend server.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::ids::{ServerId, Uid};

/// Login record for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginInfo {
    /// Milliseconds since the Unix epoch.
    pub login_time: u64,
    /// User id.
    pub uid: Uid,
    /// Client `ip:port`.
    pub address: String,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsInfo {
    /// Server id.
    pub server_id: ServerId,
    /// Open connections.
    pub total_conn_count: usize,
    /// Logged-in users.
    pub logined_count: usize,
    /// One record per logged-in user.
    pub logined_list: Vec<LoginInfo>,
}

#[derive(Default)]
struct Counters {
    conn_count: usize,
    logined: HashMap<Uid, LoginInfo>,
}

/// Tracks open connections and logged-in users.
pub struct ConnectionStats {
    server_id: ServerId,
    inner: RwLock<Counters>,
}

impl ConnectionStats {
    /// Empty statistics for `server_id`.
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            inner: RwLock::new(Counters::default()),
        }
    }

    /// Count a new connection. Returns the new total.
    pub async fn increase_connection_count(&self) -> usize {
        let mut inner = self.inner.write().await;
        inner.conn_count += 1;
        inner.conn_count
    }

    /// Count a closed connection and forget its user, if bound.
    pub async fn decrease_connection_count(&self, uid: Option<&Uid>) {
        let mut inner = self.inner.write().await;
        inner.conn_count = inner.conn_count.saturating_sub(1);
        if let Some(uid) = uid {
            inner.logined.remove(uid);
        }
    }

    /// Record a login.
    pub async fn add_logined_user(&self, uid: Uid, address: String) {
        let login_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let info = LoginInfo {
            login_time,
            uid: uid.clone(),
            address,
        };
        self.inner.write().await.logined.insert(uid, info);
    }

    /// Forget a login.
    pub async fn remove_logined_user(&self, uid: &Uid) {
        self.inner.write().await.logined.remove(uid);
    }

    /// Snapshot.
    pub async fn statistics(&self) -> StatisticsInfo {
        let inner = self.inner.read().await;
        StatisticsInfo {
            server_id: self.server_id.clone(),
            total_conn_count: inner.conn_count,
            logined_count: inner.logined.len(),
            logined_list: inner.logined.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_follow_connect_and_login() {
        let stats = ConnectionStats::new(ServerId::from("connector-1"));
        assert_eq!(stats.increase_connection_count().await, 1);
        assert_eq!(stats.increase_connection_count().await, 2);

        stats
            .add_logined_user(Uid::from("u"), "127.0.0.1:5000".into())
            .await;
        stats
            .add_logined_user(Uid::from("u"), "127.0.0.1:5001".into())
            .await;

        let info = stats.statistics().await;
        assert_eq!(info.total_conn_count, 2);
        assert_eq!(info.logined_count, 1);
        assert_eq!(info.logined_list[0].address, "127.0.0.1:5001");

        stats.decrease_connection_count(Some(&Uid::from("u"))).await;
        let info = stats.statistics().await;
        assert_eq!(info.total_conn_count, 1);
        assert_eq!(info.logined_count, 0);
    }

    #[tokio::test]
    async fn test_count_never_underflows() {
        let stats = ConnectionStats::new(ServerId::from("s"));
        stats.decrease_connection_count(None).await;
        assert_eq!(stats.statistics().await.total_conn_count, 0);
    }
}
