//! Named groups of users, bucketed by the frontend server holding each user.
//!
//! Membership can be mirrored into a [`ChannelStore`] so a restarted process
//! can replay it. Store keys:
//!
//! - `{prefix}:{serverId}` holds the keys of every channel on this server.
//! - `{prefix}:{serverId}:{name}` holds `{ownerServerId}:{uid}` members.
//!
//! Store failures are logged and never surface to callers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::ids::{ServerId, Uid};
use crate::store::{ChannelStore, StoreError};

/// Result of [`Channel::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// New member.
    Added,
    /// The uid was already in this server's bucket; a second entry was
    /// appended and counted.
    Duplicate,
    /// The uid was moved here from another server's bucket.
    Moved {
        /// The bucket it left.
        from: ServerId,
    },
    /// Empty server id, or the channel is destroyed. Nothing changed.
    Rejected,
}

impl AddOutcome {
    /// Whether the member is now in the channel.
    pub fn is_added(&self) -> bool {
        !matches!(self, AddOutcome::Rejected)
    }
}

/// One member record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMember {
    /// User id.
    pub uid: Uid,
    /// Frontend server holding the user.
    pub server_id: ServerId,
}

#[derive(Default)]
struct Members {
    groups: HashMap<ServerId, Vec<Uid>>,
    records: HashMap<Uid, ServerId>,
    user_amount: usize,
    destroyed: bool,
}

impl Members {
    fn insert(&mut self, uid: Uid, server_id: ServerId) {
        self.groups
            .entry(server_id.clone())
            .or_default()
            .push(uid.clone());
        self.records.insert(uid, server_id);
        self.user_amount += 1;
    }

    /// Remove every entry of `uid` from `server_id`'s bucket.
    fn evict(&mut self, uid: &Uid, server_id: &ServerId) {
        if let Some(group) = self.groups.get_mut(server_id) {
            let before = group.len();
            group.retain(|u| u != uid);
            self.user_amount = self.user_amount.saturating_sub(before - group.len());
            if group.is_empty() {
                self.groups.remove(server_id);
            }
        }
        self.records.remove(uid);
    }
}

fn member_value(server_id: &ServerId, uid: &Uid) -> String {
    format!("{server_id}:{uid}")
}

async fn add_to_store(store: Option<&Arc<dyn ChannelStore>>, key: &str, value: &str) {
    if let Some(store) = store
        && let Err(e) = store.add(key, value).await
    {
        tracing::error!("add key: {key} value: {value} to store, with err: {e}");
    }
}

async fn remove_from_store(store: Option<&Arc<dyn ChannelStore>>, key: &str, value: &str) {
    if let Some(store) = store
        && let Err(e) = store.remove(key, value).await
    {
        tracing::error!("remove key: {key} value: {value} from store, with err: {e}");
    }
}

async fn remove_all_from_store(store: Option<&Arc<dyn ChannelStore>>, key: &str) {
    if let Some(store) = store
        && let Err(e) = store.remove_all(key).await
    {
        tracing::error!("remove key: {key} all members from store, with err: {e}");
    }
}

/// A named group of users.
pub struct Channel {
    name: String,
    key: String,
    store: Option<Arc<dyn ChannelStore>>,
    members: Mutex<Members>,
}

impl Channel {
    fn new(name: String, key: String, store: Option<Arc<dyn ChannelStore>>) -> Self {
        Self {
            name,
            key,
            store,
            members: Mutex::new(Members::default()),
        }
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a user held by `server_id`.
    pub async fn add(&self, uid: Uid, server_id: ServerId) -> AddOutcome {
        if server_id.is_empty() {
            tracing::warn!("ignore uid {uid} for server id not specified");
            return AddOutcome::Rejected;
        }

        let mut members = self.members.lock().await;
        if members.destroyed {
            return AddOutcome::Rejected;
        }

        let outcome = match members.records.get(&uid).cloned() {
            Some(prev) if prev == server_id => {
                tracing::warn!(
                    "uid {uid} added to channel {} twice on server {server_id}",
                    self.name
                );
                AddOutcome::Duplicate
            }
            Some(prev) => {
                members.evict(&uid, &prev);
                AddOutcome::Moved { from: prev }
            }
            None => AddOutcome::Added,
        };
        members.insert(uid.clone(), server_id.clone());
        drop(members);

        if let AddOutcome::Moved { from } = &outcome {
            remove_from_store(self.store.as_ref(), &self.key, &member_value(from, &uid)).await;
        }
        add_to_store(self.store.as_ref(), &self.key, &member_value(&server_id, &uid)).await;
        outcome
    }

    /// Remove one entry of a user held by `server_id`.
    pub async fn leave(&self, uid: &Uid, server_id: &ServerId) -> bool {
        if server_id.is_empty() {
            return false;
        }

        let mut members = self.members.lock().await;
        if members.destroyed {
            return false;
        }

        let mut removed = false;
        let mut still_present = false;
        if let Some(group) = members.groups.get_mut(server_id) {
            if let Some(pos) = group.iter().position(|u| u == uid) {
                group.remove(pos);
                removed = true;
            }
            still_present = group.contains(uid);
            if group.is_empty() {
                members.groups.remove(server_id);
            }
        }
        if removed {
            members.user_amount = members.user_amount.saturating_sub(1);
            if !still_present {
                members.records.remove(uid);
            }
        }
        drop(members);

        if removed && !still_present {
            remove_from_store(self.store.as_ref(), &self.key, &member_value(server_id, uid)).await;
        }
        removed
    }

    /// Number of member entries.
    pub async fn user_amount(&self) -> usize {
        self.members.lock().await.user_amount
    }

    /// Every member uid, one per entry.
    pub async fn members(&self) -> Vec<Uid> {
        self.members
            .lock()
            .await
            .groups
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Member record for a user.
    pub async fn member(&self, uid: &Uid) -> Option<ChannelMember> {
        self.members
            .lock()
            .await
            .records
            .get(uid)
            .map(|server_id| ChannelMember {
                uid: uid.clone(),
                server_id: server_id.clone(),
            })
    }

    /// Copy of the server → uids buckets.
    pub async fn groups(&self) -> HashMap<ServerId, Vec<Uid>> {
        self.members.lock().await.groups.clone()
    }

    /// Mark the channel dead. Later membership changes are no-ops.
    pub async fn destroy(&self) {
        self.members.lock().await.destroyed = true;
    }

    /// Whether [`Channel::destroy`] has run.
    pub async fn is_destroyed(&self) -> bool {
        self.members.lock().await.destroyed
    }
}

/// Channels owned by this server.
pub struct ChannelRegistry {
    server_id: ServerId,
    prefix: String,
    store: Option<Arc<dyn ChannelStore>>,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new(
        server_id: ServerId,
        prefix: impl Into<String>,
        store: Option<Arc<dyn ChannelStore>>,
    ) -> Self {
        Self {
            server_id,
            prefix: prefix.into(),
            store,
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn root_key(&self) -> String {
        format!("{}:{}", self.prefix, self.server_id)
    }

    fn channel_key(&self, name: &str) -> String {
        format!("{}:{}:{name}", self.prefix, self.server_id)
    }

    /// Create a channel, or return the existing one.
    pub async fn create_channel(&self, name: &str) -> Arc<Channel> {
        let (channel, created) = {
            let mut channels = self.channels.write().await;
            match channels.get(name) {
                Some(channel) => (Arc::clone(channel), false),
                None => {
                    let channel = Arc::new(Channel::new(
                        name.to_string(),
                        self.channel_key(name),
                        self.store.clone(),
                    ));
                    channels.insert(name.to_string(), Arc::clone(&channel));
                    (channel, true)
                }
            }
        };
        if created {
            add_to_store(self.store.as_ref(), &self.root_key(), &self.channel_key(name)).await;
        }
        channel
    }

    /// Look up a channel, creating it when `create` is set.
    pub async fn get_channel(&self, name: &str, create: bool) -> Option<Arc<Channel>> {
        if create {
            return Some(self.create_channel(name).await);
        }
        self.channels.read().await.get(name).cloned()
    }

    /// Destroy a channel and drop its persisted membership.
    pub async fn destroy_channel(&self, name: &str) {
        let removed = self.channels.write().await.remove(name);
        if let Some(channel) = removed {
            channel.destroy().await;
        }
        let key = self.channel_key(name);
        remove_from_store(self.store.as_ref(), &self.root_key(), &key).await;
        remove_all_from_store(self.store.as_ref(), &key).await;
    }

    /// Names of every live channel.
    pub async fn channel_names(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// Replay channels and members from the store. Returns how many channels
    /// were restored. Nothing is written back to the store.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(0);
        };

        let root = self.root_key();
        let keys = store.load(&root).await.inspect_err(|e| {
            tracing::error!("load key: {root} from store, with err: {e}");
        })?;

        let key_prefix = format!("{root}:");
        let mut restored = 0;
        for key in keys {
            let Some(name) = key.strip_prefix(&key_prefix) else {
                tracing::warn!("skip foreign channel key {key} under {root}");
                continue;
            };

            let items = match store.load(&key).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::error!("load key: {key} from store, with err: {e}");
                    Vec::new()
                }
            };

            let channel = Channel::new(name.to_string(), key.clone(), self.store.clone());
            {
                let mut members = channel.members.lock().await;
                for item in items {
                    match item.split_once(':') {
                        Some((server, uid)) if !server.is_empty() => {
                            members.insert(Uid::from(uid), ServerId::from(server));
                        }
                        _ => tracing::warn!("skip malformed channel member {item}"),
                    }
                }
            }

            self.channels
                .write()
                .await
                .insert(name.to_string(), Arc::new(channel));
            restored += 1;
        }

        tracing::info!("[{}] restored {restored} channels", self.server_id);
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChannelStore;
    use async_trait::async_trait;

    fn registry(store: Option<Arc<dyn ChannelStore>>) -> ChannelRegistry {
        ChannelRegistry::new(ServerId::from("connector-1"), "chan", store)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let reg = registry(None);
        let a = reg.create_channel("room").await;
        let b = reg.create_channel("room").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(reg.get_channel("missing", false).await.is_none());
        assert!(reg.get_channel("made", true).await.is_some());
        assert_eq!(reg.channel_names().await.len(), 2);
    }

    #[tokio::test]
    async fn test_add_rejects_empty_server() {
        let channel = registry(None).create_channel("room").await;
        assert_eq!(
            channel.add(Uid::from("u"), ServerId::from("")).await,
            AddOutcome::Rejected
        );
        assert_eq!(channel.user_amount().await, 0);
    }

    #[tokio::test]
    async fn test_add_then_leave_restores_count() {
        let channel = registry(None).create_channel("room").await;
        let server = ServerId::from("connector-1");
        channel.add(Uid::from("a"), server.clone()).await;
        let before = channel.user_amount().await;

        assert_eq!(
            channel.add(Uid::from("b"), server.clone()).await,
            AddOutcome::Added
        );
        assert!(channel.leave(&Uid::from("b"), &server).await);
        assert_eq!(channel.user_amount().await, before);
    }

    #[tokio::test]
    async fn test_unmatched_leave_never_goes_negative() {
        let channel = registry(None).create_channel("room").await;
        let server = ServerId::from("connector-1");
        channel.add(Uid::from("a"), server.clone()).await;
        assert!(channel.leave(&Uid::from("a"), &server).await);
        assert!(!channel.leave(&Uid::from("a"), &server).await);
        assert!(!channel.leave(&Uid::from("ghost"), &server).await);
        assert_eq!(channel.user_amount().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_add_is_flagged_and_counted() {
        let channel = registry(None).create_channel("room").await;
        let server = ServerId::from("connector-1");
        assert_eq!(
            channel.add(Uid::from("a"), server.clone()).await,
            AddOutcome::Added
        );
        assert_eq!(
            channel.add(Uid::from("a"), server.clone()).await,
            AddOutcome::Duplicate
        );
        assert_eq!(channel.members().await.len(), 2);
        assert_eq!(channel.user_amount().await, 2);

        assert!(channel.leave(&Uid::from("a"), &server).await);
        assert!(channel.member(&Uid::from("a")).await.is_some());
        assert!(channel.leave(&Uid::from("a"), &server).await);
        assert!(channel.member(&Uid::from("a")).await.is_none());
        assert_eq!(channel.user_amount().await, 0);
    }

    #[tokio::test]
    async fn test_add_on_other_server_moves_member() {
        let channel = registry(None).create_channel("room").await;
        let uid = Uid::from("a");
        channel.add(uid.clone(), ServerId::from("s1")).await;
        assert_eq!(
            channel.add(uid.clone(), ServerId::from("s2")).await,
            AddOutcome::Moved {
                from: ServerId::from("s1")
            }
        );

        let groups = channel.groups().await;
        assert!(!groups.contains_key(&ServerId::from("s1")));
        assert_eq!(groups[&ServerId::from("s2")], vec![uid.clone()]);
        assert_eq!(channel.user_amount().await, 1);
        assert_eq!(
            channel.member(&uid).await.unwrap().server_id,
            ServerId::from("s2")
        );
    }

    #[tokio::test]
    async fn test_destroyed_channel_ignores_membership_ops() {
        let reg = registry(None);
        let channel = reg.create_channel("room").await;
        let server = ServerId::from("s1");
        channel.add(Uid::from("a"), server.clone()).await;

        reg.destroy_channel("room").await;
        assert!(channel.is_destroyed().await);
        assert_eq!(
            channel.add(Uid::from("b"), server.clone()).await,
            AddOutcome::Rejected
        );
        assert!(!channel.leave(&Uid::from("a"), &server).await);
        assert_eq!(channel.user_amount().await, 1);
        assert!(reg.get_channel("room", false).await.is_none());
    }

    #[tokio::test]
    async fn test_membership_persisted_under_prefixed_keys() {
        let store = Arc::new(MemoryChannelStore::new());
        let reg = registry(Some(store.clone()));
        let channel = reg.create_channel("room").await;
        channel.add(Uid::from("a"), ServerId::from("s1")).await;
        channel.add(Uid::from("b"), ServerId::from("s2")).await;

        assert_eq!(
            store.load("chan:connector-1").await.unwrap(),
            vec!["chan:connector-1:room"]
        );
        assert_eq!(
            store.load("chan:connector-1:room").await.unwrap(),
            vec!["s1:a", "s2:b"]
        );

        channel.leave(&Uid::from("a"), &ServerId::from("s1")).await;
        assert_eq!(
            store.load("chan:connector-1:room").await.unwrap(),
            vec!["s2:b"]
        );

        reg.destroy_channel("room").await;
        assert!(store.load("chan:connector-1").await.unwrap().is_empty());
        assert!(store.load("chan:connector-1:room").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_replays_membership() {
        let store = Arc::new(MemoryChannelStore::new());
        {
            let reg = registry(Some(store.clone()));
            let room = reg.create_channel("room").await;
            room.add(Uid::from("a"), ServerId::from("s1")).await;
            room.add(Uid::from("b"), ServerId::from("s1")).await;
            reg.create_channel("empty").await;
        }

        let reg = registry(Some(store.clone()));
        assert_eq!(reg.restore().await.unwrap(), 2);

        let room = reg.get_channel("room", false).await.unwrap();
        assert_eq!(room.user_amount().await, 2);
        assert_eq!(
            room.member(&Uid::from("b")).await.unwrap().server_id,
            ServerId::from("s1")
        );
        assert_eq!(
            store.load("chan:connector-1:room").await.unwrap(),
            vec!["s1:a", "s1:b"]
        );
    }

    struct FailingStore;

    #[async_trait]
    impl ChannelStore for FailingStore {
        async fn add(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn remove(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn load(&self, _: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn remove_all(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failures_do_not_propagate() {
        let reg = registry(Some(Arc::new(FailingStore)));
        let channel = reg.create_channel("room").await;
        assert!(
            channel
                .add(Uid::from("a"), ServerId::from("s1"))
                .await
                .is_added()
        );
        assert!(channel.leave(&Uid::from("a"), &ServerId::from("s1")).await);
        reg.destroy_channel("room").await;

        assert!(reg.restore().await.is_err());
    }
}
