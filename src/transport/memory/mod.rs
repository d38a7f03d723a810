//! In-memory transport for standalone mode.
//!
//! Keeps one append-only log per topic inside the process and models consumer
//! groups the way a partitioned log does:
//! - every group sees every record of a topic
//! - within a group, each record is claimed by exactly one member
//! - a group resumes from its committed offset when a member (re)joins
//!
//! Ideal for local development and testing without external dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    Claim, ClientSettings, ConsumerGroup, Delivery, GroupSession, OffsetCommitter, Record, Result,
    Transport, TransportClient, TransportError,
};

/// Records live in a single partition per topic.
const PARTITION: i32 = 0;

#[derive(Default)]
struct GroupState {
    /// Next offset to hand out, per topic. Shared by all members.
    cursor: HashMap<String, i64>,
    /// Next offset after the last committed one, per topic.
    committed: HashMap<String, i64>,
}

#[derive(Default)]
struct ClusterState {
    topics: HashMap<String, Vec<Record>>,
    groups: HashMap<String, GroupState>,
    joins: HashMap<String, usize>,
}

struct ClusterInner {
    state: Mutex<ClusterState>,
    offline: AtomicBool,
    /// Bumped on every append, close or availability change.
    changes: watch::Sender<u64>,
}

impl ClusterInner {
    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // A poisoned lock only means a test thread panicked mid-update; the
        // maps are still structurally valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "memory cluster is offline".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shared in-process "cluster". Clone to hand the same cluster to several
/// transports (e.g. a requester and a responder).
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(ClusterState::default()),
                offline: AtomicBool::new(false),
                changes,
            }),
        }
    }

    /// Simulate losing (or regaining) the cluster.
    ///
    /// While offline, connects, sends and joins fail with
    /// `TransportError::Unavailable` and open sessions report errors.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
        self.inner.bump();
        info!(offline, "Memory cluster availability changed");
    }

    /// Number of times any consumer group joined `topic`.
    pub fn join_count(&self, topic: &str) -> usize {
        self.inner.lock().joins.get(topic).copied().unwrap_or(0)
    }

    /// Snapshot of the records appended to `topic`.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Offset a group will resume from on `topic`, if it committed anything.
    pub fn committed_offset(&self, group_id: &str, topic: &str) -> Option<i64> {
        self.inner
            .lock()
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(topic).copied())
    }

    fn append(&self, record: Record) -> Result<Delivery> {
        self.inner.ensure_online()?;
        let offset = {
            let mut state = self.inner.lock();
            let log = state.topics.entry(record.topic.clone()).or_default();
            log.push(record);
            (log.len() - 1) as i64
        };
        self.inner.bump();
        Ok(Delivery {
            partition: PARTITION,
            offset,
        })
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport backed by a `MemoryCluster`.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    cluster: MemoryCluster,
}

impl MemoryTransport {
    /// Transport on a fresh private cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport on an existing cluster.
    pub fn with_cluster(cluster: MemoryCluster) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn TransportClient>> {
        self.cluster.inner.ensure_online()?;
        debug!(addresses = ?settings.addresses, "Memory transport client connected");
        Ok(Arc::new(MemoryClient {
            cluster: self.cluster.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryClient {
    cluster: MemoryCluster,
    closed: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("client closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportClient for MemoryClient {
    async fn send(&self, record: Record) -> Result<Delivery> {
        self.ensure_open()?;
        self.cluster.append(record)
    }

    async fn consumer_group(&self, group_id: &str) -> Result<Arc<dyn ConsumerGroup>> {
        self.ensure_open()?;
        self.cluster.inner.ensure_online()?;
        Ok(Arc::new(MemoryConsumerGroup {
            cluster: self.cluster.clone(),
            group_id: group_id.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One member of a consumer group.
struct MemoryConsumerGroup {
    cluster: MemoryCluster,
    group_id: String,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ConsumerGroup for MemoryConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn join(&self, topics: &[String]) -> Result<Box<dyn GroupSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::GroupClosed);
        }
        self.cluster.inner.ensure_online()?;

        {
            let mut state = self.cluster.inner.lock();
            for topic in topics {
                *state.joins.entry(topic.clone()).or_default() += 1;
            }
            // Joining rewinds the group to its committed position, so records
            // claimed but never committed are handed out again.
            let group = state.groups.entry(self.group_id.clone()).or_default();
            for topic in topics {
                let committed = group.committed.get(topic).copied().unwrap_or(0);
                group.cursor.insert(topic.clone(), committed);
            }
        }

        debug!(group_id = %self.group_id, topics = ?topics, "Joined memory consumer group");

        Ok(Box::new(MemorySession {
            cluster: self.cluster.clone(),
            group_id: self.group_id.clone(),
            topics: topics.to_vec(),
            closed: Arc::clone(&self.closed),
            changes: self.cluster.inner.changes.subscribe(),
            committer: Arc::new(MemoryCommitter {
                cluster: self.cluster.clone(),
                group_id: self.group_id.clone(),
            }),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.cluster.inner.bump();
        Ok(())
    }
}

struct MemoryCommitter {
    cluster: MemoryCluster,
    group_id: String,
}

impl OffsetCommitter for MemoryCommitter {
    fn commit(&self, topic: &str, _partition: i32, offset: i64) -> Result<()> {
        let mut state = self.cluster.inner.lock();
        let group = state.groups.entry(self.group_id.clone()).or_default();
        let next = group.committed.entry(topic.to_string()).or_insert(0);
        *next = (*next).max(offset + 1);
        Ok(())
    }
}

struct MemorySession {
    cluster: MemoryCluster,
    group_id: String,
    topics: Vec<String>,
    closed: Arc<AtomicBool>,
    changes: watch::Receiver<u64>,
    committer: Arc<MemoryCommitter>,
}

impl MemorySession {
    fn try_claim(&self) -> Option<Claim> {
        let mut state = self.cluster.inner.lock();
        let ClusterState { topics, groups, .. } = &mut *state;
        let group = groups.entry(self.group_id.clone()).or_default();

        for topic in &self.topics {
            let Some(log) = topics.get(topic) else {
                continue;
            };
            let cursor = group.cursor.entry(topic.clone()).or_insert(0);
            if let Some(record) = log.get(*cursor as usize) {
                let offset = *cursor;
                *cursor += 1;
                return Some(Claim::new(
                    record.clone(),
                    PARTITION,
                    offset,
                    Arc::clone(&self.committer) as Arc<dyn OffsetCommitter>,
                ));
            }
        }
        None
    }
}

#[async_trait]
impl GroupSession for MemorySession {
    async fn next(&mut self) -> Option<Result<Claim>> {
        loop {
            // Mark the current version seen before looking, so an append that
            // races with the check still wakes us.
            self.changes.borrow_and_update();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Err(e) = self.cluster.inner.ensure_online() {
                return Some(Err(e));
            }
            if let Some(claim) = self.try_claim() {
                return Some(Ok(claim));
            }
            if self.changes.changed().await.is_err() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests;
