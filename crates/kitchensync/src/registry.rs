//! Node registry (leader side)
//!
//! Tracks which followers are alive. Registration, heartbeats and status
//! responses come from the control listener; a sweep task expires nodes whose
//! heartbeat is older than the timeout. Both paths go through one `RwLock`, so
//! a report never sees a half-updated node set.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kitchenproto::StatusReport;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Expired nodes kept for status reports.
const DISCONNECTED_HISTORY: usize = 32;

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: String,
    pub addr: SocketAddr,
    pub status: String,
    pub media: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub registration_time: Instant,
    pub last_heartbeat: Instant,
    pub last_report: Option<StatusReport>,
}

/// What a heartbeat did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Refreshed,
    /// Unknown node, registered from its heartbeat.
    Registered,
}

/// Active node summary for reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub addr: SocketAddr,
    pub status: String,
    pub media: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub heartbeat_age_ms: u64,
    pub last_report: Option<StatusReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisconnectedNode {
    pub node_id: String,
    pub addr: SocketAddr,
    pub disconnected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryReport {
    /// Sorted by node id.
    pub active: Vec<NodeSummary>,
    /// Most recent first.
    pub disconnected: Vec<DisconnectedNode>,
}

#[derive(Default)]
struct RegistryInner {
    nodes: HashMap<String, NodeRecord>,
    disconnected: VecDeque<DisconnectedNode>,
}

impl RegistryInner {
    fn insert(&mut self, record: NodeRecord) {
        self.disconnected.retain(|d| d.node_id != record.node_id);
        self.nodes.insert(record.node_id.clone(), record);
    }
}

pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
    timeout: Duration,
}

impl NodeRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create or refresh a record. Returns true for a node not seen before.
    pub async fn register(
        &self,
        node_id: &str,
        addr: SocketAddr,
        status: &str,
        media: Option<String>,
        now: Instant,
    ) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.nodes.get_mut(node_id) {
            record.addr = addr;
            record.status = status.to_string();
            record.media = media;
            record.last_heartbeat = now;
            return false;
        }
        inner.insert(NodeRecord {
            node_id: node_id.to_string(),
            addr,
            status: status.to_string(),
            media,
            registered_at: Utc::now(),
            registration_time: now,
            last_heartbeat: now,
            last_report: None,
        });
        true
    }

    pub async fn heartbeat(
        &self,
        node_id: &str,
        addr: SocketAddr,
        status: &str,
        now: Instant,
    ) -> HeartbeatOutcome {
        let mut inner = self.inner.write().await;
        match inner.nodes.get_mut(node_id) {
            Some(record) => {
                record.addr = addr;
                record.status = status.to_string();
                record.last_heartbeat = now;
                HeartbeatOutcome::Refreshed
            }
            None => {
                inner.insert(NodeRecord {
                    node_id: node_id.to_string(),
                    addr,
                    status: status.to_string(),
                    media: None,
                    registered_at: Utc::now(),
                    registration_time: now,
                    last_heartbeat: now,
                    last_report: None,
                });
                HeartbeatOutcome::Registered
            }
        }
    }

    /// Store a status response. Counts as liveness.
    pub async fn record_report(&self, report: StatusReport, addr: SocketAddr, now: Instant) {
        let mut inner = self.inner.write().await;
        let status = report.correction_state.as_str().to_string();
        match inner.nodes.get_mut(&report.node_id) {
            Some(record) => {
                record.addr = addr;
                record.last_heartbeat = now;
                record.last_report = Some(report);
            }
            None => {
                inner.insert(NodeRecord {
                    node_id: report.node_id.clone(),
                    addr,
                    status,
                    media: None,
                    registered_at: Utc::now(),
                    registration_time: now,
                    last_heartbeat: now,
                    last_report: Some(report),
                });
            }
        }
    }

    /// Remove every node whose heartbeat age exceeds the timeout. Returns the
    /// expired node ids.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let timeout = self.timeout;
        let expired: Vec<String> = inner
            .nodes
            .values()
            .filter(|r| now.saturating_duration_since(r.last_heartbeat) > timeout)
            .map(|r| r.node_id.clone())
            .collect();

        for node_id in &expired {
            if let Some(record) = inner.nodes.remove(node_id) {
                inner.disconnected.push_front(DisconnectedNode {
                    node_id: record.node_id,
                    addr: record.addr,
                    disconnected_at: Utc::now(),
                });
            }
        }
        inner.disconnected.truncate(DISCONNECTED_HISTORY);
        expired
    }

    pub async fn report(&self, now: Instant) -> RegistryReport {
        let inner = self.inner.read().await;
        let mut active: Vec<NodeSummary> = inner
            .nodes
            .values()
            .map(|r| NodeSummary {
                node_id: r.node_id.clone(),
                addr: r.addr,
                status: r.status.clone(),
                media: r.media.clone(),
                registered_at: r.registered_at,
                heartbeat_age_ms: now.saturating_duration_since(r.last_heartbeat).as_millis() as u64,
                last_report: r.last_report.clone(),
            })
            .collect();
        active.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        RegistryReport {
            active,
            disconnected: inner.disconnected.iter().cloned().collect(),
        }
    }

    /// Control addresses of the active nodes.
    pub async fn addresses(&self) -> Vec<(String, SocketAddr)> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .values()
            .map(|r| (r.node_id.clone(), r.addr))
            .collect()
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.inner.read().await.nodes.get(node_id).cloned()
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.inner.read().await.nodes.contains_key(node_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every record, active and disconnected.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.nodes.clear();
        inner.disconnected.clear();
    }
}

/// Spawn the periodic expiry sweep.
pub fn spawn_sweep_task(
    registry: Arc<NodeRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = registry.sweep(Instant::now()).await;
                    for node_id in expired {
                        warn!(node_id = %node_id, "node heartbeat timed out, marked disconnected");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("registry sweep shutting down");
                    break;
                }
            }
        }
        let nodes = registry.len().await;
        info!(nodes, "registry sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kitchenproto::CorrectionState;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn register_then_refresh() {
        tokio_test::block_on(async {
            let registry = NodeRegistry::new(Duration::from_secs(3));
            let now = Instant::now();
            assert!(registry.register("pi-1", addr(6000), "ready", Some("loop.mp4".into()), now).await);
            assert!(!registry.register("pi-1", addr(6001), "ready", None, now).await);

            let record = registry.get("pi-1").await.unwrap();
            assert_eq!(record.addr, addr(6001));
            assert_eq!(registry.len().await, 1);
        });
    }

    #[tokio::test]
    async fn heartbeat_registers_unknown_node() {
        let registry = NodeRegistry::new(Duration::from_secs(3));
        let now = Instant::now();
        assert_eq!(
            registry.heartbeat("pi-2", addr(6002), "synced", now).await,
            HeartbeatOutcome::Registered
        );
        assert_eq!(
            registry.heartbeat("pi-2", addr(6002), "synced", now).await,
            HeartbeatOutcome::Refreshed
        );
        assert!(registry.contains("pi-2").await);
    }

    #[tokio::test]
    async fn sweep_expires_only_stale_nodes() {
        let registry = NodeRegistry::new(Duration::from_secs(3));
        let start = Instant::now();
        registry.register("old", addr(6003), "ready", None, start).await;
        registry
            .register("fresh", addr(6004), "ready", None, start + Duration::from_secs(2))
            .await;

        // Age exactly at the timeout is still alive
        assert!(registry.sweep(start + Duration::from_secs(3)).await.is_empty());

        let expired = registry.sweep(start + Duration::from_millis(3_500)).await;
        assert_eq!(expired, vec!["old".to_string()]);

        let report = registry.report(start + Duration::from_millis(3_500)).await;
        assert_eq!(report.active.len(), 1);
        assert_eq!(report.active[0].node_id, "fresh");
        assert_eq!(report.active[0].heartbeat_age_ms, 1_500);
        assert_eq!(report.disconnected.len(), 1);
        assert_eq!(report.disconnected[0].node_id, "old");
    }

    #[tokio::test]
    async fn re_register_leaves_disconnected_list() {
        let registry = NodeRegistry::new(Duration::from_secs(1));
        let start = Instant::now();
        registry.register("pi-3", addr(6005), "ready", None, start).await;
        registry.sweep(start + Duration::from_secs(2)).await;
        assert_eq!(registry.report(start).await.disconnected.len(), 1);

        registry
            .heartbeat("pi-3", addr(6005), "ready", start + Duration::from_secs(3))
            .await;
        let report = registry.report(start + Duration::from_secs(3)).await;
        assert_eq!(report.active.len(), 1);
        assert!(report.disconnected.is_empty());
    }

    #[tokio::test]
    async fn status_report_is_stored() {
        let registry = NodeRegistry::new(Duration::from_secs(3));
        let now = Instant::now();
        registry.register("pi-4", addr(6006), "ready", None, now).await;

        let report = StatusReport {
            node_id: "pi-4".to_string(),
            correction_state: CorrectionState::Synced,
            last_deviation: Some(0.02),
            ..StatusReport::default()
        };
        registry.record_report(report.clone(), addr(6006), now).await;

        let record = registry.get("pi-4").await.unwrap();
        assert_eq!(record.last_report, Some(report));
    }

    #[tokio::test]
    async fn disconnected_history_is_bounded() {
        let registry = NodeRegistry::new(Duration::from_millis(10));
        let start = Instant::now();
        for i in 0..(DISCONNECTED_HISTORY + 5) {
            registry
                .register(&format!("node-{}", i), addr(7000 + i as u16), "ready", None, start)
                .await;
        }
        registry.sweep(start + Duration::from_secs(1)).await;
        let report = registry.report(start).await;
        assert!(report.active.is_empty());
        assert_eq!(report.disconnected.len(), DISCONNECTED_HISTORY);

        registry.clear().await;
        assert!(registry.report(start).await.disconnected.is_empty());
    }

    #[tokio::test]
    async fn sweep_task_removes_expired_node() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_millis(100)));
        registry
            .register("pi-5", addr(6007), "ready", None, Instant::now())
            .await;

        let cancel = CancellationToken::new();
        let handle = spawn_sweep_task(registry.clone(), Duration::from_millis(20), cancel.clone());

        assert!(registry.contains("pi-5").await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!registry.contains("pi-5").await);

        cancel.cancel();
        handle.await.unwrap();
    }
}
