//! Feeds a recorded frame log through the subscription controller against a
//! snapshot of the cluster, then audits the graph it leaves behind.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetdeck_core::{
    check_links, collection_sizes, orphaned_members, ConnectionStats, LinkViolation,
    ManualTransport, MemoryStore, Subscription, SyncConfig, TransportEvent,
};
use fleetdeck_protocol::{parse_frame, Frame};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize)]
pub struct ReplayReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub resources_loaded: usize,
    pub frames_read: usize,
    /// Resource-change frames per resource type, as recorded.
    pub resource_types: BTreeMap<String, usize>,
    pub connection: Option<ConnectionStats>,
    pub collections: BTreeMap<String, usize>,
    pub violations: Vec<LinkViolation>,
    /// Mounts and balancers left on a parent they moved away from. Reported
    /// for inspection; they do not make the run fail.
    pub orphans: Vec<LinkViolation>,
}

impl ReplayReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

pub fn load_snapshot(path: &Path) -> Result<MemoryStore, String> {
    let content = fs_err::read_to_string(path).map_err(|err| err.to_string())?;
    let snapshot: Value = serde_json::from_str(&content)
        .map_err(|err| format!("Invalid snapshot {}: {}", path.display(), err))?;
    MemoryStore::from_snapshot(snapshot)
        .map_err(|err| format!("Invalid snapshot {}: {}", path.display(), err))
}

/// Non-empty lines of a JSONL frame log.
pub fn read_frames(path: &Path) -> Result<Vec<String>, String> {
    let content = fs_err::read_to_string(path).map_err(|err| err.to_string())?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn check(store: MemoryStore, config: &SyncConfig) -> ReplayReport {
    let started_at = Utc::now();
    let resources_loaded = store.preload();
    tracing::info!(resources = resources_loaded, "Snapshot loaded");

    ReplayReport {
        started_at,
        finished_at: Utc::now(),
        resources_loaded,
        frames_read: 0,
        resource_types: BTreeMap::new(),
        connection: None,
        collections: collection_sizes(&store),
        violations: check_links(&store, config),
        orphans: orphaned_members(&store, config),
    }
}

pub async fn run(
    store: MemoryStore,
    frames: Vec<String>,
    project_id: Option<&str>,
    config: &SyncConfig,
) -> ReplayReport {
    let started_at = Utc::now();
    let resources_loaded = store.preload();
    let store = Arc::new(store);
    tracing::info!(
        resources = resources_loaded,
        frames = frames.len(),
        "Replaying frame log"
    );

    let frames_read = frames.len();
    let resource_types = tally_resource_types(&frames);

    let transport = Arc::new(ManualTransport::new());
    let mut subscription = Subscription::new(transport, store.clone(), config);
    subscription.enter(project_id);

    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let feeder = tokio::spawn(async move {
        let connected = TransportEvent::Connected {
            attempts: 0,
            elapsed: Duration::ZERO,
        };
        if tx.send(connected).await.is_err() {
            return;
        }
        for raw in frames {
            if tx.send(TransportEvent::Message(raw)).await.is_err() {
                return;
            }
        }
    });

    subscription.run(&mut rx).await;
    if let Err(err) = feeder.await {
        tracing::warn!(error = %err, "Frame feeder stopped early");
    }
    subscription.settle().await;

    let violations = check_links(store.as_ref(), config);
    for violation in &violations {
        tracing::warn!(violation = %violation, "Link invariant violated");
    }
    let orphans = orphaned_members(store.as_ref(), config);
    for orphan in &orphans {
        tracing::info!(orphan = %orphan, "Member left on its previous parent");
    }

    ReplayReport {
        started_at,
        finished_at: Utc::now(),
        resources_loaded,
        frames_read,
        resource_types,
        connection: Some(subscription.stats().clone()),
        collections: collection_sizes(store.as_ref()),
        violations,
        orphans,
    }
}

fn tally_resource_types(frames: &[String]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for raw in frames {
        if let Ok((_, Frame::ResourceChange(change))) = parse_frame(raw) {
            *counts.entry(change.resource_type).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).expect("write fixture");
        path
    }

    fn snapshot() -> Value {
        json!({
            "host": [{"id": "1h1"}, {"id": "1h2"}],
            "container": [{"id": "1i1", "hosts": ["1h1"], "state": "running"}],
        })
    }

    #[test]
    fn reads_frames_skipping_blank_lines() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = write(temp_dir.path(), "frames.jsonl", "{\"name\":\"ping\"}\n\n  \n{}\n");
        assert_eq!(
            read_frames(&path).expect("frames"),
            vec!["{\"name\":\"ping\"}".to_string(), "{}".to_string()]
        );
    }

    #[test]
    fn rejects_snapshot_that_is_not_keyed_by_kind() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = write(temp_dir.path(), "snapshot.json", "[1, 2]");
        assert!(load_snapshot(&path).is_err());
    }

    #[test]
    fn check_reports_unlinked_snapshot() {
        let store = MemoryStore::from_snapshot(snapshot()).expect("snapshot");
        let report = check(store, &SyncConfig::default());
        assert_eq!(report.resources_loaded, 3);
        assert_eq!(report.violations.len(), 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn replay_repairs_and_reports() {
        let store = MemoryStore::from_snapshot(snapshot()).expect("snapshot");
        let frames = vec![
            json!({
                "name": "resource.change",
                "resourceType": "container",
                "resourceId": "1i1",
                "resource": {"type": "container", "id": "1i1", "hosts": ["1h2"]},
            })
            .to_string(),
            r#"{"name":"ping"}"#.to_string(),
            "not json".to_string(),
        ];

        let report = run(store, frames, Some("1a5"), &SyncConfig::default()).await;
        assert!(report.is_clean(), "violations: {:?}", report.violations);
        assert_eq!(report.frames_read, 3);
        assert_eq!(report.resource_types.get("container"), Some(&1));
        assert_eq!(report.collections.get("host:1h2.instances"), Some(&1));

        let connection = report.connection.expect("connection stats");
        assert_eq!(connection.frames_handled, 1);
        assert_eq!(connection.frames_dropped, 1);
        assert!(connection.last_ping_at.is_some());
    }

    #[tokio::test]
    async fn moved_mount_is_an_orphan_and_keeps_the_run_clean() {
        let store = MemoryStore::from_snapshot(json!({
            "volume": [
                {"id": "1v1", "mounts": [{"type": "mount", "id": "1m1", "volumeId": "1v1"}]},
                {"id": "1v2"},
            ],
        }))
        .expect("snapshot");
        let frames = vec![json!({
            "name": "resource.change",
            "resourceType": "mount",
            "resourceId": "1m1",
            "resource": {"type": "mount", "id": "1m1", "volumeId": "1v2"},
        })
        .to_string()];

        let report = run(store, frames, None, &SyncConfig::default()).await;
        assert!(report.is_clean(), "violations: {:?}", report.violations);
        assert_eq!(report.collections.get("volume:1v2.mounts"), Some(&1));
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].parent, "volume:1v1");
    }
}
