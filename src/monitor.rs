// =============================================================================
// Monitor - sampling scheduler and per-cycle fan-out
// =============================================================================
//
// Each tick walks the control document: users in document order, servers in
// allow-list order. A failing server or user is skipped for the cycle and
// retried naturally on the next one; only daemon init errors are ever fatal.
//
// The plaintext API-key cache lives here and is dropped whenever the control
// version advances, because a version bump may carry re-encrypted keys.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerts::AlertEvaluator;
use crate::automation::AutomationExecutor;
use crate::control::{ControlDocument, ControlLoader, ControlUser};
use crate::crypto::ApiKeyCipher;
use crate::panel::{is_conflict, PanelClient};
use crate::status::{AgentStatus, MetricsExport, StatusExporter, MAX_STATUS_ERRORS};
use crate::storage::Storage;
use crate::types::ResourceSnapshot;

/// Each entry in the status error list is capped at this many characters.
const STATUS_ERROR_MAX: usize = 160;

pub struct Monitor {
    control: Arc<ControlLoader>,
    cipher: ApiKeyCipher,
    panel: Arc<PanelClient>,
    storage: Arc<Storage>,
    alerts: Arc<AlertEvaluator>,
    automations: Arc<AutomationExecutor>,
    exporter: Arc<StatusExporter>,
    interval: Duration,
    /// Per-server snapshot cap for the metrics export.
    metrics_limit: u32,
    /// user_uuid -> decrypted panel API key.
    key_cache: Mutex<HashMap<String, String>>,
    last_control_version: AtomicI64,
    started: Instant,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<ControlLoader>,
        cipher: ApiKeyCipher,
        panel: Arc<PanelClient>,
        storage: Arc<Storage>,
        alerts: Arc<AlertEvaluator>,
        automations: Arc<AutomationExecutor>,
        exporter: Arc<StatusExporter>,
        interval: Duration,
        metrics_limit: u32,
    ) -> Self {
        Self {
            control,
            cipher,
            panel,
            storage,
            alerts,
            automations,
            exporter,
            interval,
            metrics_limit,
            key_cache: Mutex::new(HashMap::new()),
            last_control_version: AtomicI64::new(0),
            started: Instant::now(),
        }
    }

    /// Sample immediately, then on every tick until shutdown. An in-flight
    /// cycle always runs to completion.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("monitor stopping");
                    return;
                }
            }
            self.run_cycle(Utc::now()).await;
        }
    }

    /// One full sampling cycle. Public so tests can drive it directly with a
    /// controlled clock.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        let doc = self.control.get();

        if doc.users.is_empty() {
            debug!("no users configured, skipping sampling");
            self.write_status(&doc, 0, Vec::new(), now);
            return;
        }

        // Key rotation may ride along with any control update.
        let version = doc.version;
        if version > self.last_control_version.load(Ordering::Acquire) {
            self.key_cache.lock().clear();
            self.last_control_version.store(version, Ordering::Release);
            info!(version, "control version advanced, api key cache invalidated");
        }

        let mut errors: Vec<String> = Vec::new();
        let mut servers_sampled = 0usize;

        for user in &doc.users {
            let api_key = match self.user_api_key(user) {
                Ok(key) => key,
                Err(e) => {
                    warn!(user_uuid = %user.user_uuid, error = %e, "skipping user for this cycle");
                    push_error(&mut errors, format!("user {}: {e}", user.user_uuid));
                    continue;
                }
            };

            for server_id in &user.allowed_servers {
                let stats = match self.panel.fetch_resources(&api_key, server_id).await {
                    Ok(stats) => stats,
                    Err(e) => {
                        if is_conflict(&e) {
                            // Expected during installs and transfers.
                            debug!(server_id = %server_id, "server busy (409), skipping");
                        } else {
                            warn!(server_id = %server_id, error = %e, "resources fetch failed, skipping server");
                            push_error(&mut errors, format!("{server_id}: {e}"));
                        }
                        continue;
                    }
                };

                let snapshot = ResourceSnapshot {
                    id: 0,
                    server_id: server_id.clone(),
                    timestamp: now,
                    power_state: stats.current_state,
                    cpu_percent: stats.resources.cpu_absolute,
                    mem_bytes: stats.resources.memory_bytes,
                    // Limits are not part of the resources payload; zero
                    // means "unknown" to the evaluators.
                    mem_limit: 0,
                    disk_bytes: stats.resources.disk_bytes,
                    disk_limit: 0,
                    net_rx: stats.resources.network_rx_bytes,
                    net_tx: stats.resources.network_tx_bytes,
                    uptime_ms: stats.resources.uptime,
                };

                if let Err(e) = self.storage.insert_snapshot(&snapshot).await {
                    // The sample is lost for history but still evaluated.
                    warn!(server_id = %server_id, error = %e, "failed to persist snapshot");
                }
                servers_sampled += 1;

                let alert_rules: Vec<_> = doc
                    .alerts
                    .iter()
                    .filter(|r| {
                        r.enabled && r.user_uuid == user.user_uuid && r.server_id == *server_id
                    })
                    .cloned()
                    .collect();
                self.alerts
                    .evaluate(&snapshot, &alert_rules, user, now)
                    .await;

                let automation_rules: Vec<_> = doc
                    .automations
                    .iter()
                    .filter(|r| {
                        r.enabled && r.user_uuid == user.user_uuid && r.server_id == *server_id
                    })
                    .cloned()
                    .collect();
                self.automations
                    .evaluate(&snapshot, &automation_rules, user, &api_key, now)
                    .await;
            }
        }

        debug!(servers_sampled, errors = errors.len(), "cycle complete");
        self.write_status(&doc, servers_sampled, errors, now);
        self.write_metrics(&doc, now).await;
    }

    /// Cache hit or decrypt-and-cache.
    fn user_api_key(&self, user: &ControlUser) -> Result<String> {
        if let Some(key) = self.key_cache.lock().get(&user.user_uuid) {
            return Ok(key.clone());
        }
        let key = self
            .cipher
            .decrypt(&user.api_key_encrypted)
            .context("api key decryption failed")?;
        self.key_cache
            .lock()
            .insert(user.user_uuid.clone(), key.clone());
        Ok(key)
    }

    fn write_status(
        &self,
        doc: &ControlDocument,
        servers_monitored: usize,
        errors: Vec<String>,
        now: DateTime<Utc>,
    ) {
        let status = AgentStatus {
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            last_sample_at: now.to_rfc3339(),
            control_version: doc.version,
            users_count: doc.users.len(),
            active_alerts: doc.alerts.iter().filter(|r| r.enabled).count(),
            active_automations: doc.automations.iter().filter(|r| r.enabled).count(),
            servers_monitored,
            db_size_bytes: self.storage.db_size_bytes(),
            errors: if errors.is_empty() {
                None
            } else {
                Some(errors)
            },
        };
        if let Err(e) = self.exporter.write_status(&status) {
            warn!(error = %e, "failed to write status file");
        }
    }

    async fn write_metrics(&self, doc: &ControlDocument, now: DateTime<Utc>) {
        // Union of every user's allow-list, deduplicated.
        let server_ids: BTreeSet<&String> = doc
            .users
            .iter()
            .flat_map(|u| u.allowed_servers.iter())
            .collect();

        let mut export = MetricsExport {
            generated_at: now,
            servers: Default::default(),
        };
        for server_id in server_ids {
            match self
                .storage
                .recent_snapshots(server_id, self.metrics_limit)
                .await
            {
                Ok(series) => {
                    export.servers.insert(server_id.clone(), series);
                }
                Err(e) => {
                    warn!(server_id = %server_id, error = %e, "failed to read snapshots for metrics");
                }
            }
        }

        if let Err(e) = self.exporter.write_metrics(&export) {
            warn!(error = %e, "failed to write metrics file");
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("interval", &self.interval)
            .field("metrics_limit", &self.metrics_limit)
            .field(
                "last_control_version",
                &self.last_control_version.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

fn push_error(errors: &mut Vec<String>, msg: String) {
    if errors.len() >= MAX_STATUS_ERRORS {
        return;
    }
    errors.push(msg.chars().take(STATUS_ERROR_MAX).collect());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::testing::RecordingPush;
    use crate::push::PushProvider;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "test-agent-secret-0123456789";

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_754_000_000, 0).unwrap()
    }

    fn resources_json(state: &str, cpu: f64) -> serde_json::Value {
        serde_json::json!({
            "object": "stats",
            "attributes": {
                "current_state": state,
                "is_suspended": false,
                "resources": {
                    "memory_bytes": 1024,
                    "cpu_absolute": cpu,
                    "disk_bytes": 2048,
                    "network_rx_bytes": 1,
                    "network_tx_bytes": 2,
                    "uptime": 60000
                }
            }
        })
    }

    struct Harness {
        monitor: Monitor,
        loader: Arc<ControlLoader>,
        storage: Arc<Storage>,
        push: Arc<RecordingPush>,
        dir: tempfile::TempDir,
        control_path: std::path::PathBuf,
    }

    impl Harness {
        fn status(&self) -> AgentStatus {
            let raw =
                std::fs::read_to_string(self.dir.path().join("status.json")).unwrap();
            serde_json::from_str(&raw).unwrap()
        }

        fn metrics(&self) -> MetricsExport {
            let raw =
                std::fs::read_to_string(self.dir.path().join("metrics.json")).unwrap();
            serde_json::from_str(&raw).unwrap()
        }
    }

    async fn harness(panel_uri: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let control_path = dir.path().join("control.json");
        let loader = Arc::new(ControlLoader::new(&control_path));
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let push: Arc<RecordingPush> = Arc::new(RecordingPush::default());
        let push_dyn: Arc<dyn PushProvider> = push.clone();
        let panel = Arc::new(PanelClient::new(panel_uri).unwrap());
        let alerts = Arc::new(AlertEvaluator::new(storage.clone(), push_dyn.clone()));
        let automations = Arc::new(AutomationExecutor::new(
            panel.clone(),
            storage.clone(),
            push_dyn,
        ));
        let exporter = Arc::new(StatusExporter::new(
            dir.path().join("status.json"),
            dir.path().join("metrics.json"),
        ));
        let monitor = Monitor::new(
            loader.clone(),
            ApiKeyCipher::new(SECRET).unwrap(),
            panel,
            storage.clone(),
            alerts,
            automations,
            exporter,
            Duration::from_secs(30),
            100,
        );
        Harness {
            monitor,
            loader,
            storage,
            push,
            dir,
            control_path,
        }
    }

    fn write_control(h: &Harness, version: i64, api_key_plain: &str, servers: &[&str]) {
        let cipher = ApiKeyCipher::new(SECRET).unwrap();
        let doc = serde_json::json!({
            "version": version,
            "updated_at": 1_700_000_000,
            "users": [{
                "user_uuid": "u1",
                "api_key_encrypted": cipher.encrypt(api_key_plain).unwrap(),
                "is_admin": false,
                "allowed_servers": servers,
                "device_tokens": ["tok-1"]
            }],
            "alerts": [{
                "id": "al-1",
                "user_uuid": "u1",
                "server_id": servers[0],
                "condition_type": "cpu_threshold",
                "threshold": 80.0,
                "duration": 0,
                "cooldown": 300,
                "enabled": true
            }],
            "automations": []
        });
        std::fs::write(&h.control_path, doc.to_string()).unwrap();
        h.loader.poll_once().unwrap();
    }

    #[tokio::test]
    async fn empty_document_writes_zeroed_status() {
        let server = MockServer::start().await;
        let h = harness(&server.uri()).await;
        h.loader.load_initial();

        h.monitor.run_cycle(t0()).await;

        let status = h.status();
        assert_eq!(status.servers_monitored, 0);
        assert_eq!(status.users_count, 0);
        assert_eq!(status.control_version, 0);
        assert_eq!(h.storage.snapshot_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_cycle_samples_evaluates_and_exports() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/s1/resources"))
            .and(header("Authorization", "Bearer key-A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resources_json("running", 95.0)))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri()).await;
        write_control(&h, 1, "key-A", &["s1"]);

        h.monitor.run_cycle(t0()).await;

        // Snapshot persisted, cpu alert fired, exports written.
        assert_eq!(h.storage.snapshot_count().await.unwrap(), 1);
        assert_eq!(h.storage.alert_history_count().await.unwrap(), 1);
        assert_eq!(h.push.sent_count(), 1);

        let status = h.status();
        assert_eq!(status.users_count, 1);
        assert_eq!(status.servers_monitored, 1);
        assert_eq!(status.active_alerts, 1);
        assert_eq!(status.control_version, 1);
        assert!(status.errors.is_none());
        assert_eq!(status.last_sample_at, t0().to_rfc3339());

        let metrics = h.metrics();
        assert_eq!(metrics.servers["s1"].len(), 1);
        assert!((metrics.servers["s1"][0].cpu_percent - 95.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn control_version_bump_invalidates_key_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/s1/resources"))
            .and(header("Authorization", "Bearer key-A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resources_json("running", 5.0)))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/s1/resources"))
            .and(header("Authorization", "Bearer key-B"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resources_json("running", 5.0)))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server.uri()).await;
        write_control(&h, 1, "key-A", &["s1"]);
        h.monitor.run_cycle(t0()).await;
        // Same version: the cached plaintext key is reused.
        h.monitor.run_cycle(t0()).await;

        // Version bump with a re-encrypted key: the very next cycle must
        // decrypt and use the new plaintext.
        write_control(&h, 2, "key-B", &["s1"]);
        h.monitor.run_cycle(t0()).await;

        assert_eq!(h.storage.snapshot_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failing_server_is_skipped_and_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/bad/resources"))
            .respond_with(ResponseTemplate::new(500).set_body_string("panel exploded"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/good/resources"))
            .respond_with(ResponseTemplate::new(200).set_body_json(resources_json("running", 10.0)))
            .mount(&server)
            .await;

        let h = harness(&server.uri()).await;
        write_control(&h, 1, "key-A", &["bad", "good"]);

        h.monitor.run_cycle(t0()).await;

        assert_eq!(h.storage.snapshot_count().await.unwrap(), 1);
        let status = h.status();
        assert_eq!(status.servers_monitored, 1);
        let errors = status.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("bad:"));
    }

    #[tokio::test]
    async fn conflict_is_quietly_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/servers/s1/resources"))
            .respond_with(ResponseTemplate::new(409).set_body_string("transferring"))
            .mount(&server)
            .await;

        let h = harness(&server.uri()).await;
        write_control(&h, 1, "key-A", &["s1"]);
        h.monitor.run_cycle(t0()).await;

        let status = h.status();
        assert_eq!(status.servers_monitored, 0);
        // 409 is expected churn, not an error worth surfacing.
        assert!(status.errors.is_none());
    }

    #[tokio::test]
    async fn undecryptable_user_is_skipped_for_the_cycle() {
        let server = MockServer::start().await;
        let h = harness(&server.uri()).await;

        let doc = serde_json::json!({
            "version": 1,
            "users": [{
                "user_uuid": "u1",
                "api_key_encrypted": "AAAAgarbage",
                "allowed_servers": ["s1"],
                "device_tokens": []
            }],
            "alerts": [],
            "automations": []
        });
        std::fs::write(&h.control_path, doc.to_string()).unwrap();
        h.loader.poll_once().unwrap();

        h.monitor.run_cycle(t0()).await;

        assert!(server.received_requests().await.unwrap().is_empty());
        let status = h.status();
        assert_eq!(status.servers_monitored, 0);
        assert!(status.errors.unwrap()[0].contains("u1"));
    }
}
