// =============================================================================
// Control document - the app-to-agent contract, hot reloaded by polling
// =============================================================================
//
// The mobile app writes control.json (users, alert rules, automation rules)
// with a monotonically increasing version; the agent only ever reads it.
// The loader polls the file, and installs a candidate document only when its
// version is newer AND it passes structural validation, so a half-written or
// corrupt file can never replace a good configuration.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// How often the control file is re-read.
const POLL_INTERVAL: Duration = Duration::from_secs(15);

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

/// The full app-to-agent configuration envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControlDocument {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub users: Vec<ControlUser>,
    #[serde(default)]
    pub alerts: Vec<AlertRule>,
    #[serde(default)]
    pub automations: Vec<AutomationRule>,
}

/// One monitored end user: encrypted credentials plus scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlUser {
    pub user_uuid: String,
    /// base64(nonce || ciphertext || tag) under the shared agent secret.
    pub api_key_encrypted: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub allowed_servers: Vec<String>,
    #[serde(default)]
    pub device_tokens: Vec<String>,
}

/// Condition kinds an alert rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    CpuThreshold,
    RamThreshold,
    DiskThreshold,
    PowerStateChange,
    OfflineDuration,
    RestartLoop,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for AlertCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CpuThreshold => "cpu_threshold",
            Self::RamThreshold => "ram_threshold",
            Self::DiskThreshold => "disk_threshold",
            Self::PowerStateChange => "power_state_change",
            Self::OfflineDuration => "offline_duration",
            Self::RestartLoop => "restart_loop",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub user_uuid: String,
    pub server_id: String,
    pub condition_type: AlertCondition,
    #[serde(default)]
    pub threshold: f64,
    /// Seconds the condition must hold before the first trigger; 0 fires
    /// immediately.
    #[serde(default)]
    pub duration: i64,
    /// Minimum seconds between two triggers of this rule.
    #[serde(default)]
    pub cooldown: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Trigger kinds an automation rule can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationTrigger {
    CpuThreshold,
    RamThreshold,
    DiskThreshold,
    ServerOffline,
    ServerCrash,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for AutomationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CpuThreshold => "cpu_threshold",
            Self::RamThreshold => "ram_threshold",
            Self::DiskThreshold => "disk_threshold",
            Self::ServerOffline => "server_offline",
            Self::ServerCrash => "server_crash",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: String,
    pub user_uuid: String,
    pub server_id: String,
    pub trigger_type: AutomationTrigger,
    /// Numeric trigger parameters; thresholds accepted as float or integer.
    #[serde(default)]
    pub trigger_config: HashMap<String, serde_json::Value>,
    pub action: String,
    #[serde(default)]
    pub action_config: HashMap<String, String>,
    #[serde(default)]
    pub cooldown: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AutomationRule {
    /// The `threshold` entry of `trigger_config`, if present and numeric.
    pub fn threshold(&self) -> Option<f64> {
        self.trigger_config.get("threshold").and_then(|v| v.as_f64())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Structural validation applied before a candidate document is installed.
pub fn validate(doc: &ControlDocument) -> Result<()> {
    for (i, user) in doc.users.iter().enumerate() {
        if user.user_uuid.is_empty() {
            bail!("user[{i}] has an empty user_uuid");
        }
        if user.api_key_encrypted.is_empty() {
            bail!("user {} has an empty api_key_encrypted", user.user_uuid);
        }
    }
    for (i, rule) in doc.alerts.iter().enumerate() {
        if rule.id.is_empty() || rule.user_uuid.is_empty() || rule.server_id.is_empty() {
            bail!("alert[{i}] is missing id, user_uuid, or server_id");
        }
    }
    for (i, rule) in doc.automations.iter().enumerate() {
        if rule.id.is_empty() || rule.user_uuid.is_empty() || rule.server_id.is_empty() {
            bail!("automation[{i}] is missing id, user_uuid, or server_id");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Outcome of one poll of the control file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reload {
    /// File version equals (or trails) the installed version.
    Unchanged,
    /// A newer valid document was installed.
    Installed { version: i64 },
}

/// Holds the current control document and refreshes it by polling the file.
pub struct ControlLoader {
    path: PathBuf,
    current: RwLock<Arc<ControlDocument>>,
}

impl ControlLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(ControlDocument::default())),
        }
    }

    /// Read the control file once at startup. A missing file is a legitimate
    /// first-boot state and seeds an empty version-0 document; a corrupt one
    /// is logged and likewise leaves the seed in place.
    pub fn load_initial(&self) {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no control file yet, starting empty");
            return;
        }
        match self.poll_once() {
            Ok(Reload::Installed { version }) => {
                info!(version, "control document loaded");
            }
            Ok(Reload::Unchanged) => {}
            Err(e) => {
                error!(error = %e, "initial control document rejected, starting empty");
            }
        }
    }

    /// Read, parse, version-gate, validate, and maybe install the file.
    pub fn poll_once(&self) -> Result<Reload> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let candidate: ControlDocument =
            serde_json::from_str(&raw).context("control file is not valid JSON")?;

        let installed = self.version();
        if candidate.version <= installed {
            if candidate.version < installed {
                debug!(
                    candidate = candidate.version,
                    installed, "control file version trails installed document, ignoring"
                );
            }
            return Ok(Reload::Unchanged);
        }

        validate(&candidate).context("control document failed validation")?;

        let version = candidate.version;
        *self.current.write() = Arc::new(candidate);
        Ok(Reload::Installed { version })
    }

    /// Poll the file until shutdown. Installs are logged; a rejected
    /// candidate leaves the previous document in force.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            path = %self.path.display(),
            interval_secs = POLL_INTERVAL.as_secs(),
            "control loader started"
        );
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.tick().await; // first tick is immediate and load_initial already ran

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("control loader stopping");
                    return;
                }
            }

            match self.poll_once() {
                Ok(Reload::Installed { version }) => {
                    let doc = self.get();
                    info!(
                        version,
                        users = doc.users.len(),
                        alerts = doc.alerts.len(),
                        automations = doc.automations.len(),
                        "control document reloaded"
                    );
                }
                Ok(Reload::Unchanged) => {}
                Err(e) => {
                    // Mid-write reads land here too; the next poll retries.
                    error!(error = %e, "control file poll failed, keeping previous document");
                }
            }
        }
    }

    /// Snapshot of the current document, safe for read-only iteration.
    pub fn get(&self) -> Arc<ControlDocument> {
        self.current.read().clone()
    }

    /// Version of the installed document (0 until the first install).
    pub fn version(&self) -> i64 {
        self.current.read().version
    }
}

impl std::fmt::Debug for ControlLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoader")
            .field("path", &self.path)
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_json(version: i64, user_uuid: &str) -> String {
        serde_json::json!({
            "version": version,
            "updated_at": 1_700_000_000,
            "users": [{
                "user_uuid": user_uuid,
                "api_key_encrypted": "AAAA",
                "is_admin": false,
                "allowed_servers": ["s1"],
                "device_tokens": ["tok1"]
            }],
            "alerts": [{
                "id": "al-1",
                "user_uuid": user_uuid,
                "server_id": "s1",
                "condition_type": "cpu_threshold",
                "threshold": 80.0,
                "duration": 30,
                "cooldown": 300,
                "enabled": true
            }],
            "automations": []
        })
        .to_string()
    }

    #[test]
    fn missing_file_seeds_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ControlLoader::new(dir.path().join("control.json"));
        loader.load_initial();
        assert_eq!(loader.version(), 0);
        assert!(loader.get().users.is_empty());
    }

    #[test]
    fn newer_valid_document_is_installed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, doc_json(1, "u1")).unwrap();

        let loader = ControlLoader::new(&path);
        loader.load_initial();
        assert_eq!(loader.version(), 1);
        assert_eq!(loader.get().alerts.len(), 1);
        assert_eq!(
            loader.get().alerts[0].condition_type,
            AlertCondition::CpuThreshold
        );
    }

    #[test]
    fn equal_and_older_versions_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, doc_json(3, "u1")).unwrap();

        let loader = ControlLoader::new(&path);
        assert_eq!(
            loader.poll_once().unwrap(),
            Reload::Installed { version: 3 }
        );
        assert_eq!(loader.poll_once().unwrap(), Reload::Unchanged);

        std::fs::write(&path, doc_json(2, "someone-else")).unwrap();
        assert_eq!(loader.poll_once().unwrap(), Reload::Unchanged);
        // The regressed file never replaced the installed document.
        assert_eq!(loader.version(), 3);
        assert_eq!(loader.get().users[0].user_uuid, "u1");
    }

    #[test]
    fn invalid_candidate_keeps_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, doc_json(1, "u1")).unwrap();

        let loader = ControlLoader::new(&path);
        loader.load_initial();

        // Newer version but a user with no encrypted key.
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 2,
                "users": [{ "user_uuid": "u1", "api_key_encrypted": "" }]
            })
            .to_string(),
        )
        .unwrap();

        assert!(loader.poll_once().is_err());
        assert_eq!(loader.version(), 1);
        assert_eq!(loader.get().users[0].user_uuid, "u1");
    }

    #[test]
    fn malformed_json_is_an_error_not_an_install() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, "{ not json").unwrap();

        let loader = ControlLoader::new(&path);
        assert!(loader.poll_once().is_err());
        assert_eq!(loader.version(), 0);
    }

    #[test]
    fn validation_rules() {
        let mut doc: ControlDocument = serde_json::from_str(&doc_json(1, "u1")).unwrap();
        assert!(validate(&doc).is_ok());

        doc.alerts[0].server_id.clear();
        assert!(validate(&doc).is_err());

        let mut doc: ControlDocument = serde_json::from_str(&doc_json(1, "")).unwrap();
        assert!(validate(&doc).is_err());
        doc.users.clear();
        doc.alerts.clear();
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn unknown_rule_kinds_parse_to_unknown() {
        let rule: AlertRule = serde_json::from_value(serde_json::json!({
            "id": "x",
            "user_uuid": "u",
            "server_id": "s",
            "condition_type": "gpu_threshold"
        }))
        .unwrap();
        assert_eq!(rule.condition_type, AlertCondition::Unknown);
        assert!(rule.enabled);

        let auto: AutomationRule = serde_json::from_value(serde_json::json!({
            "id": "y",
            "user_uuid": "u",
            "server_id": "s",
            "trigger_type": "lunar_phase",
            "action": "restart"
        }))
        .unwrap();
        assert_eq!(auto.trigger_type, AutomationTrigger::Unknown);
    }

    #[test]
    fn threshold_accepts_float_and_integer() {
        let mk = |v: serde_json::Value| -> AutomationRule {
            serde_json::from_value(serde_json::json!({
                "id": "a", "user_uuid": "u", "server_id": "s",
                "trigger_type": "cpu_threshold",
                "trigger_config": { "threshold": v },
                "action": "restart"
            }))
            .unwrap()
        };
        assert_eq!(mk(serde_json::json!(90.5)).threshold(), Some(90.5));
        assert_eq!(mk(serde_json::json!(90)).threshold(), Some(90.0));
        assert_eq!(mk(serde_json::json!("90")).threshold(), None);
    }
}
