// =============================================================================
// Agent configuration - environment-driven, validated once at startup
// =============================================================================
//
// Every tunable lives in the process environment so the container entrypoint
// stays trivial. Required variables are hard errors (the daemon exits 1);
// optional ones carry defaults and range clamps so a bad value can degrade
// to something safe instead of taking the agent down.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

/// Default sampling interval in seconds.
const DEFAULT_SAMPLING_INTERVAL_SECS: u64 = 30;
/// Hard floor for the sampling interval.
const MIN_SAMPLING_INTERVAL_SECS: u64 = 5;
/// Default snapshot retention in days.
const DEFAULT_RETENTION_DAYS: u32 = 30;
/// Retention clamp bounds.
const MIN_RETENTION_DAYS: u32 = 1;
const MAX_RETENTION_DAYS: u32 = 30;
/// Default for the reserved action-parallelism knob.
const DEFAULT_MAX_CONCURRENT_ACTIONS: u32 = 5;
/// Minimum length accepted for the shared agent secret.
const MIN_SECRET_LEN: usize = 16;

/// Which push transport to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushProviderKind {
    /// Apple Push Notification service (production).
    Apns,
    /// Log-only sink (development / no credentials).
    Dev,
}

impl std::fmt::Display for PushProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apns => write!(f, "apns"),
            Self::Dev => write!(f, "dev"),
        }
    }
}

/// APNs credential block, required only when `PUSH_PROVIDER=apns`.
#[derive(Clone)]
pub struct ApnsConfig {
    /// base64 of a PKCS#8 PEM-encoded ECDSA P-256 private key.
    pub key_base64: String,
    pub key_id: String,
    pub team_id: String,
    pub bundle_id: String,
}

impl std::fmt::Debug for ApnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApnsConfig")
            .field("key_base64", &"<redacted>")
            .field("key_id", &self.key_id)
            .field("team_id", &self.team_id)
            .field("bundle_id", &self.bundle_id)
            .finish()
    }
}

/// Fully validated agent configuration.
#[derive(Clone)]
pub struct AgentConfig {
    pub agent_uuid: String,
    pub agent_secret: String,
    pub panel_url: String,
    pub panel_api_key: String,
    pub sampling_interval: Duration,
    pub retention_days: u32,
    pub log_level: String,
    /// Reserved: automations currently execute serially.
    pub max_concurrent_actions: u32,
    pub control_file_path: PathBuf,
    pub data_dir: PathBuf,
    pub push_provider: PushProviderKind,
    pub apns: Option<ApnsConfig>,
}

impl AgentConfig {
    /// Read and validate configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an injectable lookup,
    /// so tests never have to mutate the process environment.
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            match get(key) {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => bail!("required environment variable {key} is not set"),
            }
        };

        let agent_uuid = required("AGENT_UUID")?;
        let agent_secret = required("AGENT_SECRET")?;
        if agent_secret.len() < MIN_SECRET_LEN {
            bail!("AGENT_SECRET must be at least {MIN_SECRET_LEN} characters");
        }
        let panel_url = required("PANEL_URL")?;
        let panel_api_key = required("PANEL_API_KEY")?;

        let sampling_secs = parse_or_default(
            get("SAMPLING_INTERVAL"),
            "SAMPLING_INTERVAL",
            DEFAULT_SAMPLING_INTERVAL_SECS,
        );
        let sampling_secs = if sampling_secs < MIN_SAMPLING_INTERVAL_SECS {
            warn!(
                requested = sampling_secs,
                floor = MIN_SAMPLING_INTERVAL_SECS,
                "SAMPLING_INTERVAL below floor, clamping"
            );
            MIN_SAMPLING_INTERVAL_SECS
        } else {
            sampling_secs
        };

        let retention_days = parse_or_default(
            get("RETENTION_DAYS"),
            "RETENTION_DAYS",
            DEFAULT_RETENTION_DAYS,
        )
        .clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS);

        let max_concurrent_actions = parse_or_default(
            get("MAX_CONCURRENT_ACTIONS"),
            "MAX_CONCURRENT_ACTIONS",
            DEFAULT_MAX_CONCURRENT_ACTIONS,
        )
        .max(1);

        let log_level = get("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let control_file_path = get("CONTROL_FILE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./control/control.json"));
        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let push_provider = match get("PUSH_PROVIDER").as_deref() {
            None | Some("dev") => PushProviderKind::Dev,
            Some("apns") => PushProviderKind::Apns,
            Some(other) => bail!("PUSH_PROVIDER must be 'apns' or 'dev', got '{other}'"),
        };

        let apns = if push_provider == PushProviderKind::Apns {
            Some(ApnsConfig {
                key_base64: required("APNS_KEY_BASE64")
                    .context("PUSH_PROVIDER=apns requires APNs credentials")?,
                key_id: required("APNS_KEY_ID")?,
                team_id: required("APNS_TEAM_ID")?,
                bundle_id: required("APNS_BUNDLE_ID")?,
            })
        } else {
            None
        };

        Ok(Self {
            agent_uuid,
            agent_secret,
            panel_url,
            panel_api_key,
            sampling_interval: Duration::from_secs(sampling_secs),
            retention_days,
            log_level,
            max_concurrent_actions,
            control_file_path,
            data_dir,
            push_provider,
            apns,
        })
    }

    // -------------------------------------------------------------------------
    // Derived paths
    // -------------------------------------------------------------------------

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("agent.db")
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.data_dir.join("metrics.json")
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("agent_uuid", &self.agent_uuid)
            .field("agent_secret", &"<redacted>")
            .field("panel_url", &self.panel_url)
            .field("panel_api_key", &"<redacted>")
            .field("sampling_interval", &self.sampling_interval)
            .field("retention_days", &self.retention_days)
            .field("log_level", &self.log_level)
            .field("max_concurrent_actions", &self.max_concurrent_actions)
            .field("control_file_path", &self.control_file_path)
            .field("data_dir", &self.data_dir)
            .field("push_provider", &self.push_provider)
            .field("apns", &self.apns)
            .finish()
    }
}

/// Parse an optional env value, falling back to `default` on absence or on a
/// value that does not parse.
fn parse_or_default<T>(value: Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + std::fmt::Display,
{
    match value {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(%key, value = %raw, %default, "unparseable value, using default");
                default
            }
        },
    }
}

/// Check that `path` exists as a directory, creating it if needed.
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}
