// =============================================================================
// Automation executor - trigger evaluation and remediation dispatch
// =============================================================================
//
// Every action re-checks that the target server is in the acting user's
// allow-list and runs with that user's own API key, never the agent master
// key. A control document can therefore never escalate one user's rule onto
// another user's server.
//
// Rules for a cycle execute serially under the executor's lock; the
// configured max_concurrent value is reserved for future parallelisation.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::control::{AutomationRule, AutomationTrigger, ControlUser};
use crate::panel::{PanelClient, PowerSignal};
use crate::push::{EventType, PushPayload, PushProvider};
use crate::storage::{AutomationLogEntry, Storage};
use crate::types::{PowerState, ResourceSnapshot};

/// Error messages in the automation log are truncated to this length.
const ERROR_MSG_MAX: usize = 200;

/// What a rule actually does, parsed from the `(action, action_config)`
/// pair before any side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationAction {
    Power(PowerSignal),
    Command(String),
    Backup,
}

impl AutomationAction {
    /// Resolve a rule's action. A malformed pair is an execution failure
    /// recorded to the automation log, never a panic.
    pub fn from_rule(rule: &AutomationRule) -> Result<Self> {
        match rule.action.as_str() {
            "start" => Ok(Self::Power(PowerSignal::Start)),
            "stop" => Ok(Self::Power(PowerSignal::Stop)),
            "restart" => Ok(Self::Power(PowerSignal::Restart)),
            "command" => {
                let command = rule
                    .action_config
                    .get("command")
                    .map(String::as_str)
                    .unwrap_or_default();
                if command.is_empty() {
                    bail!("command automation has no 'command' in action_config");
                }
                Ok(Self::Command(command.to_string()))
            }
            "backup" => Ok(Self::Backup),
            other => bail!("unknown automation action '{other}'"),
        }
    }
}

/// Evaluates automation rules against snapshots and dispatches actions.
pub struct AutomationExecutor {
    panel: Arc<PanelClient>,
    storage: Arc<Storage>,
    push: Arc<dyn PushProvider>,
    /// rule_id -> when the rule last executed.
    last_executed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AutomationExecutor {
    pub fn new(
        panel: Arc<PanelClient>,
        storage: Arc<Storage>,
        push: Arc<dyn PushProvider>,
    ) -> Self {
        Self {
            panel,
            storage,
            push,
            last_executed: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate every rule in `rules` (already filtered to this user and
    /// server) against one snapshot, executing the ones that trigger.
    pub async fn evaluate(
        &self,
        snapshot: &ResourceSnapshot,
        rules: &[AutomationRule],
        user: &ControlUser,
        api_key: &str,
        now: DateTime<Utc>,
    ) {
        let mut last = self.last_executed.lock().await;

        for rule in rules {
            // 1. Cooldown gate.
            if let Some(t) = last.get(&rule.id) {
                if (now - *t).num_seconds() < rule.cooldown {
                    continue;
                }
            }

            // 2. Trigger evaluation.
            if !trigger_holds(rule, snapshot) {
                continue;
            }

            // 3. Permission re-check. The control document may still list a
            //    rule for a server the user no longer owns.
            if !user.allowed_servers.contains(&rule.server_id) {
                warn!(
                    rule_id = %rule.id,
                    user_uuid = %rule.user_uuid,
                    server_id = %rule.server_id,
                    "automation targets a server outside the user's allow-list, skipping"
                );
                continue;
            }

            // 4. Execute.
            let outcome = match AutomationAction::from_rule(rule) {
                Ok(action) => self.dispatch(&action, api_key, &rule.server_id).await,
                Err(e) => Err(e),
            };

            // 5. Record and notify.
            last.insert(rule.id.clone(), now);

            let (result, error_msg) = match &outcome {
                Ok(()) => {
                    info!(
                        rule_id = %rule.id,
                        server_id = %rule.server_id,
                        action = %rule.action,
                        "automation executed"
                    );
                    ("success", None)
                }
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        server_id = %rule.server_id,
                        action = %rule.action,
                        error = %e,
                        "automation failed"
                    );
                    ("failure", Some(truncate(&e.to_string(), ERROR_MSG_MAX)))
                }
            };

            if let Err(e) = self
                .storage
                .insert_automation_log(&AutomationLogEntry {
                    rule_id: rule.id.clone(),
                    user_uuid: rule.user_uuid.clone(),
                    server_id: rule.server_id.clone(),
                    action: rule.action.clone(),
                    result: result.to_string(),
                    error_msg: error_msg.clone(),
                    executed_at: now,
                })
                .await
            {
                warn!(rule_id = %rule.id, error = %e, "failed to record automation log");
            }

            let payload = summary_payload(rule, user, outcome.is_ok(), now);
            for token in &user.device_tokens {
                if let Err(e) = self.push.send(token, &payload).await {
                    warn!(rule_id = %rule.id, error = %e, "automation push failed");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        action: &AutomationAction,
        api_key: &str,
        server_id: &str,
    ) -> Result<()> {
        match action {
            AutomationAction::Power(signal) => {
                self.panel
                    .send_power_signal(api_key, server_id, *signal)
                    .await
            }
            AutomationAction::Command(command) => {
                self.panel.send_command(api_key, server_id, command).await
            }
            AutomationAction::Backup => self.panel.create_backup(api_key, server_id).await,
        }
    }
}

impl std::fmt::Debug for AutomationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationExecutor").finish_non_exhaustive()
    }
}

/// Does the rule's trigger hold for this snapshot?
///
/// Thresholds come from `trigger_config` and accept float or integer;
/// missing or invalid config means not triggered. `server_crash` matches
/// `offline` specifically, to distinguish a crash from an intentional stop.
fn trigger_holds(rule: &AutomationRule, snapshot: &ResourceSnapshot) -> bool {
    match rule.trigger_type {
        AutomationTrigger::CpuThreshold => rule
            .threshold()
            .is_some_and(|th| snapshot.cpu_percent > th),
        AutomationTrigger::RamThreshold => matches!(
            (rule.threshold(), snapshot.mem_percent()),
            (Some(th), Some(p)) if p > th
        ),
        AutomationTrigger::DiskThreshold => matches!(
            (rule.threshold(), snapshot.disk_percent()),
            (Some(th), Some(p)) if p > th
        ),
        AutomationTrigger::ServerOffline => snapshot.power_state.is_down(),
        AutomationTrigger::ServerCrash => snapshot.power_state == PowerState::Offline,
        AutomationTrigger::Unknown => {
            warn!(rule_id = %rule.id, "unknown automation trigger type, skipping rule");
            false
        }
    }
}

fn summary_payload(
    rule: &AutomationRule,
    user: &ControlUser,
    success: bool,
    now: DateTime<Utc>,
) -> PushPayload {
    let title = if success {
        "Automation executed".to_string()
    } else {
        "Automation failed".to_string()
    };
    PushPayload {
        title,
        body: format!(
            "{} on server {} ({})",
            rule.action,
            rule.server_id,
            rule.trigger_type
        ),
        user_uuid: user.user_uuid.clone(),
        server_id: rule.server_id.clone(),
        event_type: EventType::Automation,
        timestamp: now,
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::testing::RecordingPush;
    use chrono::TimeDelta;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn t0() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_754_000_000, 0).unwrap()
    }

    fn user() -> ControlUser {
        ControlUser {
            user_uuid: "u1".into(),
            api_key_encrypted: "AAAA".into(),
            is_admin: false,
            allowed_servers: vec!["s1".into()],
            device_tokens: vec!["tok-1".into()],
        }
    }

    fn rule(trigger: AutomationTrigger, action: &str) -> AutomationRule {
        AutomationRule {
            id: "auto-1".into(),
            user_uuid: "u1".into(),
            server_id: "s1".into(),
            trigger_type: trigger,
            trigger_config: HashMap::new(),
            action: action.into(),
            action_config: HashMap::new(),
            cooldown: 300,
            enabled: true,
        }
    }

    fn offline_snap() -> ResourceSnapshot {
        ResourceSnapshot {
            id: 0,
            server_id: "s1".into(),
            timestamp: t0(),
            power_state: PowerState::Offline,
            cpu_percent: 0.0,
            mem_bytes: 0,
            mem_limit: 0,
            disk_bytes: 0,
            disk_limit: 0,
            net_rx: 0,
            net_tx: 0,
            uptime_ms: 0,
        }
    }

    async fn fixture(
        panel_uri: &str,
    ) -> (AutomationExecutor, Arc<RecordingPush>, Arc<Storage>) {
        let storage = Arc::new(Storage::open_in_memory().await.unwrap());
        let push = Arc::new(RecordingPush::default());
        let panel = Arc::new(PanelClient::new(panel_uri).unwrap());
        let exec = AutomationExecutor::new(panel, storage.clone(), push.clone());
        (exec, push, storage)
    }

    #[tokio::test]
    async fn offline_trigger_sends_start_signal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/s1/power"))
            .and(header("Authorization", "Bearer user-key"))
            .and(body_json(serde_json::json!({ "signal": "start" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (exec, push, storage) = fixture(&server.uri()).await;
        let r = [rule(AutomationTrigger::ServerOffline, "start")];
        exec.evaluate(&offline_snap(), &r, &user(), "user-key", t0())
            .await;

        assert_eq!(storage.automation_log_count().await.unwrap(), 1);
        assert_eq!(push.sent_count(), 1);
        let sent = push.sent.lock();
        assert_eq!(sent[0].1.event_type, EventType::Automation);
        assert!(sent[0].1.title.contains("executed"));
    }

    #[tokio::test]
    async fn unauthorized_server_short_circuits_before_any_call() {
        let server = MockServer::start().await;
        // No mock mounted: any request to the panel would 404 and any
        // request at all fails the expectation below.
        let (exec, push, storage) = fixture(&server.uri()).await;

        let mut r = rule(AutomationTrigger::ServerOffline, "start");
        r.server_id = "someone-elses".into();
        exec.evaluate(&offline_snap(), &[r], &user(), "user-key", t0())
            .await;

        assert_eq!(server.received_requests().await.unwrap().len(), 0);
        assert_eq!(storage.automation_log_count().await.unwrap(), 0);
        assert_eq!(push.sent_count(), 0);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_execution() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/s1/power"))
            .respond_with(ResponseTemplate::new(204))
            .expect(2)
            .mount(&server)
            .await;

        let (exec, _push, storage) = fixture(&server.uri()).await;
        let r = [rule(AutomationTrigger::ServerOffline, "restart")];
        let u = user();

        exec.evaluate(&offline_snap(), &r, &u, "k", t0()).await;
        // 60s later: still cooling down.
        exec.evaluate(&offline_snap(), &r, &u, "k", t0() + TimeDelta::seconds(60))
            .await;
        // 300s later: eligible again.
        exec.evaluate(&offline_snap(), &r, &u, "k", t0() + TimeDelta::seconds(300))
            .await;

        assert_eq!(storage.automation_log_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cpu_trigger_reads_threshold_from_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/s1/power"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (exec, _push, storage) = fixture(&server.uri()).await;
        let mut r = rule(AutomationTrigger::CpuThreshold, "restart");
        r.trigger_config
            .insert("threshold".into(), serde_json::json!(90));

        let mut snap = offline_snap();
        snap.power_state = PowerState::Running;
        snap.cpu_percent = 85.0;
        exec.evaluate(&snap, &[r.clone()], &user(), "k", t0()).await;
        assert_eq!(storage.automation_log_count().await.unwrap(), 0);

        snap.cpu_percent = 95.0;
        exec.evaluate(&snap, &[r], &user(), "k", t0()).await;
        assert_eq!(storage.automation_log_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_threshold_config_never_triggers() {
        let server = MockServer::start().await;
        let (exec, _push, storage) = fixture(&server.uri()).await;

        let r = rule(AutomationTrigger::CpuThreshold, "restart");
        let mut snap = offline_snap();
        snap.power_state = PowerState::Running;
        snap.cpu_percent = 99.0;
        exec.evaluate(&snap, &[r], &user(), "k", t0()).await;
        assert_eq!(storage.automation_log_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn crash_trigger_ignores_clean_stop() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/s1/power"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (exec, _push, storage) = fixture(&server.uri()).await;
        let r = [rule(AutomationTrigger::ServerCrash, "start")];
        let u = user();

        let mut snap = offline_snap();
        snap.power_state = PowerState::Stopped;
        exec.evaluate(&snap, &r, &u, "k", t0()).await;
        assert_eq!(storage.automation_log_count().await.unwrap(), 0);

        snap.power_state = PowerState::Offline;
        exec.evaluate(&snap, &r, &u, "k", t0()).await;
        assert_eq!(storage.automation_log_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn command_action_requires_config_and_sends_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/s1/command"))
            .and(body_json(serde_json::json!({ "command": "say hello" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (exec, push, storage) = fixture(&server.uri()).await;
        let u = user();

        // No command configured: failure row, no panel call.
        let bare = rule(AutomationTrigger::ServerOffline, "command");
        exec.evaluate(&offline_snap(), &[bare], &u, "k", t0()).await;
        assert_eq!(storage.automation_log_count().await.unwrap(), 1);
        assert!(push.sent.lock()[0].1.title.contains("failed"));

        let mut ok = rule(AutomationTrigger::ServerOffline, "command");
        ok.id = "auto-2".into();
        ok.action_config
            .insert("command".into(), "say hello".into());
        exec.evaluate(&offline_snap(), &[ok], &u, "k", t0()).await;
        assert_eq!(storage.automation_log_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn panel_failure_is_recorded_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/client/servers/s1/backups"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (exec, push, storage) = fixture(&server.uri()).await;
        let r = [rule(AutomationTrigger::ServerOffline, "backup")];
        exec.evaluate(&offline_snap(), &r, &user(), "k", t0()).await;

        assert_eq!(storage.automation_log_count().await.unwrap(), 1);
        assert!(push.sent.lock()[0].1.title.contains("failed"));
    }

    #[test]
    fn action_parsing() {
        let mut r = rule(AutomationTrigger::ServerOffline, "restart");
        assert_eq!(
            AutomationAction::from_rule(&r).unwrap(),
            AutomationAction::Power(PowerSignal::Restart)
        );

        r.action = "backup".into();
        assert_eq!(
            AutomationAction::from_rule(&r).unwrap(),
            AutomationAction::Backup
        );

        r.action = "command".into();
        assert!(AutomationAction::from_rule(&r).is_err());
        r.action_config.insert("command".into(), "stop".into());
        assert_eq!(
            AutomationAction::from_rule(&r).unwrap(),
            AutomationAction::Command("stop".into())
        );

        r.action = "self_destruct".into();
        assert!(AutomationAction::from_rule(&r).is_err());
    }
}
