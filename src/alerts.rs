// =============================================================================
// Alert evaluator - stateful rule evaluation over resource snapshots
// =============================================================================
//
// Gates, in order, per rule:
//   1. Cooldown      - a rule stays silent for `cooldown` seconds after it
//                      fires.
//   2. Condition     - branched on the rule's condition type; percent math
//                      is skipped when the snapshot carries no limit.
//   3. Duration      - threshold conditions must hold continuously for
//                      `duration` seconds before the first trigger; any
//                      non-triggering sample resets the counter. State
//                      transitions (power change, restart loop) are
//                      point-in-time and skip this gate.
//
// Transition bookkeeping: a down->running flip is recorded into the restart
// tracker before the rules run, so a restart-loop rule fires on the very
// sample that completes the third restart. The previous power state used by
// power_state_change is captured before that update.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::control::{AlertCondition, AlertRule, ControlUser};
use crate::push::{EventType, PushPayload, PushProvider};
use crate::storage::{AlertHistoryEntry, Storage};
use crate::types::{PowerState, ResourceSnapshot};

/// Restart-loop detection window.
const RESTART_WINDOW_SECS: i64 = 5 * 60;
/// Restarts within the window that count as a loop.
const RESTART_LOOP_COUNT: usize = 3;

#[derive(Default)]
struct EvalState {
    /// rule_id -> when the condition was first observed holding.
    first_exceeded: HashMap<String, DateTime<Utc>>,
    /// rule_id -> when the rule last fired.
    last_triggered: HashMap<String, DateTime<Utc>>,
    /// server_id -> power state seen on the previous sample.
    previous_states: HashMap<String, PowerState>,
    /// server_id -> recent down->running transition times.
    restart_tracker: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Evaluates alert rules against snapshots and emits pushes + audit rows.
pub struct AlertEvaluator {
    storage: Arc<Storage>,
    push: Arc<dyn PushProvider>,
    state: Mutex<EvalState>,
}

impl AlertEvaluator {
    pub fn new(storage: Arc<Storage>, push: Arc<dyn PushProvider>) -> Self {
        Self {
            storage,
            push,
            state: Mutex::new(EvalState::default()),
        }
    }

    /// Evaluate every rule in `rules` (already filtered to this user and
    /// server) against one snapshot. `now` is injected so tests drive time.
    ///
    /// Transition tracking runs even when `rules` is empty: power-state
    /// history must stay current for rules that are enabled later.
    pub async fn evaluate(
        &self,
        snapshot: &ResourceSnapshot,
        rules: &[AlertRule],
        user: &ControlUser,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().await;
        let server_id = &snapshot.server_id;

        let previous = state.previous_states.get(server_id).copied();

        // Record a completed restart before the rules look at the tracker.
        if previous.is_some_and(PowerState::is_down) && snapshot.power_state == PowerState::Running
        {
            info!(server_id = %server_id, "server came back up");
            state
                .restart_tracker
                .entry(server_id.clone())
                .or_default()
                .push(now);
        }

        for rule in rules {
            self.evaluate_rule(&mut state, rule, snapshot, user, previous, now)
                .await;
        }

        state
            .previous_states
            .insert(server_id.clone(), snapshot.power_state);
    }

    async fn evaluate_rule(
        &self,
        state: &mut EvalState,
        rule: &AlertRule,
        snapshot: &ResourceSnapshot,
        user: &ControlUser,
        previous: Option<PowerState>,
        now: DateTime<Utc>,
    ) {
        // 1. Cooldown gate.
        if let Some(last) = state.last_triggered.get(&rule.id) {
            let since = (now - *last).num_seconds();
            if since < rule.cooldown {
                debug!(
                    rule_id = %rule.id,
                    since,
                    cooldown = rule.cooldown,
                    "rule in cooldown, skipping"
                );
                return;
            }
        }

        // 2. Condition evaluation. `Some(value)` means triggered.
        let evaluated: Option<f64> = match rule.condition_type {
            AlertCondition::CpuThreshold => {
                let v = snapshot.cpu_percent;
                (v > rule.threshold).then_some(v)
            }
            AlertCondition::RamThreshold => snapshot
                .mem_percent()
                .filter(|p| *p > rule.threshold),
            AlertCondition::DiskThreshold => snapshot
                .disk_percent()
                .filter(|p| *p > rule.threshold),
            AlertCondition::PowerStateChange => match previous {
                Some(prev) if prev != snapshot.power_state => Some(0.0),
                _ => None,
            },
            AlertCondition::OfflineDuration => snapshot.power_state.is_down().then_some(0.0),
            AlertCondition::RestartLoop => {
                let tracker = state
                    .restart_tracker
                    .entry(snapshot.server_id.clone())
                    .or_default();
                tracker.retain(|t| (now - *t).num_seconds() <= RESTART_WINDOW_SECS);
                (tracker.len() >= RESTART_LOOP_COUNT).then(|| tracker.len() as f64)
            }
            AlertCondition::Unknown => {
                warn!(rule_id = %rule.id, "unknown alert condition type, skipping rule");
                return;
            }
        };

        // 3. Not triggered: the continuity requirement starts over.
        let Some(value) = evaluated else {
            state.first_exceeded.remove(&rule.id);
            return;
        };

        // 4. Duration gate. Transition conditions are point-in-time.
        let point_in_time = matches!(
            rule.condition_type,
            AlertCondition::PowerStateChange | AlertCondition::RestartLoop
        );
        if !point_in_time && rule.duration > 0 {
            match state.first_exceeded.get(&rule.id) {
                None => {
                    state.first_exceeded.insert(rule.id.clone(), now);
                    return;
                }
                Some(first) => {
                    if (now - *first).num_seconds() < rule.duration {
                        return;
                    }
                }
            }
        }

        // 5. Fire.
        state.last_triggered.insert(rule.id.clone(), now);
        state.first_exceeded.remove(&rule.id);

        info!(
            rule_id = %rule.id,
            server_id = %snapshot.server_id,
            condition = %rule.condition_type,
            value,
            "alert triggered"
        );

        if let Err(e) = self
            .storage
            .insert_alert_history(&AlertHistoryEntry {
                rule_id: rule.id.clone(),
                user_uuid: rule.user_uuid.clone(),
                server_id: snapshot.server_id.clone(),
                condition: rule.condition_type.to_string(),
                value,
                triggered_at: now,
            })
            .await
        {
            warn!(rule_id = %rule.id, error = %e, "failed to record alert history");
        }

        let (title, body) = alert_message(rule, snapshot, previous, value);
        let payload = PushPayload {
            title,
            body,
            user_uuid: user.user_uuid.clone(),
            server_id: snapshot.server_id.clone(),
            event_type: EventType::Alert,
            timestamp: now,
        };

        for token in &user.device_tokens {
            if let Err(e) = self.push.send(token, &payload).await {
                warn!(rule_id = %rule.id, error = %e, "alert push failed");
            }
        }
    }
}

impl std::fmt::Debug for AlertEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEvaluator").finish_non_exhaustive()
    }
}

/// Human-readable notification for a fired rule.
fn alert_message(
    rule: &AlertRule,
    snapshot: &ResourceSnapshot,
    previous: Option<PowerState>,
    value: f64,
) -> (String, String) {
    let server = &snapshot.server_id;
    match rule.condition_type {
        AlertCondition::CpuThreshold => (
            "High CPU usage".to_string(),
            format!(
                "Server {server}: CPU at {value:.1}% (threshold {:.0}%)",
                rule.threshold
            ),
        ),
        AlertCondition::RamThreshold => (
            "High memory usage".to_string(),
            format!(
                "Server {server}: memory at {value:.1}% (threshold {:.0}%)",
                rule.threshold
            ),
        ),
        AlertCondition::DiskThreshold => (
            "High disk usage".to_string(),
            format!(
                "Server {server}: disk at {value:.1}% (threshold {:.0}%)",
                rule.threshold
            ),
        ),
        AlertCondition::PowerStateChange => (
            "Server state changed".to_string(),
            match previous {
                Some(prev) => format!(
                    "Server {server} went from {prev} to {}",
                    snapshot.power_state
                ),
                None => format!("Server {server} is now {}", snapshot.power_state),
            },
        ),
        AlertCondition::OfflineDuration => (
            "Server offline".to_string(),
            format!(
                "Server {server} has been {} for at least {}s",
                snapshot.power_state, rule.duration
            ),
        ),
        AlertCondition::RestartLoop => (
            "Restart loop detected".to_string(),
            format!("Server {server} restarted {value:.0} times within 5 minutes"),
        ),
        AlertCondition::Unknown => ("Alert".to_string(), format!("Server {server}")),
    }
}
