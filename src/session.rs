use k8s_openapi::api::core::v1::{ContainerState, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Session label flipped to `"true"` while a volume scale-up is in flight.
pub const MAINTENANCE_LABEL: &str = "maintenance";
/// Stamped on every pod belonging to a session; event correlation reads it back.
pub const SESSION_NAME_LABEL: &str = "session-name";
/// Ties claims and the scale job to their session for label-selected lookup.
pub const SESSION_LABEL: &str = "session";
/// Suffix of the one-shot data-copy job name.
pub const SCALE_JOB_SUFFIX: &str = "-scale-job";
/// generateName prefix for scaled-up claims.
pub const SCALED_CLAIM_PREFIX: &str = "session-pvc-";

pub const DEFAULT_CONTAINER_PORT: i32 = 8888;
pub const DEFAULT_SERVING_PORT: i32 = 80;
/// Default fsGroup for pods that bring no security context of their own.
pub const DEFAULT_FS_GROUP: i64 = 100;

/// Conditions older than this tail are dropped.
pub const MAX_CONDITIONS: usize = 100;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "sessions.example.org",
    version = "v1beta1",
    kind = "Session",
    status = "SessionStatus",
    shortname = "sn",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    /// Full pod template for the session workload.
    pub template: PodTemplateSpec,
    /// Optional policy for growing the backing volume claim as it fills up.
    #[serde(default, rename = "scalePVC", skip_serializing_if = "Option::is_none")]
    pub scale_pvc: Option<ScalePvcPolicy>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalePvcPolicy {
    /// Utilization percentage beyond which the claim is grown.
    pub threshold: i64,
    /// Multiplier applied to the current storage request when growing.
    pub scale_factor: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Ready replicas reported by the workload; 0 or 1.
    #[serde(default)]
    pub ready_replicas: i32,
    /// Raw state of the session container as last observed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_state: Option<ContainerState>,
    /// Newest-first history of observed container-state transitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<SessionCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCondition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_time: Option<Time>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn scale_job_name(session_name: &str) -> String {
    format!("{}{}", session_name, SCALE_JOB_SUFFIX)
}

pub fn in_maintenance(session: &Session) -> bool {
    session
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MAINTENANCE_LABEL))
        .map(|value| value == "true")
        .unwrap_or(false)
}

/// Translate a raw container state into the condition recorded on the session.
pub fn next_condition(state: &ContainerState, probed_at: Time) -> SessionCondition {
    let (type_, reason, message) = if state.running.is_some() {
        ("Running", None, None)
    } else if let Some(waiting) = &state.waiting {
        ("Waiting", waiting.reason.clone(), waiting.message.clone())
    } else {
        // The terminated substate carries no dedicated message; the reason
        // doubles as one.
        let reason = state.terminated.as_ref().and_then(|t| t.reason.clone());
        ("Terminated", reason.clone(), reason)
    };
    SessionCondition {
        type_: type_.to_string(),
        last_probe_time: Some(probed_at),
        reason,
        message,
    }
}

/// Prepend `condition` unless the head already records the same transition.
/// Returns whether the history changed.
pub fn push_condition(conditions: &mut Vec<SessionCondition>, condition: SessionCondition) -> bool {
    if let Some(head) = conditions.first() {
        if head.type_ == condition.type_
            && head.reason == condition.reason
            && head.message == condition.message
        {
            return false;
        }
    }
    conditions.insert(0, condition);
    conditions.truncate(MAX_CONDITIONS);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::{
        ContainerStateRunning, ContainerStateTerminated, ContainerStateWaiting,
    };
    use std::collections::BTreeMap;

    fn probe_time() -> Time {
        Time(Utc::now())
    }

    #[test]
    fn running_state_maps_to_running_condition() {
        let state = ContainerState {
            running: Some(ContainerStateRunning::default()),
            ..Default::default()
        };
        let condition = next_condition(&state, probe_time());
        assert_eq!(condition.type_, "Running");
        assert_eq!(condition.reason, None);
        assert_eq!(condition.message, None);
    }

    #[test]
    fn waiting_state_carries_reason_and_message() {
        let state = ContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("CrashLoop".to_string()),
                message: Some("back-off".to_string()),
            }),
            ..Default::default()
        };
        let condition = next_condition(&state, probe_time());
        assert_eq!(condition.type_, "Waiting");
        assert_eq!(condition.reason.as_deref(), Some("CrashLoop"));
        assert_eq!(condition.message.as_deref(), Some("back-off"));
    }

    #[test]
    fn terminated_state_reuses_reason_as_message() {
        let state = ContainerState {
            terminated: Some(ContainerStateTerminated {
                reason: Some("OOMKilled".to_string()),
                message: Some("out of memory".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let condition = next_condition(&state, probe_time());
        assert_eq!(condition.type_, "Terminated");
        assert_eq!(condition.reason.as_deref(), Some("OOMKilled"));
        assert_eq!(condition.message.as_deref(), Some("OOMKilled"));
    }

    #[test]
    fn push_condition_skips_identical_head() {
        let mut conditions = Vec::new();
        let first = SessionCondition {
            type_: "Waiting".to_string(),
            reason: Some("CrashLoop".to_string()),
            message: Some("back-off".to_string()),
            last_probe_time: Some(probe_time()),
        };
        assert!(push_condition(&mut conditions, first.clone()));
        // Same transition again, different probe time: head is unchanged.
        assert!(!push_condition(&mut conditions, first.clone()));
        assert_eq!(conditions.len(), 1);

        let second = SessionCondition {
            type_: "Running".to_string(),
            ..Default::default()
        };
        assert!(push_condition(&mut conditions, second));
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, "Running");
        assert_eq!(conditions[1].type_, "Waiting");
    }

    #[test]
    fn push_condition_bounds_history() {
        let mut conditions = Vec::new();
        for i in 0..(MAX_CONDITIONS + 10) {
            let condition = SessionCondition {
                type_: "Waiting".to_string(),
                reason: Some(format!("reason-{}", i)),
                ..Default::default()
            };
            push_condition(&mut conditions, condition);
        }
        assert_eq!(conditions.len(), MAX_CONDITIONS);
        // Newest stays at the head.
        assert_eq!(
            conditions[0].reason.as_deref(),
            Some(format!("reason-{}", MAX_CONDITIONS + 9).as_str())
        );
    }

    #[test]
    fn maintenance_label_must_be_true() {
        let mut session = Session::new("s", SessionSpec::default());
        assert!(!in_maintenance(&session));

        let mut labels = BTreeMap::new();
        labels.insert(MAINTENANCE_LABEL.to_string(), "false".to_string());
        session.metadata.labels = Some(labels.clone());
        assert!(!in_maintenance(&session));

        labels.insert(MAINTENANCE_LABEL.to_string(), "true".to_string());
        session.metadata.labels = Some(labels);
        assert!(in_maintenance(&session));
    }
}
