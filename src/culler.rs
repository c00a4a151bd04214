use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use log::warn;

use crate::config::Config;

/// Written by the external activity probe; RFC 3339.
pub const LAST_ACTIVITY_ANNOTATION: &str = "sessions.example.org/last-activity";
/// Written here when a session idles out; cleared externally when activity
/// resumes. Its presence makes the workload generator emit zero replicas.
pub const STOP_ANNOTATION: &str = "sessions.example.org/stopped";

pub fn stop_annotation_is_set(meta: &ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .map(|annotations| annotations.contains_key(STOP_ANNOTATION))
        .unwrap_or(false)
}

pub fn last_activity(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    let raw = meta.annotations.as_ref()?.get(LAST_ACTIVITY_ANNOTATION)?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(timestamp) => Some(timestamp.with_timezone(&Utc)),
        Err(err) => {
            warn!("ignoring malformed last-activity annotation {:?}: {}", raw, err);
            None
        }
    }
}

/// A session is culled once it has been idle longer than the configured
/// window and has not already been stopped. Sessions that never reported
/// activity are left alone.
pub fn needs_culling(meta: &ObjectMeta, now: DateTime<Utc>, config: &Config) -> bool {
    if !config.enable_culling || stop_annotation_is_set(meta) {
        return false;
    }
    match last_activity(meta) {
        Some(last) => now.signed_duration_since(last) > config.cull_idle_time,
        None => false,
    }
}

/// Stamp the stop annotation; the workload generator emits zero replicas
/// from the next convergence on.
pub fn set_stop_annotation(meta: &mut ObjectMeta, now: DateTime<Utc>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(STOP_ANNOTATION.to_string(), now.to_rfc3339());
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn culling_config(idle_seconds: i64) -> Config {
        Config {
            enable_culling: true,
            cull_idle_time: Duration::seconds(idle_seconds),
            ..Default::default()
        }
    }

    fn meta_with_activity(last: DateTime<Utc>) -> ObjectMeta {
        let mut annotations = BTreeMap::new();
        annotations.insert(LAST_ACTIVITY_ANNOTATION.to_string(), last.to_rfc3339());
        ObjectMeta {
            annotations: Some(annotations),
            ..Default::default()
        }
    }

    #[test]
    fn idle_past_window_needs_culling() {
        let now = Utc::now();
        let meta = meta_with_activity(now - Duration::seconds(61));
        assert!(needs_culling(&meta, now, &culling_config(60)));
    }

    #[test]
    fn fresh_activity_does_not_cull() {
        let now = Utc::now();
        let meta = meta_with_activity(now - Duration::seconds(30));
        assert!(!needs_culling(&meta, now, &culling_config(60)));
    }

    #[test]
    fn already_stopped_is_not_culled_again() {
        let now = Utc::now();
        let mut meta = meta_with_activity(now - Duration::seconds(3600));
        set_stop_annotation(&mut meta, now);
        assert!(stop_annotation_is_set(&meta));
        assert!(!needs_culling(&meta, now, &culling_config(60)));
    }

    #[test]
    fn culling_disabled_never_culls() {
        let now = Utc::now();
        let meta = meta_with_activity(now - Duration::seconds(3600));
        let config = Config {
            enable_culling: false,
            cull_idle_time: Duration::seconds(60),
            ..Default::default()
        };
        assert!(!needs_culling(&meta, now, &config));
    }

    #[test]
    fn missing_or_malformed_activity_is_ignored() {
        let now = Utc::now();
        assert!(!needs_culling(&ObjectMeta::default(), now, &culling_config(60)));

        let mut annotations = BTreeMap::new();
        annotations.insert(LAST_ACTIVITY_ANNOTATION.to_string(), "yesterday".to_string());
        let meta = ObjectMeta {
            annotations: Some(annotations),
            ..Default::default()
        };
        assert!(last_activity(&meta).is_none());
        assert!(!needs_culling(&meta, now, &culling_config(60)));
    }
}
