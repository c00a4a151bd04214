use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::api::DynamicObject;
use serde_json::{json, Value};

/// Copy the workload fields this controller owns (labels, replicas,
/// selector, pod template spec) from `desired` onto `live`. Returns whether
/// `live` changed and needs to be written back. Fields outside the owned
/// subset are never touched.
pub fn copy_workload_fields(desired: &StatefulSet, live: &mut StatefulSet) -> bool {
    let mut changed = false;

    if live.metadata.labels != desired.metadata.labels {
        live.metadata.labels = desired.metadata.labels.clone();
        changed = true;
    }

    let desired_spec = desired.spec.clone().unwrap_or_default();
    let live_spec = live.spec.get_or_insert_with(Default::default);
    if live_spec.replicas != desired_spec.replicas {
        live_spec.replicas = desired_spec.replicas;
        changed = true;
    }
    if live_spec.selector != desired_spec.selector {
        live_spec.selector = desired_spec.selector;
        changed = true;
    }
    if live_spec.template.spec != desired_spec.template.spec {
        live_spec.template.spec = desired_spec.template.spec;
        changed = true;
    }
    changed
}

/// Copy the endpoint fields this controller owns (selector, ports, type).
pub fn copy_endpoint_fields(desired: &Service, live: &mut Service) -> bool {
    let mut changed = false;

    let desired_spec = desired.spec.clone().unwrap_or_default();
    let live_spec = live.spec.get_or_insert_with(Default::default);
    if live_spec.selector != desired_spec.selector {
        live_spec.selector = desired_spec.selector;
        changed = true;
    }
    if live_spec.ports != desired_spec.ports {
        live_spec.ports = desired_spec.ports;
        changed = true;
    }
    if live_spec.type_ != desired_spec.type_ {
        live_spec.type_ = desired_spec.type_;
        changed = true;
    }
    changed
}

/// Copy the routing-rule document this controller owns (the whole `spec`).
pub fn copy_ingress_fields(desired: &DynamicObject, live: &mut DynamicObject) -> bool {
    let desired_spec = desired.data.get("spec").cloned().unwrap_or(Value::Null);
    if live.data.get("spec") == Some(&desired_spec) {
        return false;
    }
    match &mut live.data {
        Value::Object(map) => {
            map.insert("spec".to_string(), desired_spec);
        }
        other => {
            *other = json!({ "spec": desired_spec });
        }
    }
    true
}
