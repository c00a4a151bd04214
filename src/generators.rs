use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Resource, ResourceExt};
use serde_json::json;

use crate::config::Config;
use crate::culler;
use crate::errors::*;
use crate::scale;
use crate::session::{self, Session};

fn owned_metadata(session: &Session, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: session.namespace(),
        owner_references: session.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Desired workload for a session. Replicas drop to zero while the session
/// is stopped or under volume maintenance so the pod releases its claim.
pub fn workload(session: &Session, config: &Config) -> Result<StatefulSet> {
    let name = session.name_any();
    let namespace = session.namespace().unwrap_or_default();

    let mut pod_spec = session
        .spec
        .template
        .spec
        .clone()
        .ok_or_else(|| ErrorKind::InvalidSessionSpec("pod template has no spec".to_string()))?;
    if pod_spec.containers.is_empty() {
        bail!(ErrorKind::InvalidSessionSpec(
            "pod template has no containers".to_string()
        ));
    }

    {
        let container = &mut pod_spec.containers[0];
        if container.working_dir.is_none() {
            container.working_dir = Some("/home/jovyan".to_string());
        }
        if container.ports.as_ref().map_or(true, |ports| ports.is_empty()) {
            container.ports = Some(vec![ContainerPort {
                container_port: session::DEFAULT_CONTAINER_PORT,
                name: Some("session-port".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]);
        }
        container.env.get_or_insert_with(Vec::new).push(EnvVar {
            name: "NB_PREFIX".to_string(),
            value: Some(format!("/session/{}/{}", namespace, name)),
            ..Default::default()
        });
    }

    // Some platforms manage fsGroup themselves; a template that already
    // carries a security context is left untouched.
    if config.add_fsgroup && pod_spec.security_context.is_none() {
        pod_spec.security_context = Some(PodSecurityContext {
            fs_group: Some(session::DEFAULT_FS_GROUP),
            ..Default::default()
        });
    }

    // Selector pair first, then every session label on top (session wins).
    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(session::SESSION_LABEL.to_string(), name.clone());
    pod_labels.insert(session::SESSION_NAME_LABEL.to_string(), name.clone());
    if let Some(labels) = &session.metadata.labels {
        for (key, value) in labels {
            pod_labels.insert(key.clone(), value.clone());
        }
    }

    let replicas = if culler::stop_annotation_is_set(&session.metadata)
        || session::in_maintenance(session)
    {
        0
    } else {
        1
    };

    Ok(StatefulSet {
        metadata: owned_metadata(session, name.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: name.clone(),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    session::SESSION_LABEL.to_string(),
                    name,
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Desired cluster-internal endpoint: port 80 forwarding to the first
/// declared container port, 8888 when the template declares none.
pub fn endpoint(session: &Session) -> Service {
    let name = session.name_any();
    let target = session
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.container_port)
        .unwrap_or(session::DEFAULT_CONTAINER_PORT);

    Service {
        metadata: owned_metadata(session, name.clone()),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([(
                session::SESSION_LABEL.to_string(),
                name.clone(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some(format!("http-{}", name)),
                port: session::DEFAULT_SERVING_PORT,
                target_port: Some(IntOrString::Int(target)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn ingress_rule_name(namespace: &str, name: &str) -> String {
    format!("session-{}-{}", namespace, name)
}

/// Kind of the gateway-level routing rule.
pub fn ingress_rule_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "networking.istio.io",
        "v1alpha3",
        "VirtualService",
    ))
}

/// Routing rule exposing the endpoint at `/session/<ns>/<name>/` through the
/// configured gateway.
pub fn ingress_rule(session: &Session, config: &Config) -> DynamicObject {
    let name = session.name_any();
    let namespace = session.namespace().unwrap_or_default();
    let prefix = format!("/session/{}/{}/", namespace, name);
    let host = format!("{}.{}.svc.cluster.local", name, namespace);

    let mut rule = DynamicObject::new(
        &ingress_rule_name(&namespace, &name),
        &ingress_rule_resource(),
    );
    rule.metadata.namespace = Some(namespace);
    rule.metadata.owner_references = session.controller_owner_ref(&()).map(|r| vec![r]);
    rule.data = json!({
        "spec": {
            "hosts": ["*"],
            "gateways": [config.ingress_gateway],
            "http": [{
                "match": [{"uri": {"prefix": prefix}}],
                "rewrite": {"uri": prefix},
                "route": [{
                    "destination": {
                        "host": host,
                        "port": {"number": session::DEFAULT_SERVING_PORT},
                    }
                }],
                "timeout": "300s",
            }],
        }
    });
    rule
}

/// One-shot job mirroring the contents of `source` into `dest`. The source
/// side mounts read-only so a half-written destination can never leak back.
pub fn scale_job(
    session: &Session,
    source: &PersistentVolumeClaim,
    dest: &PersistentVolumeClaim,
) -> Job {
    let name = session.name_any();
    let src_volume = Volume {
        name: "source-vol".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: source.name_any(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let dest_volume = Volume {
        name: "dest-vol".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: dest.name_any(),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut metadata = owned_metadata(session, session::scale_job_name(&name));
    metadata.labels = Some(BTreeMap::from([(
        session::SESSION_LABEL.to_string(),
        name.clone(),
    )]));

    Job {
        metadata,
        spec: Some(JobSpec {
            parallelism: Some(1),
            completions: Some(1),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    // The copy pod reports through the same label as session
                    // pods, so its lifecycle events wake the owning session.
                    labels: Some(BTreeMap::from([(
                        session::SESSION_NAME_LABEL.to_string(),
                        name,
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    volumes: Some(vec![src_volume.clone(), dest_volume.clone()]),
                    containers: vec![Container {
                        name: "rsync".to_string(),
                        image: Some("eeacms/rsync:2.3".to_string()),
                        command: Some(vec![
                            "rsync".to_string(),
                            "/tmp/source/".to_string(),
                            "/tmp/dest/".to_string(),
                            "-r".to_string(),
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: src_volume.name,
                                read_only: Some(true),
                                mount_path: "/tmp/source".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: dest_volume.name,
                                read_only: Some(false),
                                mount_path: "/tmp/dest".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Replacement claim sized `scale_factor` times the current request, named
/// by the API server under the scaled-claim prefix and labelled so it can be
/// rediscovered across restarts.
pub fn scaled_claim(
    session: &Session,
    current: &PersistentVolumeClaim,
    scale_factor: i64,
) -> Result<PersistentVolumeClaim> {
    let requested = scale::storage_request(current).ok_or_else(|| {
        ErrorKind::InvalidSessionSpec(format!(
            "claim {} has no storage request",
            current.name_any()
        ))
    })?;
    let bytes = scale::parse_quantity(&requested.0)?;
    let scaled = scale::format_quantity(bytes.saturating_mul(scale_factor.max(1) as u64));

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some(session::SCALED_CLAIM_PREFIX.to_string()),
            namespace: session.namespace(),
            labels: Some(BTreeMap::from([(
                session::SESSION_LABEL.to_string(),
                session.name_any(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(scaled),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSpec;

    fn session_with_image(image: &str) -> Session {
        let mut session = Session::new(
            "s",
            SessionSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "main".to_string(),
                            image: Some(image.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                scale_pvc: None,
            },
        );
        session.metadata.namespace = Some("n".to_string());
        session.metadata.uid = Some("uid-1234".to_string());
        session
    }

    fn claim_with_request(name: &str, request: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("n".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(request.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn workload_applies_defaults() {
        let session = session_with_image("img");
        let workload = workload(&session, &Config::default()).expect("generate");
        let spec = workload.spec.expect("spec");
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(spec.service_name, "s");

        let pod_spec = spec.template.spec.expect("pod spec");
        let container = &pod_spec.containers[0];
        assert_eq!(container.working_dir.as_deref(), Some("/home/jovyan"));
        let ports = container.ports.as_ref().expect("ports");
        assert_eq!(ports[0].container_port, 8888);
        let env = container.env.as_ref().expect("env");
        assert!(env
            .iter()
            .any(|e| e.name == "NB_PREFIX" && e.value.as_deref() == Some("/session/n/s")));
        assert_eq!(
            pod_spec.security_context.and_then(|sc| sc.fs_group),
            Some(100)
        );

        let labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels.get("session").map(String::as_str), Some("s"));
        assert_eq!(labels.get("session-name").map(String::as_str), Some("s"));
        assert!(workload.metadata.owner_references.is_some());
    }

    #[test]
    fn workload_keeps_declared_values() {
        let mut session = session_with_image("img");
        {
            let spec = session.spec.template.spec.as_mut().unwrap();
            spec.containers[0].working_dir = Some("/work".to_string());
            spec.containers[0].ports = Some(vec![ContainerPort {
                container_port: 9000,
                ..Default::default()
            }]);
            spec.security_context = Some(PodSecurityContext {
                fs_group: Some(2000),
                ..Default::default()
            });
        }
        let workload = workload(&session, &Config::default()).expect("generate");
        let pod_spec = workload.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod_spec.containers[0].working_dir.as_deref(), Some("/work"));
        assert_eq!(
            pod_spec.containers[0].ports.as_ref().unwrap()[0].container_port,
            9000
        );
        assert_eq!(
            pod_spec.security_context.and_then(|sc| sc.fs_group),
            Some(2000)
        );
    }

    #[test]
    fn workload_skips_fsgroup_when_opted_out() {
        let session = session_with_image("img");
        let config = Config {
            add_fsgroup: false,
            ..Default::default()
        };
        let workload = workload(&session, &config).expect("generate");
        assert!(workload
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .security_context
            .is_none());
    }

    #[test]
    fn workload_session_labels_win_on_pods() {
        let mut session = session_with_image("img");
        session.metadata.labels = Some(BTreeMap::from([
            ("team".to_string(), "ml".to_string()),
            ("session".to_string(), "override".to_string()),
        ]));
        let workload = workload(&session, &Config::default()).expect("generate");
        let labels = workload
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .labels
            .unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("ml"));
        assert_eq!(labels.get("session").map(String::as_str), Some("override"));
    }

    #[test]
    fn workload_idles_on_stop_annotation_or_maintenance() {
        let mut session = session_with_image("img");
        session.metadata.annotations = Some(BTreeMap::from([(
            culler::STOP_ANNOTATION.to_string(),
            "2026-01-01T00:00:00Z".to_string(),
        )]));
        let stopped = workload(&session, &Config::default()).expect("generate");
        assert_eq!(stopped.spec.unwrap().replicas, Some(0));

        let mut session = session_with_image("img");
        session.metadata.labels = Some(BTreeMap::from([(
            session::MAINTENANCE_LABEL.to_string(),
            "true".to_string(),
        )]));
        let parked = workload(&session, &Config::default()).expect("generate");
        assert_eq!(parked.spec.unwrap().replicas, Some(0));
    }

    #[test]
    fn workload_rejects_empty_template() {
        let mut session = session_with_image("img");
        session.spec.template.spec.as_mut().unwrap().containers.clear();
        assert!(workload(&session, &Config::default()).is_err());
    }

    #[test]
    fn endpoint_forwards_to_first_declared_port() {
        let session = session_with_image("img");
        let service = endpoint(&session);
        let spec = service.spec.expect("spec");
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let ports = spec.ports.expect("ports");
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8888)));

        let mut session = session_with_image("img");
        session.spec.template.spec.as_mut().unwrap().containers[0].ports =
            Some(vec![ContainerPort {
                container_port: 9000,
                ..Default::default()
            }]);
        let service = endpoint(&session);
        assert_eq!(
            service.spec.unwrap().ports.unwrap()[0].target_port,
            Some(IntOrString::Int(9000))
        );
    }

    #[test]
    fn ingress_rule_routes_the_session_prefix() {
        let session = session_with_image("img");
        let rule = ingress_rule(&session, &Config::default());
        assert_eq!(rule.metadata.name.as_deref(), Some("session-n-s"));
        assert_eq!(rule.metadata.namespace.as_deref(), Some("n"));

        let spec = &rule.data["spec"];
        assert_eq!(spec["gateways"][0], "system/default-gateway");
        assert_eq!(spec["http"][0]["match"][0]["uri"]["prefix"], "/session/n/s/");
        assert_eq!(spec["http"][0]["rewrite"]["uri"], "/session/n/s/");
        assert_eq!(
            spec["http"][0]["route"][0]["destination"]["host"],
            "s.n.svc.cluster.local"
        );
        assert_eq!(spec["http"][0]["timeout"], "300s");
    }

    #[test]
    fn scale_job_mounts_source_read_only() {
        let session = session_with_image("img");
        let source = claim_with_request("old-claim", "10Gi");
        let dest = claim_with_request("session-pvc-abcde", "20Gi");
        let job = scale_job(&session, &source, &dest);
        assert_eq!(job.metadata.name.as_deref(), Some("s-scale-job"));
        assert_eq!(
            job.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get("session"))
                .map(String::as_str),
            Some("s")
        );

        let pod_spec = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        let mounts = pod_spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(mounts[1].read_only, Some(false));
        let volumes = pod_spec.volumes.unwrap();
        assert_eq!(
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "old-claim"
        );
        assert_eq!(
            volumes[1]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "session-pvc-abcde"
        );
    }

    #[test]
    fn scaled_claim_multiplies_the_request() {
        let session = session_with_image("img");
        let current = claim_with_request("old-claim", "10Gi");
        let claim = scaled_claim(&session, &current, 2).expect("generate");
        assert_eq!(
            claim.metadata.generate_name.as_deref(),
            Some("session-pvc-")
        );
        let request = claim
            .spec
            .unwrap()
            .resources
            .unwrap()
            .requests
            .unwrap()
            .get("storage")
            .cloned()
            .unwrap();
        assert_eq!(request.0, "20Gi");
    }
}
