use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event as CoreEvent, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event as PublishedEvent, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use log::{debug, info, warn};
use serde_json::json;

use crate::config::Config;
use crate::correlator;
use crate::culler;
use crate::diff;
use crate::errors::*;
use crate::generators;
use crate::metrics::Metrics;
use crate::queue::RequestKey;
use crate::scale;
use crate::session::{self, ScalePvcPolicy, Session};

/// The convergence core. One instance serves every request key; all state
/// lives in the cluster, none in the reconciler.
pub struct Reconciler {
    client: Client,
    config: Config,
    metrics: Metrics,
    reporter: Reporter,
}

impl Reconciler {
    pub fn new(client: Client, config: Config, metrics: Metrics) -> Self {
        let reporter = Reporter {
            controller: "session-controller".to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            client,
            config,
            metrics,
            reporter,
        }
    }

    fn recorder(&self, session: &Session) -> Recorder {
        Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            session.object_ref(&()),
        )
    }

    /// One pass over a request key. `Ok(Some(d))` asks the queue to run the
    /// key again after `d`; errors are retried with backoff by the caller.
    pub async fn reconcile(&self, key: &RequestKey) -> Result<Option<Duration>> {
        // The queue interleaves child-event keys with session keys. Try the
        // key as an event first; on a miss it is a session (or is gone).
        let events: Api<CoreEvent> = Api::namespaced(self.client.clone(), &key.namespace);
        if let Some(event) = events.get_opt(&key.name).await? {
            self.reissue_event(&key.namespace, &event).await?;
        }

        let sessions: Api<Session> = Api::namespaced(self.client.clone(), &key.namespace);
        match sessions.get_opt(&key.name).await? {
            Some(session) => self.converge(&sessions, session).await,
            // Deleted; children follow through their owner references.
            None => Ok(None),
        }
    }

    /// Record a child event against the session it belongs to, preserving
    /// the original type, reason and message.
    async fn reissue_event(&self, namespace: &str, event: &CoreEvent) -> Result<()> {
        let involved = &event.involved_object;
        let session_name =
            match correlator::session_for_involved_object(self.client.clone(), namespace, involved)
                .await
            {
                Ok(Some(name)) => name,
                Ok(None) => {
                    debug!("event {} has nothing to correlate against", event.name_any());
                    return Ok(());
                }
                Err(err) => {
                    debug!("dropping event {}: {}", event.name_any(), err);
                    return Ok(());
                }
            };

        let sessions: Api<Session> = Api::namespaced(self.client.clone(), namespace);
        let session = match sessions.get_opt(&session_name).await? {
            Some(session) => session,
            None => {
                debug!("event for absent session {}/{}", namespace, session_name);
                return Ok(());
            }
        };

        let kind = involved.kind.clone().unwrap_or_default().to_lowercase();
        let note = format!(
            "Reissued from {}/{}: {}",
            kind,
            involved.name.clone().unwrap_or_default(),
            event.message.clone().unwrap_or_default()
        );
        let type_ = match event.type_.as_deref() {
            Some("Warning") => EventType::Warning,
            _ => EventType::Normal,
        };
        self.recorder(&session)
            .publish(PublishedEvent {
                type_,
                reason: event.reason.clone().unwrap_or_else(|| "Reissued".to_string()),
                note: Some(note),
                action: "Reissue".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }

    async fn converge(&self, sessions: &Api<Session>, session: Session) -> Result<Option<Duration>> {
        let name = session.name_any();
        let namespace = session.namespace().unwrap_or_default();
        debug!("reconciling session {}/{}", namespace, name);

        let recorder = self.recorder(&session);
        let maintenance = session::in_maintenance(&session);

        // A template that cannot be materialized is not retryable; tell the
        // user and wait for the next spec edit.
        let desired_workload = match generators::workload(&session, &self.config) {
            Ok(workload) => workload,
            Err(err) => {
                warn!("session {}/{} has an unusable template: {}", namespace, name, err);
                recorder
                    .publish(PublishedEvent {
                        type_: EventType::Warning,
                        reason: "FailedCreate".to_string(),
                        note: Some(format!("cannot generate workload: {}", err)),
                        action: "Create".to_string(),
                        secondary: None,
                    })
                    .await?;
                return Ok(None);
            }
        };

        // Workload convergence.
        let workloads: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        let workload = match workloads.get_opt(&name).await? {
            None => {
                info!("creating workload {}/{}", namespace, name);
                self.metrics.created.with_label_values(&[&namespace]).inc();
                match workloads.create(&PostParams::default(), &desired_workload).await {
                    Ok(created) => created,
                    Err(err) => {
                        self.metrics
                            .create_failures
                            .with_label_values(&[&namespace])
                            .inc();
                        recorder
                            .publish(PublishedEvent {
                                type_: EventType::Warning,
                                reason: "FailedCreate".to_string(),
                                note: Some(format!("workload creation failed: {}", err)),
                                action: "Create".to_string(),
                                secondary: None,
                            })
                            .await?;
                        return Err(err.into());
                    }
                }
            }
            Some(mut live) => {
                // During maintenance the workload is deliberately divergent
                // (scaled down, waiting for the copy); leave it alone.
                if !maintenance && diff::copy_workload_fields(&desired_workload, &mut live) {
                    info!("updating workload {}/{}", namespace, name);
                    match workloads.replace(&name, &PostParams::default(), &live).await {
                        Ok(updated) => updated,
                        Err(err) => {
                            recorder
                                .publish(PublishedEvent {
                                    type_: EventType::Warning,
                                    reason: "FailedUpdate".to_string(),
                                    note: Some(format!("workload update failed: {}", err)),
                                    action: "Update".to_string(),
                                    secondary: None,
                                })
                                .await?;
                            return Err(err.into());
                        }
                    }
                } else {
                    live
                }
            }
        };

        // Endpoint convergence.
        let endpoints: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let desired_endpoint = generators::endpoint(&session);
        match endpoints.get_opt(&name).await? {
            None => {
                info!("creating endpoint {}/{}", namespace, name);
                endpoints
                    .create(&PostParams::default(), &desired_endpoint)
                    .await?;
            }
            Some(mut live) => {
                if diff::copy_endpoint_fields(&desired_endpoint, &mut live) {
                    info!("updating endpoint {}/{}", namespace, name);
                    endpoints.replace(&name, &PostParams::default(), &live).await?;
                }
            }
        }

        // Ingress-rule convergence.
        if self.config.use_ingress {
            self.converge_ingress(&session).await?;
        }

        // Mirror the workload's ready count onto the session.
        let mut status = session.status.clone().unwrap_or_default();
        let ready = workload
            .status
            .as_ref()
            .and_then(|status| status.ready_replicas)
            .unwrap_or(0);
        if status.ready_replicas != ready {
            info!(
                "session {}/{} ready replicas {} -> {}",
                namespace, name, status.ready_replicas, ready
            );
            status.ready_replicas = ready;
            sessions
                .patch_status(
                    &name,
                    &PatchParams::default(),
                    &Patch::Merge(&json!({ "status": status })),
                )
                .await?;
        }

        // Mirror the pod's container state and extend the condition history.
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pod = pods.get_opt(&format!("{}-0", name)).await?;
        match &pod {
            Some(pod) => {
                let observed = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.container_statuses.as_ref())
                    .and_then(|statuses| statuses.first())
                    .and_then(|container| container.state.clone());
                if let Some(state) = observed {
                    if status.container_state.as_ref() != Some(&state) {
                        info!("session {}/{} container state changed", namespace, name);
                        let condition = session::next_condition(&state, Time(Utc::now()));
                        session::push_condition(&mut status.conditions, condition);
                        status.container_state = Some(state);
                        sessions
                            .patch_status(
                                &name,
                                &PatchParams::default(),
                                &Patch::Merge(&json!({ "status": status })),
                            )
                            .await?;
                    }
                }
            }
            // The workload controller will bring the pod back on its own.
            None => debug!("pod for session {}/{} not found", namespace, name),
        }

        // A crashed pod in maintenance still holds the claim the copy job
        // needs; drop the workload to zero so the claim is released.
        let pod_crashed = pod.as_ref().map(crashed).unwrap_or(false);
        if pod_crashed && maintenance {
            let replicas = workload
                .spec
                .as_ref()
                .and_then(|spec| spec.replicas)
                .unwrap_or(0);
            if replicas > 0 {
                info!(
                    "scaling down workload {}/{} so the copy job can bind its claim",
                    namespace, name
                );
                workloads
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(&json!({"spec": {"replicas": 0}})),
                    )
                    .await?;
            }
        }

        // Maintenance progression: remount once the copy job is done.
        if maintenance {
            self.progress_maintenance(sessions, &session, &workloads).await?;
        }

        // Proactive utilization check.
        if let (Some(pod), Some(policy), false) =
            (pod.as_ref(), session.spec.scale_pvc.as_ref(), maintenance)
        {
            self.check_scale(sessions, &session, pod, policy).await?;
        }

        // Idle culling.
        let now = Utc::now();
        if pod.is_some() && culler::needs_culling(&session.metadata, now, &self.config) {
            info!("session {}/{} idle past the window; stopping", namespace, name);
            let mut stopped = session.clone();
            culler::set_stop_annotation(&mut stopped.metadata, now);
            self.metrics
                .culled
                .with_label_values(&[&namespace, &name])
                .inc();
            sessions.replace(&name, &PostParams::default(), &stopped).await?;
            return Ok(None);
        }
        if pod.is_some() && !culler::stop_annotation_is_set(&session.metadata) {
            // Alive and busy; check idleness again on the configured cadence.
            return Ok(Some(self.config.idleness_check_period));
        }

        Ok(None)
    }

    async fn converge_ingress(&self, session: &Session) -> Result<()> {
        let name = session.name_any();
        let namespace = session.namespace().unwrap_or_default();
        let rules: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            &namespace,
            &generators::ingress_rule_resource(),
        );
        let desired = generators::ingress_rule(session, &self.config);
        let rule_name = generators::ingress_rule_name(&namespace, &name);
        match rules.get_opt(&rule_name).await? {
            None => {
                info!("creating ingress rule {}/{}", namespace, rule_name);
                rules.create(&PostParams::default(), &desired).await?;
            }
            Some(mut live) => {
                if diff::copy_ingress_fields(&desired, &mut live) {
                    info!("updating ingress rule {}/{}", namespace, rule_name);
                    rules.replace(&rule_name, &PostParams::default(), &live).await?;
                }
            }
        }
        Ok(())
    }

    /// While the maintenance label is up, watch the copy job; once it has
    /// succeeded, remount the session onto the largest labelled claim. The
    /// final patch repoints the volume and clears the label in one write.
    async fn progress_maintenance(
        &self,
        sessions: &Api<Session>,
        session: &Session,
        workloads: &Api<StatefulSet>,
    ) -> Result<()> {
        let name = session.name_any();
        let namespace = session.namespace().unwrap_or_default();

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let job = match jobs.get_opt(&session::scale_job_name(&name)).await? {
            Some(job) => job,
            None => {
                debug!("scale job for session {}/{} not created yet", namespace, name);
                return Ok(());
            }
        };
        let succeeded = job
            .status
            .as_ref()
            .and_then(|status| status.succeeded)
            .unwrap_or(0);
        if succeeded == 0 {
            debug!("scale job for session {}/{} still copying", namespace, name);
            return Ok(());
        }

        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        let labelled = claims
            .list(&ListParams::default().labels(&format!("{}={}", session::SESSION_LABEL, name)))
            .await?;
        let new_claim = match scale::largest_claim(labelled.items) {
            Some(claim) => claim,
            None => {
                warn!("no scaled-up claim found for session {}/{}", namespace, name);
                return Ok(());
            }
        };

        let mut volumes = session
            .spec
            .template
            .spec
            .as_ref()
            .and_then(|spec| spec.volumes.clone())
            .unwrap_or_default();
        let index = match volumes
            .iter()
            .position(|volume| volume.persistent_volume_claim.is_some())
        {
            Some(index) => index,
            None => {
                warn!(
                    "session {}/{} template mounts no claim; leaving maintenance",
                    namespace, name
                );
                sessions
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(&json!({"metadata": {"labels": {"maintenance": "false"}}})),
                    )
                    .await?;
                return Ok(());
            }
        };

        // The workload must be recreated to mount the new claim; deleting it
        // here lets the next convergence bring it back pointed at the copy.
        info!(
            "remounting session {}/{} onto claim {}",
            namespace,
            name,
            new_claim.name_any()
        );
        match workloads.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(source) = volumes[index].persistent_volume_claim.as_mut() {
            source.claim_name = new_claim.name_any();
        }
        sessions
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({
                    "metadata": {"labels": {"maintenance": "false"}},
                    "spec": {"template": {"spec": {"volumes": volumes}}},
                })),
            )
            .await?;

        self.recorder(session)
            .publish(PublishedEvent {
                type_: EventType::Normal,
                reason: "ScaleCompleted".to_string(),
                note: Some(format!("session remounted onto claim {}", new_claim.name_any())),
                action: "Scale".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }

    /// Compare volume utilization against the policy threshold and kick off
    /// a scale-up when crossed: expand in place when the driver allows it,
    /// otherwise stage the copy-job procedure.
    async fn check_scale(
        &self,
        sessions: &Api<Session>,
        session: &Session,
        pod: &Pod,
        policy: &ScalePvcPolicy,
    ) -> Result<()> {
        let name = session.name_any();
        let namespace = session.namespace().unwrap_or_default();
        let recorder = self.recorder(session);

        let volume = match scale::claim_volume(pod) {
            Some((_, volume)) => volume,
            None => {
                debug!("pod of session {}/{} mounts no claim", namespace, name);
                return Ok(());
            }
        };
        let claim_name = volume
            .persistent_volume_claim
            .as_ref()
            .map(|source| source.claim_name.clone())
            .unwrap_or_default();
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        let claim = match claims.get_opt(&claim_name).await? {
            Some(claim) => claim,
            None => {
                debug!(
                    "claim {} of session {}/{} not found",
                    claim_name, namespace, name
                );
                return Ok(());
            }
        };

        // The mount path comes from the declared template, not the live pod.
        let mount_path = match mount_path_for(session, &volume.name) {
            Some(path) => path,
            None => {
                debug!(
                    "no mount path for volume {} of session {}/{}; skipping usage check",
                    volume.name, namespace, name
                );
                return Ok(());
            }
        };

        let requested = match scale::storage_request(&claim).map(|q| scale::parse_quantity(&q.0)) {
            Some(Ok(bytes)) if bytes > 0 => bytes,
            _ => {
                debug!(
                    "claim {} of session {}/{} has no usable storage request",
                    claim_name, namespace, name
                );
                return Ok(());
            }
        };

        // Probe failures must not block the rest of convergence.
        let used = match scale::probe_used_bytes(self.client.clone(), pod, &mount_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(
                    "disk usage probe failed for session {}/{}: {}",
                    namespace, name, err
                );
                recorder
                    .publish(PublishedEvent {
                        type_: EventType::Warning,
                        reason: "ProbeFailed".to_string(),
                        note: Some(format!("disk usage probe failed: {}", err)),
                        action: "Probe".to_string(),
                        secondary: None,
                    })
                    .await?;
                return Ok(());
            }
        };

        let percent = scale::used_percent(used, requested);
        debug!(
            "claim {} of session {}/{} at {}% of {}",
            claim_name,
            namespace,
            name,
            percent,
            scale::format_quantity(requested)
        );
        if percent <= policy.threshold {
            return Ok(());
        }

        info!(
            "claim {} of session {}/{} above the {}% threshold; scaling up",
            claim_name, namespace, name, policy.threshold
        );
        let target = requested.saturating_mul(policy.scale_factor.max(1) as u64);
        if scale::expand_in_place(self.client.clone(), &claim, target).await? {
            recorder
                .publish(PublishedEvent {
                    type_: EventType::Normal,
                    reason: "ScaleInitiated".to_string(),
                    note: Some(format!(
                        "claim {} expanded in place to {}",
                        claim_name,
                        scale::format_quantity(target)
                    )),
                    action: "Scale".to_string(),
                    secondary: None,
                })
                .await?;
            return Ok(());
        }

        // Copy-job path. Ordered so that a crash between writes converges on
        // the next cycle: stage the claim, then the job, and only then flip
        // the maintenance label. Each write on its own is idempotent.
        let staged = claims
            .list(&ListParams::default().labels(&format!("{}={}", session::SESSION_LABEL, name)))
            .await?;
        let already_staged = scale::largest_claim(
            staged
                .items
                .into_iter()
                .filter(|candidate| candidate.name_any() != claim_name)
                .collect(),
        )
        .filter(|candidate| {
            scale::storage_request(candidate)
                .and_then(|q| scale::parse_quantity(&q.0).ok())
                .map(|bytes| bytes > requested)
                .unwrap_or(false)
        });
        let new_claim = match already_staged {
            Some(claim) => claim,
            None => {
                let desired = generators::scaled_claim(session, &claim, policy.scale_factor)?;
                claims.create(&PostParams::default(), &desired).await?
            }
        };

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let job = generators::scale_job(session, &claim, &new_claim);
        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("scale job for session {}/{} already exists", namespace, name);
            }
            Err(err) => return Err(err.into()),
        }

        sessions
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({"metadata": {"labels": {"maintenance": "true"}}})),
            )
            .await?;

        recorder
            .publish(PublishedEvent {
                type_: EventType::Normal,
                reason: "ScaleInitiated".to_string(),
                note: Some(format!(
                    "copying {} into {} via job {}",
                    claim_name,
                    new_claim.name_any(),
                    session::scale_job_name(&name)
                )),
                action: "Scale".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

fn crashed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|container| container.state.as_ref())
        .map(|state| state.terminated.is_some())
        .unwrap_or(false)
}

fn mount_path_for(session: &Session, volume_name: &str) -> Option<String> {
    session
        .spec
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|container| container.volume_mounts.iter().flatten())
        .find(|mount| mount.name == volume_name)
        .map(|mount| mount.mount_path.clone())
}
