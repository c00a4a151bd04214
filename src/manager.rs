use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, SelectAll};
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event as CoreEvent, Pod};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use log::{debug, info, warn};
use tokio_util::time::DelayQueue;

use crate::config::Config;
use crate::correlator;
use crate::errors::*;
use crate::metrics::Metrics;
use crate::queue::{Backoff, RequestKey, WorkQueue};
use crate::reconciler::Reconciler;
use crate::session::{Session, SESSION_NAME_LABEL};

/// Retry pacing for failed reconciles.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct Manager {}

/// Manager that wires the watch fabric to the reconciler.
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` plus a drainer future to be awaited; the
    /// drainer runs the watches and the work queue until it is dropped.
    /// It is up to `main` to wait for it.
    pub async fn new(client: Client, config: Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        // Fail startup loudly when the CRD is missing rather than watching a
        // kind that cannot materialize.
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        crds.get("sessions.sessions.example.org")
            .await
            .chain_err(|| "session custom resource definition is not installed")?;

        let metrics = Metrics::new(prometheus::default_registry())?;
        let reconciler = Reconciler::new(client.clone(), config, metrics);
        let triggers = trigger_streams(client);
        let drainer = drain(reconciler, triggers).boxed();

        Ok((Self {}, drainer))
    }
}

/// Merge the per-kind watches into one stream of request keys. Each watch
/// maps its objects to the identity that should wake up: sessions and
/// child-kind events under their own name, workloads and pods under the
/// owning session's name.
fn trigger_streams(client: Client) -> SelectAll<BoxStream<'static, RequestKey>> {
    let sessions: Api<Session> = Api::all(client.clone());
    let session_keys = watcher(sessions, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .filter_map(|step| async move {
            match step {
                Ok(session) => Some(RequestKey::new(
                    session.namespace().unwrap_or_default(),
                    session.name_any(),
                )),
                Err(err) => {
                    warn!("session watch error: {}", err);
                    None
                }
            }
        })
        .boxed();

    let workloads: Api<StatefulSet> = Api::all(client.clone());
    let workload_keys = watcher(workloads, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .filter_map(|step| async move {
            match step {
                Ok(workload) => owned_by_session(&workload).then(|| {
                    RequestKey::new(workload.namespace().unwrap_or_default(), workload.name_any())
                }),
                Err(err) => {
                    warn!("workload watch error: {}", err);
                    None
                }
            }
        })
        .boxed();

    let pods: Api<Pod> = Api::all(client.clone());
    let pod_keys = watcher(pods, watcher::Config::default().labels(SESSION_NAME_LABEL))
        .default_backoff()
        .touched_objects()
        .filter_map(|step| async move {
            match step {
                Ok(pod) => {
                    let session = pod.labels().get(SESSION_NAME_LABEL).cloned()?;
                    Some(RequestKey::new(pod.namespace().unwrap_or_default(), session))
                }
                Err(err) => {
                    warn!("pod watch error: {}", err);
                    None
                }
            }
        })
        .boxed();

    // Child-kind events ride the same queue under their own name; the
    // reconciler reads the key as an event first and falls through. Events
    // for sessions that are already gone are enqueued on purpose.
    let events: Api<CoreEvent> = Api::all(client);
    let event_keys = watcher(events, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .filter_map(|step| async move {
            match step {
                Ok(event) => correlator::is_child_event(&event).then(|| {
                    RequestKey::new(event.namespace().unwrap_or_default(), event.name_any())
                }),
                Err(err) => {
                    warn!("event watch error: {}", err);
                    None
                }
            }
        })
        .boxed();

    stream::select_all([session_keys, workload_keys, pod_keys, event_keys])
}

fn owned_by_session(workload: &StatefulSet) -> bool {
    workload
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.kind == "Session" && r.controller.unwrap_or(false))
        })
        .unwrap_or(false)
}

/// Single-worker drain loop. Keys deduplicate while queued, failed keys
/// retry with exponential backoff, and requeue-after hints come back through
/// a delay queue feeding the same stream of work. One worker means the
/// volume scale-up procedure can never interleave with itself.
async fn drain(reconciler: Reconciler, mut triggers: SelectAll<BoxStream<'static, RequestKey>>) {
    let mut queue = WorkQueue::new();
    let mut backoff = Backoff::new(BACKOFF_BASE, BACKOFF_MAX);
    let mut delayed: DelayQueue<RequestKey> = DelayQueue::new();

    loop {
        if queue.is_empty() {
            let has_delayed = !delayed.is_empty();
            tokio::select! {
                maybe = triggers.next() => match maybe {
                    Some(key) => queue.push(key),
                    None => break,
                },
                expired = futures::future::poll_fn(|cx| delayed.poll_expired(cx)), if has_delayed => {
                    if let Some(expired) = expired {
                        queue.push(expired.into_inner());
                    }
                }
            }
        }

        // Collapse whatever else is already waiting before picking up work.
        while let Some(Some(key)) = triggers.next().now_or_never() {
            queue.push(key);
        }
        while let Some(expired) = futures::future::poll_fn(|cx| delayed.poll_expired(cx))
            .now_or_never()
            .flatten()
        {
            queue.push(expired.into_inner());
        }

        let key = match queue.pop() {
            Some(key) => key,
            None => continue,
        };
        match reconciler.reconcile(&key).await {
            Ok(requeue_after) => {
                backoff.reset(&key);
                if let Some(delay) = requeue_after {
                    debug!("requeueing {} after {:?}", key, delay);
                    delayed.insert(key, delay);
                }
            }
            Err(err) => {
                let delay = backoff.next_delay(&key);
                warn!("reconcile of {} failed (retry in {:?}): {}", key, delay, err);
                delayed.insert(key, delay);
            }
        }
    }
    info!("trigger streams ended; work queue drained");
}
