use k8s_openapi::api::core::v1::{Event as CoreEvent, ObjectReference, Pod};
use kube::{Api, Client};

use crate::errors::*;
use crate::session::SESSION_NAME_LABEL;

/// Kinds whose events are re-emitted against the owning session. Anything
/// else is dropped before it reaches the queue.
pub fn is_child_event(event: &CoreEvent) -> bool {
    matches!(
        event.involved_object.kind.as_deref(),
        Some("Pod") | Some("StatefulSet")
    )
}

/// Resolve the involved object of a child event to its session name.
/// Workload names equal session names; pods carry the name in a label.
/// An involved object of any other kind, or a pod without the label, is not
/// ours and yields an error.
pub async fn session_for_involved_object(
    client: Client,
    namespace: &str,
    involved: &ObjectReference,
) -> Result<Option<String>> {
    let name = involved.name.clone().unwrap_or_default();
    match involved.kind.as_deref() {
        Some("StatefulSet") => Ok(Some(name)),
        Some("Pod") => {
            let pods: Api<Pod> = Api::namespaced(client, namespace);
            match pods.get_opt(&name).await? {
                Some(pod) => match pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(SESSION_NAME_LABEL))
                {
                    Some(session) => Ok(Some(session.clone())),
                    None => bail!(ErrorKind::UnrelatedEvent("Pod".to_string())),
                },
                // The pod is already gone; nothing to correlate against.
                None => Ok(None),
            }
        }
        other => bail!(ErrorKind::UnrelatedEvent(
            other.unwrap_or("<none>").to_string()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_for_kind(kind: Option<&str>) -> CoreEvent {
        CoreEvent {
            involved_object: ObjectReference {
                kind: kind.map(String::from),
                name: Some("s".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn only_pod_and_workload_events_pass() {
        assert!(is_child_event(&event_for_kind(Some("Pod"))));
        assert!(is_child_event(&event_for_kind(Some("StatefulSet"))));
        assert!(!is_child_event(&event_for_kind(Some("Service"))));
        assert!(!is_child_event(&event_for_kind(Some("Job"))));
        assert!(!is_child_event(&event_for_kind(None)));
    }
}
