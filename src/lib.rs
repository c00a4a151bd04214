#[macro_use]
extern crate error_chain;

pub mod config;
pub mod correlator;
pub mod culler;
pub mod diff;
pub mod generators;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod scale;
pub mod session;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Kube(kube::Error);
            SerdeJson(serde_json::Error);
            Prometheus(prometheus::Error);
        }
        errors {
            InvalidSessionSpec(reason: String) {
                description("session spec cannot be materialized")
                display("invalid session spec: {}", reason)
            }
            UnrelatedEvent(kind: String) {
                description("event does not belong to a session")
                display("event involves unrelated kind {:?}", kind)
            }
            MalformedQuantity(quantity: String) {
                description("unparseable resource quantity")
                display("malformed quantity {:?}", quantity)
            }
        }
    }
}

/*
A Session declares one interactive compute workload. The controller keeps a
stable-identity singleton workload, a cluster-internal endpoint and
(optionally) a gateway routing rule converged with each Session, mirrors the
pod's container state back onto the Session status, idles sessions that have
seen no activity past a configurable window, and grows the backing volume
claim when utilization crosses the declared threshold.

Growing a claim that the storage driver cannot expand in place is a
multi-cycle procedure: stage a larger claim, copy the data across with a
one-shot job while the pod is down, then re-point the Session at the new
claim and recreate the workload. Every step of that procedure is recoverable
from labels, annotations and child objects alone, so a controller restart at
any point resumes where the last write left off.

All triggers (Sessions, their workloads, their pods, and child-kind events)
funnel into a single deduplicating work queue drained by one worker, which
keeps the multi-cycle volume procedure from interleaving with itself.
*/
