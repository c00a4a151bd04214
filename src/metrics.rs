use prometheus::{IntCounterVec, Opts, Registry};

use crate::errors::*;

/// Counters the controller maintains. Everything else about a session is
/// observable from the cluster and needs no separate export.
#[derive(Clone)]
pub struct Metrics {
    /// Workload creations attempted, by namespace.
    pub created: IntCounterVec,
    /// Workload creations that the API rejected, by namespace.
    pub create_failures: IntCounterVec,
    /// Sessions stopped for idleness, by namespace and name.
    pub culled: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let created = IntCounterVec::new(
            Opts::new("session_create_total", "Session workloads created"),
            &["namespace"],
        )?;
        let create_failures = IntCounterVec::new(
            Opts::new("session_create_failed_total", "Session workload creations rejected"),
            &["namespace"],
        )?;
        let culled = IntCounterVec::new(
            Opts::new("session_culling_total", "Sessions stopped for idleness"),
            &["namespace", "name"],
        )?;
        registry.register(Box::new(created.clone()))?;
        registry.register(Box::new(create_failures.clone()))?;
        registry.register(Box::new(culled.clone()))?;
        Ok(Self {
            created,
            create_failures,
            culled,
        })
    }
}
