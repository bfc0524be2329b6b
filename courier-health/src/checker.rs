//! Readiness tracking

use std::{collections::BTreeMap, fmt};

use courier_common::internal;
use serde::Serialize;

/// Something whose readiness the process depends on
pub trait Probe: Send + Sync {
    fn is_ready(&self) -> bool;
}

impl<F> Probe for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_ready(&self) -> bool {
        self()
    }
}

/// Tracks the readiness of every registered component
///
/// With nothing registered the process is ready.
#[derive(Default)]
pub struct HealthChecker {
    probes: Vec<(String, Box<dyn Probe>)>,
}

impl fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthChecker")
            .field(
                "probes",
                &self.probes.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl HealthChecker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a probe that must report ready for the process to be ready
    pub fn register(&mut self, name: impl Into<String>, probe: impl Probe + 'static) {
        self.probes.push((name.into(), Box::new(probe)));
    }

    /// If we can run this, the process is alive
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        true
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        let ready = self.probes.iter().all(|(_, probe)| probe.is_ready());

        if !ready {
            internal!(level = DEBUG, "Readiness check failed");
        }

        ready
    }

    /// The state of every probe, for the readiness response body
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        let probes: BTreeMap<String, bool> = self
            .probes
            .iter()
            .map(|(name, probe)| (name.clone(), probe.is_ready()))
            .collect();

        HealthStatus {
            alive: self.is_alive(),
            ready: probes.values().all(|ready| *ready),
            probes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub alive: bool,
    pub ready: bool,
    pub probes: BTreeMap<String, bool>,
}
