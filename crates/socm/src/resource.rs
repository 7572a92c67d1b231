//! Cluster resources and Quality-of-Service admission.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A named admission policy on a cluster.
///
/// Any absent limit means "unlimited". Policies are immutable after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosPolicy {
    pub name: String,
    /// Maximum walltime in minutes per job.
    pub max_walltime: Option<u32>,
    /// Maximum number of concurrently outstanding jobs.
    pub max_jobs: Option<u32>,
    /// Maximum total cores over all outstanding jobs.
    pub max_cores: Option<u32>,
}

impl QosPolicy {
    pub fn new(
        name: &str,
        max_walltime: Option<u32>,
        max_jobs: Option<u32>,
        max_cores: Option<u32>,
    ) -> Self {
        Self {
            name: name.to_string(),
            max_walltime,
            max_jobs,
            max_cores,
        }
    }
}

#[derive(Debug, Clone)]
struct OutstandingJob {
    #[allow(dead_code)]
    job_id: String,
    #[allow(dead_code)]
    walltime_minutes: f64,
    cores: u32,
}

/// A batch-scheduled cluster: node/core/memory capacities plus its QoS
/// ladder, and a per-process table of outstanding jobs per QoS.
///
/// The QoS list order is significant and comes from the cluster
/// definition: smaller, shorter policies first, so short jobs never
/// consume capacity of a long-running QoS.
#[derive(Debug)]
pub struct Resource {
    pub name: String,
    pub nodes: u32,
    pub cores_per_node: u32,
    pub memory_per_node_mb: u64,
    pub qos: Vec<QosPolicy>,
    outstanding: Mutex<HashMap<String, Vec<OutstandingJob>>>,
}

impl Resource {
    pub fn new(
        name: &str,
        nodes: u32,
        cores_per_node: u32,
        memory_per_node_mb: u64,
        qos: Vec<QosPolicy>,
    ) -> Self {
        Self {
            name: name.to_string(),
            nodes,
            cores_per_node,
            memory_per_node_mb,
            qos,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Total core count of the cluster.
    pub fn total_cores(&self) -> u32 {
        self.nodes * self.cores_per_node
    }

    /// Scan the QoS list in order and return the first policy that admits a
    /// job of the given walltime and core count, accounting for outstanding
    /// jobs. Returns `None` when no policy fits.
    pub fn fits_in_qos(&self, walltime_minutes: f64, cores: u32) -> Option<QosPolicy> {
        let outstanding = self.outstanding.lock();
        self.qos
            .iter()
            .find(|policy| Self::policy_admits(policy, &outstanding, walltime_minutes, cores))
            .cloned()
    }

    /// Atomically re-check admission and register the job against the first
    /// fitting policy. Returns whether the registration succeeded.
    pub fn register_job(&self, job_id: &str, walltime_minutes: f64, cores: u32) -> bool {
        let mut outstanding = self.outstanding.lock();
        let Some(policy) = self
            .qos
            .iter()
            .find(|policy| Self::policy_admits(policy, &outstanding, walltime_minutes, cores))
        else {
            return false;
        };
        outstanding
            .entry(policy.name.clone())
            .or_default()
            .push(OutstandingJob {
                job_id: job_id.to_string(),
                walltime_minutes,
                cores,
            });
        true
    }

    fn policy_admits(
        policy: &QosPolicy,
        outstanding: &HashMap<String, Vec<OutstandingJob>>,
        walltime_minutes: f64,
        cores: u32,
    ) -> bool {
        static EMPTY: Vec<OutstandingJob> = Vec::new();
        let jobs = outstanding.get(&policy.name).unwrap_or(&EMPTY);
        if let Some(max_walltime) = policy.max_walltime {
            if f64::from(max_walltime) < walltime_minutes {
                return false;
            }
        }
        if let Some(max_cores) = policy.max_cores {
            let used: u32 = jobs.iter().map(|job| job.cores).sum();
            if max_cores.saturating_sub(used) < cores {
                return false;
            }
        }
        if let Some(max_jobs) = policy.max_jobs {
            if jobs.len() as u32 >= max_jobs {
                return false;
            }
        }
        true
    }
}

/// The built-in cluster definitions, keyed by resource name.
pub fn registered_resources() -> HashMap<String, Arc<Resource>> {
    let mut registry = HashMap::new();

    registry.insert(
        "tiger3".to_string(),
        Arc::new(Resource::new(
            "tiger3",
            492,
            112,
            1_000_000,
            vec![
                QosPolicy::new("test", Some(60), Some(1), Some(8_000)),
                QosPolicy::new("vshort", Some(300), Some(2_000), Some(55_104)),
                QosPolicy::new("short", Some(1_440), Some(50), Some(8_000)),
                QosPolicy::new("medium", Some(4_320), Some(80), Some(4_000)),
                QosPolicy::new("long", Some(8_640), Some(16), Some(1_000)),
                QosPolicy::new("vlong", Some(21_600), Some(8), Some(900)),
            ],
        )),
    );

    registry.insert(
        "perlmutter".to_string(),
        Arc::new(Resource::new(
            "perlmutter",
            3_072,
            128,
            1_000_000,
            vec![
                QosPolicy::new("debug", Some(30), Some(5), Some(1_024)),
                QosPolicy::new("interactive", Some(240), Some(2), Some(512)),
                QosPolicy::new("shared_interactive", Some(240), Some(2), Some(64)),
                QosPolicy::new("regular", Some(2_880), Some(5_000), Some(393_216)),
            ],
        )),
    );

    registry.insert(
        "universe".to_string(),
        Arc::new(Resource::new(
            "universe",
            28,
            224,
            1_000_000,
            vec![QosPolicy::new("main", Some(43_200), Some(5_000), Some(6_272))],
        )),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> Resource {
        Resource::new(
            "testbed",
            4,
            16,
            128_000,
            vec![
                QosPolicy::new("short", Some(60), Some(2), Some(32)),
                QosPolicy::new("long", Some(1_440), Some(4), Some(64)),
            ],
        )
    }

    #[test]
    fn first_fitting_policy_wins() {
        let res = resource();
        let policy = res.fits_in_qos(30.0, 16).unwrap();
        assert_eq!(policy.name, "short");
    }

    #[test]
    fn long_jobs_skip_short_policies() {
        let res = resource();
        let policy = res.fits_in_qos(600.0, 16).unwrap();
        assert_eq!(policy.name, "long");
    }

    #[test]
    fn no_policy_for_oversized_jobs() {
        let res = resource();
        assert!(res.fits_in_qos(30.0, 128).is_none());
        assert!(res.fits_in_qos(10_000.0, 1).is_none());
    }

    #[test]
    fn fits_is_idempotent_without_registration() {
        let res = resource();
        let first = res.fits_in_qos(30.0, 16).unwrap();
        let second = res.fits_in_qos(30.0, 16).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn registration_consumes_capacity() {
        let res = resource();
        assert!(res.register_job("a", 30.0, 24));
        // 8 cores left in "short"; a 16-core job must fall through to "long".
        let policy = res.fits_in_qos(30.0, 16).unwrap();
        assert_eq!(policy.name, "long");
        assert!(res.register_job("b", 30.0, 16));
        assert!(res.register_job("c", 30.0, 8));
        // "short" is now at its 2-job limit.
        let policy = res.fits_in_qos(5.0, 1).unwrap();
        assert_eq!(policy.name, "long");
    }

    #[test]
    fn registration_fails_when_nothing_fits() {
        let res = resource();
        assert!(!res.register_job("big", 30.0, 1_000));
    }

    #[test]
    fn registry_contains_default_resource() {
        let registry = registered_resources();
        let tiger = &registry["tiger3"];
        assert_eq!(tiger.total_cores(), 492 * 112);
        assert_eq!(tiger.qos[0].name, "test");
    }
}
