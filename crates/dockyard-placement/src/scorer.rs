//! Least-loaded placement.
//!
//! For each admitted host the scorer projects utilization after the job
//! would be placed there:
//!
//! ```text
//! cpu    = (reserved_cpus   + job.cpus)   / cpus   * 100
//! memory = (reserved_memory + job.memory) / memory * 100
//! total  = (cpu + memory) / 200 * 100
//! ```
//!
//! Hosts whose capacity is below the request, or whose total would exceed
//! 100, are dropped. The lowest total wins; ties go to the lowest host id.

use serde::Serialize;
use tracing::debug;

use dockyard_core::{HostSnapshot, JobSpec};

use crate::error::{PlacementError, PlacementResult};

/// Projected utilization of one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostScore {
    pub host_id: String,
    pub cpu: f64,
    pub memory: f64,
    pub total: f64,
}

/// Percentage of `capacity` used by `used`. Zero capacity only fits zero.
fn utilization(used: f64, capacity: f64) -> f64 {
    if capacity > 0.0 {
        used / capacity * 100.0
    } else if used > 0.0 {
        f64::INFINITY
    } else {
        0.0
    }
}

/// Score one host, or `None` if the job does not fit.
pub fn score_host(job: &JobSpec, host: &HostSnapshot) -> Option<HostScore> {
    if host.cpus < job.cpus || host.memory < job.memory {
        return None;
    }
    let cpu = utilization(host.reserved_cpus + job.cpus, host.cpus);
    let memory = utilization(host.reserved_memory + job.memory, host.memory);
    let total = (cpu + memory) / 200.0 * 100.0;
    if total > 100.0 {
        return None;
    }
    Some(HostScore {
        host_id: host.host_id.clone(),
        cpu,
        memory,
        total,
    })
}

/// Score every host that fits, least loaded first.
pub fn rank_hosts(job: &JobSpec, hosts: &[HostSnapshot]) -> Vec<HostScore> {
    let mut scores: Vec<HostScore> = hosts.iter().filter_map(|h| score_host(job, h)).collect();
    scores.sort_by(|a, b| {
        a.total
            .total_cmp(&b.total)
            .then_with(|| a.host_id.cmp(&b.host_id))
    });
    scores
}

/// Pick the least loaded host for `job`.
pub fn place(job: &JobSpec, hosts: &[HostSnapshot]) -> PlacementResult<HostSnapshot> {
    let ranked = rank_hosts(job, hosts);
    for s in &ranked {
        debug!(host = %s.host_id, cpu = s.cpu, memory = s.memory, total = s.total, "placement score");
    }
    let best = ranked.first().ok_or(PlacementError::NoResources)?;
    hosts
        .iter()
        .find(|h| h.host_id == best.host_id)
        .cloned()
        .ok_or(PlacementError::NoResources)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_snapshot(id: &str, cpus: f64, memory: f64, reserved_cpus: f64, reserved_memory: f64) -> HostSnapshot {
        HostSnapshot {
            host_id: id.to_string(),
            cpus,
            memory,
            reserved_cpus,
            reserved_memory,
        }
    }

    #[test]
    fn picks_less_reserved_host() {
        let job = JobSpec::new("redis").with_resources(1.0, 512.0);
        let hosts = vec![
            make_snapshot("b", 4.0, 4096.0, 2.0, 2048.0),
            make_snapshot("a", 4.0, 4096.0, 1.0, 1024.0),
        ];
        assert_eq!(place(&job, &hosts).unwrap().host_id, "a");

        let hosts = vec![
            make_snapshot("a", 4.0, 4096.0, 2.0, 2048.0),
            make_snapshot("b", 4.0, 4096.0, 1.0, 1024.0),
        ];
        assert_eq!(place(&job, &hosts).unwrap().host_id, "b");
    }

    #[test]
    fn score_formula() {
        let job = JobSpec::new("redis").with_resources(1.0, 1024.0);
        let s = score_host(&job, &make_snapshot("a", 4.0, 4096.0, 1.0, 0.0)).unwrap();
        assert_eq!(s.cpu, 50.0);
        assert_eq!(s.memory, 25.0);
        assert_eq!(s.total, 37.5);
    }

    #[test]
    fn fails_when_every_host_would_overcommit() {
        let job = JobSpec::new("redis").with_resources(2.0, 2048.0);
        let hosts = vec![
            make_snapshot("a", 4.0, 4096.0, 3.0, 3072.0),
            make_snapshot("b", 2.0, 2048.0, 1.0, 1024.0),
        ];
        let err = place(&job, &hosts).unwrap_err();
        assert!(matches!(err, PlacementError::NoResources));
        assert_eq!(err.to_string(), "no resources available");
    }

    #[test]
    fn drops_hosts_smaller_than_request() {
        let job = JobSpec::new("big").with_resources(8.0, 1024.0);
        let hosts = vec![
            make_snapshot("small", 4.0, 65536.0, 0.0, 0.0),
            make_snapshot("large", 16.0, 16384.0, 8.0, 8192.0),
        ];
        assert_eq!(place(&job, &hosts).unwrap().host_id, "large");
    }

    #[test]
    fn one_dimension_may_exceed_if_total_fits() {
        // cpu 125%, memory 25%: total 75
        let job = JobSpec::new("cpu-heavy").with_resources(1.0, 1024.0);
        let s = score_host(&job, &make_snapshot("a", 4.0, 4096.0, 4.0, 0.0)).unwrap();
        assert_eq!(s.total, 75.0);
    }

    #[test]
    fn ties_break_on_lowest_host_id() {
        let job = JobSpec::new("redis").with_resources(1.0, 512.0);
        let hosts = vec![
            make_snapshot("node-c", 4.0, 4096.0, 0.0, 0.0),
            make_snapshot("node-a", 4.0, 4096.0, 0.0, 0.0),
            make_snapshot("node-b", 4.0, 4096.0, 0.0, 0.0),
        ];
        assert_eq!(place(&job, &hosts).unwrap().host_id, "node-a");
    }

    #[test]
    fn zero_request_on_empty_hosts() {
        let job = JobSpec::new("tiny");
        let hosts = vec![make_snapshot("a", 0.0, 0.0, 0.0, 0.0)];
        assert_eq!(rank_hosts(&job, &hosts)[0].total, 0.0);
    }

    #[test]
    fn no_hosts_means_no_resources() {
        assert!(matches!(
            place(&JobSpec::new("redis"), &[]),
            Err(PlacementError::NoResources)
        ));
    }
}
