//! Host discovery from environment variables.
//!
//! With prefix `DOCKER_HOST_` the following keys describe host 0:
//!
//! ```text
//! DOCKER_HOST_0=tcp://10.0.0.5:2375
//! DOCKER_HOST_0_LABEL=ssd,us-east
//! DOCKER_HOST_0_CPU=4
//! DOCKER_HOST_0_MEM=8192
//! ```
//!
//! Indices need not be contiguous. Missing `_CPU`/`_MEM` fall back to the
//! configured defaults.

use std::collections::BTreeMap;

use crate::config::DiscoveryConfig;
use crate::types::HostInfo;

/// Identity given to the fallback host when no variables are set.
pub const DEFAULT_HOST_ID: &str = "local";

#[derive(Default)]
struct Partial {
    addr: Option<String>,
    labels: Vec<String>,
    cpus: Option<f64>,
    memory: Option<f64>,
}

/// Build host entries from `(key, value)` pairs, ordered by index.
///
/// Unparseable CPU or memory values are ignored with a warning. An index
/// that has attributes but no address is dropped. If nothing is found a
/// single host at `config.default_addr` is returned.
pub fn discover_hosts<I, K, V>(config: &DiscoveryConfig, vars: I) -> Vec<HostInfo>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut found: BTreeMap<u32, Partial> = BTreeMap::new();

    for (key, value) in vars {
        let Some(rest) = key.as_ref().strip_prefix(config.prefix.as_str()) else {
            continue;
        };
        let value = value.as_ref().trim();
        let (index, suffix) = match rest.split_once('_') {
            Some((idx, suffix)) => (idx, Some(suffix)),
            None => (rest, None),
        };
        let Ok(index) = index.parse::<u32>() else {
            continue;
        };
        let entry = found.entry(index).or_default();

        match suffix {
            None => entry.addr = Some(value.to_string()),
            Some("LABEL") => {
                entry.labels = value
                    .split(',')
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect();
            }
            Some("CPU") => match value.parse() {
                Ok(cpus) => entry.cpus = Some(cpus),
                Err(_) => tracing::warn!(key = key.as_ref(), value, "ignoring invalid cpu count"),
            },
            Some("MEM") => match value.parse() {
                Ok(mem) => entry.memory = Some(mem),
                Err(_) => tracing::warn!(key = key.as_ref(), value, "ignoring invalid memory"),
            },
            Some(_) => {}
        }
    }

    let hosts: Vec<HostInfo> = found
        .into_iter()
        .filter_map(|(index, p)| {
            let addr = p.addr.filter(|a| !a.is_empty())?;
            Some(
                HostInfo::new(
                    format!("host-{index}"),
                    addr,
                    p.cpus.unwrap_or(config.default_cpus),
                    p.memory.unwrap_or(config.default_memory),
                )
                .with_labels(p.labels),
            )
        })
        .collect();

    if hosts.is_empty() {
        tracing::debug!(addr = %config.default_addr, "no hosts in environment, using default");
        return vec![HostInfo::new(
            DEFAULT_HOST_ID,
            config.default_addr.clone(),
            config.default_cpus,
            config.default_memory,
        )];
    }
    hosts
}
