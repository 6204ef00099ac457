//! NUMA topology discovery and thread pinning.
//!
//! Linux exposes domains under `/sys/devices/system/node`; each domain's
//! `cpulist` names its CPUs. Threads pin with `sched_setaffinity`, after
//! which first-touch allocation keeps a partition's arrays on its domain.
//! Hosts without that information (or other platforms) degrade to a single
//! domain covering every CPU, which turns the whole layer into a no-op.

/// One NUMA domain and the CPUs it owns.
#[derive(Clone, Debug)]
pub struct Domain {
    /// Kernel node id.
    pub id: usize,
    /// CPUs local to this domain.
    pub cpus: Vec<usize>,
}

/// The machine's NUMA layout as seen at startup.
#[derive(Clone, Debug)]
pub struct Topology {
    domains: Vec<Domain>,
}

impl Topology {
    /// Discovers the topology, falling back to one domain spanning all
    /// CPUs when nothing better is available.
    pub fn detect() -> Self {
        detect_linux().unwrap_or_else(Self::single_domain)
    }

    /// A degenerate single-domain topology (the graceful fallback).
    pub fn single_domain() -> Self {
        let cpus = (0..std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1))
            .collect();
        Self {
            domains: vec![Domain { id: 0, cpus }],
        }
    }

    /// Number of domains (always at least 1).
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    /// The domains in id order.
    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    /// Threads the machine can run at once.
    pub fn cpu_count(&self) -> usize {
        self.domains.iter().map(|d| d.cpus.len()).sum::<usize>().max(1)
    }
}

#[cfg(target_os = "linux")]
fn detect_linux() -> Option<Topology> {
    let mut domains = Vec::new();
    let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(id) = name
            .strip_prefix("node")
            .and_then(|rest| rest.parse::<usize>().ok())
        else {
            continue;
        };
        let cpulist = std::fs::read_to_string(entry.path().join("cpulist")).ok()?;
        let cpus = parse_cpulist(cpulist.trim());
        if !cpus.is_empty() {
            domains.push(Domain { id, cpus });
        }
    }
    if domains.is_empty() {
        return None;
    }
    domains.sort_by_key(|d| d.id);
    Some(Topology { domains })
}

#[cfg(not(target_os = "linux"))]
fn detect_linux() -> Option<Topology> {
    None
}

/// Parses the kernel's cpulist format, e.g. `0-3,8,10-11`.
fn parse_cpulist(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// Pins the calling thread to `domain`'s CPUs.
///
/// Returns whether the pin took effect; failure is logged and harmless
/// (the thread simply floats).
pub fn pin_current_thread(topology: &Topology, domain: usize) -> bool {
    let Some(dom) = topology.domains().get(domain) else {
        return false;
    };
    pin_to_cpus(&dom.cpus)
}

#[cfg(target_os = "linux")]
fn pin_to_cpus(cpus: &[usize]) -> bool {
    if cpus.is_empty() {
        return false;
    }
    // SAFETY: cpu_set_t is plain data; CPU_ZERO/CPU_SET only write into it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            if cpu < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(cpu, &mut set);
            }
        }
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            tracing::warn!(errno = *libc::__errno_location(), "sched_setaffinity failed");
            return false;
        }
    }
    true
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpus(_cpus: &[usize]) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpulist_parsing() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0-1,4,6-7"), vec![0, 1, 4, 6, 7]);
        assert_eq!(parse_cpulist("5"), vec![5]);
        assert!(parse_cpulist("").is_empty());
    }

    #[test]
    fn detect_always_yields_a_domain() {
        let topology = Topology::detect();
        assert!(topology.domain_count() >= 1);
        assert!(topology.cpu_count() >= 1);
    }

    #[test]
    fn pinning_to_a_known_domain_is_harmless() {
        let topology = Topology::detect();
        // Either it works or it degrades; both are acceptable here.
        let _ = pin_current_thread(&topology, 0);
        assert!(!pin_current_thread(&topology, topology.domain_count()));
    }
}
