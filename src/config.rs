use std::fs;
use std::thread;

/// Default number of addresses recorded per callstack.
pub const MAX_ENTRIES: usize = 128;

const POSSIBLE_CPUS: &str = "/sys/devices/system/cpu/possible";

/// Sizing of a callstack context, fixed when the context is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallstackConfig {
    /// Maximum number of addresses recorded per capture.
    pub max_depth: usize,
    /// Number of CPUs buffers are reserved for. Must cover every CPU that
    /// may ever fire an event, including ones not yet online.
    pub nr_cpus: usize,
}

impl CallstackConfig {
    pub fn with_max_depth(max_depth: usize) -> Self {
        CallstackConfig {
            max_depth,
            ..Self::default()
        }
    }
}

impl Default for CallstackConfig {
    fn default() -> Self {
        CallstackConfig {
            max_depth: MAX_ENTRIES,
            nr_cpus: possible_cpus(),
        }
    }
}

/// Number of possible CPUs on this machine, online or not.
pub fn possible_cpus() -> usize {
    fs::read_to_string(POSSIBLE_CPUS)
        .ok()
        .and_then(|list| parse_cpu_list(&list))
        .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
}

// Format: comma separated ids or ranges, e.g. "0-3,8-11"
fn parse_cpu_list(list: &str) -> Option<usize> {
    let mut highest = None;
    for part in list.trim().split(',') {
        let last = match part.split_once('-') {
            Some((_, end)) => end.parse::<usize>().ok()?,
            None => part.parse::<usize>().ok()?,
        };
        highest = highest.max(Some(last));
    }
    highest.map(|cpu| cpu + 1)
}
