//! CPU list handling: `0,2-3` style lists and the sysfs CPU sets.

use std::fs;
use std::path::Path;

use regex::Regex;

use crate::error::{Error, Result};

const SYSFS_CPU_DIR: &str = "/sys/devices/system/cpu";

/// Largest `NR_CPUS` the kernel can be configured with.
pub const MAX_CPUS: u32 = 8192;

/// Parse a kernel-style CPU list (`"0,2-3"`) into sorted, de-duplicated CPU
/// indices.
pub fn parse_cpu_list(list: &str) -> Result<Vec<u32>> {
    let range_re = Regex::new(r"^(\d+)(?:-(\d+))?$").unwrap();
    let trimmed = list.trim().trim_end_matches('\0');
    if trimmed.is_empty() {
        return Err(Error::cpu_list(list, "empty list"));
    }

    let mut cpus = Vec::new();
    for part in trimmed.split(',') {
        let part = part.trim();
        let cap = range_re
            .captures(part)
            .ok_or_else(|| Error::cpu_list(list, format!("bad element '{part}'")))?;
        let start: u32 = cap[1]
            .parse()
            .map_err(|_| Error::cpu_list(list, format!("bad cpu '{}'", &cap[1])))?;
        let end: u32 = match cap.get(2) {
            Some(end) => end
                .as_str()
                .parse()
                .map_err(|_| Error::cpu_list(list, format!("bad cpu '{}'", end.as_str())))?,
            None => start,
        };
        if end < start {
            return Err(Error::cpu_list(list, format!("descending range '{part}'")));
        }
        if end >= MAX_CPUS {
            return Err(Error::cpu_list(list, format!("cpu {end} out of range")));
        }
        cpus.extend(start..=end);
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

fn read_cpu_file(path: &Path) -> Result<Vec<u32>> {
    let buf = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_cpu_list(&buf)
}

/// CPUs that can ever be brought online on this machine.
pub fn possible_cpus() -> Result<Vec<u32>> {
    read_cpu_file(&Path::new(SYSFS_CPU_DIR).join("possible"))
}

/// CPUs currently online.
pub fn online_cpus() -> Result<Vec<u32>> {
    read_cpu_file(&Path::new(SYSFS_CPU_DIR).join("online"))
}
