use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::event_list::TargetSpec;

/// Events measured when none are given on the command line.
pub const DEFAULT_EVENTS: &str = "instructions,cpu-cycles,cache-misses,cache-references";

/// Runtime options for a counting session, separated from the CLI parsing
/// concerns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatConfig {
    /// Verbosity level (0 = warn, 1 = info, 2 = debug, 3+ = trace).
    /// Any level above 0 also dumps the counter open arguments.
    pub verbosity: u8,
    /// Event specifications, one per `-e`
    pub events: Vec<String>,
    /// Count everything on every CPU
    pub all_cpus: bool,
    /// Attach to an already running process
    pub pid: Option<i32>,
    /// Restrict counting to these CPUs
    pub cpus: Option<Vec<u32>>,
    /// Print the counters every interval
    pub interval: Option<Duration>,
    /// Print per-CPU values instead of sums
    pub no_aggr: bool,
    /// perfmon JSON event list
    pub event_file: Option<PathBuf>,
    /// Command to launch and measure
    pub command: Vec<String>,
}

impl StatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() && !self.all_cpus && self.pid.is_none() {
            bail!("Specify a command to run, -a or -p");
        }
        if let Some(pid) = self.pid {
            if self.all_cpus {
                bail!("-a and -p cannot be combined");
            }
            if !self.command.is_empty() {
                bail!("-p cannot be combined with a command");
            }
            if pid <= 0 {
                bail!("Invalid pid {}", pid);
            }
        }
        if self.interval == Some(Duration::ZERO) {
            bail!("Interval must be at least 1ms");
        }
        if self.events.iter().any(|e| e.trim().is_empty()) {
            bail!("Empty event list");
        }
        Ok(())
    }

    /// The event specifications to parse, in order.
    pub fn event_specs(&self) -> Vec<&str> {
        if self.events.is_empty() {
            vec![DEFAULT_EVENTS]
        } else {
            self.events.iter().map(String::as_str).collect()
        }
    }

    /// Where to attach the counters. `child` is the pid of the launched
    /// command, if there is one.
    pub fn target_spec(&self, child: Option<i32>) -> TargetSpec {
        let spec = match (self.all_cpus, self.pid.or(child)) {
            (false, Some(pid)) => TargetSpec::process(pid),
            _ => TargetSpec::all_cpus(),
        };
        let spec = spec.with_enable_on_exec(!self.all_cpus && child.is_some());
        match &self.cpus {
            Some(cpus) => spec.with_cpus(cpus.clone()),
            None => spec,
        }
    }

    /// Default `tracing` filter for the verbosity level.
    pub fn log_level(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
