//! evstat library - hardware performance counter management.
//!
//! Parses textual event specifications into counter groups, opens one
//! kernel counter per event per CPU (or per measured thread), and reads the
//! counts back corrected for multiplexing.
//!
//! # Modules
//!
//! - [`spec`] - event specification parsing
//! - [`pmu`] - event name lookup: generic events, sysfs PMUs, JSON lists
//! - [`event_list`] - the counter table: attach, read, scale, aggregate
//! - [`perf`] - the `perf_event_open(2)` ABI
//! - [`session`] - the `evstat` command-line session
//!
//! # Example
//!
//! ```no_run
//! use evstat::{EventList, EventResolver, TargetSpec};
//!
//! let resolver = EventResolver::from_system();
//! let mut list = EventList::new();
//! list.parse_events("{instructions,cpu-cycles},cache-misses", &resolver)
//!     .expect("bad event list");
//! list.setup_events(&TargetSpec::all_cpus()).expect("cannot open counters");
//!
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! list.read_all_events();
//! for (id, event) in list.events() {
//!     println!("{} {}", event.display_name(), list.aggregate(id));
//! }
//! ```

pub mod backend;
pub mod command;
pub mod config;
pub mod cpulist;
pub mod error;
pub mod event_list;
pub mod output;
pub mod perf;
pub mod pmu;
pub mod session;
pub mod spec;

pub use backend::{CounterBackend, PerfBackend};
pub use config::{StatConfig, DEFAULT_EVENTS};
pub use cpulist::parse_cpu_list;
pub use error::{Error, Result};
pub use event_list::{
    CounterValue, EventId, EventList, Scope, Target, TargetId, TargetSpec,
};
pub use pmu::{EventDatabase, EventResolver};
pub use spec::{EventDefinition, Group};
