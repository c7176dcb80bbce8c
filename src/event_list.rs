//! The counter table.
//!
//! An [`EventList`] owns the parsed event groups and, once attached, one
//! [`CounterHandle`] per (event, target) pair. Handles are stored event-major
//! in a flat vector, so `handle(event, target)` is a single index.
//!
//! Every group is opened as one kernel counter group per target: the first
//! event becomes the leader and the rest pass its descriptor as `group_fd`.
//! Reading goes through the leader only, which yields all sibling values
//! from the same scheduling window.

use std::fmt;
use std::io::{self, Write};
use std::os::fd::AsRawFd;

use crate::backend::{CounterBackend, PerfBackend};
use crate::cpulist;
use crate::error::{Error, Result};
use crate::perf::OpenFlags;
use crate::pmu::EventDatabase;
use crate::spec::{format_groups, parse_events, EventDefinition, Group};

/// Flat index of an event across all groups.
pub type EventId = usize;
/// Index into [`EventList::targets`].
pub type TargetId = usize;

/// What a counter handle is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Everything running on one CPU.
    Cpu(u32),
    /// One process while it runs on one CPU.
    Thread { pid: i32, cpu: u32 },
    /// One process on whatever CPU it runs.
    ThreadAnyCpu { pid: i32 },
}

impl Target {
    pub fn cpu(&self) -> Option<u32> {
        match self {
            Target::Cpu(cpu) | Target::Thread { cpu, .. } => Some(*cpu),
            Target::ThreadAnyCpu { .. } => None,
        }
    }

    /// The `pid` argument of `perf_event_open`.
    pub fn pid(&self) -> i32 {
        match self {
            Target::Cpu(_) => -1,
            Target::Thread { pid, .. } | Target::ThreadAnyCpu { pid } => *pid,
        }
    }

    /// The `cpu` argument of `perf_event_open`.
    fn open_cpu(&self) -> i32 {
        self.cpu().map_or(-1, |cpu| cpu as i32)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Cpu(cpu) => write!(f, "cpu {cpu}"),
            Target::Thread { pid, cpu } => write!(f, "pid {pid} on cpu {cpu}"),
            Target::ThreadAnyCpu { pid } => write!(f, "pid {pid}"),
        }
    }
}

/// Whether to count the whole system or one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    AllCpus,
    Process(i32),
}

/// Target selection for [`EventList::setup_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub scope: Scope,
    /// Restrict counting to these CPUs.
    pub cpus: Option<Vec<u32>>,
    /// Leave the counters for the exec of the measured process to enable.
    pub enable_on_exec: bool,
}

impl TargetSpec {
    pub fn all_cpus() -> Self {
        TargetSpec {
            scope: Scope::AllCpus,
            cpus: None,
            enable_on_exec: false,
        }
    }

    pub fn process(pid: i32) -> Self {
        TargetSpec {
            scope: Scope::Process(pid),
            cpus: None,
            enable_on_exec: false,
        }
    }

    pub fn with_cpus(mut self, cpus: Vec<u32>) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_enable_on_exec(mut self, enable_on_exec: bool) -> Self {
        self.enable_on_exec = enable_on_exec;
        self
    }

    /// Expand into targets, each paired with whether the CPU mask selects it.
    ///
    /// A process without a CPU mask is a single target that follows the
    /// process across CPUs. Everything else gets one target per possible
    /// CPU, masked-out CPUs included, so target indices stay aligned with
    /// CPU numbering.
    pub fn targets(&self, possible: &[u32]) -> Result<Vec<(Target, bool)>> {
        if let Some(mask) = &self.cpus {
            if let Some(cpu) = mask.iter().find(|cpu| !possible.contains(cpu)) {
                let list = mask
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                return Err(Error::cpu_list(&list, format!("cpu {cpu} does not exist")));
            }
        }
        let selected = |cpu: u32| self.cpus.as_ref().map_or(true, |mask| mask.contains(&cpu));

        let targets = match (self.scope, &self.cpus) {
            (Scope::Process(pid), None) => vec![(Target::ThreadAnyCpu { pid }, true)],
            (Scope::Process(pid), Some(_)) => possible
                .iter()
                .map(|&cpu| (Target::Thread { pid, cpu }, selected(cpu)))
                .collect(),
            (Scope::AllCpus, _) => possible
                .iter()
                .map(|&cpu| (Target::Cpu(cpu), selected(cpu)))
                .collect(),
        };
        Ok(targets)
    }

    fn inherit(&self) -> bool {
        matches!(self.scope, Scope::Process(_))
    }
}

/// Attachment state of one handle.
#[derive(Debug)]
pub enum HandleState<H> {
    /// Excluded by the CPU mask or not covered by the event's PMU.
    NotApplicable,
    /// The kernel reported the CPU as absent when opening.
    Unavailable,
    Open(H),
}

/// One raw counter reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reading {
    pub raw: u64,
    pub enabled: u64,
    pub running: u64,
}

impl Reading {
    /// Estimate of the count had the counter been running the whole time it
    /// was enabled. `None` when it never ran.
    pub fn scaled(&self) -> Option<u64> {
        if self.running == 0 || self.enabled == 0 {
            return None;
        }
        if self.enabled == self.running {
            return Some(self.raw);
        }
        let scaled = self.raw as u128 * self.enabled as u128 / self.running as u128;
        Some(u64::try_from(scaled).unwrap_or(u64::MAX))
    }
}

/// The last read of a handle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Snapshot {
    #[default]
    Empty,
    Value(Reading),
    Failed(String),
}

#[derive(Debug)]
pub struct CounterHandle<H> {
    state: HandleState<H>,
    snapshot: Snapshot,
}

impl<H> CounterHandle<H> {
    fn not_applicable() -> Self {
        CounterHandle {
            state: HandleState::NotApplicable,
            snapshot: Snapshot::Empty,
        }
    }

    pub fn state(&self) -> &HandleState<H> {
        &self.state
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open(_))
    }
}

/// What the presentation layer sees for one (event, target).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub valid: bool,
    pub raw_count: u64,
    pub scaled_count: u64,
}

pub struct EventList<B: CounterBackend = PerfBackend> {
    backend: B,
    groups: Vec<Group>,
    targets: Vec<Target>,
    handles: Vec<CounterHandle<B::Handle>>,
    flags: OpenFlags,
    attached: bool,
}

impl EventList<PerfBackend> {
    pub fn new() -> Self {
        Self::with_backend(PerfBackend)
    }
}

impl Default for EventList<PerfBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: CounterBackend> EventList<B> {
    pub fn with_backend(backend: B) -> Self {
        EventList {
            backend,
            groups: Vec::new(),
            targets: Vec::new(),
            handles: Vec::new(),
            flags: OpenFlags::default(),
            attached: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Parse `spec` and append its groups. On error nothing is appended.
    pub fn parse_events(&mut self, spec: &str, db: &dyn EventDatabase) -> Result<()> {
        if self.attached {
            return Err(Error::AlreadyAttached);
        }
        let groups = parse_events(spec, db)?;
        tracing::debug!("parsed {} groups from '{}'", groups.len(), spec);
        self.groups.extend(groups);
        Ok(())
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn num_events(&self) -> usize {
        self.groups.iter().map(Group::len).sum()
    }

    pub fn events(&self) -> impl Iterator<Item = (EventId, &EventDefinition)> {
        self.groups.iter().flat_map(Group::events).enumerate()
    }

    pub fn event(&self, event: EventId) -> Option<&EventDefinition> {
        self.groups.iter().flat_map(Group::events).nth(event)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Render the groups back into specification text.
    pub fn spec_string(&self) -> String {
        format_groups(&self.groups)
    }

    fn index(&self, event: EventId, target: TargetId) -> usize {
        event * self.targets.len() + target
    }

    pub fn handle(&self, event: EventId, target: TargetId) -> &CounterHandle<B::Handle> {
        &self.handles[self.index(event, target)]
    }

    /// Open counters for every event on the CPUs of this machine.
    pub fn setup_events(&mut self, spec: &TargetSpec) -> Result<()> {
        let possible = cpulist::possible_cpus()?;
        let online = cpulist::online_cpus()?;
        self.setup_events_on(spec, &possible, &online)
    }

    /// Open counters for every event, with `possible` as the CPU universe.
    ///
    /// Either every applicable counter is opened or none is: on error all
    /// descriptors opened so far are closed and the list is left unattached.
    /// ENODEV on a CPU outside `online` leaves that counter unavailable; on an
    /// online CPU it means the hardware cannot count the event and is fatal.
    pub fn setup_events_on(
        &mut self,
        spec: &TargetSpec,
        possible: &[u32],
        online: &[u32],
    ) -> Result<()> {
        if self.attached {
            return Err(Error::AlreadyAttached);
        }
        let targets = spec.targets(possible)?;
        let nt = targets.len();
        let flags = OpenFlags {
            disabled: true,
            inherit: spec.inherit(),
            enable_on_exec: spec.enable_on_exec,
        };
        let follower_flags = OpenFlags {
            disabled: false,
            enable_on_exec: false,
            ..flags
        };

        let mut handles: Vec<CounterHandle<B::Handle>> = (0..self.num_events() * nt)
            .map(|_| CounterHandle::not_applicable())
            .collect();

        for (t, &(target, selected)) in targets.iter().enumerate() {
            if !selected {
                continue;
            }
            let mut first = 0;
            for group in &self.groups {
                let leader_idx = first * nt + t;
                for (m, event) in group.events().iter().enumerate() {
                    let idx = (first + m) * nt + t;
                    let covered = match (&event.cpus, target.cpu()) {
                        (Some(cpus), Some(cpu)) => cpus.contains(&cpu),
                        _ => true,
                    };
                    if !covered {
                        continue;
                    }
                    // Followers share the fate of a leader that could not open
                    if m > 0 {
                        match handles[leader_idx].state {
                            HandleState::Open(_) => {}
                            HandleState::Unavailable => {
                                handles[idx].state = HandleState::Unavailable;
                                continue;
                            }
                            HandleState::NotApplicable => continue,
                        }
                    }
                    let leader = match &handles[leader_idx].state {
                        HandleState::Open(h) if m > 0 => Some(h),
                        _ => None,
                    };
                    let raw = event
                        .attr
                        .to_raw(if m == 0 { &flags } else { &follower_flags });
                    let result = self
                        .backend
                        .open(&raw, target.pid(), target.open_cpu(), leader);
                    handles[idx].state = match result {
                        Ok(h) => HandleState::Open(h),
                        Err(e)
                            if e.raw_os_error() == Some(libc::ENODEV)
                                && target.cpu().is_some_and(|cpu| !online.contains(&cpu)) =>
                        {
                            tracing::debug!("{} unavailable on {}: {}", event.name, target, e);
                            HandleState::Unavailable
                        }
                        Err(source) => {
                            return Err(Error::Attach {
                                event: event.display_name().to_string(),
                                target,
                                source,
                            })
                        }
                    };
                }
                first += group.len();
            }
        }

        self.targets = targets.into_iter().map(|(target, _)| target).collect();
        self.handles = handles;
        self.flags = flags;
        self.attached = true;
        tracing::debug!(
            "attached {} events to {} targets, {} counters open",
            self.num_events(),
            self.targets.len(),
            self.handles.iter().filter(|h| h.is_open()).count()
        );

        if !spec.enable_on_exec {
            self.enable_all()?;
        }
        Ok(())
    }

    /// Run `op` on every open group leader, stopping at the first error.
    fn for_each_leader(
        &mut self,
        mut op: impl FnMut(&mut B, &mut B::Handle) -> io::Result<()>,
    ) -> Result<()> {
        let nt = self.targets.len();
        let mut first = 0;
        for group in &self.groups {
            for t in 0..nt {
                if let HandleState::Open(h) = &mut self.handles[first * nt + t].state {
                    if let Err(source) = op(&mut self.backend, h) {
                        return Err(Error::Attach {
                            event: group.leader().display_name().to_string(),
                            target: self.targets[t],
                            source,
                        });
                    }
                }
            }
            first += group.len();
        }
        Ok(())
    }

    /// Start counting on every group.
    pub fn enable_all(&mut self) -> Result<()> {
        self.for_each_leader(|backend, h| backend.enable(h))
    }

    pub fn disable_all(&mut self) -> Result<()> {
        self.for_each_leader(|backend, h| backend.disable(h))
    }

    /// Zero every counter. Snapshots are kept until the next read.
    pub fn reset_all(&mut self) -> Result<()> {
        self.for_each_leader(|backend, h| backend.reset(h))
    }

    /// Take a fresh snapshot of every open counter, one read per group leader.
    ///
    /// A failed read marks the members of that group on that target as
    /// failed and moves on; the other groups are unaffected.
    pub fn read_all_events(&mut self) {
        let nt = self.targets.len();
        let mut first = 0;
        for group in &self.groups {
            for t in 0..nt {
                let members: Vec<usize> = (first..first + group.len())
                    .map(|event| event * nt + t)
                    .filter(|&idx| self.handles[idx].is_open())
                    .collect();
                let HandleState::Open(leader) = &self.handles[first * nt + t].state else {
                    continue;
                };
                let snapshots: Vec<Snapshot> = match self.backend.read_group(leader, members.len()) {
                    Ok(reading) if reading.values.len() == members.len() => reading
                        .values
                        .iter()
                        .map(|&raw| {
                            Snapshot::Value(Reading {
                                raw,
                                enabled: reading.time_enabled,
                                running: reading.time_running,
                            })
                        })
                        .collect(),
                    Ok(reading) => {
                        let reason = format!(
                            "group read returned {} values, expected {}",
                            reading.values.len(),
                            members.len()
                        );
                        vec![Snapshot::Failed(reason); members.len()]
                    }
                    Err(e) => {
                        tracing::debug!(
                            "read of {} on {} failed: {}",
                            group.leader().name,
                            self.targets[t],
                            e
                        );
                        vec![Snapshot::Failed(e.to_string()); members.len()]
                    }
                };
                for (idx, snapshot) in members.into_iter().zip(snapshots) {
                    self.handles[idx].snapshot = snapshot;
                }
            }
            first += group.len();
        }
    }

    /// The last good reading of a handle.
    pub fn reading(&self, event: EventId, target: TargetId) -> Option<Reading> {
        let handle = self.handle(event, target);
        match (&handle.state, &handle.snapshot) {
            (HandleState::Open(_), Snapshot::Value(reading)) => Some(*reading),
            _ => None,
        }
    }

    /// Multiplexing-corrected count, `None` when there is no usable value.
    pub fn scaled_value(&self, event: EventId, target: TargetId) -> Option<u64> {
        self.reading(event, target)?.scaled()
    }

    pub fn value(&self, event: EventId, target: TargetId) -> CounterValue {
        match self.reading(event, target) {
            Some(reading) => match reading.scaled() {
                Some(scaled) => CounterValue {
                    valid: true,
                    raw_count: reading.raw,
                    scaled_count: scaled,
                },
                None => CounterValue {
                    raw_count: reading.raw,
                    ..Default::default()
                },
            },
            None => CounterValue::default(),
        }
    }

    /// Every target's value for one event, valid or not.
    pub fn values(
        &self,
        event: EventId,
    ) -> impl Iterator<Item = (TargetId, Target, CounterValue)> + '_ {
        self.targets
            .iter()
            .enumerate()
            .map(move |(t, &target)| (t, target, self.value(event, t)))
    }

    /// Sum of the valid scaled values of one event across all targets.
    pub fn aggregate(&self, event: EventId) -> u64 {
        self.values(event)
            .filter(|(_, _, value)| value.valid)
            .fold(0u64, |sum, (_, _, value)| sum.saturating_add(value.scaled_count))
    }

    /// Errors from the last read pass, one per failed handle.
    pub fn read_errors(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        for (id, event) in self.events() {
            for (t, &target) in self.targets.iter().enumerate() {
                if let Snapshot::Failed(reason) = &self.handle(id, t).snapshot {
                    errors.push(Error::Read {
                        event: event.display_name().to_string(),
                        target,
                        reason: reason.clone(),
                    });
                }
            }
        }
        errors
    }

    /// Dump the arguments each counter was opened with, one line per handle.
    pub fn write_attrs(&self, w: &mut impl Write) -> io::Result<()> {
        let nt = self.targets.len();
        let mut first = 0;
        for group in &self.groups {
            for (m, event) in group.events().iter().enumerate() {
                for (t, target) in self.targets.iter().enumerate() {
                    write!(w, "{} {}: ", event.display_name(), target)?;
                    match &self.handles[(first + m) * nt + t].state {
                        HandleState::NotApplicable => writeln!(w, "not applicable")?,
                        HandleState::Unavailable => writeln!(w, "unavailable")?,
                        HandleState::Open(h) => {
                            let (flags, group_fd) = if m == 0 {
                                (self.flags, -1)
                            } else {
                                let group_fd = match &self.handles[first * nt + t].state {
                                    HandleState::Open(leader) => leader.as_raw_fd(),
                                    _ => -1,
                                };
                                let flags = OpenFlags {
                                    disabled: false,
                                    enable_on_exec: false,
                                    ..self.flags
                                };
                                (flags, group_fd)
                            };
                            writeln!(
                                w,
                                "fd={} pid={} cpu={} group_fd={} {}",
                                h.as_raw_fd(),
                                target.pid(),
                                target.open_cpu(),
                                group_fd,
                                event.attr.to_raw(&flags)
                            )?;
                        }
                    }
                }
            }
            first += group.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::perf::*;
    use crate::pmu::{EventResolver, Pmu};

    fn db() -> EventResolver {
        let mut imc = Pmu::new("uncore_imc", 16);
        imc.add_format("event", "config:0-7");
        imc.cpus = Some(vec![0]);
        EventResolver::new().with_pmu(imc)
    }

    fn list(spec: &str) -> EventList<FakeBackend> {
        let mut list = EventList::with_backend(FakeBackend::default());
        list.parse_events(spec, &db()).unwrap();
        list
    }

    fn set_count(list: &mut EventList<FakeBackend>, config: u64, cpu: i32, value: u64) {
        list.backend_mut().counts.insert((config, cpu), value);
    }

    const CPUS: [u32; 4] = [0, 1, 2, 3];

    #[test]
    fn test_grouping_shares_leader() {
        let mut list = list("{instructions,cpu-cycles},cache-misses");
        list.setup_events_on(&TargetSpec::all_cpus(), &[0, 1], &[0, 1]).unwrap();

        let opens = &list.backend_mut().opens;
        assert_eq!(opens.len(), 6);
        for cpu in [0, 1] {
            let on_cpu: Vec<_> = opens.iter().filter(|c| c.cpu == cpu).collect();
            assert_eq!(on_cpu[0].config, PERF_COUNT_HW_INSTRUCTIONS);
            assert_eq!(on_cpu[0].group_fd, -1);
            assert_eq!(on_cpu[1].config, PERF_COUNT_HW_CPU_CYCLES);
            assert_eq!(on_cpu[1].group_fd, on_cpu[0].fd);
            assert_eq!(on_cpu[2].config, PERF_COUNT_HW_CACHE_MISSES);
            assert_eq!(on_cpu[2].group_fd, -1);
            assert!(on_cpu.iter().all(|c| c.pid == -1 && !c.inherit));
        }
        // Exactly one kernel group per group per target
        assert_eq!(opens.iter().filter(|c| c.group_fd == -1).count(), 4);
        // Leaders open disabled and are enabled once everything is open
        assert!(opens.iter().all(|c| c.disabled == (c.group_fd == -1)));
        assert_eq!(list.backend_mut().enabled.len(), 4);
    }

    #[test]
    fn test_cpu_mask_marks_not_applicable() {
        let mut list = list("instructions");
        list.setup_events_on(&TargetSpec::all_cpus().with_cpus(vec![0, 2, 3]), &CPUS, &CPUS)
            .unwrap();
        for (cpu, value) in [(0, 10), (1, 20), (2, 30), (3, 40)] {
            set_count(&mut list, PERF_COUNT_HW_INSTRUCTIONS, cpu, value);
        }
        list.read_all_events();

        assert!(matches!(
            list.handle(0, 1).state(),
            HandleState::NotApplicable
        ));
        assert!(list.backend_mut().opens.iter().all(|c| c.cpu != 1));
        let valid: Vec<_> = list
            .values(0)
            .filter(|(_, _, v)| v.valid)
            .map(|(_, target, v)| (target, v.scaled_count))
            .collect();
        assert_eq!(
            valid,
            vec![
                (Target::Cpu(0), 10),
                (Target::Cpu(2), 30),
                (Target::Cpu(3), 40)
            ]
        );
        assert_eq!(list.aggregate(0), 80);
        assert_eq!(list.scaled_value(0, 1), None);
    }

    #[test]
    fn test_failed_parse_opens_nothing() {
        let mut list = EventList::with_backend(FakeBackend::default());
        match list.parse_events("instructions,bogus_event_xyz", &db()) {
            Err(Error::InvalidEventSpec { token, .. }) => assert_eq!(token, "bogus_event_xyz"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(list.num_events(), 0);
        list.setup_events_on(&TargetSpec::all_cpus(), &CPUS, &CPUS).unwrap();
        assert!(list.backend_mut().opens.is_empty());
        assert_eq!(list.read_errors().len(), 0);
    }

    #[test]
    fn test_scaling_identity_and_correction() {
        let mut list = list("instructions");
        list.setup_events_on(&TargetSpec::all_cpus(), &[0], &[0]).unwrap();
        set_count(&mut list, PERF_COUNT_HW_INSTRUCTIONS, 0, 100);

        list.read_all_events();
        assert_eq!(list.scaled_value(0, 0), Some(100));

        list.backend_mut().times = (1000, 500);
        list.read_all_events();
        let value = list.value(0, 0);
        assert!(value.valid);
        assert_eq!(value.raw_count, 100);
        assert_eq!(value.scaled_count, 200);
    }

    #[test]
    fn test_reading_scaled() {
        let r = |raw, enabled, running| Reading {
            raw,
            enabled,
            running,
        };
        assert_eq!(r(100, 0, 0).scaled(), None);
        assert_eq!(r(100, 500, 0).scaled(), None);
        assert_eq!(r(100, 0, 500).scaled(), None);
        assert_eq!(r(7, 7, 7).scaled(), Some(7));
        assert_eq!(r(100, 3, 2).scaled(), Some(150));
        // truncation
        assert_eq!(r(10, 3, 4).scaled(), Some(7));
        // no intermediate overflow
        assert_eq!(r(u64::MAX / 2, 2, 1).scaled(), Some(u64::MAX - 1));
        assert_eq!(r(u64::MAX, 4, 1).scaled(), Some(u64::MAX));
    }

    #[test]
    fn test_read_is_idempotent_snapshot() {
        let mut list = list("{instructions,cpu-cycles}");
        list.setup_events_on(&TargetSpec::all_cpus(), &[0, 1], &[0, 1]).unwrap();
        set_count(&mut list, PERF_COUNT_HW_INSTRUCTIONS, 0, 5);
        set_count(&mut list, PERF_COUNT_HW_CPU_CYCLES, 1, 9);
        list.backend_mut().times = (300, 100);

        list.read_all_events();
        let first: Vec<_> = (0..2).flat_map(|e| list.values(e).collect::<Vec<_>>()).collect();
        list.read_all_events();
        let second: Vec<_> = (0..2).flat_map(|e| list.values(e).collect::<Vec<_>>()).collect();
        assert_eq!(first, second);
        // one read per group leader per pass
        assert_eq!(list.backend_mut().reads, 4);
        assert_eq!(list.aggregate(0), 15);
        assert_eq!(list.aggregate(1), 27);
    }

    #[test]
    fn test_aggregate_empty_is_zero() {
        let mut list = list("instructions");
        // Before attach and before the first read, nothing is valid
        list.setup_events_on(&TargetSpec::all_cpus().with_cpus(vec![1]), &CPUS, &CPUS)
            .unwrap();
        assert_eq!(list.aggregate(0), 0);
        assert!(list.values(0).all(|(_, _, v)| !v.valid));

        // A counter that never ran is not valid either
        list.backend_mut().times = (0, 0);
        list.read_all_events();
        assert_eq!(list.aggregate(0), 0);
        assert_eq!(list.scaled_value(0, 1), None);
    }

    #[test]
    fn test_aggregate_matches_sum_of_valid() {
        let mut list = list("cache-misses");
        list.setup_events_on(&TargetSpec::all_cpus(), &CPUS, &CPUS).unwrap();
        for cpu in 0..4 {
            set_count(&mut list, PERF_COUNT_HW_CACHE_MISSES, cpu, 1000 + cpu as u64);
        }
        list.backend_mut().failing_cpus.insert(2);
        list.backend_mut().times = (10, 4);
        list.read_all_events();

        let sum: u64 = list
            .values(0)
            .filter(|(_, _, v)| v.valid)
            .map(|(_, _, v)| v.scaled_count)
            .sum();
        assert_eq!(list.aggregate(0), sum);
        assert_eq!(sum, 2500 + 2502 + 2507);
    }

    #[test]
    fn test_offline_cpu_is_unavailable() {
        let mut list = list("{instructions,cpu-cycles}");
        list.backend_mut()
            .open_errors
            .insert((PERF_COUNT_HW_INSTRUCTIONS, 3), libc::ENODEV);
        list.setup_events_on(&TargetSpec::all_cpus(), &CPUS, &[0, 1, 2])
            .unwrap();

        assert!(matches!(list.handle(0, 3).state(), HandleState::Unavailable));
        assert!(matches!(list.handle(1, 3).state(), HandleState::Unavailable));
        assert!(list.handle(0, 2).is_open());
        list.read_all_events();
        assert!(!list.value(1, 3).valid);
        assert!(list.read_errors().is_empty());
    }

    #[test]
    fn test_unsupported_event_on_online_cpu_is_fatal() {
        let mut list = list("instructions:ppp");
        for cpu in 0..4 {
            list.backend_mut()
                .open_errors
                .insert((PERF_COUNT_HW_INSTRUCTIONS, cpu), libc::ENODEV);
        }
        match list.setup_events_on(&TargetSpec::all_cpus(), &CPUS, &CPUS) {
            Err(Error::Attach { target, source, .. }) => {
                assert_eq!(target, Target::Cpu(0));
                assert_eq!(source.raw_os_error(), Some(libc::ENODEV));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(!list.is_attached());
        assert!(list.backend_mut().enabled.is_empty());
    }

    #[test]
    fn test_attach_error_is_fatal() {
        let mut list = list("instructions,cache-misses");
        list.backend_mut()
            .open_errors
            .insert((PERF_COUNT_HW_CACHE_MISSES, 2), libc::EACCES);
        match list.setup_events_on(&TargetSpec::all_cpus(), &CPUS, &CPUS) {
            Err(Error::Attach {
                event,
                target,
                source,
            }) => {
                assert_eq!(event, "cache-misses");
                assert_eq!(target, Target::Cpu(2));
                assert_eq!(source.raw_os_error(), Some(libc::EACCES));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(!list.is_attached());
        assert!(list.targets().is_empty());
        assert!(list.backend_mut().enabled.is_empty());
    }

    #[test]
    fn test_read_failure_is_per_group() {
        let mut list = list("{instructions,cpu-cycles}");
        list.setup_events_on(&TargetSpec::all_cpus(), &[0, 1], &[0, 1]).unwrap();
        set_count(&mut list, PERF_COUNT_HW_INSTRUCTIONS, 0, 42);
        list.backend_mut().failing_cpus.insert(1);
        list.read_all_events();

        assert_eq!(list.scaled_value(0, 0), Some(42));
        assert!(matches!(list.handle(0, 1).snapshot(), Snapshot::Failed(_)));
        assert!(matches!(list.handle(1, 1).snapshot(), Snapshot::Failed(_)));
        let errors = list.read_errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| matches!(
            e,
            Error::Read {
                target: Target::Cpu(1),
                ..
            }
        )));

        // The next successful read replaces the failure
        list.backend_mut().failing_cpus.clear();
        list.read_all_events();
        assert!(list.read_errors().is_empty());
    }

    #[test]
    fn test_short_group_read_fails_members() {
        let mut list = list("{instructions,cpu-cycles}");
        list.setup_events_on(&TargetSpec::all_cpus(), &[0], &[0]).unwrap();
        list.backend_mut().short_reads = true;
        list.read_all_events();
        assert!(!list.value(0, 0).valid);
        assert_eq!(list.read_errors().len(), 2);
    }

    #[test]
    fn test_process_without_mask_follows_thread() {
        let mut list = list("{instructions,cpu-cycles}");
        let spec = TargetSpec::process(4242).with_enable_on_exec(true);
        list.setup_events_on(&spec, &CPUS, &CPUS).unwrap();

        assert_eq!(list.targets(), &[Target::ThreadAnyCpu { pid: 4242 }]);
        let opens = &list.backend_mut().opens;
        assert_eq!(opens.len(), 2);
        assert!(opens.iter().all(|c| c.pid == 4242 && c.cpu == -1 && c.inherit));
        assert!(opens[0].enable_on_exec && opens[0].disabled);
        assert!(!opens[1].enable_on_exec && !opens[1].disabled);
        // exec enables the counters
        assert!(list.backend_mut().enabled.is_empty());
    }

    #[test]
    fn test_process_with_mask_is_per_cpu() {
        let mut list = list("instructions");
        list.setup_events_on(&TargetSpec::process(7).with_cpus(vec![1, 2]), &CPUS, &CPUS)
            .unwrap();
        assert_eq!(list.targets().len(), 4);
        assert_eq!(list.targets()[2], Target::Thread { pid: 7, cpu: 2 });
        let cpus: Vec<i32> = list.backend_mut().opens.iter().map(|c| c.cpu).collect();
        assert_eq!(cpus, vec![1, 2]);
    }

    #[test]
    fn test_mask_outside_machine() {
        let mut list = list("instructions");
        let err = list
            .setup_events_on(&TargetSpec::all_cpus().with_cpus(vec![0, 9]), &CPUS, &CPUS)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCpuList { .. }));
    }

    #[test]
    fn test_pmu_cpus_limit_targets() {
        let mut list = list("uncore_imc/event=0x4/,instructions");
        list.setup_events_on(&TargetSpec::all_cpus(), &CPUS, &CPUS).unwrap();
        assert!(list.handle(0, 0).is_open());
        for t in 1..4 {
            assert!(matches!(
                list.handle(0, t).state(),
                HandleState::NotApplicable
            ));
            assert!(list.handle(1, t).is_open());
        }
    }

    #[test]
    fn test_no_changes_after_attach() {
        let mut list = list("instructions");
        list.setup_events_on(&TargetSpec::all_cpus(), &[0], &[0]).unwrap();
        assert!(matches!(
            list.parse_events("cache-misses", &db()),
            Err(Error::AlreadyAttached)
        ));
        assert!(matches!(
            list.setup_events_on(&TargetSpec::all_cpus(), &[0], &[0]),
            Err(Error::AlreadyAttached)
        ));
    }

    #[test]
    fn test_enable_disable_reset_hit_leaders() {
        let mut list = list("{instructions,cpu-cycles},cs");
        list.setup_events_on(&TargetSpec::all_cpus().with_enable_on_exec(true), &[0], &[0])
            .unwrap();
        list.enable_all().unwrap();
        list.disable_all().unwrap();
        list.reset_all().unwrap();
        let backend = list.backend_mut();
        assert_eq!(backend.enabled, vec![100, 102]);
        assert_eq!(backend.disabled, vec![100, 102]);
        assert_eq!(backend.resets, vec![100, 102]);
    }

    #[test]
    fn test_write_attrs() {
        let mut list = list("{instructions,cpu-cycles}");
        list.setup_events_on(&TargetSpec::all_cpus().with_cpus(vec![1]), &[0, 1], &[0, 1])
            .unwrap();
        let mut out = Vec::new();
        list.write_attrs(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "instructions cpu 0: not applicable");
        assert_eq!(
            lines[1],
            "instructions cpu 1: fd=100 pid=-1 cpu=1 group_fd=-1 \
             type=0 (hardware) config=0x1 read_format=0xb disabled"
        );
        assert_eq!(
            lines[3],
            "cpu-cycles cpu 1: fd=101 pid=-1 cpu=1 group_fd=100 \
             type=0 (hardware) config=0x0 read_format=0xb"
        );
    }

    #[test]
    fn test_spec_string_round_trip() {
        let list = list("{instructions,cpu-cycles},cache-misses");
        assert_eq!(list.spec_string(), "{instructions,cpu-cycles},cache-misses");
        let names: Vec<&str> = list.events().map(|(_, e)| e.name.as_str()).collect();
        assert_eq!(names, vec!["instructions", "cpu-cycles", "cache-misses"]);
        assert_eq!(list.event(2).unwrap().name, "cache-misses");
        assert!(list.event(3).is_none());
    }
}
