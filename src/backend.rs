//! The syscall boundary of the counter table.
//!
//! [`EventList`](crate::EventList) never calls `perf_event_open` directly, it
//! goes through a [`CounterBackend`]. [`PerfBackend`] is the real thing.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use crate::perf::{
    perf_event_attr, perf_event_open, GroupReading, PerfEventFile, PERF_FLAG_FD_CLOEXEC,
};

pub trait CounterBackend {
    type Handle: AsRawFd;

    /// Open one counter. `group` is the group leader for followers.
    fn open(
        &mut self,
        attr: &perf_event_attr,
        pid: i32,
        cpu: i32,
        group: Option<&Self::Handle>,
    ) -> io::Result<Self::Handle>;

    /// Read a group leader. `members` counts the leader itself.
    fn read_group(&mut self, leader: &Self::Handle, members: usize) -> io::Result<GroupReading>;

    fn enable(&mut self, leader: &mut Self::Handle) -> io::Result<()>;

    fn disable(&mut self, leader: &mut Self::Handle) -> io::Result<()>;

    fn reset(&mut self, leader: &mut Self::Handle) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct PerfBackend;

impl CounterBackend for PerfBackend {
    type Handle = PerfEventFile;

    fn open(
        &mut self,
        attr: &perf_event_attr,
        pid: i32,
        cpu: i32,
        group: Option<&PerfEventFile>,
    ) -> io::Result<PerfEventFile> {
        let group_fd: RawFd = group.map_or(-1, |g| g.as_raw_fd());
        perf_event_open(attr, pid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC)
    }

    fn read_group(&mut self, leader: &PerfEventFile, members: usize) -> io::Result<GroupReading> {
        leader.read_group(members)
    }

    fn enable(&mut self, leader: &mut PerfEventFile) -> io::Result<()> {
        leader.enable()
    }

    fn disable(&mut self, leader: &mut PerfEventFile) -> io::Result<()> {
        leader.disable()
    }

    fn reset(&mut self, leader: &mut PerfEventFile) -> io::Result<()> {
        leader.reset()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! An in-memory backend for exercising the counter table.

    use super::*;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OpenCall {
        pub fd: RawFd,
        pub kind: u32,
        pub config: u64,
        pub pid: i32,
        pub cpu: i32,
        pub group_fd: RawFd,
        pub disabled: bool,
        pub inherit: bool,
        pub enable_on_exec: bool,
    }

    #[derive(Debug)]
    pub struct FakeHandle(pub RawFd);

    impl AsRawFd for FakeHandle {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    #[derive(Debug)]
    pub struct FakeBackend {
        next_fd: RawFd,
        pub opens: Vec<OpenCall>,
        /// Open fails with this errno for `(config, cpu)`.
        pub open_errors: HashMap<(u64, i32), i32>,
        /// Counter value for `(config, cpu)`.
        pub counts: HashMap<(u64, i32), u64>,
        /// Enabled and running time reported for every group.
        pub times: (u64, u64),
        /// Reads of groups led on these CPUs fail.
        pub failing_cpus: HashSet<i32>,
        /// Report one value fewer than requested.
        pub short_reads: bool,
        pub reads: usize,
        pub enabled: Vec<RawFd>,
        pub disabled: Vec<RawFd>,
        pub resets: Vec<RawFd>,
    }

    impl Default for FakeBackend {
        fn default() -> Self {
            FakeBackend {
                next_fd: 100,
                opens: Vec::new(),
                open_errors: HashMap::new(),
                counts: HashMap::new(),
                times: (1000, 1000),
                failing_cpus: HashSet::new(),
                short_reads: false,
                reads: 0,
                enabled: Vec::new(),
                disabled: Vec::new(),
                resets: Vec::new(),
            }
        }
    }

    impl FakeBackend {
        fn call(&self, fd: RawFd) -> &OpenCall {
            self.opens.iter().find(|c| c.fd == fd).unwrap()
        }
    }

    impl CounterBackend for FakeBackend {
        type Handle = FakeHandle;

        fn open(
            &mut self,
            attr: &perf_event_attr,
            pid: i32,
            cpu: i32,
            group: Option<&FakeHandle>,
        ) -> io::Result<FakeHandle> {
            if let Some(errno) = self.open_errors.get(&(attr.config, cpu)) {
                return Err(io::Error::from_raw_os_error(*errno));
            }
            let fd = self.next_fd;
            self.next_fd += 1;
            self.opens.push(OpenCall {
                fd,
                kind: attr._type,
                config: attr.config,
                pid,
                cpu,
                group_fd: group.map_or(-1, |g| g.0),
                disabled: attr.flags.disabled() != 0,
                inherit: attr.flags.inherit() != 0,
                enable_on_exec: attr.flags.enable_on_exec() != 0,
            });
            Ok(FakeHandle(fd))
        }

        fn read_group(&mut self, leader: &FakeHandle, members: usize) -> io::Result<GroupReading> {
            self.reads += 1;
            let cpu = self.call(leader.0).cpu;
            if self.failing_cpus.contains(&cpu) {
                return Err(io::Error::from_raw_os_error(libc::ESRCH));
            }
            let mut values: Vec<u64> = self
                .opens
                .iter()
                .filter(|c| c.fd == leader.0 || c.group_fd == leader.0)
                .map(|c| self.counts.get(&(c.config, c.cpu)).copied().unwrap_or(0))
                .collect();
            assert_eq!(values.len(), members, "member count mismatch");
            if self.short_reads {
                values.pop();
            }
            Ok(GroupReading {
                time_enabled: self.times.0,
                time_running: self.times.1,
                values,
            })
        }

        fn enable(&mut self, leader: &mut FakeHandle) -> io::Result<()> {
            self.enabled.push(leader.0);
            Ok(())
        }

        fn disable(&mut self, leader: &mut FakeHandle) -> io::Result<()> {
            self.disabled.push(leader.0);
            Ok(())
        }

        fn reset(&mut self, leader: &mut FakeHandle) -> io::Result<()> {
            self.resets.push(leader.0);
            Ok(())
        }
    }
}
