//! Thin layer over the `perf_event_open(2)` ABI.
//!
//! Only the counting side of the interface is modelled: no sampling, no ring
//! buffers. Every counter is opened with a group read format so one `read(2)`
//! on a group leader returns the values of all its siblings together with the
//! shared enabled/running times.

use std::fmt;
use std::io::Error;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use bitfield::bitfield;
use nix::errno::Errno;
use nix::{ioctl_write_int_bad, request_code_none};

bitfield! {
    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy, Default)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    u64;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 16, 15;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub exclude_host, set_exclude_host: 19, 19;
    pub exclude_guest, set_exclude_guest: 20, 20;
    pub __reserved_1, _: 63, 21;
}

/// `struct perf_event_attr` as of `PERF_ATTR_SIZE_VER6`.
///
/// The sampling, breakpoint and aux unions are flattened to the member this
/// crate uses; they are all `u64` wide so the layout is unchanged.
#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Default)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_HW_CACHE: u32 = 3;
pub const PERF_TYPE_RAW: u32 = 4;
pub const PERF_TYPE_BREAKPOINT: u32 = 5;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
pub const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
pub const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;
pub const PERF_COUNT_HW_BRANCH_INSTRUCTIONS: u64 = 4;
pub const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
pub const PERF_COUNT_HW_BUS_CYCLES: u64 = 6;
pub const PERF_COUNT_HW_STALLED_CYCLES_FRONTEND: u64 = 7;
pub const PERF_COUNT_HW_STALLED_CYCLES_BACKEND: u64 = 8;
pub const PERF_COUNT_HW_REF_CPU_CYCLES: u64 = 9;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_CPU_MIGRATIONS: u64 = 4;
pub const PERF_COUNT_SW_PAGE_FAULTS_MIN: u64 = 5;
pub const PERF_COUNT_SW_PAGE_FAULTS_MAJ: u64 = 6;
pub const PERF_COUNT_SW_ALIGNMENT_FAULTS: u64 = 7;
pub const PERF_COUNT_SW_EMULATION_FAULTS: u64 = 8;

pub const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 0;
pub const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 1;
pub const PERF_FORMAT_ID: u64 = 1 << 2;
pub const PERF_FORMAT_GROUP: u64 = 1 << 3;

/// Read format used for every counter this crate opens.
pub const GROUP_READ_FORMAT: u64 =
    PERF_FORMAT_GROUP | PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

const PERF_IOC_FLAG_GROUP: libc::c_int = 1;

/// Name of a `perf_event_attr.type` value, for diagnostics.
pub fn type_name(kind: u32) -> &'static str {
    match kind {
        PERF_TYPE_HARDWARE => "hardware",
        PERF_TYPE_SOFTWARE => "software",
        PERF_TYPE_TRACEPOINT => "tracepoint",
        PERF_TYPE_HW_CACHE => "hw-cache",
        PERF_TYPE_RAW => "raw",
        PERF_TYPE_BREAKPOINT => "breakpoint",
        _ => "pmu",
    }
}

/// The architecture-neutral encoding of an event: which PMU, which config
/// words, and what privilege levels to count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventAttr {
    pub kind: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub precise_ip: u8,
}

impl EventAttr {
    pub fn new(kind: u32, config: u64) -> Self {
        EventAttr {
            kind,
            config,
            ..Default::default()
        }
    }

    /// Build the kernel attribute block for this event.
    pub fn to_raw(&self, opts: &OpenFlags) -> perf_event_attr {
        let mut attr = perf_event_attr {
            _type: self.kind,
            size: mem::size_of::<perf_event_attr>() as u32,
            config: self.config,
            config1: self.config1,
            config2: self.config2,
            read_format: GROUP_READ_FORMAT,
            ..Default::default()
        };
        attr.flags.set_exclude_user(self.exclude_user as u64);
        attr.flags.set_exclude_kernel(self.exclude_kernel as u64);
        attr.flags.set_exclude_hv(self.exclude_hv as u64);
        attr.flags.set_precise_ip(self.precise_ip as u64);
        attr.flags.set_disabled(opts.disabled as u64);
        attr.flags.set_inherit(opts.inherit as u64);
        attr.flags.set_enable_on_exec(opts.enable_on_exec as u64);
        attr
    }
}

/// Per-open flags that depend on how the counter is attached rather than on
/// the event itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub disabled: bool,
    pub inherit: bool,
    pub enable_on_exec: bool,
}

impl fmt::Display for perf_event_attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} ({}) config={:#x}",
            self._type,
            type_name(self._type),
            self.config
        )?;
        if self.config1 != 0 {
            write!(f, " config1={:#x}", self.config1)?;
        }
        if self.config2 != 0 {
            write!(f, " config2={:#x}", self.config2)?;
        }
        write!(f, " read_format={:#x}", self.read_format)?;
        let flags = [
            ("disabled", self.flags.disabled()),
            ("inherit", self.flags.inherit()),
            ("exclude_user", self.flags.exclude_user()),
            ("exclude_kernel", self.flags.exclude_kernel()),
            ("exclude_hv", self.flags.exclude_hv()),
            ("enable_on_exec", self.flags.enable_on_exec()),
        ];
        for (name, value) in flags {
            if value != 0 {
                write!(f, " {}", name)?;
            }
        }
        if self.flags.precise_ip() != 0 {
            write!(f, " precise_ip={}", self.flags.precise_ip())?;
        }
        Ok(())
    }
}

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    hw_event: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            hw_event as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    Ok(PerfEventFile {
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
        need_disable: false,
    })
}

ioctl_write_int_bad!(perf_event_ioc_enable, request_code_none!(b'$', 0));
ioctl_write_int_bad!(perf_event_ioc_disable, request_code_none!(b'$', 1));
ioctl_write_int_bad!(perf_event_ioc_reset, request_code_none!(b'$', 3));

/// One raw group read: `{ nr, time_enabled, time_running, value[nr] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReading {
    pub time_enabled: u64,
    pub time_running: u64,
    pub values: Vec<u64>,
}

impl GroupReading {
    /// Decode the words returned by `read(2)` on a group leader opened with
    /// [`GROUP_READ_FORMAT`].
    pub fn from_words(words: &[u64]) -> Option<GroupReading> {
        if words.len() < 3 {
            return None;
        }
        let nr = words[0] as usize;
        let values = words[3..].get(..nr)?;
        Some(GroupReading {
            time_enabled: words[1],
            time_running: words[2],
            values: values.to_vec(),
        })
    }
}

/// An open counter descriptor. Closed on drop.
#[derive(Debug)]
pub struct PerfEventFile {
    fd: OwnedFd,
    need_disable: bool,
}

impl PerfEventFile {
    /// Enable this counter and, for a group leader, all of its siblings.
    pub fn enable(&mut self) -> Result<(), Error> {
        unsafe { perf_event_ioc_enable(self.fd.as_raw_fd(), PERF_IOC_FLAG_GROUP) }?;
        self.need_disable = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_disable(self.fd.as_raw_fd(), PERF_IOC_FLAG_GROUP) } {
            Ok(_) => {
                self.need_disable = false;
                Ok(())
            }
            Err(Errno::ENOTTY) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn reset(&self) -> Result<(), Error> {
        unsafe { perf_event_ioc_reset(self.fd.as_raw_fd(), PERF_IOC_FLAG_GROUP) }?;
        Ok(())
    }

    /// Read the whole group this descriptor leads. `members` is the number
    /// of counters in the group, leader included.
    pub fn read_group(&self, members: usize) -> Result<GroupReading, Error> {
        let mut words = vec![0u64; 3 + members];
        let len = words.len() * mem::size_of::<u64>();
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                words.as_mut_ptr() as *mut libc::c_void,
                len,
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        let n = n as usize / mem::size_of::<u64>();
        GroupReading::from_words(&words[..n]).ok_or_else(|| {
            Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short group read: {} words", n),
            )
        })
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for PerfEventFile {
    fn drop(&mut self) {
        if !self.need_disable {
            return;
        }
        if let Err(e) = self.disable() {
            tracing::debug!("failed to disable counter fd {}: {}", self.fd.as_raw_fd(), e);
        }
    }
}
