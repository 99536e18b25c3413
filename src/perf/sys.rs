#![allow(unused)]

use libc::{c_int, c_ulong, pid_t, syscall, SYS_perf_event_open};

#[cfg(target_endian = "big")]
macro_rules! flag {
    ($nth:expr) => {
        (1 << 63) >> $nth
    };
}

#[cfg(target_endian = "little")]
macro_rules! flag {
    ($nth:expr) => {
        1 << $nth
    };
}

pub const PERF_FLAG_FD_CLOEXEC: c_ulong = 1 << 3;

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_ATTR_FLAG_DISABLED: u64 = flag!(0);
pub const PERF_ATTR_FLAG_INHERIT: u64 = flag!(1);
pub const PERF_ATTR_FLAG_PINNED: u64 = flag!(2);
pub const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = flag!(5);
pub const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = flag!(6);
pub const PERF_ATTR_FLAG_EXCLUDE_IDLE: u64 = flag!(7);
pub const PERF_ATTR_FLAG_MMAP: u64 = flag!(8);
pub const PERF_ATTR_FLAG_COMM: u64 = flag!(9);
pub const PERF_ATTR_FLAG_FREQ: u64 = flag!(10);
pub const PERF_ATTR_FLAG_ENABLE_ON_EXEC: u64 = flag!(12);
pub const PERF_ATTR_FLAG_TASK: u64 = flag!(13);
pub const PERF_ATTR_FLAG_MMAP_DATA: u64 = flag!(17);
pub const PERF_ATTR_FLAG_SAMPLE_ID_ALL: u64 = flag!(18);
pub const PERF_ATTR_FLAG_MMAP2: u64 = flag!(23);
pub const PERF_ATTR_FLAG_COMM_EXEC: u64 = flag!(24);
pub const PERF_ATTR_FLAG_USE_CLOCKID: u64 = flag!(25);
pub const PERF_ATTR_FLAG_CONTEXT_SWITCH: u64 = flag!(26);

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;
pub const PERF_COUNT_SW_PAGE_FAULTS: u64 = 2;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

pub const PERF_SAMPLE_IP: u64 = 1 << 0;
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_READ: u64 = 1 << 4;
pub const PERF_SAMPLE_ID: u64 = 1 << 6;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_PERIOD: u64 = 1 << 8;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_IDENTIFIER: u64 = 1 << 16;

mod ioctl {
    use libc::c_ulong;

    pub const IOC_NRSHIFT: c_ulong = 0;
    pub const IOC_NRBITS: c_ulong = 8;
    pub const IOC_TYPEBITS: c_ulong = 8;
    pub const IOC_SIZEBITS: c_ulong = 14;
    pub const IOC_NONE: c_ulong = 0;
    pub const IOC_WRITE: c_ulong = 1;
    pub const IOC_READ: c_ulong = 2;
    pub const IOC_TYPESHIFT: c_ulong = IOC_NRSHIFT + IOC_NRBITS;
    pub const IOC_SIZESHIFT: c_ulong = IOC_TYPESHIFT + IOC_TYPEBITS;
    pub const IOC_DIRSHIFT: c_ulong = IOC_SIZESHIFT + IOC_SIZEBITS;
}

macro_rules! ioc {
    ($dir:expr, $kind:expr, $nr:expr, $size:expr) => {
        ($dir << ioctl::IOC_DIRSHIFT)
            | (($kind as c_ulong) << ioctl::IOC_TYPESHIFT)
            | ($nr << ioctl::IOC_NRSHIFT)
            | ($size << ioctl::IOC_SIZESHIFT)
    };
}

macro_rules! io {
    ($kind:expr, $nr:expr) => {
        ioc!(ioctl::IOC_NONE, $kind, $nr, 0)
    };
}

macro_rules! ior {
    ($kind:expr, $nr:expr, $size:expr) => {
        ioc!(ioctl::IOC_READ, $kind, $nr, $size)
    };
}

pub const PERF_EVENT_IOC_ENABLE: c_ulong = io!(b'$', 0);
pub const PERF_EVENT_IOC_DISABLE: c_ulong = io!(b'$', 1);
pub const PERF_EVENT_IOC_RESET: c_ulong = io!(b'$', 3);
pub const PERF_EVENT_IOC_SET_OUTPUT: c_ulong = io!(b'$', 5);
pub const PERF_EVENT_IOC_ID: c_ulong = ior!(b'$', 7, 8);

/// The subset of `perf_event_attr` this daemon configures. The kernel
/// tolerates shorter-than-current sizes, so the layout stops after the V3
/// fields.
#[repr(C)]
pub struct PerfEventAttr {
    pub kind: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period_or_freq: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub bp_addr_or_config: u64,
    pub bp_len_or_config: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clock_id: i32,
}

/// The perf mmap header page. `data_head`/`aux_head` are written by the
/// kernel with release semantics; the tails belong to us.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub reserved: [u8; 118 * 8 + 4],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// Framing of every record in the data ring.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PerfEventHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

pub fn sys_perf_event_open(
    attr: &PerfEventAttr,
    pid: pid_t,
    cpu: c_int,
    group_fd: c_int,
    flags: c_ulong,
) -> c_int {
    unsafe {
        syscall(
            SYS_perf_event_open,
            attr as *const _,
            pid,
            cpu,
            group_fd,
            flags,
        ) as c_int
    }
}

pub fn perf_event_ioc_enable(fd: c_int) -> std::io::Result<()> {
    if unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ENABLE as _) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn perf_event_ioc_set_output(fd: c_int, output_fd: c_int) -> std::io::Result<()> {
    if unsafe { libc::ioctl(fd, PERF_EVENT_IOC_SET_OUTPUT as _, output_fd) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
