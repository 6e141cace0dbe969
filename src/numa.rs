//! NUMA and affinity helpers.
//!
//! Backing memory for pools and rings comes from here. On Linux with a
//! NUMA-capable kernel the region is an anonymous mapping bound to a node
//! with `mbind(2)`; everywhere else it is a plain 64-byte aligned heap
//! allocation. Both paths are released by dropping the [`NumaRegion`].

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;

use tracing::{debug, trace};

use crate::error::{Result, SubstrateError};

/// Cache line size assumed throughout the substrate.
pub const CACHE_LINE: usize = 64;

/// Page size used when `sysconf` is unavailable.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// Highest node id we can express in the `mbind` node mask.
const MAX_NODES: usize = 1024;

/// Returns the system page size.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as usize;
        }
    }
    FALLBACK_PAGE_SIZE
}

/// Returns true if the kernel exposes a NUMA memory policy interface.
///
/// Mirrors `numa_available()` from libnuma: a successful `get_mempolicy`
/// with no output arguments means policies are supported.
pub fn numa_available() -> bool {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe {
            libc::syscall(
                libc::SYS_get_mempolicy,
                std::ptr::null_mut::<libc::c_int>(),
                std::ptr::null_mut::<libc::c_ulong>(),
                0 as libc::c_ulong,
                std::ptr::null_mut::<libc::c_void>(),
                0 as libc::c_ulong,
            )
        };
        rc == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// NUMA node of the CPU the calling thread is currently running on.
pub fn current_node() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        let mut cpu: libc::c_uint = 0;
        let mut node: libc::c_uint = 0;
        let rc = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut libc::c_uint,
                &mut node as *mut libc::c_uint,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == 0 {
            return Some(node as usize);
        }
        None
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Parse a sysfs cpu list such as `0-3,8-11` into individual CPU ids.
pub fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<usize>(), hi.trim().parse::<usize>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.trim().parse::<usize>() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

/// CPUs that belong to `node`, empty if the topology is unknown.
pub fn cpus_of_node(node: usize) -> Vec<usize> {
    let path = format!("/sys/devices/system/node/node{node}/cpulist");
    std::fs::read_to_string(path)
        .map(|s| parse_cpu_list(&s))
        .unwrap_or_default()
}

/// Migrate the calling thread's affinity to the CPUs of `node`.
///
/// Best-effort: returns `Ok(false)` when the node has no known CPUs or
/// NUMA is not available, `Err` only when the kernel rejects the mask.
pub fn pin_to_node(node: usize) -> Result<bool> {
    let cpus: Vec<usize> = cpus_of_node(node).into_iter().filter(|&c| c < MAX_CPUS).collect();
    if cpus.is_empty() {
        debug!(node, "no cpus known for node, affinity unchanged");
        return Ok(false);
    }
    set_affinity(&cpus)?;
    debug!(node, cpus = cpus.len(), "pinned thread to node");
    Ok(true)
}

/// CPU ids representable in the affinity mask.
#[cfg(target_os = "linux")]
const MAX_CPUS: usize = libc::CPU_SETSIZE as usize;
#[cfg(not(target_os = "linux"))]
const MAX_CPUS: usize = usize::MAX;

/// Ids at or past `MAX_CPUS` are skipped.
#[cfg(target_os = "linux")]
fn set_affinity(cpus: &[usize]) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus.iter().filter(|&&c| c < MAX_CPUS) {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(SubstrateError::Affinity(
                std::io::Error::last_os_error().to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_cpus: &[usize]) -> Result<()> {
    Ok(())
}

/// Pin the current thread to a single core.
///
/// Returns false if the core id is unknown or the OS refused.
pub fn pin_to_core(core: usize) -> bool {
    core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|c| c.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false)
}

/// Pin the current thread to the last available core.
///
/// The last core is typically isolated from OS interrupts.
pub fn pin_to_last_core() -> bool {
    core_affinity::get_core_ids()
        .and_then(|ids| ids.last().copied())
        .map(core_affinity::set_for_current)
        .unwrap_or(false)
}

enum Backing {
    /// Anonymous mapping, released with `munmap`.
    #[cfg(target_os = "linux")]
    Mapped { map_len: usize },
    /// Heap allocation, released with `dealloc`.
    Heap(Layout),
}

/// A 64-byte aligned memory region, optionally bound to a NUMA node.
///
/// Dropping the region frees it through the same path that acquired it.
pub struct NumaRegion {
    ptr: NonNull<u8>,
    len: usize,
    node: Option<usize>,
    backing: Backing,
}

// SAFETY: the region is plain memory owned exclusively by this value.
unsafe impl Send for NumaRegion {}
unsafe impl Sync for NumaRegion {}

impl NumaRegion {
    /// Allocate `size` bytes on `node`, or on the caller's node when `None`.
    ///
    /// Falls back to a plain aligned allocation when NUMA is unavailable.
    /// A failed `mbind` keeps the mapping but leaves it unbound.
    pub fn allocate(size: usize, node: Option<usize>) -> Result<Self> {
        let len = size.max(1).next_multiple_of(CACHE_LINE);

        #[cfg(target_os = "linux")]
        {
            if numa_available() {
                return Self::allocate_mapped(len, node.or_else(current_node));
            }
        }

        Self::allocate_heap(len, node)
    }

    /// Plain 64-byte aligned allocation, never bound to a node.
    pub fn allocate_aligned(size: usize) -> Result<Self> {
        Self::allocate_heap(size.max(1).next_multiple_of(CACHE_LINE), None)
    }

    fn allocate_heap(len: usize, requested: Option<usize>) -> Result<Self> {
        let layout = Layout::from_size_align(len, CACHE_LINE)
            .map_err(|_| SubstrateError::OutOfMemory { bytes: len, node: requested })?;
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw)
            .ok_or(SubstrateError::OutOfMemory { bytes: len, node: requested })?;
        trace!(bytes = len, "allocated aligned heap region");
        Ok(Self { ptr, len, node: None, backing: Backing::Heap(layout) })
    }

    #[cfg(target_os = "linux")]
    fn allocate_mapped(len: usize, node: Option<usize>) -> Result<Self> {
        let map_len = len.next_multiple_of(page_size());
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(SubstrateError::OutOfMemory { bytes: map_len, node });
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or(SubstrateError::OutOfMemory { bytes: map_len, node })?;

        let bound = node.filter(|&n| bind_to_node(ptr, map_len, n));
        if bound.is_none() {
            debug!(bytes = map_len, requested = ?node, "mbind unavailable, region left unbound");
        } else {
            trace!(bytes = map_len, node = ?bound, "mapped region bound to node");
        }

        Ok(Self { ptr, len, node: bound, backing: Backing::Mapped { map_len } })
    }

    /// Start of the region. Always 64-byte aligned.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Usable length in bytes (a multiple of 64).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Regions are never empty; kept for API symmetry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Node the region is bound to, if binding succeeded.
    #[inline]
    pub fn node(&self) -> Option<usize> {
        self.node
    }

    /// True if the region came from the NUMA mapping path.
    pub fn is_mapped(&self) -> bool {
        !matches!(self.backing, Backing::Heap(_))
    }

    /// Touch the first byte of every page so later accesses never fault.
    ///
    /// Must run before any data is stored: the touched bytes are zeroed.
    /// Returns the number of pages touched.
    pub fn prefault(&mut self) -> usize {
        let page = page_size();
        let base = self.ptr.as_ptr();
        let mut pages = 0;
        let mut offset = 0;
        while offset < self.len {
            unsafe {
                std::ptr::write_volatile(base.add(offset), 0);
                if offset + page < self.len {
                    prefetch(base.add(offset + page));
                }
            }
            pages += 1;
            offset += page;
        }
        trace!(pages, bytes = self.len, "prefaulted region");
        pages
    }
}

impl Drop for NumaRegion {
    fn drop(&mut self) {
        match self.backing {
            #[cfg(target_os = "linux")]
            Backing::Mapped { map_len } => unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), map_len);
            },
            Backing::Heap(layout) => unsafe {
                alloc::dealloc(self.ptr.as_ptr(), layout);
            },
        }
    }
}

impl fmt::Debug for NumaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumaRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("node", &self.node)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn bind_to_node(ptr: NonNull<u8>, len: usize, node: usize) -> bool {
    const MPOL_BIND: libc::c_int = 2;
    const WORD_BITS: usize = libc::c_ulong::BITS as usize;

    if node >= MAX_NODES {
        return false;
    }
    let mut mask = [0 as libc::c_ulong; MAX_NODES / WORD_BITS];
    mask[node / WORD_BITS] |= 1 << (node % WORD_BITS);

    // The kernel ignores the last bit of `maxnode`.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr.as_ptr() as *mut libc::c_void,
            len as libc::c_ulong,
            MPOL_BIND,
            mask.as_ptr(),
            (MAX_NODES + 1) as libc::c_ulong,
            0 as libc::c_uint,
        )
    };
    rc == 0
}

#[inline(always)]
unsafe fn prefetch(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = ptr;
    }
}
