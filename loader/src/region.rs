//! Region Mapper
//!
//! Turns one loadable entry into a populated region of the address space:
//!
//! 1. Shift the target address by the base offset
//! 2. Round the start down and the end up to page boundaries
//! 3. Reserve the window read-write at exactly that address
//! 4. Copy the file bytes to the (shifted) target address
//! 5. Apply the final protection
//!
//! Bytes past the file extent are never written, so they keep the zero fill
//! of the fresh anonymous reservation (BSS).
//!
//! Pages already reserved by an earlier entry of the same load are not
//! reserved again: their contents stay, and their protection becomes the
//! union of every entry that touches them.
//!
//! The address space itself sits behind [`AddressSpace`]: the real one uses
//! fixed anonymous `mmap`, the simulated one keeps pages in a map so the
//! algorithm can be tested without touching the process.

use std::collections::BTreeMap;
use std::io;

use crate::config::PAGE_SIZE;
use crate::error::LoadError;

bitflags::bitflags! {
    /// Final protection of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        /// Readable.
        const READ = 0b001;
        /// Writable.
        const WRITE = 0b010;
        /// Executable.
        const EXEC = 0b100;
    }
}

impl Permissions {
    /// `mprotect` protection bits.
    pub fn prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl core::fmt::Display for Permissions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let flag = |p: Self, c: char| if self.contains(p) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'R'),
            flag(Self::WRITE, 'W'),
            flag(Self::EXEC, 'X')
        )
    }
}

impl serde::Serialize for Permissions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Round `addr` down to a multiple of `page_size` (a power of two).
pub const fn page_floor(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

/// Round `addr` up to a multiple of `page_size`, `None` on overflow.
pub const fn page_ceil(addr: u64, page_size: u64) -> Option<u64> {
    match addr.checked_add(page_size - 1) {
        Some(v) => Some(v & !(page_size - 1)),
        None => None,
    }
}

/// A page-aligned `[start, start + len)` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// First byte (page aligned)
    pub start: u64,
    /// Length in bytes (multiple of the page size)
    pub len: u64,
}

impl Region {
    /// Smallest page-aligned window covering `[addr, addr + extent)`.
    ///
    /// Returns `None` if the window does not fit in 64 bits.
    pub fn covering(addr: u64, extent: u64, page_size: u64) -> Option<Self> {
        let start = page_floor(addr, page_size);
        let end = page_ceil(addr.checked_add(extent)?, page_size)?;
        Some(Self {
            start,
            len: end - start,
        })
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.start && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }
}

/// Process address space as seen by the Region Mapper.
///
/// `reserve` must place the window exactly at `region.start` or fail; the
/// window is readable, writable and zero-filled afterwards.
pub trait AddressSpace {
    /// Reserve a zero-filled read-write window at a fixed address.
    fn reserve(&mut self, region: Region) -> Result<(), LoadError>;

    /// Copy `bytes` to `addr`, which lies inside a reserved window.
    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), LoadError>;

    /// Change the protection of a reserved window.
    fn protect(&mut self, region: Region, perms: Permissions) -> Result<(), LoadError>;
}

/// One mapping request.
#[derive(Debug, Clone, Copy)]
pub struct MapRequest<'a> {
    /// Link-time virtual address
    pub vaddr: u64,
    /// Bytes copied from the file
    pub file_bytes: &'a [u8],
    /// Size in memory (at least `file_bytes.len()`)
    pub mem_size: u64,
    /// Final protection
    pub perms: Permissions,
}

/// Page-granular mapping of loadable entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMapper {
    base: u64,
    page_size: u64,
    /// Pages reserved so far, with their final protection
    pages: BTreeMap<u64, Permissions>,
}

impl RegionMapper {
    /// Mapper that shifts every address by `base`.
    pub fn new(base: u64, page_size: u64) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            base,
            page_size,
            pages: BTreeMap::new(),
        }
    }

    /// Protection of the page at `addr`, if this mapper reserved it.
    pub fn page_perms(&self, addr: u64) -> Option<Permissions> {
        self.pages.get(&page_floor(addr, self.page_size)).copied()
    }

    /// Split `region` into runs of consecutive pages sharing the same key.
    fn page_runs<K: PartialEq>(&self, region: Region, mut key: impl FnMut(u64) -> K) -> Vec<(Region, K)> {
        let mut runs: Vec<(Region, K)> = Vec::new();
        for addr in (region.start..region.end()).step_by(self.page_size as usize) {
            let k = key(addr);
            match runs.last_mut() {
                Some((run, last)) if *last == k => run.len += self.page_size,
                _ => runs.push((
                    Region {
                        start: addr,
                        len: self.page_size,
                    },
                    k,
                )),
            }
        }
        runs
    }

    /// Base offset applied to every address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Page size used for alignment.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Compute the region for a request without touching memory.
    ///
    /// Returns `Ok(None)` for zero-sized requests.
    pub fn plan(&self, label: &str, vaddr: u64, mem_size: u64) -> Result<Option<Region>, LoadError> {
        if mem_size == 0 {
            return Ok(None);
        }

        let overflow = || LoadError::AddressOverflow {
            label: label.to_string(),
            addr: vaddr,
            len: mem_size,
        };
        let target = vaddr.checked_add(self.base).ok_or_else(overflow)?;
        Region::covering(target, mem_size, self.page_size)
            .map(Some)
            .ok_or_else(overflow)
    }

    /// Reserve, fill and protect the region for `request`.
    ///
    /// Returns the mapped region, or `None` when the request is empty.
    pub fn map<A: AddressSpace + ?Sized>(
        &mut self,
        space: &mut A,
        label: &str,
        request: &MapRequest<'_>,
    ) -> Result<Option<Region>, LoadError> {
        debug_assert!(request.file_bytes.len() as u64 <= request.mem_size);

        let Some(region) = self.plan(label, request.vaddr, request.mem_size)? else {
            log::debug!("{label}: zero size, nothing to map");
            return Ok(None);
        };
        let target = request.vaddr + self.base;

        log::trace!(
            "{label}: reserve [{:#x}, {:#x}) then copy {:#x} bytes to {target:#x}",
            region.start,
            region.end(),
            request.file_bytes.len()
        );

        // Fresh pages get reserved; shared ones are reopened for writing.
        let held = self.page_runs(region, |addr| self.pages.get(&addr).copied());
        for (run, perms) in held {
            match perms {
                None => space.reserve(run)?,
                Some(perms) if !perms.contains(Permissions::WRITE) => {
                    log::debug!("{label}: reusing [{:#x}, {:#x})", run.start, run.end());
                    space.protect(run, Permissions::READ | Permissions::WRITE)?;
                }
                Some(_) => log::debug!("{label}: reusing [{:#x}, {:#x})", run.start, run.end()),
            }
        }

        if !request.file_bytes.is_empty() {
            space.write(target, request.file_bytes)?;
        }

        for addr in (region.start..region.end()).step_by(self.page_size as usize) {
            *self.pages.entry(addr).or_insert(Permissions::empty()) |= request.perms;
        }
        let finals = self.page_runs(region, |addr| self.pages.get(&addr).copied());
        for (run, perms) in finals {
            space.protect(run, perms.unwrap_or(request.perms))?;
        }

        Ok(Some(region))
    }
}

/// The real process address space.
///
/// Windows are created with `MAP_FIXED`: an existing mapping at the same
/// address is replaced, as the kernel would do for an `execve`. Keeping the
/// new windows clear of the loader's own code, data and stack is up to the
/// caller.
#[derive(Debug, Default)]
pub struct MmapAddressSpace {
    reserved: Vec<Region>,
}

impl MmapAddressSpace {
    /// Empty address space handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Windows reserved so far, in reservation order.
    pub fn reserved(&self) -> &[Region] {
        &self.reserved
    }

    /// Whether `[addr, addr + len)` lies inside reserved windows, possibly
    /// several adjacent ones.
    fn covers(&self, addr: u64, len: u64) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut cur = addr;
        while cur < end {
            match self.reserved.iter().find(|r| r.contains(cur, 1)) {
                Some(r) => cur = r.end(),
                None => return false,
            }
        }
        true
    }
}

impl AddressSpace for MmapAddressSpace {
    fn reserve(&mut self, region: Region) -> Result<(), LoadError> {
        let reserve_err = |source| LoadError::Reserve {
            start: region.start,
            len: region.len,
            source,
        };
        let len = usize::try_from(region.len)
            .map_err(|_| reserve_err(io::Error::from(io::ErrorKind::InvalidInput)))?;

        // SAFETY: anonymous private mapping; MAP_FIXED only replaces pages
        // in the requested window.
        let ptr = unsafe {
            libc::mmap(
                region.start as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(reserve_err(io::Error::last_os_error()));
        }
        if ptr as u64 != region.start {
            // SAFETY: `ptr` is the mapping just created with length `len`.
            unsafe { libc::munmap(ptr, len) };
            return Err(reserve_err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("kernel placed the window at {:#x}", ptr as u64),
            )));
        }

        self.reserved.push(region);
        Ok(())
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), LoadError> {
        let len = bytes.len() as u64;
        if !self.covers(addr, len) {
            return Err(LoadError::Write {
                addr,
                len,
                reason: "destination is not inside a reserved window".to_string(),
            });
        }

        // SAFETY: the destination lies inside a read-write window this
        // address space reserved and the source is a distinct buffer.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
        Ok(())
    }

    fn protect(&mut self, region: Region, perms: Permissions) -> Result<(), LoadError> {
        let protect_err = |source| LoadError::Protect {
            start: region.start,
            len: region.len,
            source,
        };
        let len = usize::try_from(region.len)
            .map_err(|_| protect_err(io::Error::from(io::ErrorKind::InvalidInput)))?;

        // SAFETY: changes protection of a window this address space mapped.
        let rc = unsafe { libc::mprotect(region.start as *mut libc::c_void, len, perms.prot()) };
        if rc != 0 {
            return Err(protect_err(io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// One page of a [`SimulatedAddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedPage {
    /// Page contents
    pub bytes: Vec<u8>,
    /// Current protection
    pub perms: Permissions,
}

/// In-memory stand-in for the process address space.
///
/// Pages are tracked individually. Reserving over existing pages replaces
/// them with fresh zero pages, like `MAP_FIXED`. Writes need every touched
/// page to be present and writable.
#[derive(Debug, Clone)]
pub struct SimulatedAddressSpace {
    page_size: u64,
    pages: BTreeMap<u64, SimulatedPage>,
    denied: Vec<Region>,
    reservations: Vec<Region>,
}

impl Default for SimulatedAddressSpace {
    fn default() -> Self {
        Self::new(PAGE_SIZE)
    }
}

impl SimulatedAddressSpace {
    /// Empty address space with the given page size.
    pub fn new(page_size: u64) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            pages: BTreeMap::new(),
            denied: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Make any reservation overlapping `region` fail.
    pub fn deny(&mut self, region: Region) {
        self.denied.push(region);
    }

    /// Every successful reservation, in order.
    pub fn reservations(&self) -> &[Region] {
        &self.reservations
    }

    /// Number of pages currently present.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Page starting at `addr`.
    pub fn page(&self, addr: u64) -> Option<&SimulatedPage> {
        self.pages.get(&addr)
    }

    /// Copy `len` bytes starting at `addr`, if every page is present.
    pub fn read(&self, addr: u64, len: u64) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(usize::try_from(len).ok()?);
        let mut cur = addr;
        let end = addr.checked_add(len)?;
        while cur < end {
            let page_addr = page_floor(cur, self.page_size);
            let page = self.pages.get(&page_addr)?;
            let from = (cur - page_addr) as usize;
            let to = (end.min(page_addr + self.page_size) - page_addr) as usize;
            out.extend_from_slice(&page.bytes[from..to]);
            cur = page_addr + to as u64;
        }
        Some(out)
    }

    fn page_addrs(&self, region: Region) -> impl Iterator<Item = u64> {
        (region.start..region.end()).step_by(self.page_size as usize)
    }

    fn check_window(&self, region: Region) -> Result<(), io::Error> {
        if region.len == 0
            || region.start % self.page_size != 0
            || region.len % self.page_size != 0
        {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        Ok(())
    }
}

impl AddressSpace for SimulatedAddressSpace {
    fn reserve(&mut self, region: Region) -> Result<(), LoadError> {
        let reserve_err = |source| LoadError::Reserve {
            start: region.start,
            len: region.len,
            source,
        };
        self.check_window(region).map_err(reserve_err)?;

        let collides = self
            .denied
            .iter()
            .any(|d| region.start < d.end() && d.start < region.end());
        if collides {
            return Err(reserve_err(io::Error::from(io::ErrorKind::AddrInUse)));
        }

        for addr in self.page_addrs(region).collect::<Vec<_>>() {
            self.pages.insert(
                addr,
                SimulatedPage {
                    bytes: vec![0; self.page_size as usize],
                    perms: Permissions::READ | Permissions::WRITE,
                },
            );
        }
        self.reservations.push(region);
        Ok(())
    }

    fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), LoadError> {
        let len = bytes.len() as u64;
        let fault = |reason: &str| LoadError::Write {
            addr,
            len,
            reason: reason.to_string(),
        };
        let end = addr.checked_add(len).ok_or_else(|| fault("address overflow"))?;

        let mut cur = addr;
        let mut src = bytes;
        while cur < end {
            let page_addr = page_floor(cur, self.page_size);
            let page_end = page_addr + self.page_size;
            let page = self
                .pages
                .get_mut(&page_addr)
                .ok_or_else(|| fault("page not mapped"))?;
            if !page.perms.contains(Permissions::WRITE) {
                return Err(fault("page not writable"));
            }

            let from = (cur - page_addr) as usize;
            let n = (end.min(page_end) - cur) as usize;
            page.bytes[from..from + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            cur += n as u64;
        }
        Ok(())
    }

    fn protect(&mut self, region: Region, perms: Permissions) -> Result<(), LoadError> {
        let protect_err = |source| LoadError::Protect {
            start: region.start,
            len: region.len,
            source,
        };
        self.check_window(region).map_err(protect_err)?;

        let addrs: Vec<u64> = self.page_addrs(region).collect();
        if addrs.iter().any(|a| !self.pages.contains_key(a)) {
            return Err(protect_err(io::Error::from(io::ErrorKind::OutOfMemory)));
        }
        for addr in addrs {
            if let Some(page) = self.pages.get_mut(&addr) {
                page.perms = perms;
            }
        }
        Ok(())
    }
}
