use std::fmt;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::MemRegion;

/// Maps and unmaps the backing memory of committed regions.
pub trait CommitMapper: Send + Sync {
    fn commit(&self, range: MemRegion) -> Result<(), MemoryError>;
    fn uncommit(&self, range: MemRegion) -> Result<(), MemoryError>;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryOp {
    Reserve,
    Commit,
    Uncommit,
}

#[derive(Debug)]
pub struct MemoryError {
    pub op: MemoryOp,
    pub range: MemRegion,
    pub errno: errno::Errno,
}

impl MemoryError {
    fn last(op: MemoryOp, range: MemRegion) -> Self {
        Self {
            op,
            range,
            errno: errno::errno(),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} of {} failed: {}", self.op, self.range, self.errno)
    }
}

impl std::error::Error for MemoryError {}

/// Address space reserved up front for the whole heap. Pages are only backed by memory
/// between a `commit` and the matching `uncommit`.
pub struct ReservedSpace {
    region: MemRegion,
}

unsafe impl Send for ReservedSpace {}
unsafe impl Sync for ReservedSpace {}

impl ReservedSpace {
    pub fn reserve(size: usize, alignment: usize) -> Result<Self, MemoryError> {
        let alignment = alignment.max(page_size());
        let size = super::align_up(size, page_size());
        let start = unsafe { os::reserve_aligned(size, alignment) }
            .ok_or_else(|| MemoryError::last(MemoryOp::Reserve, MemRegion::new(0, size)))?;
        log::debug!(target: "gc-region", "Reserved {} at {:#x}", crate::utils::formatted_size(size), start);
        Ok(Self {
            region: MemRegion::new(start, start + size),
        })
    }

    pub fn region(&self) -> MemRegion {
        self.region
    }

    pub fn start(&self) -> usize {
        self.region.start()
    }

    fn verify_range(&self, range: MemRegion) {
        assert!(
            range.start() >= self.region.start() && range.end() <= self.region.end(),
            "range {} is outside of reserved space {}",
            range,
            self.region
        );
    }
}

impl CommitMapper for ReservedSpace {
    fn commit(&self, range: MemRegion) -> Result<(), MemoryError> {
        self.verify_range(range);
        if unsafe { os::commit(range.start(), range.byte_size()) } {
            Ok(())
        } else {
            Err(MemoryError::last(MemoryOp::Commit, range))
        }
    }

    fn uncommit(&self, range: MemRegion) -> Result<(), MemoryError> {
        self.verify_range(range);
        if unsafe { os::uncommit(range.start(), range.byte_size()) } {
            Ok(())
        } else {
            Err(MemoryError::last(MemoryOp::Uncommit, range))
        }
    }
}

impl Drop for ReservedSpace {
    fn drop(&mut self) {
        unsafe { os::release(self.region.start(), self.region.byte_size()) }
    }
}

/// Mapper that touches no memory and records what it was asked to do.
///
/// Useful when the heap range is synthetic, e.g. when the object model keeps objects
/// in side tables.
#[derive(Default)]
pub struct NoopMapper {
    log: Mutex<Vec<(MemoryOp, MemRegion)>>,
}

impl NoopMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operations(&self) -> Vec<(MemoryOp, MemRegion)> {
        self.log.lock().clone()
    }
}

impl CommitMapper for NoopMapper {
    fn commit(&self, range: MemRegion) -> Result<(), MemoryError> {
        self.log.lock().push((MemoryOp::Commit, range));
        Ok(())
    }

    fn uncommit(&self, range: MemRegion) -> Result<(), MemoryError> {
        self.log.lock().push((MemoryOp::Uncommit, range));
        Ok(())
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod os {
            use std::ptr::null_mut;

            pub fn page_size() -> usize {
                let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                if val <= 0 {
                    4096
                } else {
                    val as usize
                }
            }

            unsafe fn unmap(start: usize, end: usize) {
                if end > start {
                    libc::munmap(start as _, end - start);
                }
            }

            pub unsafe fn reserve_aligned(size: usize, alignment: usize) -> Option<usize> {
                let allocated_size = size + alignment;
                let addr = libc::mmap(
                    null_mut(),
                    allocated_size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                );

                if addr == libc::MAP_FAILED {
                    return None;
                }

                let base = addr as usize;
                let aligned_base = super::super::align_up(base, alignment);
                unmap(base, aligned_base);
                unmap(aligned_base + size, base + allocated_size);
                Some(aligned_base)
            }

            pub unsafe fn commit(start: usize, size: usize) -> bool {
                let result = libc::mmap(
                    start as _,
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                    -1,
                    0,
                );
                result != libc::MAP_FAILED
            }

            pub unsafe fn uncommit(start: usize, size: usize) -> bool {
                let result = libc::mmap(
                    start as _,
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                result != libc::MAP_FAILED
            }

            pub unsafe fn release(start: usize, size: usize) {
                unmap(start, start + size);
            }
        }
    } else if #[cfg(windows)] {
        mod os {
            use std::ptr::null_mut;
            use winapi::um::{
                memoryapi::{VirtualAlloc, VirtualFree},
                sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
                winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
            };

            pub fn page_size() -> usize {
                unsafe {
                    let mut info: SYSTEM_INFO = std::mem::zeroed();
                    GetSystemInfo(&mut info);
                    info.dwPageSize as usize
                }
            }

            pub unsafe fn reserve_aligned(size: usize, alignment: usize) -> Option<usize> {
                // Reserve an oversized block to learn an aligned address, then reserve exactly there.
                for _ in 0..8 {
                    let probe = VirtualAlloc(null_mut(), size + alignment, MEM_RESERVE, PAGE_NOACCESS);
                    if probe.is_null() {
                        return None;
                    }
                    let aligned = super::super::align_up(probe as usize, alignment);
                    VirtualFree(probe, 0, MEM_RELEASE);
                    let addr = VirtualAlloc(aligned as _, size, MEM_RESERVE, PAGE_NOACCESS);
                    if !addr.is_null() {
                        return Some(addr as usize);
                    }
                }
                None
            }

            pub unsafe fn commit(start: usize, size: usize) -> bool {
                !VirtualAlloc(start as _, size, MEM_COMMIT, PAGE_READWRITE).is_null()
            }

            pub unsafe fn uncommit(start: usize, size: usize) -> bool {
                VirtualFree(start as _, size, MEM_DECOMMIT) != 0
            }

            pub unsafe fn release(start: usize, _size: usize) {
                VirtualFree(start as _, 0, MEM_RELEASE);
            }
        }
    }
}

pub fn page_size() -> usize {
    static PAGE_SIZE: OnceCell<usize> = OnceCell::new();
    *PAGE_SIZE.get_or_init(os::page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn test_reserve_commit_uncommit() {
        let region_size = 64 * 1024;
        let space = ReservedSpace::reserve(4 * region_size, region_size).unwrap();
        assert!(super::super::is_aligned(space.start(), region_size));

        let range = MemRegion::new(space.start() + region_size, space.start() + 2 * region_size);
        space.commit(range).unwrap();
        unsafe {
            let p = range.start() as *mut usize;
            p.write(0xdead);
            assert_eq!(p.read(), 0xdead);
        }
        space.uncommit(range).unwrap();
        space.commit(range).unwrap();
        unsafe {
            assert_eq!((range.start() as *const usize).read(), 0);
        }
    }

    #[test]
    fn test_noop_mapper_records() {
        let mapper = NoopMapper::new();
        let range = MemRegion::new(0x1000, 0x2000);
        mapper.commit(range).unwrap();
        mapper.uncommit(range).unwrap();
        assert_eq!(
            mapper.operations(),
            vec![(MemoryOp::Commit, range), (MemoryOp::Uncommit, range)]
        );
    }
}
