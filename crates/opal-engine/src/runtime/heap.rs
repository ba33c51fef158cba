//! Two-semispace heap
//!
//! One anonymous mapping split into two equal semispaces; allocation
//! bumps a pointer through the active space. The frame pointer of the
//! call into user code is recorded as the root frame so that a future
//! stop-and-copy collector can walk the stack from there down to the
//! current stack pointer, using the stack maps to find references.
//!
//! The collector itself is not wired up yet: the out-of-memory handler
//! reclaims nothing, so exhausting the active semispace after the retry
//! is fatal.

use crate::runtime::class::ClassDesc;
use crate::runtime::object::Object;

const PAGE_SIZE: usize = 0x1000;
/// Preferred heap start address (a hint, not a demand).
const HEAP_START_HINT: usize = 0x100_0000_0000;

/// The heap backing one runtime image.
#[derive(Debug)]
pub struct Heap {
    base: *mut u8,
    total: usize,
    to_start: *mut u8,
    to_end: *mut u8,
    from_start: *mut u8,
    from_end: *mut u8,
    free: *mut u8,
    /// Frame pointer at entry into user code (GC root frame)
    pub root_frame: *mut u8,
}

// Safety: the mapping is owned by this value; the single-threaded
// runtime discipline serialises access.
unsafe impl Send for Heap {}

impl Heap {
    /// Map a heap of `requested_size` bytes (rounded up to whole pages)
    /// and split it into two semispaces.
    pub fn new(requested_size: usize) -> Heap {
        let total = requested_size.next_multiple_of(PAGE_SIZE);
        let base = unsafe {
            libc::mmap(
                HEAP_START_HINT as *mut libc::c_void,
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED || base.is_null() {
            eprintln!("Cannot allocate heap; out of memory");
            std::process::exit(1);
        }
        let base = base as *mut u8;
        let half = total >> 1;
        unsafe {
            Heap {
                base,
                total,
                to_start: base,
                to_end: base.add(half),
                from_start: base.add(half),
                from_end: base.add(total),
                free: base,
                root_frame: std::ptr::null_mut(),
            }
        }
    }

    /// Allocate an object with `fields_nr` fields and install its class
    /// pointer. Fields start out zeroed (null references / zero ints).
    pub fn allocate_object(&mut self, class: *const ClassDesc, fields_nr: usize) -> *mut Object {
        let requested = std::mem::size_of::<usize>() * (1 + fields_nr);
        if self.available() < requested {
            self.handle_out_of_memory();
            if self.available() < requested {
                eprintln!(
                    "Out of memory: insufficient space for {} bytes ({} fields) (allocated: {} of {} bytes)",
                    requested,
                    fields_nr,
                    self.size() - self.available(),
                    self.size()
                );
                std::process::exit(1);
            }
        }
        unsafe {
            let obj = self.free as *mut Object;
            self.free = self.free.add(requested);
            (*obj).class = class;
            std::ptr::write_bytes((obj as *mut u64).add(1), 0, fields_nr);
            obj
        }
    }

    /// Bytes left in the active semispace.
    pub fn available(&self) -> usize {
        self.to_end as usize - self.free as usize
    }

    /// Size of one semispace.
    pub fn size(&self) -> usize {
        self.to_end as usize - self.to_start as usize
    }

    /// The inactive semispace, reserved for the future copying collector.
    pub fn reserve_semispace(&self) -> (*mut u8, *mut u8) {
        (self.from_start, self.from_end)
    }

    /// Out-of-memory hook: the collector is not wired up yet, so this
    /// only leaves the root frame in place for it and reclaims nothing.
    fn handle_out_of_memory(&mut self) {}
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}
