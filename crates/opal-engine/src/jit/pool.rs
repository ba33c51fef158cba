//! Executable code pool
//!
//! A process-wide pool of RWX memory pages, acquired lazily with `mmap`
//! and subdivided into variable-length buffers. Every buffer carries an
//! inline header (capacity, used size); a free list threads through
//! unused regions reusing the header space, so freeing and reallocating
//! never touches the page mapping.
//!
//! First-fit allocation hands out the *entire* free region it finds, so
//! callers are expected to [`CodeBuffer::terminate`] once emission is
//! done; the trimmed tail goes back on the free list.
//!
//! x86-64 keeps instruction and data caches coherent for same-address
//! writes, so no explicit cache synchronisation is needed between
//! emitting into a buffer and executing it.
//!
//! Out-of-memory is fatal by design: this is a compiler for small
//! programs. The pool itself sits behind a mutex because it is a
//! process-wide static; the compilation pipeline proper is
//! single-threaded.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

const PAGE_SIZE: usize = 0x1000;
const INITIAL_SIZE: usize = PAGE_SIZE * 64;
const MIN_INCREMENT: usize = PAGE_SIZE * 64;
/// Preferred start address for the code segment (a hint, not a demand).
const POOL_START_HINT: usize = 0xb0_0000_0000;

/// Inline buffer header. `capacity` overlaps the free-list entry's
/// `size` field, so a region reclaimed from the free list already
/// carries its capacity.
#[repr(C)]
struct BufferHeader {
    /// Usable bytes following the header
    capacity: usize,
    /// Bytes emitted so far
    used: usize,
}

/// Free-list entry, stored in place of a buffer header.
#[repr(C)]
struct FreeHeader {
    /// Usable bytes following this header
    size: usize,
    next: *mut FreeHeader,
}

const HEADER_SIZE: usize = std::mem::size_of::<BufferHeader>();

struct Region {
    base: *mut u8,
    size: usize,
}

struct Pool {
    regions: Vec<Region>,
    free_list: *mut FreeHeader,
}

// Safety: all pointers reference process-lifetime mmap'd pages; access
// is serialised by the surrounding mutex.
unsafe impl Send for Pool {}

static POOL: Lazy<Mutex<Pool>> = Lazy::new(|| {
    Mutex::new(Pool {
        regions: Vec::new(),
        free_list: std::ptr::null_mut(),
    })
});

fn fatal(message: &str) -> ! {
    eprintln!("Fatal: {}", message);
    std::process::exit(1);
}

impl Pool {
    /// Map a fresh executable region of at least `min_size` bytes.
    fn grow(&mut self, min_size: usize) {
        let alloc_size = min_size
            .max(if self.regions.is_empty() {
                INITIAL_SIZE
            } else {
                MIN_INCREMENT
            })
            .next_multiple_of(PAGE_SIZE);

        let hint = match self.regions.last() {
            Some(r) => r.base as usize + r.size,
            None => POOL_START_HINT,
        };

        let base = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                alloc_size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED || base.is_null() {
            fatal("Out of code memory!");
        }
        let base = base as *mut u8;

        // the whole region starts out as one free entry
        unsafe {
            let entry = base as *mut FreeHeader;
            (*entry).size = alloc_size - HEADER_SIZE;
            (*entry).next = self.free_list;
            self.free_list = entry;
        }
        self.regions.push(Region {
            base,
            size: alloc_size,
        });
    }

    /// First-fit allocation of a buffer with `capacity >= buf_size`.
    fn alloc(&mut self, buf_size: usize) -> *mut BufferHeader {
        // any region must be able to hold a free-list entry later
        let buf_size = buf_size.max(std::mem::size_of::<FreeHeader>() - HEADER_SIZE);

        loop {
            let mut link: *mut *mut FreeHeader = &mut self.free_list;
            unsafe {
                while !(*link).is_null() {
                    let entry = *link;
                    if (*entry).size >= buf_size {
                        *link = (*entry).next;
                        let header = entry as *mut BufferHeader;
                        // capacity already holds the region size
                        (*header).used = 0;
                        return header;
                    }
                    link = &mut (*entry).next;
                }
            }
            self.grow(buf_size + HEADER_SIZE + MIN_INCREMENT);
        }
    }

    fn free(&mut self, header: *mut BufferHeader) {
        unsafe {
            let entry = header as *mut FreeHeader;
            // size stays: it overlaps the capacity field
            (*entry).next = self.free_list;
            self.free_list = entry;
        }
    }

    fn contains(&self, ptr: *const u8, len: usize) -> bool {
        self.regions.iter().any(|r| {
            let start = r.base as usize;
            let p = ptr as usize;
            p >= start && p + len <= start + r.size
        })
    }
}

/// Handle to one buffer in the pool.
///
/// The handle owns its region: dropping it without [`CodeBuffer::free`]
/// leaks the region until process exit (harmless for the image
/// lifecycle, which frees all buffers explicitly).
#[derive(Debug)]
pub struct CodeBuffer {
    header: *mut BufferHeader,
}

// Safety: buffers are only mutated by the single-threaded pipeline;
// handing a handle to another thread moves that right along with it.
unsafe impl Send for CodeBuffer {}

impl CodeBuffer {
    /// Allocate a buffer expected to hold `expected_size` bytes.
    pub fn new(expected_size: usize) -> CodeBuffer {
        assert!(expected_size > 0);
        let header = POOL.lock().alloc(expected_size);
        CodeBuffer { header }
    }

    /// Append `n` bytes, returning the write position.
    ///
    /// The returned pointer is valid only until the next `alloc`: if the
    /// buffer runs out of capacity it is moved to a larger region (the
    /// emitted prefix is copied, the old region freed).
    pub fn alloc(&mut self, n: usize) -> *mut u8 {
        unsafe {
            let required = (*self.header).used + n;
            if required > (*self.header).capacity {
                let new_size = required + n; // some extra space
                let mut pool = POOL.lock();
                let new_header = pool.alloc(new_size);
                std::ptr::copy_nonoverlapping(
                    (self.header as *mut u8).add(HEADER_SIZE),
                    (new_header as *mut u8).add(HEADER_SIZE),
                    (*self.header).used,
                );
                (*new_header).used = (*self.header).used;
                pool.free(self.header);
                self.header = new_header;
            }
            let at = (self.header as *mut u8)
                .add(HEADER_SIZE)
                .add((*self.header).used);
            (*self.header).used += n;
            at
        }
    }

    /// Trim the buffer to its used size (rounded to pointer alignment)
    /// and return the tail to the free list if it can hold an entry.
    pub fn terminate(&mut self) {
        unsafe {
            let data = (self.header as *mut u8).add(HEADER_SIZE);
            let end = data.add((*self.header).used);
            let aligned_end =
                ((end as usize + std::mem::size_of::<usize>() - 1) & !(std::mem::size_of::<usize>() - 1)) as *mut u8;
            let kept = aligned_end as usize - data as usize;
            let mut left_over = (*self.header).capacity - kept;
            if left_over < std::mem::size_of::<FreeHeader>() + 4 {
                // too small for a free-list entry: account it to this buffer
                left_over = 0;
            }
            (*self.header).capacity -= left_over;
            if left_over != 0 {
                let mut pool = POOL.lock();
                let entry = aligned_end as *mut FreeHeader;
                (*entry).size = left_over - HEADER_SIZE;
                (*entry).next = pool.free_list;
                pool.free_list = entry;
            }
        }
    }

    /// Return the buffer's region to the free list.
    pub fn free(self) {
        POOL.lock().free(self.header);
    }

    /// Pointer to the first emitted byte.
    pub fn entrypoint(&self) -> *mut u8 {
        unsafe { (self.header as *mut u8).add(HEADER_SIZE) }
    }

    /// Recover a buffer handle from its payload pointer.
    ///
    /// # Safety
    ///
    /// `entry` must be a pointer previously returned by
    /// [`CodeBuffer::entrypoint`] of a live (unfreed) buffer.
    pub unsafe fn from_entrypoint(entry: *mut u8) -> CodeBuffer {
        CodeBuffer {
            header: entry.sub(HEADER_SIZE) as *mut BufferHeader,
        }
    }

    /// Bytes emitted so far.
    pub fn len(&self) -> usize {
        unsafe { (*self.header).used }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Usable capacity.
    pub fn capacity(&self) -> usize {
        unsafe { (*self.header).capacity }
    }

    /// The emitted bytes.
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.entrypoint(), self.len()) }
    }
}

/// Walk the free list and verify every entry lies inside the pool and
/// no two entries overlap. Used by tests for the pool invariant.
pub fn verify_free_list() -> bool {
    let pool = POOL.lock();
    let mut entries: Vec<(usize, usize)> = Vec::new();
    unsafe {
        let mut entry = pool.free_list;
        while !entry.is_null() {
            let start = entry as usize;
            let len = HEADER_SIZE + (*entry).size;
            if !pool.contains(entry as *const u8, len) {
                return false;
            }
            entries.push((start, len));
            entry = (*entry).next;
        }
    }
    entries.sort_unstable();
    entries.windows(2).all(|w| w[0].0 + w[0].1 <= w[1].0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_write() {
        let mut buf = CodeBuffer::new(64);
        assert_eq!(buf.len(), 0);
        let p = buf.alloc(4);
        unsafe {
            p.copy_from_nonoverlapping([0xde, 0xad, 0xbe, 0xef].as_ptr(), 4);
        }
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        buf.free();
    }

    #[test]
    fn test_growth_preserves_prefix() {
        let mut buf = CodeBuffer::new(16);
        let cap = buf.capacity();
        // fill past the initial capacity to force relocation
        for i in 0..(cap + 64) {
            let p = buf.alloc(1);
            unsafe { *p = (i & 0xff) as u8 };
        }
        assert_eq!(buf.len(), cap + 64);
        for (i, &b) in buf.bytes().iter().enumerate() {
            assert_eq!(b, (i & 0xff) as u8);
        }
        buf.free();
    }

    #[test]
    fn test_terminate_returns_tail() {
        let mut buf = CodeBuffer::new(4096);
        let cap_before = buf.capacity();
        buf.alloc(10);
        buf.terminate();
        assert!(buf.capacity() < cap_before);
        // used size rounds up to pointer alignment at most
        assert!(buf.capacity() >= buf.len());
        assert!(verify_free_list());
        buf.free();
    }

    #[test]
    fn test_free_list_reuse() {
        // a private pool instance keeps this deterministic regardless of
        // what other tests do to the process-wide pool
        let mut pool = Pool {
            regions: Vec::new(),
            free_list: std::ptr::null_mut(),
        };
        let a = pool.alloc(128);
        let b = pool.alloc(128);
        assert_ne!(a, b);
        pool.free(a);
        // the freed region is first on the list and fits, so it comes back
        let c = pool.alloc(64);
        assert_eq!(a, c);
        unsafe {
            assert_eq!((*c).used, 0);
            assert!((*c).capacity >= 128);
        }
    }

    #[test]
    fn test_entrypoint_round_trip() {
        let mut buf = CodeBuffer::new(32);
        buf.alloc(2);
        let entry = buf.entrypoint();
        let recovered = unsafe { CodeBuffer::from_entrypoint(entry) };
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered.entrypoint(), entry);
        std::mem::forget(recovered); // one handle, one free
        buf.free();
    }

    #[test]
    fn test_free_list_integrity() {
        let mut pool = Pool {
            regions: Vec::new(),
            free_list: std::ptr::null_mut(),
        };
        let headers: Vec<_> = (1..8).map(|i| pool.alloc(i * 40)).collect();
        for header in headers {
            pool.free(header);
        }
        // every free entry lies inside the pool and none overlap
        let mut entries: Vec<(usize, usize)> = Vec::new();
        unsafe {
            let mut entry = pool.free_list;
            while !entry.is_null() {
                assert!(pool.contains(entry as *const u8, HEADER_SIZE + (*entry).size));
                entries.push((entry as usize, HEADER_SIZE + (*entry).size));
                entry = (*entry).next;
            }
        }
        entries.sort_unstable();
        assert!(entries.windows(2).all(|w| w[0].0 + w[0].1 <= w[1].0));

        // the shared pool's invariant holds as well
        assert!(verify_free_list());
    }
}
