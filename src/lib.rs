//! # Buddy Memory Allocator
//!
//! A buddy-system allocator over a single `mmap`-backed region. The pool
//! maintains one free list per power-of-two block size (`avail[k]`), splits
//! a larger free block on demand when a smaller one is requested, and
//! coalesces adjacent buddies back together on `free`.
//!
//! The core ([`BuddyPool`]) is single-threaded; wrap it in [`sync::SyncBuddyPool`]
//! to share one pool across threads.
mod buddy_error;
mod sync;

pub use buddy_error::BuddyError;
pub use sync::SyncBuddyPool;

use errno::*;
use log::{debug, error, trace};
use memmap2::MmapMut;
use std::{array, ptr};

/// The default amount of memory that this memory manager will manage unless explicitly set. The
/// number of bytes is calculated as 2^DEFAULT_K
pub const DEFAULT_K: usize = 30;

/// The minimum size of the buddy memory pool.
pub const MIN_K: usize = 20;

/// The maximum size of the buddy memory pool. This is 1 larger than needed to allow indexes 1-N
/// instead of 0-N. Internally the maximum amount of memory is MAX_K-1
pub const MAX_K: usize = 48;

/// The smallest block the allocator will ever carve, regardless of how small the
/// request is. Must be large enough to hold an `Avail` header.
pub const SMALLEST_K: usize = 6;

const BLOCK_RESERVED: u8 = 0; // Block has been handed to user
const BLOCK_AVAIL: u8 = 1; // Block is available to allocate
const BLOCK_UNUSED: u8 = 3; // Block is not used at all (sentinel)

/// The error code for ENOMEM as defined in the POSIX standard
const ENOMEM: Errno = Errno(12);

/// Struct to represent the table of all available blocks
struct Avail {
    tag: u8,          // Tag for block status BLOCK_AVAIL, BLOCK_RESERVED, BLOCK_UNUSED
    kval: usize,      // The kval of this block
    next: *mut Avail, // next memory block
    prev: *mut Avail, // prev memory block
}

impl Avail {
    /// Create a new Avail struct with default values
    ///
    /// # Returns
    /// a new Avail struct
    fn new() -> Avail {
        Avail {
            tag: BLOCK_UNUSED,
            kval: 0,
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }
}

/// The buddy memory pool.
///
/// Always heap-allocated behind a [`Box`] (see [`BuddyPool::new`]): the sentinel
/// headers in `avail` point at each other and at themselves, so the pool's
/// backing memory must never move once those pointers are written.
pub struct BuddyPool {
    kval_m: usize,         // The max kval of this pool
    base: MmapMut,         // Base address used to scale memory for buddy calculations
    avail: [Avail; MAX_K], // The array of available memory blocks
}

impl BuddyPool {
    /// Create and initialize a new memory pool using the buddy algorithm. Internally,
    /// this function uses memmap2 to get a block of memory to manage, so it should be
    /// portable to any system that implements mmap as well as Windows. This function
    /// will round up to the nearest power of two. So if the user requests 503MiB it
    /// will be rounded up to 512MiB.
    ///
    /// Note that if a 0 is passed as an argument then it initializes the memory pool to
    /// be of the default size of DEFAULT_K. If the caller specifies an unreasonably
    /// small size, then the buddy system may not be able to satisfy any requests.
    ///
    /// NOTE: Memory pools returned by this function can not be intermingled. Calling
    /// `malloc` with pool A and then calling `free` with pool B will result in
    /// undefined behavior.
    ///
    /// # Arguments
    /// * size - The size of the pool in bytes
    pub fn new(size: usize) -> Result<Box<BuddyPool>, BuddyError> {
        let kval = if size == 0 { DEFAULT_K } else { bytes_to_k(size) };
        let kval_m = kval.clamp(MIN_K, MAX_K - 1);

        let numbytes = 1usize << kval_m;
        // Memory map a block of raw memory to manage
        let base = MmapMut::map_anon(numbytes).map_err(|_| {
            error!("buddy pool init failed: mmap of {} bytes failed", numbytes);
            set_errno(ENOMEM);
            BuddyError::NoMemory
        })?;

        let mut pool = Box::new(BuddyPool {
            kval_m,
            base,
            avail: array::from_fn(|_| Avail::new()),
        });
        pool.init();
        debug!("buddy pool initialized: kval_m={kval_m} numbytes={numbytes}");
        Ok(pool)
    }

    /// Lay out the sentinel rings and the single whole-pool free block. Must run
    /// after the pool's final heap address is fixed (see the `Box` in `new`),
    /// because the sentinels and the first block are self-referential pointers
    /// into `self.avail` and `self.base`.
    fn init(&mut self) {
        // Initialize the avail list
        for i in 0..=self.kval_m {
            self.avail[i].next = &mut self.avail[i] as *mut Avail;
            self.avail[i].prev = &mut self.avail[i] as *mut Avail;
            self.avail[i].kval = i;
            self.avail[i].tag = BLOCK_UNUSED;
        }

        //Add in the first block
        let base_ptr = self.base.as_ptr() as *mut Avail;
        self.avail[self.kval_m].next = base_ptr;
        self.avail[self.kval_m].prev = base_ptr;

        let m = unsafe { &mut *base_ptr };
        m.tag = BLOCK_AVAIL;
        m.kval = self.kval_m;
        m.next = &mut self.avail[self.kval_m] as *mut Avail;
        m.prev = &mut self.avail[self.kval_m] as *mut Avail;
    }

    /// Find the buddy of a given header, relative to the base address we got from memmap2.
    ///
    /// # Arguments
    /// * avail - The memory block that we want to find the buddy for
    ///
    /// # Returns
    /// a pointer to the buddy
    fn buddy_calc(&self, avail: &Avail) -> *mut Avail {
        let mut addr = (avail as *const Avail).addr();
        addr -= self.base.as_ptr().addr();
        let mask = 1usize << avail.kval;
        unsafe { self.base.as_ptr().offset((addr ^ mask) as isize) as *mut Avail }
    }

    /// Computes the address of the buddy of the block whose header begins at
    /// `block`, exposed for testing. `block` must be a header address (as
    /// returned by `(ptr as *mut u8).sub(size_of::<Avail>())` on an issued user
    /// pointer), not the user pointer itself, and must have `kval < kval_m` --
    /// the whole-pool block has no buddy and calling this on it is a
    /// programming error.
    pub fn buddy_of(&self, block: *mut u8) -> *mut u8 {
        let avail = unsafe { &*(block as *const Avail) };
        self.buddy_calc(avail) as *mut u8
    }

    /// Allocates a block of size bytes of memory, returning a pointer to the beginning of the
    /// block. The content of the newly allocated block of memory is not initialized, remaining
    /// with indeterminate values.
    ///
    /// Requesting zero bytes returns `Err(BuddyError::InvalidArgument)` without touching any
    /// pool state and without setting the host out-of-memory indicator.
    ///
    /// # Arguments
    /// * size - The size of the user requested memory block in bytes
    ///
    /// # Returns
    /// a pointer to the memory block
    pub fn malloc(&mut self, size: usize) -> Result<*mut u8, BuddyError> {
        if size == 0 {
            return Err(BuddyError::InvalidArgument);
        }
        let avail_size = size_of::<Avail>();
        let kval = bytes_to_k(size + avail_size).max(SMALLEST_K);
        trace!("malloc: {size} bytes requested -> kval {kval}");
        unsafe { Ok((self.malloc_kval(kval)? as *mut u8).add(avail_size)) }
    }

    /// Allocates a block of memory of size 2^k bytes, returning a pointer to the Avail struct at
    /// the start of the block. This is in contrast to the malloc function which returns a pointer
    /// to the start of usable user memory.
    ///
    /// # Arguments
    /// * kval - The size of the requested block in K values
    ///
    /// # Returns
    /// a pointer to the Avail struct at the start of the block
    unsafe fn malloc_kval(&mut self, kval: usize) -> Result<*mut Avail, BuddyError> {
        if kval > self.kval_m {
            error!("buddy pool out of memory: no block >= kval {kval} (kval_m={})", self.kval_m);
            set_errno(ENOMEM);
            return Err(BuddyError::NoMemory);
        }
        if self.avail[kval].next as *const Avail != &self.avail[kval] {
            let block = self.avail[kval].next;
            self.remove_from_avail(&mut *block);
            return Ok(block);
        }
        //No blocks available at this kval, try to split a larger block
        let larger_block = self.malloc_kval(kval + 1)?;
        Ok(self.split(&mut *larger_block))
    }

    /// Splits a block of memory into two smaller blocks. This function will return a pointer to the
    /// block with the lowest address, the other block will be added to the Avail list. The returned
    /// block will be tagged as reserved and not added to the avail list.
    ///
    /// # Arguments
    /// * avail - The block of memory to split
    ///
    /// # Returns
    /// a pointer to the block with the lowest address after the split
    fn split<'a>(&mut self, avail: &'a mut Avail) -> &'a mut Avail {
        let kval = avail.kval;
        avail.kval -= 1;
        avail.tag = BLOCK_RESERVED;
        let buddy = self.buddy_calc(avail);
        unsafe {
            ptr::write(buddy, Avail::new());
            let buddy = &mut *buddy;
            buddy.kval = kval - 1;
            buddy.tag = BLOCK_AVAIL;
            self.add_to_avail(buddy);
        }
        trace!("split: kval {kval} -> two blocks at kval {}", kval - 1);
        avail
    }

    /// A block of memory previously allocated by a call to malloc is deallocated, making it
    /// available again for further allocations.
    ///
    /// If ptr does not point to a block of memory allocated by this pool, the call is ignored.
    ///
    /// If ptr is a null pointer, the function does nothing. Notice that this function does not
    /// change the value of ptr itself, hence it still points to the same (now invalid) location.
    ///
    /// # Arguments
    /// * ptr - Pointer to the memory block to free
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            let header = ptr.sub(size_of::<Avail>()) as *mut Avail;
            let Some(avail) = header.as_mut() else {
                return;
            };
            // Guards against double-free and frees of foreign pointers at a best-effort
            // level: anything whose header doesn't currently read RESERVED is ignored.
            if avail.tag != BLOCK_RESERVED {
                return;
            }
            self.free_avail(avail);
        }
    }

    /// Frees a block of memory previously allocated by a call to malloc. This function should
    /// only be used internally as it takes as an argument the reference to the Avail struct, not
    /// the pointer to user memory.
    unsafe fn free_avail(&mut self, avail: &mut Avail) {
        let mut avail = avail;
        let mut buddy_o = self.get_avail_buddy(avail);
        while let Some(buddy) = buddy_o {
            let buddy = buddy as *mut Avail;
            self.remove_from_avail(&mut *buddy);
            if (avail as *mut Avail) < buddy {
                avail.kval += 1;
            } else {
                (*buddy).kval += 1;
                avail = &mut *buddy;
            }
            trace!("coalesce: merged into block at kval {}", avail.kval);
            buddy_o = self.get_avail_buddy(avail);
        }
        self.add_to_avail(avail);
    }

    /// Adds a block of memory to the avail list and tags it as available.
    ///
    /// # Arguments
    /// * avail - The block of memory to add to the avail list
    fn add_to_avail(&mut self, avail: &mut Avail) {
        let kval = avail.kval;
        avail.prev = self.avail[kval].prev;
        avail.next = &mut self.avail[kval];
        unsafe {
            (*self.avail[kval].prev).next = avail;
        }
        self.avail[kval].prev = avail;
        avail.tag = BLOCK_AVAIL;
    }

    /// Removes a block of memory from the avail list and tags it as reserved.
    ///
    /// # Arguments
    /// * avail - The block of memory to remove from the avail list
    fn remove_from_avail(&mut self, avail: &mut Avail) {
        unsafe {
            (*avail.next).prev = avail.prev;
            (*avail.prev).next = avail.next;
        }
        avail.tag = BLOCK_RESERVED;
        avail.next = ptr::null_mut();
        avail.prev = ptr::null_mut();
    }

    /// Gets the buddy of a block of memory. This function will return None if the buddy is not
    /// tagged as available or is not the same size. This is most useful in coalescing blocks
    /// during a free operation.
    ///
    /// # Arguments
    /// * avail - The block of memory to get the buddy for
    ///
    /// # Returns
    /// a reference to the buddy block if it is available, otherwise None
    fn get_avail_buddy(&self, avail: &Avail) -> Option<&mut Avail> {
        if avail.kval == self.kval_m {
            return None;
        }
        let buddy = unsafe { self.buddy_calc(avail).as_mut().unwrap() };
        if buddy.tag != BLOCK_AVAIL {
            return None;
        }
        if buddy.kval != avail.kval {
            return None;
        }
        Some(buddy)
    }
}

impl Drop for BuddyPool {
    /// Inverse of init. Releases all memory allocated by the buddy allocator. This function
    /// will be called automatically when the BuddyPool goes out of scope.
    fn drop(&mut self) {
        debug!("buddy pool destroyed: kval_m={}", self.kval_m);
        let _ = self.base.flush();
    }
}

/// Converts bytes to its equivalent K value defined as the smallest K for which `bytes <= 2^K`.
///
/// # Arguments
/// * bytes - the number of bytes
///
/// # Returns
/// the K value that will fit bytes
pub fn bytes_to_k(mut bytes: usize) -> usize {
    if bytes == 0 {
        return 0;
    }
    let mut k: usize = 0;
    bytes -= 1;
    while bytes > 0 {
        bytes >>= 1;
        k += 1;
    }
    k
}
