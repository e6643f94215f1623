//! Pooled byte regions for record framing.
//!
//! A [`BufferPool`] hands out [`Region`]s of at least its suggested size and
//! takes them back on release. Every connection holds two [`Buffers`]
//! triples (receive and send), each made of a header and a padding region
//! from the small pool and a body region from the large pool.
//!
//! ```text
//!  claim ──► free list empty? ──yes──► grow by ~1/3 of allocated
//!                  │ no
//!                  ▼
//!              pop region
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Suggested size of small regions (record header and padding).
pub const SMALL_REGION_SIZE: usize = 8;

/// Default suggested size of body regions.
pub const DEFAULT_BODY_REGION_SIZE: usize = 4 * 1024;

/// An owned, fixed-length byte region.
#[derive(Debug)]
pub struct Region {
    bytes: Box<[u8]>,
}

impl Region {
    fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0u8; len].into_boxed_slice(),
        }
    }
}

impl Deref for Region {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for Region {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

#[derive(Debug)]
struct PoolState {
    free: Vec<Region>,
    allocated: usize,
}

#[derive(Debug)]
struct PoolInner {
    suggested_size: usize,
    state: Mutex<PoolState>,
}

/// A free list of regions, shared across all connections.
///
/// Cloning the pool yields another handle to the same free list.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create an empty pool handing out regions of `suggested_size` bytes.
    pub fn new(suggested_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                suggested_size,
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    allocated: 0,
                }),
            }),
        }
    }

    pub fn suggested_size(&self) -> usize {
        self.inner.suggested_size
    }

    /// Take a region from the free list, growing the pool if it is empty.
    pub fn claim(&self) -> Region {
        let mut state = self.inner.state.lock();

        if state.free.is_empty() {
            let grow = (state.allocated / 3).max(1);
            for _ in 0..grow {
                state.free.push(Region::zeroed(self.inner.suggested_size));
            }
            state.allocated += grow;
            tracing::trace!(
                size = self.inner.suggested_size,
                grow,
                allocated = state.allocated,
                "buffer pool expanded"
            );
        }

        // Non-empty after the growth above.
        state
            .free
            .pop()
            .unwrap_or_else(|| Region::zeroed(self.inner.suggested_size))
    }

    /// Allocate a dedicated region of `len` bytes. It is counted like any
    /// other region of the pool and joins the free list on release.
    fn allocate(&self, len: usize) -> Region {
        let len = len.max(self.inner.suggested_size);
        self.inner.state.lock().allocated += 1;
        tracing::trace!(len, "oversized buffer region allocated");
        Region::zeroed(len)
    }

    /// Return a region to the free list.
    ///
    /// Regions smaller than the suggested size did not come from this pool
    /// and are dropped instead.
    pub fn release(&self, region: Region) {
        if region.len() < self.inner.suggested_size {
            debug_assert!(false, "released region smaller than the suggested size");
            return;
        }
        self.inner.state.lock().free.push(region);
    }

    /// Number of regions the pool has allocated so far.
    pub fn allocated(&self) -> usize {
        self.inner.state.lock().allocated
    }

    /// Number of regions currently waiting in the free list.
    pub fn available(&self) -> usize {
        self.inner.state.lock().free.len()
    }
}

/// The small and large pools of a server.
#[derive(Debug, Clone)]
pub struct BufferPools {
    pub small: BufferPool,
    pub large: BufferPool,
}

impl BufferPools {
    pub fn new(body_region_size: usize) -> Self {
        Self {
            small: BufferPool::new(SMALL_REGION_SIZE),
            large: BufferPool::new(body_region_size),
        }
    }

    /// Claim a header/body/padding triple.
    pub fn claim_triple(&self) -> Buffers {
        Buffers {
            header: Some(self.small.claim()),
            body: Some(self.large.claim()),
            padding: Some(self.small.claim()),
            pools: self.clone(),
        }
    }
}

impl Default for BufferPools {
    fn default() -> Self {
        Self::new(DEFAULT_BODY_REGION_SIZE)
    }
}

/// Header, body and padding regions used to frame one record at a time.
///
/// The regions go back to their pools when the triple is dropped.
#[derive(Debug)]
pub struct Buffers {
    header: Option<Region>,
    body: Option<Region>,
    padding: Option<Region>,
    pools: BufferPools,
}

impl Buffers {
    /// Header region with room for at least `len` bytes.
    pub fn header(&mut self, len: usize) -> &mut [u8] {
        enforce(&mut self.header, &self.pools.small, len)
    }

    /// Body region with room for at least `len` bytes.
    pub fn body(&mut self, len: usize) -> &mut [u8] {
        enforce(&mut self.body, &self.pools.large, len)
    }

    /// Padding region with room for at least `len` bytes.
    pub fn padding(&mut self, len: usize) -> &mut [u8] {
        enforce(&mut self.padding, &self.pools.small, len)
    }
}

impl Drop for Buffers {
    fn drop(&mut self) {
        if let Some(region) = self.header.take() {
            self.pools.small.release(region);
        }
        if let Some(region) = self.padding.take() {
            self.pools.small.release(region);
        }
        if let Some(region) = self.body.take() {
            self.pools.large.release(region);
        }
    }
}

/// Make sure `slot` holds a region of at least `len` bytes and return its
/// first `len` bytes. An undersized region goes back to `pool` and is
/// replaced by a dedicated allocation counted against `pool`.
fn enforce<'a>(slot: &'a mut Option<Region>, pool: &BufferPool, len: usize) -> &'a mut [u8] {
    if slot.as_ref().is_some_and(|region| region.len() < len) {
        if let Some(old) = slot.take() {
            pool.release(old);
        }
    }

    let region = slot.get_or_insert_with(|| pool.allocate(len));
    &mut region[..len]
}
