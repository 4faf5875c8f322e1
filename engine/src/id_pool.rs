//! Pooled storage for 32-byte connection identifiers.
//!
//! The pool owns one contiguous allocation sliced into fixed 32-byte slots.
//! Connections check a slot out at session start and return it on teardown.
//! The backing region never moves for the lifetime of the pool, so slot
//! addresses stay valid even when handed to long-running I/O registrations.
//!
//! Clients know their exact concurrent-connection count up front and commit
//! every slot at construction. Servers cannot know how many connections they
//! will field, so they reserve room for a large cap and hand out slots in
//! chunks, growing the free list on demand.

use parking_lot::Mutex;

use crate::error::Error;

/// Length of a connection identifier in bytes.
pub const CONNECTION_ID_LENGTH: usize = 32;

/// Upper bound on concurrent server-side connections the pool reserves for.
pub const SERVER_MAX_CONNECTIONS: usize = 1_000_000;

/// How many slots a server commits at a time.
pub const SERVER_GROWTH_CHUNK: usize = 2_500;

/// A checked-out 32-byte slot, identified by its index into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(u32);

impl Slot {
    /// Byte offset of this slot within the pool's backing region.
    #[inline]
    pub fn offset(&self) -> usize {
        self.0 as usize * CONNECTION_ID_LENGTH
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Thread-safe pool of connection-id slots.
///
/// A single mutex guards the free list; contention is acceptable because
/// checkouts happen only at connection start and end.
pub struct IdPool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    storage: Box<[u8]>,
    /// Slots handed to the free list so far. Grows in chunks for servers;
    /// fixed at the slot capacity for clients.
    committed: usize,
    free: Vec<u32>,
    /// Zero for clients: the pool never grows past its initial commit.
    growth_chunk: usize,
}

impl IdPool {
    /// A client pool, committed once for exactly `connection_limit` slots.
    pub fn client(connection_limit: usize) -> Self {
        assert!(connection_limit > 0, "IdPool requires at least one slot");
        let mut inner = PoolInner {
            storage: vec![0u8; connection_limit * CONNECTION_ID_LENGTH].into_boxed_slice(),
            committed: 0,
            free: Vec::with_capacity(connection_limit),
            growth_chunk: 0,
        };
        inner.commit(connection_limit);
        Self { inner: Mutex::new(inner) }
    }

    /// A server pool: reserved for [`SERVER_MAX_CONNECTIONS`], committed in
    /// [`SERVER_GROWTH_CHUNK`]-slot chunks as demand grows.
    pub fn server() -> Self {
        let mut inner = PoolInner {
            storage: vec![0u8; SERVER_MAX_CONNECTIONS * CONNECTION_ID_LENGTH].into_boxed_slice(),
            committed: 0,
            free: Vec::new(),
            growth_chunk: SERVER_GROWTH_CHUNK,
        };
        inner.commit(SERVER_GROWTH_CHUNK);
        Self { inner: Mutex::new(inner) }
    }

    /// Check out a free slot, growing the committed region if the free list
    /// is empty and the pool still has reserved headroom.
    pub fn checkout(&self) -> Result<Slot, Error> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            if inner.growth_chunk == 0 {
                // Clients pre-commit exactly the number of slots they need;
                // running dry means more connections are live than the
                // configured limit allows.
                return Err(Error::OutOfResource);
            }
            let chunk = inner.growth_chunk;
            if !inner.commit(chunk) {
                return Err(Error::OutOfResource);
            }
        }
        let index = inner
            .free
            .pop()
            .expect("free list cannot be empty after a successful grow");
        Ok(Slot(index))
    }

    /// Return a slot to the free list. Never fails.
    pub fn checkin(&self, slot: Slot) {
        let mut inner = self.inner.lock();
        debug_assert!(slot.index() < inner.committed, "checkin of an uncommitted slot");
        inner.free.push(slot.0);
    }

    /// Write a 32-byte identifier into a checked-out slot.
    pub fn write(&self, slot: Slot, id: &[u8; CONNECTION_ID_LENGTH]) {
        let mut inner = self.inner.lock();
        let offset = slot.offset();
        inner.storage[offset..offset + CONNECTION_ID_LENGTH].copy_from_slice(id);
    }

    /// Read the identifier stored in a slot.
    pub fn read(&self, slot: Slot) -> [u8; CONNECTION_ID_LENGTH] {
        let inner = self.inner.lock();
        let offset = slot.offset();
        let mut id = [0u8; CONNECTION_ID_LENGTH];
        id.copy_from_slice(&inner.storage[offset..offset + CONNECTION_ID_LENGTH]);
        id
    }

    /// Number of slots currently committed to the free list (live or free).
    pub fn committed(&self) -> usize {
        self.inner.lock().committed
    }

    /// Number of slots currently available for checkout.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl PoolInner {
    /// Extend the free list by up to `count` slots. Returns false when the
    /// reservation is fully committed.
    fn commit(&mut self, count: usize) -> bool {
        let capacity = self.storage.len() / CONNECTION_ID_LENGTH;
        if self.committed == capacity {
            return false;
        }
        let target = (self.committed + count).min(capacity);
        for index in self.committed..target {
            self.free.push(index as u32);
        }
        self.committed = target;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_write_read_round_trip() {
        let pool = IdPool::client(4);
        let slot = pool.checkout().unwrap();
        let id = [0xABu8; CONNECTION_ID_LENGTH];
        pool.write(slot, &id);
        assert_eq!(pool.read(slot), id);
        pool.checkin(slot);
    }

    #[test]
    fn live_slots_are_distinct() {
        let pool = IdPool::client(8);
        let mut slots = Vec::new();
        for _ in 0..8 {
            slots.push(pool.checkout().unwrap());
        }
        for (i, a) in slots.iter().enumerate() {
            for b in &slots[i + 1..] {
                assert_ne!(a.offset(), b.offset());
            }
        }
    }

    #[test]
    fn client_pool_exhaustion() {
        let pool = IdPool::client(2);
        let _a = pool.checkout().unwrap();
        let _b = pool.checkout().unwrap();
        assert!(matches!(pool.checkout(), Err(Error::OutOfResource)));
    }

    #[test]
    fn checkin_makes_slot_reusable() {
        let pool = IdPool::client(1);
        let a = pool.checkout().unwrap();
        pool.checkin(a);
        let b = pool.checkout().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn server_pool_grows_in_chunks() {
        let pool = IdPool::server();
        assert_eq!(pool.committed(), SERVER_GROWTH_CHUNK);

        // Drain the first chunk entirely.
        let mut slots = Vec::new();
        for _ in 0..SERVER_GROWTH_CHUNK {
            slots.push(pool.checkout().unwrap());
        }
        assert_eq!(pool.free_count(), 0);

        // The next checkout triggers a grow.
        let extra = pool.checkout().unwrap();
        assert_eq!(pool.committed(), 2 * SERVER_GROWTH_CHUNK);
        assert_eq!(extra.index(), 2 * SERVER_GROWTH_CHUNK - 1);
    }

    #[test]
    fn distinct_slots_do_not_alias() {
        let pool = IdPool::client(2);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        pool.write(a, &[0x11; CONNECTION_ID_LENGTH]);
        pool.write(b, &[0x22; CONNECTION_ID_LENGTH]);
        assert_eq!(pool.read(a), [0x11; CONNECTION_ID_LENGTH]);
        assert_eq!(pool.read(b), [0x22; CONNECTION_ID_LENGTH]);
    }
}
