use std::{fmt, hash::Hash, marker::PhantomData};

use generational_arena::{Arena, Index};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool '{pool}' exhausted ({capacity} slots in use)")]
    Exhausted { pool: &'static str, capacity: usize },
}

/// Non-owning reference to a pool slot. Stale handles (slot released and
/// reused since) fail to resolve instead of aliasing the new occupant.
pub struct HandleId<T> {
    idx: Index,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HandleId<T> {
    fn from_index(idx: Index) -> Self {
        Self {
            idx,
            _marker: PhantomData,
        }
    }

    /// Reserved sentinel, never returned by `obtain`.
    pub fn invalid() -> Self {
        Self::from_index(Index::from_raw_parts(usize::MAX, u64::MAX))
    }

    pub fn is_invalid(&self) -> bool {
        self.idx == Index::from_raw_parts(usize::MAX, u64::MAX)
    }

    pub fn slot(&self) -> usize {
        self.idx.into_raw_parts().0
    }

    pub fn generation(&self) -> u64 {
        self.idx.into_raw_parts().1
    }
}

impl<T> Clone for HandleId<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for HandleId<T> {}

impl<T> PartialEq for HandleId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
    }
}
impl<T> Eq for HandleId<T> {}

impl<T> Hash for HandleId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.idx.hash(state);
    }
}

impl<T> fmt::Debug for HandleId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            return write!(f, "HandleId(invalid)");
        }
        let (slot, generation) = self.idx.into_raw_parts();
        write!(f, "HandleId({slot}v{generation})")
    }
}

/// Fixed-capacity slot pool. Released slots are handed out again most recently
/// released first; the pool never grows past the capacity it was created with.
pub struct ResourcePool<T, Tag = T> {
    name: &'static str,
    arena: Arena<T>,
    capacity: usize,
    _tag: PhantomData<fn() -> Tag>,
}

impl<T, Tag> ResourcePool<T, Tag> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            arena: Arena::with_capacity(capacity),
            capacity,
            _tag: PhantomData,
        }
    }

    pub fn obtain(&mut self, value: T) -> Result<HandleId<Tag>, PoolError> {
        self.arena
            .try_insert(value)
            .map(HandleId::from_index)
            .map_err(|_| PoolError::Exhausted {
                pool: self.name,
                capacity: self.capacity,
            })
    }

    pub fn access(&self, handle: HandleId<Tag>) -> Option<&T> {
        self.arena.get(handle.idx)
    }

    pub fn access_mut(&mut self, handle: HandleId<Tag>) -> Option<&mut T> {
        self.arena.get_mut(handle.idx)
    }

    pub fn release(&mut self, handle: HandleId<Tag>) -> Option<T> {
        self.arena.remove(handle.idx)
    }

    pub fn contains(&self, handle: HandleId<Tag>) -> bool {
        self.arena.contains(handle.idx)
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandleId<Tag>, &T)> {
        self.arena.iter().map(|(idx, value)| (HandleId::from_index(idx), value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (HandleId<Tag>, &mut T)> {
        self.arena
            .iter_mut()
            .map(|(idx, value)| (HandleId::from_index(idx), value))
    }

    pub fn handles(&self) -> Vec<HandleId<Tag>> {
        self.arena.iter().map(|(idx, _)| HandleId::from_index(idx)).collect()
    }

    /// Releases every live slot, returning the values.
    pub fn free_all(&mut self) -> Vec<(HandleId<Tag>, T)> {
        let handles = self.handles();
        handles
            .into_iter()
            .filter_map(|handle| self.release(handle).map(|value| (handle, value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct _Thing;

    #[test]
    fn obtain_until_exhausted() {
        let mut pool: ResourcePool<u32, _Thing> = ResourcePool::new("things", 2);
        pool.obtain(1).unwrap();
        pool.obtain(2).unwrap();
        assert_eq!(
            pool.obtain(3),
            Err(PoolError::Exhausted { pool: "things", capacity: 2 })
        );
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn released_slot_is_reused_and_stale_handle_misses() {
        let mut pool: ResourcePool<&str> = ResourcePool::new("names", 4);
        let a = pool.obtain("a").unwrap();
        let b = pool.obtain("b").unwrap();
        assert_eq!(pool.release(a), Some("a"));
        assert_eq!(pool.release(b), Some("b"));

        let c = pool.obtain("c").unwrap();
        assert_eq!(c.slot(), b.slot(), "last released slot comes back first");
        assert_ne!(c, b);
        assert!(pool.access(b).is_none());
        assert_eq!(pool.access(c), Some(&"c"));

        let d = pool.obtain("d").unwrap();
        assert_eq!(d.slot(), a.slot());
        assert!(pool.access(a).is_none());
    }

    #[test]
    fn invalid_handle_never_resolves() {
        let mut pool: ResourcePool<u8> = ResourcePool::new("bytes", 1);
        pool.obtain(7).unwrap();
        let invalid = HandleId::<u8>::invalid();
        assert!(invalid.is_invalid());
        assert!(pool.access(invalid).is_none());
        assert!(pool.release(invalid).is_none());
    }

    #[test]
    fn free_all_empties_pool() {
        let mut pool: ResourcePool<u8> = ResourcePool::new("bytes", 3);
        let h = pool.obtain(1).unwrap();
        pool.obtain(2).unwrap();
        let freed = pool.free_all();
        assert_eq!(freed.len(), 2);
        assert!(pool.is_empty());
        assert!(!pool.contains(h));
        pool.obtain(3).unwrap();
        pool.obtain(4).unwrap();
        pool.obtain(5).unwrap();
    }
}
