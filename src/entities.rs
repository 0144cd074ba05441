use core::fmt;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use thiserror::Error;

/// Generation value marking an invalid handle. Live entities always carry a
/// non-zero generation.
const INVALID_GENERATION: u32 = 0;

/// Lightweight unique ID, or handle, of an entity
///
/// Obtained from [`World::create_entity`](crate::World::create_entity) or
/// [`World::reserve_entity`](crate::World::reserve_entity). A handle packs a
/// slot index and a generation counter; recycling a slot bumps the
/// generation, so stale handles can be told apart from their successors.
#[derive(Clone, Copy, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct Entity {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Entity {
    /// The designated invalid handle.
    pub const INVALID: Entity = Entity {
        index: u32::MAX,
        generation: INVALID_GENERATION,
    };

    /// Slot index. Unique among live entities, reused after destruction.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot at the time this handle was issued.
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Whether this handle is structurally well-formed (not the invalid
    /// sentinel). Says nothing about liveness; ask the world for that.
    pub fn valid(self) -> bool {
        self.generation != INVALID_GENERATION
    }

    /// Packs the handle into 64 bits: generation in the upper half, index in
    /// the lower. Useful for storing handles externally.
    pub fn to_bits(self) -> u64 {
        u64::from(self.generation) << 32 | u64::from(self.index)
    }

    /// Reconstructs a handle previously taken apart with
    /// [`to_bits`](Entity::to_bits), or `None` for bit patterns that cannot
    /// name a live entity.
    pub fn from_bits(bits: u64) -> Option<Self> {
        let generation = (bits >> 32) as u32;
        if generation == INVALID_GENERATION {
            return None;
        }
        Some(Self {
            index: bits as u32,
            generation,
        })
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Error indicating that no entity with a particular ID exists
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("no such entity")]
pub struct NoSuchEntity;

/// Entity lifecycle bookkeeping: generation counters, a LIFO free list, and
/// an atomic cursor that lets handles be reserved from any thread.
///
/// Structural operations (`create`, `destroy`, `flush_reserved`) are
/// single-writer and run between schedules; `reserve` and `is_valid` are
/// safe to call concurrently with them excluded.
#[derive(Default)]
pub(crate) struct Entities {
    /// Current generation per slot; the slot count doubles as the high-water
    /// mark of materialized indices.
    generations: Vec<u32>,
    /// Recycled slot indices, popped last-in-first-out.
    free_indices: Vec<u32>,
    /// Mirrors `free_indices.len()`; batch creation claims a run of free
    /// slots with a single compare-exchange.
    free_cursor: AtomicI64,
    /// Next never-used index. `reserve` bumps this without touching any
    /// other state.
    next_index: AtomicU32,
    count: AtomicUsize,
}

impl Entities {
    /// Whether reserved handles are waiting for `flush_reserved`.
    pub fn needs_flush(&self) -> bool {
        (self.generations.len() as u32) < self.next_index.load(Ordering::Relaxed)
    }

    fn verify_flushed(&self) {
        debug_assert!(
            !self.needs_flush(),
            "flush_reserved must run before structural entity operations"
        );
    }

    /// Creates one entity, preferring the most recently freed slot.
    pub fn create(&mut self) -> Entity {
        self.verify_flushed();

        self.count.fetch_add(1, Ordering::Relaxed);
        if let Some(index) = self.free_indices.pop() {
            self.free_cursor
                .store(self.free_indices.len() as i64, Ordering::Relaxed);
            // The generation was already advanced when the slot was freed.
            Entity {
                index,
                generation: self.generations[index as usize],
            }
        } else {
            let index = self.next_index.fetch_add(1, Ordering::Relaxed);
            debug_assert_eq!(index as usize, self.generations.len());
            self.generations.push(1);
            Entity {
                index,
                generation: 1,
            }
        }
    }

    /// Creates `count` entities, draining the free list first via the
    /// cursor, then extending the index space in bulk.
    pub fn create_many(&mut self, count: usize, out: &mut impl Extend<Entity>) {
        if count == 0 {
            return;
        }
        self.verify_flushed();

        let mut remaining = count;

        let cursor = self.free_cursor.load(Ordering::Relaxed);
        let available = cursor.max(0) as usize;
        let from_free = remaining.min(available);
        if from_free > 0 {
            let new_cursor = cursor - from_free as i64;
            if self
                .free_cursor
                .compare_exchange(cursor, new_cursor, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let start = new_cursor as usize;
                for &index in &self.free_indices[start..start + from_free] {
                    out.extend([Entity {
                        index,
                        generation: self.generations[index as usize],
                    }]);
                }
                self.free_indices.truncate(start);
                remaining -= from_free;
            }
        }

        if remaining > 0 {
            let start = self
                .next_index
                .fetch_add(remaining as u32, Ordering::Relaxed);
            debug_assert_eq!(start as usize, self.generations.len());
            let end = start + remaining as u32;
            self.generations.resize(end as usize, 1);
            out.extend((start..end).map(|index| Entity {
                index,
                generation: 1,
            }));
        }

        self.count.fetch_add(count, Ordering::Relaxed);
    }

    /// Hands out an index without materializing the entity. The handle is
    /// not valid until `flush_reserved` runs on the owning thread.
    ///
    /// Lock-free; callable from any thread.
    pub fn reserve(&self) -> Entity {
        // Only the monotonic counter moves here; generations and the live
        // count are updated during the flush.
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        Entity {
            index,
            generation: 1,
        }
    }

    /// Materializes every handle issued by `reserve` since the last flush.
    pub fn flush_reserved(&mut self) {
        let next = self.next_index.load(Ordering::Relaxed);
        let flushed = self.generations.len() as u32;
        if next > flushed {
            self.generations.resize(next as usize, 1);
            self.count
                .fetch_add((next - flushed) as usize, Ordering::Relaxed);
        }
    }

    /// Destroys `entity`. Destroying a stale or malformed handle is a
    /// contract violation; the operation is skipped in release builds.
    pub fn destroy(&mut self, entity: Entity) {
        if !self.is_valid(entity) {
            contract_violation!("destroy: entity {entity:?} is not alive");
            return;
        }
        self.free(entity);
    }

    /// Destroys `entity` if it is still alive; stale handles are a no-op.
    /// Returns whether anything was destroyed.
    pub fn try_destroy(&mut self, entity: Entity) -> bool {
        if !self.is_valid(entity) {
            return false;
        }
        self.free(entity);
        true
    }

    fn free(&mut self, entity: Entity) {
        self.verify_flushed();

        let slot = &mut self.generations[entity.index as usize];
        // Advance the generation in place so the slot can be recycled with a
        // fresh handle; zero is reserved for the invalid sentinel.
        *slot = match slot.wrapping_add(1) {
            INVALID_GENERATION => 1,
            next => next,
        };

        self.free_indices.push(entity.index);
        self.free_cursor
            .store(self.free_indices.len() as i64, Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether `entity` names a live, flushed slot.
    pub fn is_valid(&self, entity: Entity) -> bool {
        entity.valid()
            && (entity.index as usize) < self.generations.len()
            && self.generations[entity.index as usize] == entity.generation
    }

    /// Number of live entities.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Grows the slot and free-list capacity ahead of time.
    pub fn reserve_capacity(&mut self, additional: usize) {
        self.generations.reserve(additional);
        self.free_indices.reserve(additional);
    }

    /// Destroys everything and resets the index space.
    pub fn clear(&mut self) {
        self.generations.clear();
        self.free_indices.clear();
        self.free_cursor.store(0, Ordering::Relaxed);
        self.next_index.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::{HashMap, HashSet};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn entity_bits_roundtrip() {
        let e = Entity {
            index: 0xBAAD_F00D,
            generation: 0xDEAD_BEEF,
        };
        assert_eq!(Entity::from_bits(e.to_bits()).unwrap(), e);
        assert_eq!(Entity::from_bits(Entity::INVALID.to_bits()), None);
    }

    #[test]
    fn recycle_is_lifo_with_bumped_generation() {
        let mut entities = Entities::default();
        let first: Vec<Entity> = (0..5).map(|_| entities.create()).collect();

        entities.destroy(first[1]);
        entities.destroy(first[3]);

        let a = entities.create();
        let b = entities.create();
        assert_eq!((a.index, a.generation), (3, 2));
        assert_eq!((b.index, b.generation), (1, 2));

        for &survivor in [&first[0], &first[2], &first[4]] {
            assert!(entities.is_valid(survivor));
            assert_eq!(survivor.generation, 1);
        }
        assert!(!entities.is_valid(first[1]));
        assert!(!entities.is_valid(first[3]));
    }

    #[test]
    fn create_and_destroy_randomized() {
        let mut rng = StdRng::seed_from_u64(0xFEED_FACE_DEAD_F00D);

        let mut entities = Entities::default();
        let mut first_unused = 0u32;
        let mut index_to_generation: HashMap<u32, u32> = HashMap::new();
        let mut free_set: HashSet<u32> = HashSet::new();
        let mut live = 0usize;

        for _ in 0..1000 {
            if rng.gen_bool(0.7) || first_unused == 0 {
                let entity = entities.create();
                live += 1;

                if !free_set.is_empty() {
                    assert!(free_set.remove(&entity.index));
                } else if entity.index >= first_unused {
                    first_unused = entity.index + 1;
                }
                assert!(index_to_generation
                    .insert(entity.index, entity.generation)
                    .is_none());
            } else {
                let index = rng.gen_range(0..first_unused);
                if let Some(generation) = index_to_generation.remove(&index) {
                    assert!(entities.try_destroy(Entity { index, generation }));
                    live -= 1;
                    free_set.insert(index);
                }
            }
            assert_eq!(entities.count(), live);
        }
    }

    #[test]
    fn try_destroy_stale_is_noop() {
        let mut entities = Entities::default();
        let e = entities.create();
        assert!(entities.try_destroy(e));
        assert!(!entities.try_destroy(e));
        assert_eq!(entities.count(), 0);
    }

    #[test]
    fn create_many_drains_free_list_then_extends() {
        let mut entities = Entities::default();
        let initial: Vec<Entity> = (0..10).map(|_| entities.create()).collect();
        for entity in &initial[6..] {
            entities.destroy(*entity);
        }

        let mut batch = Vec::new();
        entities.create_many(10, &mut batch);
        assert_eq!(batch.len(), 10);
        assert_eq!(batch.iter().map(|e| e.index).max(), Some(15));
        for entity in &batch {
            assert!(entities.is_valid(*entity));
        }
        assert_eq!(entities.count(), 16);
    }

    #[test]
    fn create_many_zero_is_a_noop() {
        let mut entities = Entities::default();
        let mut batch = Vec::new();
        entities.create_many(0, &mut batch);
        assert!(batch.is_empty());
        assert_eq!(entities.count(), 0);
        assert!(!entities.needs_flush());
    }

    #[test]
    fn reserve_then_flush() {
        let mut entities = Entities::default();
        let a = entities.create();

        let reserved = entities.reserve();
        assert_ne!(reserved.index, a.index);
        // Reserved handles are not valid until flushed.
        assert!(!entities.is_valid(reserved));
        assert!(entities.needs_flush());

        entities.flush_reserved();
        assert!(entities.is_valid(reserved));
        assert_eq!(entities.count(), 2);
    }

    #[test]
    fn reserve_is_thread_safe() {
        use std::sync::Arc;

        let entities = Arc::new(Entities::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let entities = Arc::clone(&entities);
                std::thread::spawn(move || {
                    (0..250).map(|_| entities.reserve()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for entity in handle.join().unwrap() {
                assert!(seen.insert(entity.index), "duplicate reserved index");
            }
        }
        assert_eq!(seen.len(), 1000);

        let mut entities = Arc::into_inner(entities).unwrap();
        entities.flush_reserved();
        assert_eq!(entities.count(), 1000);
    }
}
