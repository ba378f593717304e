//! Where each live primitive lives.
//!
//! A generational slot map: entries sit in a dense `Vec` reused through a free
//! list, and each entry carries a generation bumped on removal. Block slots
//! hold a [`LocationHandle`] rather than the external id, so a handle left
//! behind by a removed primitive can never resolve to whoever reuses the entry.

use hashbrown::HashMap;
use linepool_core::PrimitiveId;

use crate::block::BlockKey;

/// Generation-checked reference into the [`LocationMap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LocationHandle {
    index: u32,
    generation: u32,
}

/// Owning block and slot of a primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub block: BlockKey,
    pub slot: usize,
}

#[derive(Debug)]
enum Entry {
    Occupied {
        generation: u32,
        id: PrimitiveId,
        location: Location,
    },
    Vacant {
        generation: u32,
    },
}

impl Entry {
    const fn generation(&self) -> u32 {
        match self {
            Self::Occupied { generation, .. } | Self::Vacant { generation } => *generation,
        }
    }
}

/// Id → location table.
#[derive(Debug, Default)]
pub struct LocationMap {
    entries: Vec<Entry>,
    free: Vec<u32>,
    by_id: HashMap<PrimitiveId, LocationHandle>,
}

impl LocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new primitive. Returns `None` if `id` is already present.
    pub fn insert(&mut self, id: PrimitiveId, location: Location) -> Option<LocationHandle> {
        if self.by_id.contains_key(&id) {
            return None;
        }

        let handle = if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            let generation = entry.generation();
            *entry = Entry::Occupied {
                generation,
                id,
                location,
            };
            LocationHandle { index, generation }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry::Occupied {
                generation: 0,
                id,
                location,
            });
            LocationHandle {
                index,
                generation: 0,
            }
        };

        self.by_id.insert(id, handle);
        Some(handle)
    }

    /// Look up by external id.
    pub fn get(&self, id: PrimitiveId) -> Option<Location> {
        self.by_id
            .get(&id)
            .and_then(|&handle| self.resolve(handle))
            .map(|(_, location)| location)
    }

    /// Handle currently assigned to `id`.
    pub fn handle(&self, id: PrimitiveId) -> Option<LocationHandle> {
        self.by_id.get(&id).copied()
    }

    /// Resolve a handle; stale handles yield `None`.
    pub fn resolve(&self, handle: LocationHandle) -> Option<(PrimitiveId, Location)> {
        match self.entries.get(handle.index as usize)? {
            Entry::Occupied {
                generation,
                id,
                location,
            } if *generation == handle.generation => Some((*id, *location)),
            _ => None,
        }
    }

    /// Point a live handle at a new slot index. Returns false for stale handles.
    pub fn set_slot(&mut self, handle: LocationHandle, slot: usize) -> bool {
        match self.entries.get_mut(handle.index as usize) {
            Some(Entry::Occupied {
                generation,
                location,
                ..
            }) if *generation == handle.generation => {
                location.slot = slot;
                true
            }
            _ => false,
        }
    }

    /// Remove `id`, invalidating its handle.
    pub fn remove(&mut self, id: PrimitiveId) -> Option<Location> {
        let handle = self.by_id.remove(&id)?;
        let entry = &mut self.entries[handle.index as usize];
        let Entry::Occupied { location, .. } = *entry else {
            return None;
        };
        *entry = Entry::Vacant {
            generation: handle.generation.wrapping_add(1),
        };
        self.free.push(handle.index);
        Some(location)
    }

    pub fn contains(&self, id: PrimitiveId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Vacate every entry. Outstanding handles all become stale.
    pub fn clear(&mut self) {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Entry::Occupied { generation, .. } = *entry {
                *entry = Entry::Vacant {
                    generation: generation.wrapping_add(1),
                };
                self.free.push(index as u32);
            }
        }
        self.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(slot: usize) -> Location {
        Location {
            block: BlockKey {
                color_key: 0xFF00_00FF,
                index: 0,
                generation: 0,
            },
            slot,
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut map = LocationMap::new();
        assert!(map.insert(PrimitiveId(1), loc(0)).is_some());
        assert!(map.insert(PrimitiveId(1), loc(1)).is_none());
        assert_eq!(map.get(PrimitiveId(1)), Some(loc(0)));
    }

    #[test]
    fn stale_handle_does_not_alias_reused_entry() {
        let mut map = LocationMap::new();
        let old = map.insert(PrimitiveId(1), loc(0)).unwrap();
        map.remove(PrimitiveId(1));

        let new = map.insert(PrimitiveId(2), loc(5)).unwrap();
        assert_ne!(old, new);
        assert!(map.resolve(old).is_none());
        assert!(!map.set_slot(old, 9));
        assert_eq!(map.resolve(new), Some((PrimitiveId(2), loc(5))));
    }

    #[test]
    fn set_slot_moves_live_entry() {
        let mut map = LocationMap::new();
        let handle = map.insert(PrimitiveId(7), loc(3)).unwrap();
        assert!(map.set_slot(handle, 1));
        assert_eq!(map.get(PrimitiveId(7)).map(|l| l.slot), Some(1));
    }

    #[test]
    fn id_reuse_after_remove() {
        let mut map = LocationMap::new();
        map.insert(PrimitiveId(4), loc(0)).unwrap();
        assert_eq!(map.remove(PrimitiveId(4)), Some(loc(0)));
        assert!(map.remove(PrimitiveId(4)).is_none());
        assert!(map.insert(PrimitiveId(4), loc(2)).is_some());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn clear_invalidates_everything() {
        let mut map = LocationMap::new();
        let a = map.insert(PrimitiveId(1), loc(0)).unwrap();
        let b = map.insert(PrimitiveId(2), loc(1)).unwrap();
        map.clear();
        assert!(map.is_empty());
        assert!(map.resolve(a).is_none());
        assert!(map.resolve(b).is_none());
        assert!(map.insert(PrimitiveId(1), loc(0)).is_some());
    }
}
