//! Live room membership. Nothing here is persisted: after a restart every
//! room starts with zero members.

use std::collections::HashSet;

use dashmap::DashMap;

/// Set of owner ids per room. Each call holds the room's shard guard for
/// its whole duration, which serializes joins and leaves of one room.
#[derive(Default)]
pub struct Registry {
    rooms: DashMap<String, HashSet<String>>,
}

impl Registry {
    /// Adds `owner_id` to the room and returns the new member count.
    /// Joining twice is a no-op.
    pub fn join(&self, room_id: &str, owner_id: &str) -> usize {
        let mut members = self.rooms.entry(room_id.to_string()).or_default();
        members.insert(owner_id.to_string());
        members.len()
    }

    /// Removes `owner_id` and returns the remaining member count. The room
    /// entry is dropped once it is empty.
    pub fn leave(&self, room_id: &str, owner_id: &str) -> usize {
        let remaining = match self.rooms.get_mut(room_id) {
            Some(mut members) => {
                members.remove(owner_id);
                members.len()
            }
            None => return 0,
        };
        if remaining == 0 {
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
        }
        remaining
    }

    pub fn active_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |members| members.len())
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        self.active_count(room_id) > 0
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_distinct_owners() {
        let registry = Registry::default();
        assert_eq!(registry.join("ABC123", "a"), 1);
        assert_eq!(registry.join("ABC123", "b"), 2);
        assert_eq!(registry.join("ABC123", "a"), 2);
        assert_eq!(registry.active_count("ABC123"), 2);
        assert_eq!(registry.active_count("OTHER1"), 0);
    }

    #[test]
    fn leaving_never_goes_negative() {
        let registry = Registry::default();
        assert_eq!(registry.leave("ABC123", "a"), 0);

        registry.join("ABC123", "a");
        assert_eq!(registry.leave("ABC123", "ghost"), 1);
        assert_eq!(registry.leave("ABC123", "a"), 0);
        assert_eq!(registry.leave("ABC123", "a"), 0);
        assert_eq!(registry.room_count(), 0);
        assert!(!registry.is_active("ABC123"));
    }

    #[test]
    fn arbitrary_join_leave_sequences_match_a_model() {
        let registry = Registry::default();
        let mut model: HashSet<&str> = HashSet::new();
        let owners = ["a", "b", "c", "d"];
        // Deterministic pseudo-random walk over join/leave operations.
        let mut seed: u32 = 7;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let owner = owners[(seed >> 16) as usize % owners.len()];
            let count = if (seed >> 20) & 1 == 0 {
                model.insert(owner);
                registry.join("ABC123", owner)
            } else {
                model.remove(owner);
                registry.leave("ABC123", owner)
            };
            assert_eq!(count, model.len());
            assert_eq!(registry.active_count("ABC123"), model.len());
        }
    }

    #[test]
    fn concurrent_joins_are_all_counted() {
        let registry = std::sync::Arc::new(Registry::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry.join("ABC123", &format!("{worker}-{i}"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.active_count("ABC123"), 400);
    }
}
