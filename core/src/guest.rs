//! Ephemeral guest allocator (§3/§6): `~GuestNNNN` with N in [1000,9999),
//! drawn uniformly and rejecting collisions.

use common::error::HandlerError;
use rand::RngExt;
use std::collections::HashSet;
use std::sync::Mutex;

const LOW: u32 = 1000;
const HIGH: u32 = 9999;
const POOL_SIZE: u32 = HIGH - LOW;

pub struct EphemeralGuestRegistry {
    used: Mutex<HashSet<u32>>,
}

impl EphemeralGuestRegistry {
    pub fn new() -> Self {
        EphemeralGuestRegistry { used: Mutex::new(HashSet::new()) }
    }

    /// Allocates a fresh `~GuestNNNN` name. Fatal (per §7) if the pool is
    /// exhausted after exceeding the number of attempts equal to the pool
    /// size.
    pub fn allocate(&self) -> Result<String, HandlerError> {
        let mut used = self.used.lock().expect("guest registry mutex poisoned");
        if used.len() as u32 >= POOL_SIZE {
            return Err(HandlerError::Fatal("ephemeral guest pool exhausted".into()));
        }

        let mut rng = rand::rng();
        for _ in 0..POOL_SIZE {
            let n = rng.random_range(LOW..HIGH);
            if used.insert(n) {
                return Ok(format!("~Guest{:04}", n));
            }
        }

        Err(HandlerError::Fatal("ephemeral guest pool exhausted".into()))
    }

    pub fn release(&self, name: &str) {
        if let Some(n) = parse_guest_number(name) {
            self.used.lock().expect("guest registry mutex poisoned").remove(&n);
        }
    }
}

impl Default for EphemeralGuestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_guest_number(name: &str) -> Option<u32> {
    name.strip_prefix("~Guest")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_within_range_and_format() {
        let registry = EphemeralGuestRegistry::new();
        let name = registry.allocate().unwrap();
        assert!(name.starts_with("~Guest"));
        let n = parse_guest_number(&name).unwrap();
        assert!((1000..9999).contains(&n));
    }

    #[test]
    fn release_frees_name_for_reuse() {
        let registry = EphemeralGuestRegistry::new();
        let name = registry.allocate().unwrap();
        registry.release(&name);
        assert_eq!(registry.used.lock().unwrap().len(), 0);
    }
}
