//! Stack-map registry
//!
//! Maps call-site return addresses to bit vectors describing which
//! frame slots hold object references at that point. A future
//! stop-and-copy collector walks the stack from the recorded root frame
//! and uses these maps to distinguish references from scalars.

use crate::analysis::bitset::BitSet;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

static REGISTRY: Lazy<Mutex<FxHashMap<usize, BitSet>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Reset the registry (image construction).
pub fn init() {
    REGISTRY.lock().clear();
}

/// Drop all entries (image teardown).
pub fn clear() {
    REGISTRY.lock().clear();
}

/// Associate a return address with its reference-slot map.
pub fn put(address: *const u8, map: BitSet) {
    REGISTRY.lock().insert(address as usize, map);
}

/// Request the map for a return address.
pub fn get(address: *const u8) -> Option<BitSet> {
    REGISTRY.lock().get(&(address as usize)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let addr = 0x1234_5678usize as *const u8;
        let mut map = BitSet::new(4);
        map.set(1);
        map.set(3);
        put(addr, map.clone());
        assert_eq!(get(addr), Some(map));
    }

    #[test]
    fn test_miss() {
        assert_eq!(get(1usize as *const u8), None);
    }
}
