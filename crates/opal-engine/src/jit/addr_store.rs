//! Instruction-address store
//!
//! Process-wide map from native addresses to (kind, name) pairs. Purely
//! an annotation aid for machine-code dumps; nothing in the pipeline
//! depends on it.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// What an address points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    Type,
    Function,
    Builtin,
    Special,
    Data,
    StringLiteral,
    Trampoline,
}

impl AddrKind {
    pub fn prefix(self) -> &'static str {
        match self {
            AddrKind::Type => "type",
            AddrKind::Function => "function",
            AddrKind::Builtin => "builtin",
            AddrKind::Special => "special",
            AddrKind::Data => "data",
            AddrKind::StringLiteral => "string",
            AddrKind::Trampoline => "trampoline",
        }
    }
}

static STORE: Lazy<Mutex<FxHashMap<usize, (AddrKind, String)>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Record an address annotation (later entries replace earlier ones).
pub fn put(addr: *const u8, kind: AddrKind, name: &str) {
    STORE.lock().insert(addr as usize, (kind, name.to_string()));
}

/// Look up an annotation.
pub fn get(addr: *const u8) -> Option<(AddrKind, String)> {
    STORE.lock().get(&(addr as usize)).cloned()
}

/// Render an address with its annotation, if known.
pub fn describe(addr: *const u8) -> String {
    match get(addr) {
        Some((kind, name)) => format!("{:p} ({} {})", addr, kind.prefix(), name),
        None => format!("{:p}", addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let marker = &test_put_and_get as *const _ as *const u8;
        put(marker, AddrKind::Special, "marker");
        let (kind, name) = get(marker).unwrap();
        assert_eq!(kind, AddrKind::Special);
        assert_eq!(name, "marker");
        assert!(describe(marker).contains("special marker"));
    }

    #[test]
    fn test_unknown_address() {
        assert!(get(usize::MAX as *const u8).is_none());
    }
}
