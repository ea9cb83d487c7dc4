//! Pooled names for variables, target types, and project identifiers.
//!
//! A Symbol is a 32-bit id into a process-wide name table. Equality is an
//! id comparison and cloning is a copy; the table is append-only so a
//! resolved name stays valid for the life of the process. The name-to-id
//! index is sharded to spread lock contention across the parallel load
//! and match phases.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{LazyLock, Mutex, RwLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Index shard count; a power of two so the selector is a mask.
const SHARDS: usize = 16;

struct Pool {
    /// name -> id, sharded by name hash.
    index: [Mutex<HashMap<&'static str, u32>>; SHARDS],
    /// id -> name; append-only, id 0 is the empty name.
    table: RwLock<Vec<&'static str>>,
}

static POOL: LazyLock<Pool> = LazyLock::new(|| {
    let pool = Pool {
        index: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        table: RwLock::new(vec![""]),
    };
    pool.index[Pool::shard_of("")].lock().unwrap().insert("", 0);
    pool
});

impl Pool {
    fn shard_of(name: &str) -> usize {
        let mut h = DefaultHasher::new();
        name.hash(&mut h);
        (h.finish() as usize) & (SHARDS - 1)
    }

    fn intern(&self, name: &str) -> u32 {
        // The shard lock covers the table append, so one name gets one
        // id even under concurrent interning.
        let mut shard = self.index[Self::shard_of(name)].lock().unwrap();
        if let Some(&id) = shard.get(name) {
            return id;
        }

        let stored: &'static str = String::from(name).leak();
        let id = {
            let mut table = self.table.write().unwrap();
            let id = table.len() as u32;
            table.push(stored);
            id
        };
        shard.insert(stored, id);
        id
    }

    fn resolve(&self, id: u32) -> &'static str {
        self.table.read().unwrap()[id as usize]
    }
}

/// A pooled name: id comparison for equality, copy for cloning.
///
/// Hashing and ordering go through the name itself so Symbols interoperate
/// with `&str` keys in maps.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Symbol(u32);

impl Symbol {
    /// Pool a name, returning the canonical Symbol for it.
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(POOL.intern(s.as_ref()))
    }

    /// The empty name.
    pub const fn empty() -> Self {
        Symbol(0)
    }

    /// Resolve the name. The table is append-only, so the result is good
    /// for the life of the process.
    pub fn as_str(&self) -> &'static str {
        POOL.resolve(self.0)
    }

    /// Check if the name is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Get the length of the name.
    pub fn len(&self) -> usize {
        self.as_str().len()
    }
}

impl Default for Symbol {
    fn default() -> Self {
        Symbol::empty()
    }
}

impl Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for Symbol {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.0 == other.0 {
            Ordering::Equal
        } else {
            self.as_str().cmp(other.as_str())
        }
    }
}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Name-content hashing keeps map lookups by &str working
        // (Borrow requires hash agreement with str).
        self.as_str().hash(state)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

impl Serialize for Symbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Symbol::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_name_same_id() {
        let a = Symbol::new("update");
        let b = Symbol::new("update");
        let c = Symbol::new("clean");

        assert_eq!(a, b);
        assert_eq!(a.0, b.0);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "update");
    }

    #[test]
    fn test_str_comparison() {
        let a = Symbol::new("config.gen");
        assert_eq!(a, "config.gen");
        assert_ne!(a, "config");
        assert!(a.starts_with("config."));
    }

    #[test]
    fn test_str_keyed_map_lookup() {
        use std::collections::HashMap;

        let mut map = HashMap::new();
        map.insert(Symbol::new("exe"), 42);

        assert_eq!(map.get(&Symbol::new("exe")), Some(&42));
        // Borrow<str>: lookups by bare name, no interning needed.
        assert_eq!(map.get("exe"), Some(&42));
        assert_eq!(map.get("lib"), None);
    }

    #[test]
    fn test_ordering_matches_names() {
        use std::collections::BTreeMap;

        let mut map = BTreeMap::new();
        for name in ["gen.options", "config.gen", "config.jobs"] {
            map.insert(Symbol::new(name), ());
        }

        let keys: Vec<&str> = map.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, ["config.gen", "config.jobs", "gen.options"]);
        assert!(map.contains_key("config.jobs"));
    }

    #[test]
    fn test_empty_is_id_zero() {
        let a = Symbol::empty();
        let b = Symbol::default();
        let c = Symbol::new("");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert!(a.is_empty());
        assert_eq!(a.len(), 0);
    }

    #[test]
    fn test_concurrent_interning_is_canonical() {
        let ids: Vec<Symbol> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| Symbol::new("contended-name")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }
}
