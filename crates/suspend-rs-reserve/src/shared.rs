// Keyed, reference counted shared objects
use std::collections::HashMap;
use std::rc::Rc;

struct SharedEntry<T> {
    value: Rc<T>,
    refs: usize,
}

/// Objects shared under a string key. The first `acquire` of a key builds
/// the object, later ones hand out the same instance; the matching number
/// of `release` calls removes it again.
pub struct SharedRegistry<T> {
    entries: HashMap<String, SharedEntry<T>>,
}

impl<T> std::fmt::Debug for SharedRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(key, entry)| (key, entry.refs)))
            .finish()
    }
}

impl<T> Default for SharedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn acquire<F>(&mut self, key: &str, factory: F) -> Rc<T>
    where
        F: FnOnce() -> T,
    {
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| SharedEntry {
                value: Rc::new(factory()),
                refs: 0,
            });
        entry.refs += 1;
        Rc::clone(&entry.value)
    }

    /// Drop one reference to `key`. Returns the object once the last
    /// reference is gone and the entry has been removed.
    pub fn release(&mut self, key: &str) -> Option<Rc<T>> {
        let entry = self.entries.get_mut(key)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }
        self.entries.remove(key).map(|entry| entry.value)
    }

    pub fn ref_count(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.refs)
    }

    /// Snapshot of every live object.
    pub fn values(&self) -> Vec<Rc<T>> {
        self.entries
            .values()
            .map(|entry| Rc::clone(&entry.value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
