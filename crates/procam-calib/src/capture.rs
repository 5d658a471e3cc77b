//! ID-addressed storage for calibration captures.

use serde::{Deserialize, Serialize};

/// Stable handle of a capture. Never reused within one [`CaptureSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaptureId(pub u64);

impl std::fmt::Display for CaptureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureEntry<T> {
    pub id: CaptureId,
    pub selected: bool,
    pub data: T,
}

/// Insertion-ordered arena of captures.
///
/// Only selected entries take part in a solve; deselecting keeps the data
/// around so it can be re-enabled later.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureSet<T> {
    entries: Vec<CaptureEntry<T>>,
    next_id: u64,
}

impl<T> Default for CaptureSet<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

impl<T> CaptureSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new, selected capture.
    pub fn add(&mut self, data: T) -> CaptureId {
        let id = CaptureId(self.next_id);
        self.next_id += 1;
        self.entries.push(CaptureEntry {
            id,
            selected: true,
            data,
        });
        id
    }

    fn position(&self, id: CaptureId) -> Option<usize> {
        // ids are pushed in increasing order
        self.entries.binary_search_by_key(&id, |e| e.id).ok()
    }

    pub fn get(&self, id: CaptureId) -> Option<&T> {
        self.position(id).map(|i| &self.entries[i].data)
    }

    pub fn get_mut(&mut self, id: CaptureId) -> Option<&mut T> {
        self.position(id).map(move |i| &mut self.entries[i].data)
    }

    pub fn remove(&mut self, id: CaptureId) -> Option<T> {
        self.position(id).map(|i| self.entries.remove(i).data)
    }

    /// Drop every capture. IDs keep increasing afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_selected(&self, id: CaptureId) -> Option<bool> {
        self.position(id).map(|i| self.entries[i].selected)
    }

    /// Returns `false` when `id` is unknown.
    pub fn set_selected(&mut self, id: CaptureId, selected: bool) -> bool {
        match self.position(id) {
            Some(i) => {
                self.entries[i].selected = selected;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CaptureEntry<T>> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CaptureEntry<T>> {
        self.entries.iter_mut()
    }

    pub fn iter_selected(&self) -> impl Iterator<Item = (CaptureId, &T)> {
        self.entries
            .iter()
            .filter(|e| e.selected)
            .map(|e| (e.id, &e.data))
    }

    pub fn selected_count(&self) -> usize {
        self.entries.iter().filter(|e| e.selected).count()
    }

    pub fn ids(&self) -> Vec<CaptureId> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_survive_removal() {
        let mut set = CaptureSet::new();
        let a = set.add("a");
        let b = set.add("b");
        let c = set.add("c");
        assert_eq!(set.remove(b), Some("b"));
        assert_eq!(set.get(a), Some(&"a"));
        assert_eq!(set.get(c), Some(&"c"));
        assert_eq!(set.get(b), None);

        let d = set.add("d");
        assert!(d > c);
        set.clear();
        assert!(set.add("e") > d);
    }

    #[test]
    fn selection_filters_iteration() {
        let mut set = CaptureSet::new();
        let a = set.add(1);
        let b = set.add(2);
        assert!(set.set_selected(a, false));
        assert!(!set.set_selected(CaptureId(99), false));
        let picked: Vec<_> = set.iter_selected().map(|(id, v)| (id, *v)).collect();
        assert_eq!(picked, vec![(b, 2)]);
        assert_eq!(set.selected_count(), 1);
        assert_eq!(set.is_selected(a), Some(false));
    }

    #[test]
    fn serializes_with_next_id() {
        let mut set = CaptureSet::new();
        set.add(3.5_f64);
        let id = set.add(4.5);
        set.remove(id);
        let json = serde_json::to_string(&set).unwrap();
        let mut back: CaptureSet<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
        assert_eq!(back.add(1.0), CaptureId(2));
    }
}
