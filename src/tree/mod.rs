pub mod attribute;
pub mod object;

pub use object::{search, Kind, Object, Resolved};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::tree::object::FileData;
use std::sync::RwLock;

/// Process-wide registry of open files, keyed by filename, so the `keep`
/// policy (spec §3 "File" lifecycle, §9 open question) can be honored:
/// closing a `keep`-flagged file leaves its tree reachable for a later
/// `file_create`/`file_open` of the same name to reuse.
#[derive(Clone, Default)]
pub struct FileRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<Object>>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or, if `keep` previously preserved it, reuse) the tree for
    /// `filename`.
    pub fn create(&self, filename: &str, keep: bool) -> Arc<Object> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(existing) = guard.get(filename) {
            return existing.clone();
        }
        let file = Object::new(
            filename,
            Kind::File(FileData { keep, references: RwLock::new(HashMap::new()) }),
        );
        guard.insert(filename.to_string(), file.clone());
        file
    }

    pub fn open(&self, filename: &str) -> Option<Arc<Object>> {
        self.inner.lock().unwrap().get(filename).cloned()
    }

    /// Close `filename`: drops the tree from the registry unless the
    /// file's `keep` flag is set (spec §3 "Lifecycle").
    pub fn close(&self, filename: &str) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(file) = guard.get(filename) {
            if let Kind::File(data) = &file.kind {
                if data.keep {
                    return;
                }
            }
        }
        guard.remove(filename);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_preserves_tree_across_close() {
        let reg = FileRegistry::new();
        let file = reg.create("a.h5", true);
        let g = Object::new("g", Kind::Group(object::GroupData { _gcpl: () }));
        file.add_child(g).unwrap();

        reg.close("a.h5");
        let reopened = reg.open("a.h5").expect("kept file should remain registered");
        assert!(reopened.child("g").is_some());
    }

    #[test]
    fn without_keep_close_drops_tree() {
        let reg = FileRegistry::new();
        reg.create("b.h5", false);
        reg.close("b.h5");
        assert!(reg.open("b.h5").is_none());
    }
}
