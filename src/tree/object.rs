//! In-memory object tree: hierarchical namespace + identity (spec §4.A).

use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::dataset_store::DatasetStore;
use crate::tree::attribute::AttributeStore;
use crate::error::{LowFiveError, Result};
use crate::token::Token;

/// Which HDF5-ish kind of node this is, carrying variant-specific state.
///
/// `File`/`Group`/`Dataset`/`Attribute`/`NamedType`/`HardLink`/`SoftLink`
/// are "real" nodes with memory-resident data; the `Dummy*` variants are
/// placeholders created when an open resolves a name with no local
/// declaration yet (spec §4.D edge case, §8 S6).
pub enum Kind {
    File(FileData),
    Group(GroupData),
    Dataset(Arc<Mutex<DatasetStore>>),
    Attribute(Mutex<AttributeStore>),
    NamedType,
    HardLink { target: Weak<Object> },
    SoftLink { target: String },
    DummyFile,
    DummyGroup,
    DummyDataset,
}

impl Kind {
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Kind::File(_) | Kind::Group(_) | Kind::DummyFile | Kind::DummyGroup
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Kind::File(_) => "File",
            Kind::Group(_) => "Group",
            Kind::Dataset(_) => "Dataset",
            Kind::Attribute(_) => "Attribute",
            Kind::NamedType => "NamedType",
            Kind::HardLink { .. } => "HardLink",
            Kind::SoftLink { .. } => "SoftLink",
            Kind::DummyFile => "DummyFile",
            Kind::DummyGroup => "DummyGroup",
            Kind::DummyDataset => "DummyDataset",
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, Kind::DummyFile | Kind::DummyGroup | Kind::DummyDataset)
    }
}

/// File-scoped state: property-list stand-ins, the `keep` policy, and the
/// cross-file reference table (spec §3 "File", §9 "cross-file object
/// references").
pub struct FileData {
    pub keep: bool,
    pub references: RwLock<std::collections::HashMap<Token, Weak<Object>>>,
}

pub struct GroupData {
    // Group creation properties aren't modeled beyond existing as a
    // placeholder slot; nothing in the spec exercises their contents.
    pub _gcpl: (),
}

/// One node of the object tree. Parent links are weak (spec §9 "parent
/// pointers"); children are owned. Insertion order is preserved via `Vec`
/// so iteration matches spec §3's "order of insertion preserved".
pub struct Object {
    name: Mutex<String>,
    pub token: Token,
    pub parent: Mutex<Weak<Object>>,
    pub children: Mutex<Vec<Arc<Object>>>,
    pub kind: Kind,
}

impl Object {
    pub fn new(name: impl Into<String>, kind: Kind) -> Arc<Self> {
        Arc::new(Object {
            name: Mutex::new(name.into()),
            token: Token::new(),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(Vec::new()),
            kind,
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    /// Rename this node in place (spec §4.D `link_move`). Identity (token,
    /// children, external handle) is untouched; only the name visible to
    /// `child()`/`fullname()` lookups changes.
    pub fn rename(&self, new_name: impl Into<String>) {
        *self.name.lock().unwrap() = new_name.into();
    }

    /// Add `child` under `self`. Fails if `self` isn't a container variant
    /// (spec §4.A).
    pub fn add_child(self: &Arc<Self>, child: Arc<Object>) -> Result<()> {
        if !self.kind.is_container() {
            return Err(LowFiveError::metadata(format!(
                "cannot add child '{}' under non-container '{}'",
                child.name(),
                self.name()
            )));
        }
        *child.parent.lock().unwrap() = Arc::downgrade(self);
        self.children.lock().unwrap().push(child);
        Ok(())
    }

    pub fn child(&self, name: &str) -> Option<Arc<Object>> {
        self.children.lock().unwrap().iter().find(|c| c.name() == name).cloned()
    }

    pub fn parent(&self) -> Option<Arc<Object>> {
        self.parent.lock().unwrap().upgrade()
    }

    pub fn find_root(self: &Arc<Self>) -> Arc<Object> {
        let mut cur = self.clone();
        while let Some(p) = cur.parent() {
            cur = p;
        }
        cur
    }

    /// `(filename, absolute_path)` by walking parent pointers to the
    /// nearest `File` ancestor (spec §4.A `fullname`).
    pub fn fullname(self: &Arc<Self>) -> (String, String) {
        let mut segments = Vec::new();
        let mut cur = self.clone();
        loop {
            if matches!(cur.kind, Kind::File(_)) {
                break;
            }
            segments.push(cur.name());
            match cur.parent() {
                Some(p) => cur = p,
                None => break,
            }
        }
        segments.reverse();
        let path = format!("/{}", segments.join("/"));
        let root = self.find_root();
        (root.name(), path)
    }

    pub fn fill_token(&self) -> Token {
        self.token
    }
}

/// Result of resolving a `/`-joined path from `root`: either the fully
/// resolved node, or the deepest node reached plus the unresolved
/// remainder (spec §4.A `search`).
pub enum Resolved {
    Exact(Arc<Object>),
    Partial { deepest: Arc<Object>, remainder: Vec<String> },
}

impl Resolved {
    pub fn exact(self) -> Option<Arc<Object>> {
        match self {
            Resolved::Exact(o) => Some(o),
            Resolved::Partial { .. } => None,
        }
    }
}

/// Resolve `path` (absolute or relative, `/`-joined) starting at `root`.
pub fn search(root: &Arc<Object>, path: &str) -> Resolved {
    let segments: Vec<String> =
        path.split('/').filter(|s| !s.is_empty()).map(str::to_string).collect();

    let mut cur = root.clone();
    for (i, seg) in segments.iter().enumerate() {
        match cur.child(seg) {
            Some(next) => cur = next,
            None => {
                return Resolved::Partial { deepest: cur, remainder: segments[i..].to_vec() };
            }
        }
    }
    Resolved::Exact(cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_file() -> Arc<Object> {
        Object::new("/root.h5", Kind::File(FileData { keep: false, references: RwLock::new(Default::default()) }))
    }

    #[test]
    fn add_child_rejects_non_container() {
        let file = make_file();
        let ds_store = DatasetStore::new(
            crate::datatype::Datatype::f32(),
            crate::dataspace::Dataspace::simple(vec![4]),
            crate::dataset_store::Ownership::Owned,
        );
        let dataset = Object::new("d", Kind::Dataset(Arc::new(Mutex::new(ds_store))));
        file.add_child(dataset.clone()).unwrap();

        let leaf = Object::new("x", Kind::Group(GroupData { _gcpl: () }));
        assert!(dataset.add_child(leaf).is_err());
    }

    #[test]
    fn search_exact_and_partial() {
        let file = make_file();
        let g = Object::new("g", Kind::Group(GroupData { _gcpl: () }));
        file.add_child(g.clone()).unwrap();
        let ds_store = DatasetStore::new(
            crate::datatype::Datatype::f32(),
            crate::dataspace::Dataspace::simple(vec![4]),
            crate::dataset_store::Ownership::Owned,
        );
        let d = Object::new("d", Kind::Dataset(Arc::new(Mutex::new(ds_store))));
        g.add_child(d.clone()).unwrap();

        match search(&file, "/g/d") {
            Resolved::Exact(o) => assert_eq!(o.token, d.token),
            _ => panic!("expected exact resolution"),
        }

        match search(&file, "/g/missing") {
            Resolved::Partial { deepest, remainder } => {
                assert_eq!(deepest.token, g.token);
                assert_eq!(remainder, vec!["missing".to_string()]);
            }
            _ => panic!("expected partial resolution"),
        }
    }

    #[test]
    fn fullname_walks_to_file_root() {
        let file = make_file();
        let g = Object::new("g", Kind::Group(GroupData { _gcpl: () }));
        file.add_child(g.clone()).unwrap();
        let (filename, path) = g.fullname();
        assert_eq!(filename, "/root.h5");
        assert_eq!(path, "/g");
    }
}
