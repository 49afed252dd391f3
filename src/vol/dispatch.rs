//! VOL dispatcher: maps HDF5-style operation callbacks onto the object
//! tree (spec §4.D).
//!
//! Grounded on the teacher's `http/*.rs` handlers — one function per
//! operation, each resolving a path, making a policy decision, then
//! acting — generalized from "one handler per HTTP route" to "one
//! handler per VOL callback", and from path-prefix sandboxing to the
//! glob policy of `glob_policy.rs`.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::dataset_store::{DatasetStore, Ownership};
use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::{LowFiveError, Result};
use crate::glob_policy::{GlobPolicy, PolicyKind};
use crate::token::Token;
use crate::tree::attribute::AttributeStore;
use crate::tree::object::{FileData, GroupData};
use crate::tree::{search, FileRegistry, Kind, Object, Resolved};

use super::handle::{HandlePair, NullBackend, PassthruBackend};

/// Per-call policy decision (spec §4.D step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub passthru: bool,
    pub memory: bool,
    pub zerocopy: bool,
    pub keep: bool,
}

/// Reported by `object_get(info)` (spec §4.D).
pub struct ObjectInfo {
    pub type_name: &'static str,
    pub token: Token,
    pub attribute_count: usize,
}

pub struct Dispatcher {
    pub registry: FileRegistry,
    policy: Mutex<GlobPolicy>,
    default_keep: Mutex<bool>,
    backend: Arc<dyn PassthruBackend>,
}

impl Dispatcher {
    pub fn new(policy: GlobPolicy, default_keep: bool) -> Self {
        Dispatcher {
            registry: FileRegistry::new(),
            policy: Mutex::new(policy),
            default_keep: Mutex::new(default_keep),
            backend: Arc::new(NullBackend),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn PassthruBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Add a glob rule to the live policy (spec §6
    /// `set_passthru`/`set_memory`/`set_zerocopy`).
    pub fn add_policy_rule(&self, kind: PolicyKind, filename: impl Into<String>, path: impl Into<String>) {
        self.policy.lock().unwrap().add(kind, filename, path);
    }

    /// Process-wide default for the `keep` policy (spec §6 `set_keep`).
    pub fn set_default_keep(&self, keep: bool) {
        *self.default_keep.lock().unwrap() = keep;
    }

    fn decide(&self, filename: &str, path: &str) -> Policy {
        let policy = self.policy.lock().unwrap();
        let default_keep = *self.default_keep.lock().unwrap();
        let zerocopy = policy.match_any(filename, path, PolicyKind::ZeroCopy, false);
        Policy {
            passthru: policy.match_any(filename, path, PolicyKind::Passthru, false),
            memory: zerocopy || policy.match_any(filename, path, PolicyKind::Memory, true),
            zerocopy,
            keep: policy.match_any(filename, path, PolicyKind::Keep, default_keep),
        }
    }

    fn wrap(&self, metadata: Arc<Object>, filename: &str, passthru: bool) -> Result<HandlePair> {
        if passthru {
            let handle = self.backend.open(filename)?;
            Ok(HandlePair::with_external(metadata, handle, self.backend.clone()))
        } else {
            Ok(HandlePair::memory_only(metadata))
        }
    }

    // -- File ----------------------------------------------------------

    pub fn file_create(&self, filename: &str) -> Result<HandlePair> {
        let policy = self.decide(filename, "/");
        let file = self.registry.create(filename, policy.keep);
        debug!(filename, keep = policy.keep, passthru = policy.passthru, "file_create");
        self.wrap(file, filename, policy.passthru)
    }

    pub fn file_open(&self, filename: &str) -> Result<HandlePair> {
        let policy = self.decide(filename, "/");
        let file = match self.registry.open(filename) {
            Some(f) => f,
            None => {
                debug!(filename, "file_open: no local tree, opening as dummy");
                Object::new(filename, Kind::DummyFile)
            }
        };
        self.wrap(file, filename, policy.passthru)
    }

    pub fn file_close(&self, handle: &HandlePair) -> Result<()> {
        if handle.temporary {
            return Ok(());
        }
        let (filename, _) = handle.metadata.fullname();
        let filename = if matches!(handle.metadata.kind, Kind::File(_)) {
            handle.metadata.name()
        } else {
            filename
        };
        self.registry.close(&filename);
        if let Some(ext) = handle.external_handle() {
            self.backend.close(ext)?;
        }
        Ok(())
    }

    // -- Group -----------------------------------------------------------

    pub fn group_create(&self, parent: &HandlePair, name: &str) -> Result<HandlePair> {
        let node = Object::new(name, Kind::Group(GroupData { _gcpl: () }));
        parent.metadata.add_child(node.clone())?;
        let (filename, path) = node.fullname();
        let policy = self.decide(&filename, &path);
        self.wrap(node, &filename, policy.passthru)
    }

    pub fn group_open(&self, parent: &HandlePair, name: &str) -> Result<HandlePair> {
        self.open_child(parent, name, Kind::DummyGroup)
    }

    // -- Dataset ---------------------------------------------------------

    pub fn dataset_create(
        &self,
        parent: &HandlePair,
        name: &str,
        element_type: Datatype,
        space: Dataspace,
    ) -> Result<HandlePair> {
        let (filename, parent_path) = parent.metadata.fullname();
        let path = format!("{parent_path}/{name}");
        let policy = self.decide(&filename, &path);
        let ownership = if policy.zerocopy { Ownership::Borrowed } else { Ownership::Owned };
        let store = DatasetStore::new(element_type, space, ownership);
        let node = Object::new(name, Kind::Dataset(Arc::new(Mutex::new(store))));
        parent.metadata.add_child(node.clone())?;
        self.wrap(node, &filename, policy.passthru)
    }

    pub fn dataset_open(&self, parent: &HandlePair, name: &str) -> Result<HandlePair> {
        self.open_child(parent, name, Kind::DummyDataset)
    }

    pub fn dataset_write(
        &self,
        handle: &HandlePair,
        element_type: Datatype,
        memspace: Option<Dataspace>,
        filespace: Option<Dataspace>,
        buf: &[u8],
    ) -> Result<()> {
        let Kind::Dataset(store) = &handle.metadata.kind else {
            return Err(LowFiveError::metadata("dataset_write on a non-dataset handle"));
        };
        store.lock().unwrap().write(element_type, memspace, filespace, buf)
    }

    pub fn dataset_read(
        &self,
        handle: &HandlePair,
        element_type: Datatype,
        memspace: Option<Dataspace>,
        filespace: Option<Dataspace>,
        out: &mut [u8],
    ) -> Result<()> {
        match &handle.metadata.kind {
            Kind::Dataset(store) => store.lock().unwrap().read(element_type, memspace, filespace, out),
            Kind::DummyDataset => Err(LowFiveError::metadata(
                "dataset_read on a dummy dataset requires the query client (spec §4.G)",
            )),
            _ => Err(LowFiveError::metadata("dataset_read on a non-dataset handle")),
        }
    }

    pub fn dataset_get_space(&self, handle: &HandlePair) -> Result<Dataspace> {
        match &handle.metadata.kind {
            Kind::Dataset(store) => Ok(store.lock().unwrap().space.clone()),
            _ => Err(LowFiveError::metadata("dataset_get_space on a non-dataset handle")),
        }
    }

    pub fn dataset_get_type(&self, handle: &HandlePair) -> Result<Datatype> {
        match &handle.metadata.kind {
            Kind::Dataset(store) => Ok(store.lock().unwrap().element_type.clone()),
            _ => Err(LowFiveError::metadata("dataset_get_type on a non-dataset handle")),
        }
    }

    /// `dataset_specific(set_extent)` (spec §4.D, §4.C).
    pub fn dataset_set_extent(&self, handle: &HandlePair, sizes: &[u64]) -> Result<()> {
        match &handle.metadata.kind {
            Kind::Dataset(store) => store.lock().unwrap().set_extent(sizes),
            _ => Err(LowFiveError::metadata("set_extent on a non-dataset handle")),
        }
    }

    // -- Attribute ---------------------------------------------------------

    /// Create returns the existing node if `name` is already an attribute
    /// of `parent` (spec §4.D edge case).
    pub fn attribute_create(
        &self,
        parent: &HandlePair,
        name: &str,
        element_type: Datatype,
        space: Dataspace,
    ) -> Result<HandlePair> {
        if let Some(existing) = parent.metadata.child(name) {
            if matches!(existing.kind, Kind::Attribute(_)) {
                return Ok(HandlePair::memory_only(existing));
            }
        }
        let store = AttributeStore::new(element_type, space);
        let node = Object::new(name, Kind::Attribute(Mutex::new(store)));
        parent.metadata.add_child(node.clone())?;
        Ok(HandlePair::memory_only(node))
    }

    pub fn attribute_open(&self, parent: &HandlePair, name: &str) -> Result<HandlePair> {
        let node = parent
            .metadata
            .child(name)
            .filter(|c| matches!(c.kind, Kind::Attribute(_)))
            .ok_or_else(|| LowFiveError::metadata(format!("no such attribute '{name}'")))?;
        Ok(HandlePair::memory_only(node))
    }

    pub fn attribute_write(&self, handle: &HandlePair, element_type: Datatype, buf: &[u8]) -> Result<()> {
        let Kind::Attribute(store) = &handle.metadata.kind else {
            return Err(LowFiveError::metadata("attribute_write on a non-attribute handle"));
        };
        store.lock().unwrap().write(element_type, buf)
    }

    pub fn attribute_read(&self, handle: &HandlePair, element_type: Datatype, out: &mut [u8]) -> Result<()> {
        let Kind::Attribute(store) = &handle.metadata.kind else {
            return Err(LowFiveError::metadata("attribute_read on a non-attribute handle"));
        };
        store.lock().unwrap().read(element_type, out)
    }

    pub fn attribute_exists(&self, parent: &HandlePair, name: &str) -> bool {
        parent
            .metadata
            .child(name)
            .map(|c| matches!(c.kind, Kind::Attribute(_)))
            .unwrap_or(false)
    }

    /// Invokes `visit` once per attribute child of `parent`, each with a
    /// temporary handle (spec §4.D: "wraps the metadata handle in a
    /// temporary external handle... so the callback owns a reference,
    /// then releases"). Our memory-only model has no separate external
    /// reference to register, so `temporary` alone documents the
    /// contract: `visit` must not assume the handle outlives the call.
    pub fn attribute_iterate(&self, parent: &HandlePair, mut visit: impl FnMut(&str, &HandlePair)) {
        let children = parent.metadata.children.lock().unwrap().clone();
        for child in children {
            if matches!(child.kind, Kind::Attribute(_)) {
                let temp = HandlePair::temporary(child.clone());
                visit(&child.name(), &temp);
            }
        }
    }

    // -- Object / link -----------------------------------------------------

    pub fn object_get_info(&self, handle: &HandlePair) -> ObjectInfo {
        let attribute_count = handle
            .metadata
            .children
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c.kind, Kind::Attribute(_)))
            .count();
        ObjectInfo {
            type_name: handle.metadata.kind.type_name(),
            token: handle.metadata.fill_token(),
            attribute_count,
        }
    }

    pub fn object_get_file(&self, handle: &HandlePair) -> Arc<Object> {
        handle.metadata.find_root()
    }

    pub fn object_get_name(&self, handle: &HandlePair) -> (String, String) {
        handle.metadata.fullname()
    }

    /// `object_specific(lookup token)` (spec §4.D): resolve a token to
    /// the object it names via the owning file's weak reference table
    /// (spec §9 "cross-file object references").
    pub fn object_lookup_token(&self, file: &Arc<Object>, token: Token) -> Option<Arc<Object>> {
        let Kind::File(FileData { references, .. }) = &file.kind else {
            return None;
        };
        references.read().unwrap().get(&token).and_then(|w| w.upgrade())
    }

    fn register_reference(&self, file: &Arc<Object>, target: &Arc<Object>) {
        if let Kind::File(FileData { references, .. }) = &file.kind {
            references.write().unwrap().insert(target.token, Arc::downgrade(target));
        }
    }

    pub fn link_create_hard(&self, parent: &HandlePair, name: &str, target: &Arc<Object>) -> Result<HandlePair> {
        let node = Object::new(name, Kind::HardLink { target: Arc::downgrade(target) });
        parent.metadata.add_child(node.clone())?;
        self.register_reference(&parent.metadata.find_root(), target);
        Ok(HandlePair::memory_only(node))
    }

    pub fn link_create_soft(&self, parent: &HandlePair, name: &str, target_path: &str) -> Result<HandlePair> {
        let node = Object::new(name, Kind::SoftLink { target: target_path.to_string() });
        parent.metadata.add_child(node.clone())?;
        Ok(HandlePair::memory_only(node))
    }

    /// Copy `name` under `parent` into `dest_parent` as `dest_name`
    /// (spec §4.D "link copy"); copies the link, not the referent.
    pub fn link_copy(
        &self,
        parent: &HandlePair,
        name: &str,
        dest_parent: &HandlePair,
        dest_name: &str,
    ) -> Result<()> {
        let child = parent
            .metadata
            .child(name)
            .ok_or_else(|| LowFiveError::metadata(format!("no such link '{name}'")))?;
        let copy = match &child.kind {
            Kind::HardLink { target } => Object::new(dest_name, Kind::HardLink { target: target.clone() }),
            Kind::SoftLink { target } => {
                Object::new(dest_name, Kind::SoftLink { target: target.clone() })
            }
            _ => return Err(LowFiveError::metadata(format!("'{name}' is not a link"))),
        };
        dest_parent.metadata.add_child(copy)
    }

    /// Move `name` under `parent` to `dest_parent` as `dest_name` (spec
    /// §4.D "link move"): re-parents the node itself, preserving its
    /// children and token.
    pub fn link_move(
        &self,
        parent: &HandlePair,
        name: &str,
        dest_parent: &HandlePair,
        dest_name: &str,
    ) -> Result<()> {
        let child = parent
            .metadata
            .child(name)
            .ok_or_else(|| LowFiveError::metadata(format!("no such child '{name}'")))?;
        {
            let mut siblings = parent.metadata.children.lock().unwrap();
            siblings.retain(|c| !Arc::ptr_eq(c, &child));
        }
        child.rename(dest_name);
        dest_parent.metadata.add_child(child)
    }

    /// `blob_put` (spec §4.D): stores an opaque byte blob as a named
    /// attribute-like node outside the regular dataset/attribute
    /// namespace; minimal support since the spec treats blobs only as a
    /// pass-through primitive, not a modeled data structure.
    pub fn blob_put(&self, parent: &HandlePair, name: &str, bytes: &[u8]) -> Result<HandlePair> {
        let store = AttributeStore::new(Datatype::fixed(crate::datatype::TypeClass::Opaque, bytes.len()), Dataspace::simple(vec![1]));
        let node = Object::new(name, Kind::Attribute(Mutex::new(store)));
        parent.metadata.add_child(node.clone())?;
        if let Kind::Attribute(store) = &node.kind {
            store.lock().unwrap().write(Datatype::fixed(crate::datatype::TypeClass::Opaque, bytes.len()), bytes)?;
        }
        Ok(HandlePair::memory_only(node))
    }

    /// `introspect` (spec §4.D): reports whether a path is served from
    /// memory, passthru, both, or neither, without performing the call.
    pub fn introspect(&self, filename: &str, path: &str) -> Policy {
        self.decide(filename, path)
    }

    fn open_child(&self, parent: &HandlePair, name: &str, dummy_kind: Kind) -> Result<HandlePair> {
        match search(&parent.metadata, name) {
            Resolved::Exact(node) => {
                let (filename, _) = node.fullname();
                let policy = self.decide(&filename, name);
                self.wrap(node, &filename, policy.passthru)
            }
            Resolved::Partial { deepest, remainder } => {
                trace!(name, "open_child: creating dummy chain for unresolved remainder");
                let node = create_dummy_chain(&deepest, &remainder, dummy_kind)?;
                Ok(HandlePair::memory_only(node))
            }
        }
    }
}

/// Create placeholder nodes for every unresolved path segment (spec
/// §4.D "Open of a path not resolvable in memory yields a dummy node of
/// the appropriate variant"): intermediate segments become `DummyGroup`,
/// the final segment becomes `leaf_kind`.
fn create_dummy_chain(deepest: &Arc<Object>, remainder: &[String], leaf_kind: Kind) -> Result<Arc<Object>> {
    let mut cur = deepest.clone();
    for (i, seg) in remainder.iter().enumerate() {
        let is_leaf = i == remainder.len() - 1;
        let kind = if is_leaf { clone_dummy_kind(&leaf_kind) } else { Kind::DummyGroup };
        let node = Object::new(seg.clone(), kind);
        cur.add_child(node.clone())?;
        cur = node;
    }
    Ok(cur)
}

fn clone_dummy_kind(kind: &Kind) -> Kind {
    match kind {
        Kind::DummyFile => Kind::DummyFile,
        Kind::DummyGroup => Kind::DummyGroup,
        Kind::DummyDataset => Kind::DummyDataset,
        _ => Kind::DummyGroup,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(GlobPolicy::default(), false)
    }

    #[test]
    fn file_create_then_group_and_dataset() {
        let d = dispatcher();
        let file = d.file_create("run.h5").unwrap();
        let group = d.group_create(&file, "g").unwrap();
        let dataset = d
            .dataset_create(&group, "d", Datatype::f32(), Dataspace::simple(vec![4]))
            .unwrap();
        assert_eq!(d.object_get_name(&dataset).1, "/g/d");

        let buf = vec![0u8; 16];
        d.dataset_write(&dataset, Datatype::f32(), None, None, &buf).unwrap();
        let mut out = vec![0xffu8; 16];
        d.dataset_read(&dataset, Datatype::f32(), None, None, &mut out).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn dataset_open_unresolved_yields_dummy_chain() {
        let d = dispatcher();
        let file = d.file_create("run.h5").unwrap();
        let handle = d.dataset_open(&file, "g/missing").unwrap();
        assert!(matches!(handle.metadata.kind, Kind::DummyDataset));
        assert_eq!(handle.metadata.fullname().1, "/g/missing");
        // the intermediate group was also created, as a dummy
        let g = file.metadata.child("g").unwrap();
        assert!(matches!(g.kind, Kind::DummyGroup));
    }

    #[test]
    fn attribute_create_is_idempotent() {
        let d = dispatcher();
        let file = d.file_create("run.h5").unwrap();
        let a1 = d
            .attribute_create(&file, "units", Datatype::i32(), Dataspace::simple(vec![1]))
            .unwrap();
        let a2 = d
            .attribute_create(&file, "units", Datatype::i32(), Dataspace::simple(vec![1]))
            .unwrap();
        assert_eq!(a1.metadata.token, a2.metadata.token);
    }

    #[test]
    fn object_get_info_counts_attributes() {
        let d = dispatcher();
        let file = d.file_create("run.h5").unwrap();
        d.attribute_create(&file, "a", Datatype::i32(), Dataspace::simple(vec![1])).unwrap();
        d.attribute_create(&file, "b", Datatype::i32(), Dataspace::simple(vec![1])).unwrap();
        let info = d.object_get_info(&file);
        assert_eq!(info.attribute_count, 2);
    }

    #[test]
    fn link_move_reparents_node() {
        let d = dispatcher();
        let file = d.file_create("run.h5").unwrap();
        let g1 = d.group_create(&file, "g1").unwrap();
        let g2 = d.group_create(&file, "g2").unwrap();
        d.dataset_create(&g1, "d", Datatype::f32(), Dataspace::simple(vec![1])).unwrap();
        d.link_move(&g1, "d", &g2, "d2").unwrap();
        assert!(g1.metadata.child("d").is_none());
        assert!(g2.metadata.child("d2").is_some());
    }

    #[test]
    fn keep_flag_survives_close_and_reopen() {
        let d = Dispatcher::new(GlobPolicy::default(), true);
        let file = d.file_create("kept.h5").unwrap();
        d.group_create(&file, "g").unwrap();
        d.file_close(&file).unwrap();
        let reopened = d.file_open("kept.h5").unwrap();
        assert!(reopened.metadata.child("g").is_some());
    }
}
