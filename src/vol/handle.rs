//! Lifecycle & reference counting of paired handles (spec §4.I).
//!
//! Every VOL callback result is a `{external, metadata}` pair per spec
//! §4.I. The metadata side's lifetime is already reference-counted by
//! `Arc<Object>`; this module adds the matching reference count for the
//! *external* (passthru) side, modeled as a trait object rather than a
//! real libhdf5 handle, since the native HDF5 implementation is an
//! out-of-scope external collaborator (spec §1).

use std::sync::Arc;

use crate::error::Result;
use crate::tree::Object;

/// Opaque stand-in for a handle returned by the underlying passthru
/// library. The real system hands these to/from native HDF5; here it's
/// just an id the backend trait can use however it likes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalHandle(pub u64);

/// The passthru collaborator (spec §1 "external"): an underlying HDF5
/// implementation that actually persists to disk. No native binding is
/// wired into this crate — plugging one in means implementing this
/// trait over it.
pub trait PassthruBackend: Send + Sync {
    fn open(&self, filepath: &str) -> Result<ExternalHandle>;
    fn close(&self, handle: ExternalHandle) -> Result<()>;
}

/// A backend that does nothing; used whenever a path's glob policy
/// doesn't request passthru.
pub struct NullBackend;

impl PassthruBackend for NullBackend {
    fn open(&self, _filepath: &str) -> Result<ExternalHandle> {
        Ok(ExternalHandle(0))
    }

    fn close(&self, _handle: ExternalHandle) -> Result<()> {
        Ok(())
    }
}

struct ExternalRef {
    handle: ExternalHandle,
    backend: Arc<dyn PassthruBackend>,
}

impl Drop for ExternalRef {
    fn drop(&mut self) {
        let _ = self.backend.close(self.handle);
    }
}

/// `{external, metadata}` pair returned to VOL callers (spec §4.D/§4.I).
/// `external` is `None` when the call was memory-only. Cloning and
/// dropping a `HandlePair` is the reference-count operation spec §4.I
/// describes: the external side is released when the last clone drops.
#[derive(Clone)]
pub struct HandlePair {
    pub metadata: Arc<Object>,
    external: Option<Arc<ExternalRef>>,
    /// Wrappers created only to satisfy a callback's handle argument
    /// (e.g. `attr_iterate`'s per-item callback handle, spec §4.D) don't
    /// own the referent; closing them must not destroy the tree node.
    pub temporary: bool,
}

impl HandlePair {
    pub fn memory_only(metadata: Arc<Object>) -> Self {
        HandlePair { metadata, external: None, temporary: false }
    }

    pub fn temporary(metadata: Arc<Object>) -> Self {
        HandlePair { metadata, external: None, temporary: true }
    }

    pub fn with_external(
        metadata: Arc<Object>,
        handle: ExternalHandle,
        backend: Arc<dyn PassthruBackend>,
    ) -> Self {
        HandlePair {
            metadata,
            external: Some(Arc::new(ExternalRef { handle, backend })),
            temporary: false,
        }
    }

    pub fn is_memory_only(&self) -> bool {
        self.external.is_none()
    }

    pub fn external_handle(&self) -> Option<ExternalHandle> {
        self.external.as_ref().map(|r| r.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Kind, Object};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend(Arc<AtomicUsize>);
    impl PassthruBackend for CountingBackend {
        fn open(&self, _: &str) -> Result<ExternalHandle> {
            Ok(ExternalHandle(1))
        }
        fn close(&self, _: ExternalHandle) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn external_ref_closes_once_all_clones_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let backend: Arc<dyn PassthruBackend> = Arc::new(CountingBackend(closes.clone()));
        let metadata = Object::new("f.h5", Kind::DummyFile);
        let pair = HandlePair::with_external(metadata, ExternalHandle(1), backend);
        let clone = pair.clone();
        drop(pair);
        assert_eq!(closes.load(Ordering::SeqCst), 0, "still one live reference");
        drop(clone);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn memory_only_pair_has_no_external_handle() {
        let metadata = Object::new("f.h5", Kind::DummyFile);
        let pair = HandlePair::memory_only(metadata);
        assert!(pair.is_memory_only());
        assert!(pair.external_handle().is_none());
    }
}
