//! Top-level facade wiring the object tree, glob policy, and the
//! distributed index/query layer into one per-process handle (spec §6
//! "Configuration surface").
//!
//! Grounded on the teacher's `state.rs` `AppState`: one struct built once
//! from `Config` and shared as `Arc`/cloned handles across whatever the
//! process plays (producer server, consumer client, or both in a
//! co-located test). Where the teacher's `AppState` owns `FsService`,
//! `PtyManager`, `SessionStore`, this owns the `Dispatcher` (the VOL
//! callback surface) plus the bookkeeping spec §6 lists as free-standing
//! setters: which dataset paths are served over which inter-communicator,
//! and the two escape-hatch callbacks (`set_serve_indices`,
//! `set_consumer_filename`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::comm::{Communicator, Tag};
use crate::config::Config;
use crate::error::{LowFiveError, Result};
use crate::glob_policy::PolicyKind;
use crate::index::{Decomposer, SpatialIndex};
use crate::server::{Server, ServedDataset};
use crate::tree::{search, Kind, Object, Resolved};
use crate::vol::Dispatcher;
use crate::wire::{MessageKind, Writer};

/// A `(filename, path)` pair bound to one inter-communicator index, set
/// up by `set_intercomm` (spec §6). One index may bind several datasets;
/// `serve_all` groups by index and runs one `Server` per producer rank.
struct Binding {
    filename: String,
    path: String,
}

type ServeIndicesFn = Box<dyn Fn(&str) -> Vec<usize> + Send + Sync>;
type ConsumerFilenameFn = Box<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Default)]
struct IntercommSlot {
    intercomm: Option<Arc<dyn Communicator>>,
    local: Option<Arc<dyn Communicator>>,
    bindings: Vec<Binding>,
    servers: Vec<JoinHandle<Result<()>>>,
}

/// Per-process LowFive handle: the object tree's VOL dispatcher plus the
/// producer/consumer wiring spec §6 exposes as `set_*`/`serve_all`/etc.
pub struct Runtime {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    intercomms: Mutex<HashMap<usize, IntercommSlot>>,
    serve_indices: Mutex<Option<ServeIndicesFn>>,
    consumer_filename: Mutex<Option<ConsumerFilenameFn>>,
    serve_on_close: Mutex<bool>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let dispatcher = Dispatcher::new(config.policy.clone(), config.keep);
        let serve_on_close = config.serve_on_close;
        Runtime {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            intercomms: Mutex::new(HashMap::new()),
            serve_indices: Mutex::new(None),
            consumer_filename: Mutex::new(None),
            serve_on_close: Mutex::new(serve_on_close),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Config::from_file(path)?))
    }

    // -- Glob policy setters (spec §6) ----------------------------------

    pub fn set_passthru(&self, filename: impl Into<String>, path: impl Into<String>) {
        self.dispatcher.add_policy_rule(PolicyKind::Passthru, filename, path);
    }

    pub fn set_memory(&self, filename: impl Into<String>, path: impl Into<String>) {
        self.dispatcher.add_policy_rule(PolicyKind::Memory, filename, path);
    }

    pub fn set_zerocopy(&self, filename: impl Into<String>, path: impl Into<String>) {
        self.dispatcher.add_policy_rule(PolicyKind::ZeroCopy, filename, path);
    }

    /// Process-wide default for the `keep` policy (spec §4.H/§6); a glob
    /// rule added via the policy list still overrides this per path.
    pub fn set_keep(&self, keep: bool) {
        self.dispatcher.set_default_keep(keep);
    }

    pub fn set_serve_on_close(&self, value: bool) {
        *self.serve_on_close.lock().unwrap() = value;
    }

    pub fn serve_on_close(&self) -> bool {
        *self.serve_on_close.lock().unwrap()
    }

    /// Escape hatch letting the caller decide, per filename, which
    /// inter-communicator indices a dataset should be served over instead
    /// of (or in addition to) an explicit `set_intercomm` binding.
    pub fn set_serve_indices(&self, f: impl Fn(&str) -> Vec<usize> + Send + Sync + 'static) {
        *self.serve_indices.lock().unwrap() = Some(Box::new(f));
    }

    /// Escape hatch letting the caller rewrite a producer-declared
    /// filename into whatever name the consumer side should resolve
    /// (spec §6 `set_consumer_filename`); used when producer and
    /// consumer don't agree on a shared path naming convention.
    pub fn set_consumer_filename(&self, f: impl Fn(&str) -> String + Send + Sync + 'static) {
        *self.consumer_filename.lock().unwrap() = Some(Box::new(f));
    }

    pub fn consumer_filename(&self, producer_filename: &str) -> String {
        match self.consumer_filename.lock().unwrap().as_ref() {
            Some(f) => f(producer_filename),
            None => producer_filename.to_string(),
        }
    }

    // -- Inter-communicator wiring (spec §6) ----------------------------

    /// Register the actual communicator objects backing `index` (real
    /// MPI hands these out implicitly; this crate's `Communicator`
    /// abstraction needs them supplied explicitly since it isn't tied to
    /// a process-global MPI context).
    pub fn set_communicators(&self, index: usize, intercomm: Arc<dyn Communicator>, local: Arc<dyn Communicator>) {
        let mut slots = self.intercomms.lock().unwrap();
        let slot = slots.entry(index).or_default();
        slot.intercomm = Some(intercomm);
        slot.local = Some(local);
    }

    /// Bind a produced dataset's path to an inter-communicator index
    /// (spec §6 `set_intercomm(filename, path, index)`).
    pub fn set_intercomm(&self, filename: impl Into<String>, path: impl Into<String>, index: usize) {
        let mut slots = self.intercomms.lock().unwrap();
        slots.entry(index).or_default().bindings.push(Binding { filename: filename.into(), path: path.into() });
    }

    /// Filenames bound to `intercomm_index` (spec §6 `get_filenames`).
    pub fn get_filenames(&self, intercomm_index: usize) -> Vec<String> {
        let slots = self.intercomms.lock().unwrap();
        match slots.get(&intercomm_index) {
            Some(slot) => {
                let mut names: Vec<String> =
                    slot.bindings.iter().map(|b| b.filename.clone()).collect();
                names.sort();
                names.dedup();
                names
            }
            None => Vec::new(),
        }
    }

    /// Start serving every bound dataset (spec §6 `serve_all`): for each
    /// registered inter-communicator index, build a `SpatialIndex` over
    /// this rank's local triples and spawn a `Server` task answering that
    /// index's consumer group.
    pub async fn serve_all(&self) -> Result<()> {
        let indices: Vec<usize> = self.intercomms.lock().unwrap().keys().copied().collect();
        for index in indices {
            self.serve_index(index).await?;
        }
        Ok(())
    }

    async fn serve_index(&self, index: usize) -> Result<()> {
        let (intercomm, local, bindings) = {
            let slots = self.intercomms.lock().unwrap();
            let slot = slots
                .get(&index)
                .ok_or_else(|| LowFiveError::protocol(format!("no communicators set for intercomm index {index}")))?;
            let intercomm = slot
                .intercomm
                .clone()
                .ok_or_else(|| LowFiveError::protocol(format!("intercomm index {index} has no communicator")))?;
            let local = slot
                .local
                .clone()
                .ok_or_else(|| LowFiveError::protocol(format!("intercomm index {index} has no local communicator")))?;
            (intercomm, local, slot.bindings.iter().map(|b| (b.filename.clone(), b.path.clone())).collect::<Vec<_>>())
        };

        let world = local.size() as u64;
        let mut served = Vec::new();
        for (id, (filename, path)) in bindings.into_iter().enumerate() {
            let file = self
                .dispatcher
                .registry
                .open(&filename)
                .ok_or_else(|| LowFiveError::metadata(format!("'{filename}' is not open")))?;
            let node = match search(&file, &path) {
                Resolved::Exact(o) => o,
                Resolved::Partial { .. } => {
                    return Err(LowFiveError::metadata(format!("'{path}' does not resolve in '{filename}'")))
                }
            };
            let Kind::Dataset(store) = &node.kind else {
                return Err(LowFiveError::metadata(format!("'{path}' in '{filename}' is not a dataset")));
            };

            let (decomposer, local_spaces) = {
                let guard = store.lock().unwrap();
                let decomposer = Decomposer::new(guard.space.dims.clone(), world);
                let local_spaces: Vec<_> = guard.triples.iter().map(|t| t.file_space.clone()).collect();
                (decomposer, local_spaces)
            };
            let spatial_index = SpatialIndex::build(&intercomm, &decomposer, &local_spaces).await?;

            debug!(filename, path, id, "serving dataset");
            served.push(ServedDataset {
                id: id as u64,
                name: format!("{filename}:{path}"),
                store: store.clone(),
                decomposer,
                index: spatial_index,
            });
        }

        let server = Server::new(intercomm, local, served);
        let handle = tokio::spawn(async move { server.run().await });
        self.intercomms.lock().unwrap().get_mut(&index).unwrap().servers.push(handle);
        Ok(())
    }

    /// Tell the consumer group at `index` that the producer is done
    /// producing (spec §6 `producer_signal_done`); sent to every remote
    /// rank, independent of the `done` message a consumer sends back on
    /// close.
    pub async fn producer_signal_done(&self, index: usize) -> Result<()> {
        let intercomm = self.intercomm(index)?;
        let payload = Writer::new(MessageKind::Done).into_bytes();
        for dest in 0..intercomm.remote_size() {
            intercomm.send(dest, Tag::Producer, payload.clone()).await?;
        }
        info!(index, "producer signaled done");
        Ok(())
    }

    /// Consumer-side termination signal for `index` (spec §6
    /// `send_done`): sent once, by consumer rank 0, to producer rank 0.
    pub async fn send_done(&self, index: usize) -> Result<()> {
        let intercomm = self.intercomm(index)?;
        intercomm.send(0, Tag::Consumer, Writer::new(MessageKind::Done).into_bytes()).await
    }

    /// Await every `Server` task spawned by `serve_all` for `index`.
    pub async fn join(&self, index: usize) -> Result<()> {
        let handles = {
            let mut slots = self.intercomms.lock().unwrap();
            match slots.get_mut(&index) {
                Some(slot) => std::mem::take(&mut slot.servers),
                None => Vec::new(),
            }
        };
        for handle in handles {
            handle.await.map_err(|e| LowFiveError::resource(e.to_string()))??;
        }
        Ok(())
    }

    fn intercomm(&self, index: usize) -> Result<Arc<dyn Communicator>> {
        self.intercomms
            .lock()
            .unwrap()
            .get(&index)
            .and_then(|slot| slot.intercomm.clone())
            .ok_or_else(|| LowFiveError::protocol(format!("no communicator set for intercomm index {index}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChannelComm;

    #[test]
    fn set_intercomm_tracks_bound_filenames() {
        let rt = Runtime::new(Config::default());
        rt.set_intercomm("run.h5", "/g/d", 0);
        rt.set_intercomm("other.h5", "/g/e", 0);
        let mut names = rt.get_filenames(0);
        names.sort();
        assert_eq!(names, vec!["other.h5".to_string(), "run.h5".to_string()]);
        assert!(rt.get_filenames(1).is_empty());
    }

    #[test]
    fn consumer_filename_defaults_to_identity() {
        let rt = Runtime::new(Config::default());
        assert_eq!(rt.consumer_filename("run.h5"), "run.h5");
        rt.set_consumer_filename(|f| format!("consumer-{f}"));
        assert_eq!(rt.consumer_filename("run.h5"), "consumer-run.h5");
    }

    #[tokio::test]
    async fn producer_signal_done_reaches_every_consumer_rank() {
        let (producers, consumers) = ChannelComm::intercomm(1, 2);
        let local = ChannelComm::local_group(1);
        let rt = Runtime::new(Config::default());
        rt.set_communicators(0, producers[0].clone(), local[0].clone());
        rt.producer_signal_done(0).await.unwrap();
        for consumer in &consumers {
            let payload = consumer.recv(0, Tag::Producer).await.unwrap();
            let (kind, _) = crate::wire::Reader::new(&payload).unwrap();
            assert_eq!(kind, MessageKind::Done);
        }
    }
}
