//! Index/query server: producer-side message loop (spec §4.F).
//!
//! Grounded on the teacher's `ws/system.rs` `select!`-driven loop (there,
//! racing a PTY read against inbound websocket frames); here the race is
//! between inbound `consumer`-tagged protocol messages and the local
//! "done" barrier that ends the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::comm::{Communicator, Tag};
use crate::dataset_store::DatasetStore;
use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::Result;
use crate::index::{Decomposer, SpatialIndex};
use crate::wire::{MessageKind, Reader, Writer};

/// One dataset this rank can answer queries about.
pub struct ServedDataset {
    pub id: u64,
    pub name: String,
    pub store: Arc<Mutex<DatasetStore>>,
    pub decomposer: Decomposer,
    pub index: SpatialIndex,
}

/// Runs the message loop of spec §4.F for one producer rank.
pub struct Server {
    rank: usize,
    intercomm: Arc<dyn Communicator>,
    local: Arc<dyn Communicator>,
    by_id: HashMap<u64, ServedDataset>,
    by_name: HashMap<String, u64>,
}

impl Server {
    pub fn new(
        intercomm: Arc<dyn Communicator>,
        local: Arc<dyn Communicator>,
        datasets: Vec<ServedDataset>,
    ) -> Self {
        let rank = intercomm.rank();
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for ds in datasets {
            by_name.insert(ds.name.clone(), ds.id);
            by_id.insert(ds.id, ds);
        }
        Server { rank, intercomm, local, by_id, by_name }
    }

    /// Ready → Serving → Terminated (spec §4.F).
    pub async fn run(&self) -> Result<()> {
        if self.rank == 0 {
            debug!(remote = self.intercomm.remote_size(), "sending ready to consumer group");
            let ready = Writer::new(MessageKind::Ready).into_bytes();
            for dest in 0..self.intercomm.remote_size() {
                self.intercomm.send(dest, Tag::Producer, ready.clone()).await?;
            }
            self.serve_as_root().await
        } else {
            self.serve_as_non_root().await
        }
    }

    async fn serve_as_root(&self) -> Result<()> {
        loop {
            let (from, payload) = self.intercomm.recv_any(Tag::Consumer).await?;
            let (kind, reader) = Reader::new(&payload)?;
            if kind == MessageKind::Done {
                debug!("done received, releasing local barrier");
                self.local.barrier().await;
                return Ok(());
            }
            self.handle(from, kind, reader).await?;
        }
    }

    async fn serve_as_non_root(&self) -> Result<()> {
        let barrier_fut = self.local.barrier();
        tokio::pin!(barrier_fut);
        loop {
            tokio::select! {
                _ = &mut barrier_fut => return Ok(()),
                msg = self.intercomm.recv_any(Tag::Consumer) => {
                    let (from, payload) = msg?;
                    let (kind, reader) = Reader::new(&payload)?;
                    self.handle(from, kind, reader).await?;
                }
            }
        }
    }

    async fn handle(&self, from: usize, kind: MessageKind, mut r: Reader<'_>) -> Result<()> {
        trace!(?kind, from, "serving request");
        let reply = match kind {
            MessageKind::Id => {
                let name = r.get_string()?;
                let mut w = Writer::new(MessageKind::Id);
                match self.by_name.get(&name) {
                    Some(&id) => w.put_u64(id),
                    None => w.put_u64(u64::MAX),
                };
                w.into_bytes()
            }
            MessageKind::Dimension => {
                let id = r.get_u64()?;
                let ds = self.dataset(id)?;
                let store = ds.store.lock().unwrap();
                let mut w = Writer::new(MessageKind::Dimension);
                w.put_u32(store.space.ndim() as u32);
                w.put_datatype(&store.element_type);
                w.put_dataspace(&store.space);
                w.into_bytes()
            }
            MessageKind::Domain => {
                let id = r.get_u64()?;
                let ds = self.dataset(id)?;
                let mut w = Writer::new(MessageKind::Domain);
                w.put_dataspace(&Dataspace::simple(ds.decomposer.domain.clone()));
                w.into_bytes()
            }
            MessageKind::Redirect => {
                let id = r.get_u64()?;
                let query = r.get_dataspace()?;
                let ds = self.dataset(id)?;
                let locs = ds.index.locations_intersecting(&query);
                let mut w = Writer::new(MessageKind::Redirect);
                w.put_u32(locs.len() as u32);
                for loc in locs {
                    w.put_dataspace(&loc.space);
                    w.put_u32(loc.source_rank);
                }
                w.into_bytes()
            }
            MessageKind::Data => {
                let id = r.get_u64()?;
                let query = r.get_dataspace()?;
                let ds = self.dataset(id)?;
                let store = ds.store.lock().unwrap();
                let fragments = store.matching_fragments(&query);
                let mut w = Writer::new(MessageKind::Data);
                w.put_u32(fragments.len() as u32);
                for (sub, bytes) in fragments {
                    w.put_dataspace(&sub);
                    w.put_bytes(&bytes);
                }
                w.into_bytes()
            }
            MessageKind::Ready | MessageKind::Done => {
                warn!(?kind, "unexpected message kind on the consumer tag");
                return Ok(());
            }
        };
        self.intercomm.send(from, Tag::Producer, reply).await
    }

    fn dataset(&self, id: u64) -> Result<&ServedDataset> {
        self.by_id
            .get(&id)
            .ok_or_else(|| crate::error::LowFiveError::protocol(format!("unknown dataset id {id}")))
    }
}

/// Replies expected from [`Server::handle`]'s counterpart on the query
/// client (spec §4.G); kept here as small decode helpers shared by
/// `client.rs` and the integration tests.
pub fn decode_dimension_reply(payload: &[u8]) -> Result<(u32, Datatype, Dataspace)> {
    let (_kind, mut r) = Reader::new(payload)?;
    let ndim = r.get_u32()?;
    let ty = r.get_datatype()?;
    let space = r.get_dataspace()?;
    Ok((ndim, ty, space))
}

pub fn decode_domain_reply(payload: &[u8]) -> Result<Dataspace> {
    let (_kind, mut r) = Reader::new(payload)?;
    r.get_dataspace()
}

pub fn decode_redirect_reply(payload: &[u8]) -> Result<Vec<(Dataspace, u32)>> {
    let (_kind, mut r) = Reader::new(payload)?;
    let count = r.get_u32()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push((r.get_dataspace()?, r.get_u32()?));
    }
    Ok(out)
}

pub fn decode_data_reply(payload: &[u8]) -> Result<Vec<(Dataspace, Vec<u8>)>> {
    let (_kind, mut r) = Reader::new(payload)?;
    let count = r.get_u32()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push((r.get_dataspace()?, r.get_bytes()?));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChannelComm;
    use crate::dataset_store::Ownership;

    fn make_served(id: u64, name: &str) -> ServedDataset {
        let mut store = DatasetStore::new(Datatype::f32(), Dataspace::simple(vec![10, 10]), Ownership::Owned);
        let w = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![10, 10]);
        let buf = vec![9.0f32; w.size() as usize];
        let bytes: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, buf.len() * 4) };
        store.write(Datatype::f32(), None, Some(w), bytes).unwrap();
        let decomposer = Decomposer::new(vec![10, 10], 1);
        ServedDataset {
            id,
            name: name.to_string(),
            store: Arc::new(Mutex::new(store)),
            decomposer,
            index: SpatialIndex::default(),
        }
    }

    #[tokio::test]
    async fn answers_id_dimension_and_data_requests() {
        let (producers, consumers) = ChannelComm::intercomm(1, 1);
        let local = ChannelComm::local_group(1);
        let served = make_served(0, "/g/d");

        let intercomm: Arc<dyn Communicator> = producers[0].clone();
        let localc: Arc<dyn Communicator> = local[0].clone();
        let server = Server::new(intercomm, localc, vec![served]);

        let consumer: Arc<dyn Communicator> = consumers[0].clone();
        let server_task = tokio::spawn(async move { server.run().await });

        let ready = consumer.recv(0, Tag::Producer).await.unwrap();
        let (kind, _) = Reader::new(&ready).unwrap();
        assert_eq!(kind, MessageKind::Ready);

        let mut w = Writer::new(MessageKind::Id);
        w.put_string("/g/d");
        consumer.send(0, Tag::Consumer, w.into_bytes()).await.unwrap();
        let reply = consumer.recv(0, Tag::Producer).await.unwrap();
        let (_kind, mut r) = Reader::new(&reply).unwrap();
        let id = r.get_u64().unwrap();
        assert_eq!(id, 0);

        let mut w = Writer::new(MessageKind::Data);
        w.put_u64(id);
        w.put_dataspace(&Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![10, 10]));
        consumer.send(0, Tag::Consumer, w.into_bytes()).await.unwrap();
        let reply = consumer.recv(0, Tag::Producer).await.unwrap();
        let fragments = decode_data_reply(&reply).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].0.size(), 100);

        consumer.send(0, Tag::Consumer, Writer::new(MessageKind::Done).into_bytes()).await.unwrap();
        server_task.await.unwrap().unwrap();
    }
}
