//! Query client: consumer-side query driver (spec §4.G).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::comm::{Communicator, Tag};
use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::{LowFiveError, Result};
use crate::index::Decomposer;
use crate::server::{decode_data_reply, decode_dimension_reply, decode_domain_reply, decode_redirect_reply};
use crate::wire::{MessageKind, Reader, Writer};

/// What a consumer rank learns about a dataset during `file_open`
/// (spec §4.G step 2: "the same regular decomposition the client first
/// learned via `dimension`/`domain` messages").
pub struct ClientDataset {
    pub id: u64,
    pub decomposer: Decomposer,
    pub element_type: Datatype,
    pub space: Dataspace,
}

/// One consumer rank's view of the inter-communicator to the producer
/// group, plus the datasets it has resolved ids/decompositions for.
pub struct Client {
    intercomm: Arc<dyn Communicator>,
    datasets: HashMap<String, ClientDataset>,
}

impl Client {
    pub fn new(intercomm: Arc<dyn Communicator>) -> Self {
        Client { intercomm, datasets: HashMap::new() }
    }

    /// Wait for the producer group's `ready` handshake (spec §4.F
    /// "Ready" state). Only meaningful on the rank that initiates the
    /// session; callers that already know the producer side is serving
    /// may skip this.
    pub async fn wait_ready(&self) -> Result<()> {
        let payload = self.intercomm.recv(0, Tag::Producer).await?;
        let (kind, _) = Reader::new(&payload)?;
        if kind != MessageKind::Ready {
            return Err(LowFiveError::protocol("expected ready as the first producer message"));
        }
        Ok(())
    }

    /// Resolve `name` to a dataset id, its type/space, and its producer
    /// decomposition, contacting producer rank 0 (spec §4.D "dummy" open
    /// populated lazily; this is the lookup a dummy's later read uses).
    pub async fn open(&mut self, name: &str) -> Result<u64> {
        let mut w = Writer::new(MessageKind::Id);
        w.put_string(name);
        self.intercomm.send(0, Tag::Consumer, w.into_bytes()).await?;
        let reply = self.intercomm.recv(0, Tag::Producer).await?;
        let (_kind, mut r) = Reader::new(&reply)?;
        let id = r.get_u64()?;
        if id == u64::MAX {
            return Err(LowFiveError::metadata(format!("dataset '{name}' not found by producer")));
        }

        let mut w = Writer::new(MessageKind::Dimension);
        w.put_u64(id);
        self.intercomm.send(0, Tag::Consumer, w.into_bytes()).await?;
        let reply = self.intercomm.recv(0, Tag::Producer).await?;
        let (_ndim, element_type, space) = decode_dimension_reply(&reply)?;

        let mut w = Writer::new(MessageKind::Domain);
        w.put_u64(id);
        self.intercomm.send(0, Tag::Consumer, w.into_bytes()).await?;
        let reply = self.intercomm.recv(0, Tag::Producer).await?;
        let domain = decode_domain_reply(&reply)?;
        let decomposer = Decomposer::new(domain.dims, self.intercomm.remote_size() as u64);

        debug!(name, id, "resolved dataset");
        self.datasets.insert(name.to_string(), ClientDataset { id, decomposer, element_type, space });
        Ok(id)
    }

    /// `dataset_read` (spec §4.G): find the tile owners covering the
    /// query's bounding box, redirect to the ranks actually holding data,
    /// then fetch and scatter the bytes into `out`.
    pub async fn read(
        &self,
        name: &str,
        memspace: Option<Dataspace>,
        filespace: Dataspace,
        out: &mut [u8],
    ) -> Result<()> {
        let ds = self
            .datasets
            .get(name)
            .ok_or_else(|| LowFiveError::metadata(format!("'{name}' was never opened")))?;
        let mem_space = memspace.unwrap_or_else(|| Dataspace::simple(vec![filespace.size()]));
        let elem_size = ds.element_type.element_size();

        let bbox = Decomposer::bounding_block(&filespace);
        let mut tile_owners: Vec<usize> =
            ds.decomposer.tiles_touching(&bbox).into_iter().map(|g| ds.decomposer.owner(g)).collect();
        tile_owners.sort_unstable();
        tile_owners.dedup();

        let mut data_owners: BTreeSet<u32> = BTreeSet::new();
        for owner in tile_owners {
            let mut w = Writer::new(MessageKind::Redirect);
            w.put_u64(ds.id);
            w.put_dataspace(&filespace);
            self.intercomm.send(owner, Tag::Consumer, w.into_bytes()).await?;
            let reply = self.intercomm.recv(owner, Tag::Producer).await?;
            for (_space, rank) in decode_redirect_reply(&reply)? {
                data_owners.insert(rank);
            }
        }

        for owner in data_owners {
            let mut w = Writer::new(MessageKind::Data);
            w.put_u64(ds.id);
            w.put_dataspace(&filespace);
            self.intercomm.send(owner as usize, Tag::Consumer, w.into_bytes()).await?;
            let reply = self.intercomm.recv(owner as usize, Tag::Producer).await?;
            for (sub_file_space, bytes) in decode_data_reply(&reply)? {
                let dst = Dataspace::project_intersection(&filespace, &mem_space, &sub_file_space);
                if dst.size() == 0 {
                    continue;
                }
                let mut src_off = 0usize;
                for (dst_off, dst_len) in dst.iterate(elem_size) {
                    out[dst_off..dst_off + dst_len].copy_from_slice(&bytes[src_off..src_off + dst_len]);
                    src_off += dst_len;
                }
            }
        }
        Ok(())
    }

    /// Final termination signal (spec §4.F/G): sent once by consumer
    /// rank 0 on file close.
    pub async fn send_done(&self) -> Result<()> {
        self.intercomm.send(0, Tag::Consumer, Writer::new(MessageKind::Done).into_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChannelComm;
    use crate::dataset_store::{DatasetStore, Ownership};
    use crate::server::{Server, ServedDataset};
    use std::sync::Mutex;

    /// End-to-end S3: two producer ranks write disjoint halves of a
    /// 100x100 grid; one consumer rank reads the whole grid.
    #[tokio::test]
    async fn two_producers_one_consumer_disjoint_halves_s3() {
        let (producers, consumers) = ChannelComm::intercomm(2, 1);
        let local = ChannelComm::local_group(2);

        let make_half = |value: f32, start: u64, end: u64| {
            let mut store = DatasetStore::new(Datatype::f32(), Dataspace::simple(vec![100, 100]), Ownership::Owned);
            let region = Dataspace::hyperslab(vec![100, 100], vec![start, 0], vec![end, 100]);
            let buf = vec![value; region.size() as usize];
            let bytes: &[u8] =
                unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, buf.len() * 4) };
            store.write(Datatype::f32(), None, Some(region), bytes).unwrap();
            store
        };

        let store0 = make_half(1.0, 0, 50);
        let store1 = make_half(2.0, 50, 100);
        let decomposer = Decomposer::new(vec![100, 100], 2);

        let idx0 = crate::index::SpatialIndex::build(
            &(producers[0].clone() as Arc<dyn Communicator>),
            &decomposer,
            &[Dataspace::hyperslab(vec![100, 100], vec![0, 0], vec![50, 100])],
        );
        let idx1 = crate::index::SpatialIndex::build(
            &(producers[1].clone() as Arc<dyn Communicator>),
            &decomposer,
            &[Dataspace::hyperslab(vec![100, 100], vec![50, 0], vec![100, 100])],
        );
        let (idx0, idx1) = tokio::join!(idx0, idx1);
        let (idx0, idx1) = (idx0.unwrap(), idx1.unwrap());

        let served0 = ServedDataset {
            id: 0,
            name: "/g/d".to_string(),
            store: Arc::new(Mutex::new(store0)),
            decomposer: decomposer.clone(),
            index: idx0,
        };
        let served1 = ServedDataset {
            id: 0,
            name: "/g/d".to_string(),
            store: Arc::new(Mutex::new(store1)),
            decomposer: decomposer.clone(),
            index: idx1,
        };

        let server0 = Server::new(producers[0].clone(), local[0].clone(), vec![served0]);
        let server1 = Server::new(producers[1].clone(), local[1].clone(), vec![served1]);
        let task0 = tokio::spawn(async move { server0.run().await });
        let task1 = tokio::spawn(async move { server1.run().await });

        let mut client = Client::new(consumers[0].clone());
        client.wait_ready().await.unwrap();
        client.open("/g/d").await.unwrap();

        let read_space = Dataspace::hyperslab(vec![100, 100], vec![0, 0], vec![100, 100]);
        let mut out = vec![0u8; 100 * 100 * 4];
        client.read("/g/d", None, read_space, &mut out).await.unwrap();
        let floats: &[f32] =
            unsafe { std::slice::from_raw_parts(out.as_ptr() as *const f32, 100 * 100) };
        for r in 0..100u64 {
            for c in 0..100u64 {
                let v = floats[(r * 100 + c) as usize];
                let expected = if r < 50 { 1.0 } else { 2.0 };
                assert_eq!(v, expected, "mismatch at ({r},{c})");
            }
        }

        client.send_done().await.unwrap();
        task0.await.unwrap().unwrap();
        task1.await.unwrap().unwrap();
    }
}
