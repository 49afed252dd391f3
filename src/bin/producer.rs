//! Producer-side smoke test, analogous to `examples/prod-con/producer.cpp`
//! in the original: decomposes a domain across producer ranks, writes a
//! block each, and serves queries until a consumer says `done`.
//!
//! The original pairs this with a separate `consumer` process joined by a
//! real MPI inter-communicator; that transport is an out-of-scope
//! external collaborator here (spec §1), so this binary drives an
//! in-process [`lowfive::ChannelComm`] consumer task itself rather than
//! waiting on a second OS process. It exists to exercise the public API
//! end to end, not as part of the crate's tested surface.

use std::sync::{Arc, Mutex};

use lowfive::comm::ChannelComm;
use lowfive::dataset_store::{DatasetStore, Ownership};
use lowfive::dataspace::Dataspace;
use lowfive::datatype::Datatype;
use lowfive::index::{Decomposer, SpatialIndex};
use lowfive::server::{Server, ServedDataset};
use lowfive::{Client, Communicator};

const PRODUCER_RANKS: usize = 2;
const GRID: u64 = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lowfive::init_tracing();

    let (producers, consumers) = ChannelComm::intercomm(PRODUCER_RANKS, 1);
    let local = ChannelComm::local_group(PRODUCER_RANKS);
    let decomposer = Decomposer::new(vec![GRID, GRID], PRODUCER_RANKS as u64);

    let mut server_tasks = Vec::new();
    for rank in 0..PRODUCER_RANKS {
        let bounds = decomposer.tile_bounds(rank as u64);
        let region = Dataspace::hyperslab(
            vec![GRID, GRID],
            bounds.start.clone(),
            bounds.end.clone(),
        );
        let mut store = DatasetStore::new(Datatype::f32(), Dataspace::simple(vec![GRID, GRID]), Ownership::Owned);
        // Nonzero per-rank value: a zero-filled corruption bug in the
        // scatter path would be invisible against a literal 0.0 payload.
        let value = rank as f32 + 1.0;
        let buf = vec![value; region.size() as usize];
        let bytes: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, buf.len() * 4) };
        store.write(Datatype::f32(), None, Some(region.clone()), bytes)?;

        let comm: Arc<dyn Communicator> = producers[rank].clone();
        let dec = decomposer.clone();
        let index = SpatialIndex::build(&comm, &dec, &[region]).await?;

        let served = ServedDataset {
            id: 0,
            name: "/grid".to_string(),
            store: Arc::new(Mutex::new(store)),
            decomposer: dec,
            index,
        };
        let server = Server::new(comm, local[rank].clone(), vec![served]);
        server_tasks.push(tokio::spawn(async move { server.run().await }));
    }

    tracing::info!(ranks = PRODUCER_RANKS, grid = GRID, "producer serving");

    let mut client = Client::new(consumers[0].clone());
    client.wait_ready().await?;
    client.open("/grid").await?;
    let read_space = Dataspace::hyperslab(vec![GRID, GRID], vec![0, 0], vec![GRID, GRID]);
    let mut out = vec![0u8; (GRID * GRID) as usize * 4];
    client.read("/grid", None, read_space, &mut out).await?;
    client.send_done().await?;

    for task in server_tasks {
        task.await??;
    }
    tracing::info!("producer done");
    Ok(())
}
