//! Consumer-side smoke test, analogous to `examples/prod-con/consumer.cpp`
//! in the original: opens a dataset the producer side declared and reads
//! back a sub-region, without ever seeing the producer's full grid.
//!
//! Same in-process caveat as `producer.rs`: a real deployment joins two
//! OS processes over an MPI inter-communicator (spec §1 out-of-scope
//! external collaborator); this binary drives both sides itself via
//! [`lowfive::ChannelComm`] so it can run standalone as a smoke test.

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
        let region = Dataspace::hyperslab(vec![GRID, GRID], bounds.start.clone(), bounds.end.clone());
        let mut store = DatasetStore::new(Datatype::f32(), Dataspace::simple(vec![GRID, GRID]), Ownership::Owned);
        // Nonzero per-rank value: a zero-filled corruption bug in the
        // scatter path would be invisible against a literal 0.0 payload.
        let buf = vec![rank as f32 + 1.0; region.size() as usize];
        let bytes: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, buf.len() * 4) };
        store.write(Datatype::f32(), None, Some(region.clone()), bytes)?;

        let comm: Arc<dyn Communicator> = producers[rank].clone();
        let dec = decomposer.clone();
        let index = SpatialIndex::build(&comm, &dec, &[region]).await?;
        let served =
            ServedDataset { id: 0, name: "/grid".to_string(), store: Arc::new(Mutex::new(store)), decomposer: dec, index };
        let server = Server::new(comm, local[rank].clone(), vec![served]);
        server_tasks.push(tokio::spawn(async move { server.run().await }));
    }

    let mut client = Client::new(consumers[0].clone());
    client.wait_ready().await?;
    client.open("/grid").await?;

    // Read only the corner quadrant instead of the whole grid: spec §4.G's
    // redirect step should contact one producer rank, not both.
    let quadrant = GRID / 2;
    let read_space = Dataspace::hyperslab(vec![GRID, GRID], vec![0, 0], vec![quadrant, quadrant]);
    let mut out = vec![0u8; (quadrant * quadrant) as usize * 4];
    client.read("/grid", None, read_space, &mut out).await?;
    let floats: &[f32] = unsafe { std::slice::from_raw_parts(out.as_ptr() as *const f32, out.len() / 4) };
    tracing::info!(first = floats[0], last = floats[floats.len() - 1], "consumer read quadrant");

    client.send_done().await?;
    for task in server_tasks {
        task.await??;
    }
    Ok(())
}
