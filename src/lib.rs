//! LowFive: a distributed in-memory metadata/index-query coupling layer
//! for scientific in-situ workflows (spec §1-2).
//!
//! A producer task's writes stay resident in this process's object tree
//! (§4.A-§4.C); a consumer task resolves names and reads fragments back
//! out over an inter-communicator (§4.F-§4.G), routed by a spatial index
//! over a regular tile decomposition (§4.E) instead of shipping the whole
//! dataset. [`runtime::Runtime`] is the per-process facade a host VOL
//! connector or a demo binary wires together; [`vol::Dispatcher`] is the
//! callback surface itself.

pub mod client;
pub mod comm;
pub mod config;
pub mod dataset_store;
pub mod dataspace;
pub mod datatype;
pub mod error;
pub mod glob_policy;
pub mod index;
pub mod runtime;
pub mod server;
pub mod token;
pub mod tree;
pub mod vol;
pub mod wire;

pub use client::Client;
pub use comm::{ChannelComm, Communicator, Tag};
pub use config::Config;
pub use dataspace::Dataspace;
pub use datatype::Datatype;
pub use error::{LowFiveError, Result};
pub use runtime::Runtime;
pub use server::Server;

/// Install the `tracing` subscriber the binaries and demos share,
/// honoring `RUST_LOG` the same way the teacher's `main.rs` does.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "lowfive=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
