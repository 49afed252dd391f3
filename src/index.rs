//! Spatial index: regular decomposition + `BoxLocations` (spec §4.E).
//!
//! Grounded on `include/lowfive/index.hpp`'s `Decomposer`/`RegularDecomposer`
//! and `BoxLocations` (original C++); the original's decomposer factors
//! the producer world size across every dimension it is given. This
//! rewrite decomposes along the first (slowest-varying) dimension only —
//! every scenario in spec.md §8 (S3, S4) decomposes along a single axis,
//! and a single-axis regular decomposition is the common case the
//! original's general N-dimensional factorization reduces to whenever the
//! tile count doesn't need to be spread across more than one dimension.
//! [REDESIGN FLAG — noted in DESIGN.md: multi-axis factorization could be
//! added later without changing `BoxLocations`'s shape.]

use std::sync::Arc;

use crate::comm::{Communicator, Tag};
use crate::dataspace::{Block, Dataspace, Selection};
use crate::error::Result;
use crate::wire::{MessageKind, Reader, Writer};

/// Splits a dataset's logical domain into `num_tiles` contiguous,
/// axis-aligned ranges along dimension 0; tile `g` is owned by producer
/// rank `g` (spec §4.E "contiguous assignment").
#[derive(Debug, Clone)]
pub struct Decomposer {
    pub domain: Vec<u64>,
    pub num_tiles: u64,
}

impl Decomposer {
    pub fn new(domain: Vec<u64>, num_tiles: u64) -> Self {
        assert!(num_tiles > 0, "decomposer requires at least one tile");
        Decomposer { domain, num_tiles }
    }

    fn edge(&self, i: u64) -> u64 {
        let d0 = self.domain[0];
        (d0 * i) / self.num_tiles
    }

    /// Bounding box owned by tile `gid`.
    pub fn tile_bounds(&self, gid: u64) -> Block {
        let mut start = vec![0u64; self.domain.len()];
        let mut end = self.domain.clone();
        start[0] = self.edge(gid);
        end[0] = self.edge(gid + 1);
        Block::new(start, end)
    }

    pub fn owner(&self, gid: u64) -> usize {
        gid as usize
    }

    /// Tile ids whose bounding box intersects `b`.
    pub fn tiles_touching(&self, b: &Block) -> Vec<u64> {
        (0..self.num_tiles).filter(|&g| self.tile_bounds(g).intersects(b)).collect()
    }

    /// Smallest axis-aligned block enclosing every coordinate `space`
    /// selects, in `space`'s own coordinate domain.
    pub fn bounding_block(space: &Dataspace) -> Block {
        let mut start = space.dims.clone();
        let mut end = vec![0u64; space.dims.len()];
        match &space.selection {
            Selection::All => Block::new(vec![0; space.dims.len()], space.dims.clone()),
            Selection::Hyperslab(blocks) => {
                for blk in blocks {
                    for i in 0..blk.ndim() {
                        start[i] = start[i].min(blk.start[i]);
                        end[i] = end[i].max(blk.end[i]);
                    }
                }
                Block::new(start, end)
            }
            Selection::Points(pts) => {
                for p in pts {
                    for i in 0..p.len() {
                        start[i] = start[i].min(p[i]);
                        end[i] = end[i].max(p[i] + 1);
                    }
                }
                Block::new(start, end)
            }
        }
    }
}

/// One routing record: a file-space rectangle written by `source_rank`.
#[derive(Debug, Clone)]
pub struct BoxLocation {
    pub space: Dataspace,
    pub source_rank: u32,
}

fn encode_box_locations(locs: &[BoxLocation]) -> Vec<u8> {
    let mut w = Writer::new(MessageKind::Domain);
    w.put_u32(locs.len() as u32);
    for loc in locs {
        w.put_dataspace(&loc.space);
        w.put_u32(loc.source_rank);
    }
    w.into_bytes()
}

fn decode_box_locations(buf: &[u8]) -> Result<Vec<BoxLocation>> {
    let (_kind, mut r) = Reader::new(buf)?;
    let count = r.get_u32()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let space = r.get_dataspace()?;
        let source_rank = r.get_u32()?;
        out.push(BoxLocation { space, source_rank });
    }
    Ok(out)
}

/// Per-rank spatial index: this rank's decomposition view of the dataset
/// and the `BoxLocations` it has collected for the tiles it owns.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    pub box_locations: Vec<BoxLocation>,
}

impl SpatialIndex {
    /// Build the index for one dataset: enumerate local triples' file-space
    /// boxes, route each to the producer ranks owning the touched tiles via
    /// an all-to-some exchange, and collect what arrives for tiles this
    /// rank owns (spec §4.E steps 1-3).
    pub async fn build(
        comm: &Arc<dyn Communicator>,
        decomposer: &Decomposer,
        local_file_spaces: &[Dataspace],
    ) -> Result<SpatialIndex> {
        let my_rank = comm.rank();
        let world = comm.size();

        let mut outgoing: Vec<Vec<BoxLocation>> = vec![Vec::new(); world];
        for space in local_file_spaces {
            let bbox = Decomposer::bounding_block(space);
            for gid in decomposer.tiles_touching(&bbox) {
                let owner = decomposer.owner(gid);
                if owner < world {
                    outgoing[owner]
                        .push(BoxLocation { space: space.clone(), source_rank: my_rank as u32 });
                }
            }
        }

        for (dest, records) in outgoing.iter().enumerate() {
            if dest == my_rank {
                continue;
            }
            comm.send(dest, Tag::Local, encode_box_locations(records)).await?;
        }

        let mut box_locations = outgoing[my_rank].clone();
        for _ in 0..world.saturating_sub(1) {
            let (_from, payload) = comm.recv_any(Tag::Local).await?;
            box_locations.extend(decode_box_locations(&payload)?);
        }

        comm.barrier().await;
        Ok(SpatialIndex { box_locations })
    }

    /// Records in this rank's `BoxLocations` whose dataspace intersects
    /// `query` (spec §4.F `redirect` reply; idempotent under duplicate
    /// delivery per spec §4.E invariant).
    pub fn locations_intersecting(&self, query: &Dataspace) -> Vec<&BoxLocation> {
        self.box_locations.iter().filter(|loc| loc.space.intersects(query)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposer_splits_first_axis_contiguously() {
        let dec = Decomposer::new(vec![100, 100], 2);
        let t0 = dec.tile_bounds(0);
        let t1 = dec.tile_bounds(1);
        assert_eq!(t0.start, vec![0, 0]);
        assert_eq!(t0.end, vec![50, 100]);
        assert_eq!(t1.start, vec![50, 0]);
        assert_eq!(t1.end, vec![100, 100]);
        assert_eq!(dec.owner(0), 0);
        assert_eq!(dec.owner(1), 1);
    }

    #[test]
    fn tiles_touching_finds_overlapping_tiles_only() {
        let dec = Decomposer::new(vec![16, 16, 16], 4);
        let region = Block::new(vec![3, 0, 0], vec![5, 16, 16]);
        let touched = dec.tiles_touching(&region);
        assert_eq!(touched, vec![0, 1]);
    }

    #[tokio::test]
    async fn build_routes_triples_to_tile_owners() {
        use crate::comm::ChannelComm;
        let group = ChannelComm::local_group(2);
        let dec = Decomposer::new(vec![100, 100], 2);

        let left = Dataspace::hyperslab(vec![100, 100], vec![0, 0], vec![50, 100]);
        let right = Dataspace::hyperslab(vec![100, 100], vec![50, 0], vec![100, 100]);

        let comm0: Arc<dyn Communicator> = group[0].clone();
        let comm1: Arc<dyn Communicator> = group[1].clone();
        let dec0 = dec.clone();
        let dec1 = dec.clone();
        let (idx0, idx1) = tokio::join!(
            SpatialIndex::build(&comm0, &dec0, std::slice::from_ref(&left)),
            SpatialIndex::build(&comm1, &dec1, std::slice::from_ref(&right)),
        );
        let idx0 = idx0.unwrap();
        let idx1 = idx1.unwrap();

        assert_eq!(idx0.box_locations.len(), 1);
        assert_eq!(idx0.box_locations[0].source_rank, 0);
        assert_eq!(idx1.box_locations.len(), 1);
        assert_eq!(idx1.box_locations[0].source_rank, 1);
    }
}
