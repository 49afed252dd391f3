//! N-dimensional selection algebra.
//!
//! This module is the one piece of the core that the specification treats
//! as an oracle: `project_intersection` and `iterate` must agree exactly
//! with the semantics an HDF5 dataspace would produce. We don't link
//! against a native HDF5 dataspace implementation (spec §1 explicitly
//! keeps the dataspace algebra delegated to an external library in the
//! production system); instead we implement the same contract directly,
//! since the core's own tests are the only oracle available here.

use byteorder::{ByteOrder, LittleEndian};

pub const MAX_DIMS: usize = 32;

/// One axis-aligned rectangular block, half-open on the end (`start..end`
/// per dimension).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: Vec<u64>,
    pub end: Vec<u64>,
}

impl Block {
    pub fn new(start: Vec<u64>, end: Vec<u64>) -> Self {
        assert_eq!(start.len(), end.len());
        Block { start, end }
    }

    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    pub fn size(&self) -> u64 {
        self.start
            .iter()
            .zip(&self.end)
            .map(|(&s, &e)| e.saturating_sub(s))
            .product()
    }

    pub fn contains(&self, coord: &[u64]) -> bool {
        coord
            .iter()
            .zip(self.start.iter().zip(&self.end))
            .all(|(&c, (&s, &e))| c >= s && c < e)
    }

    pub fn intersects(&self, other: &Block) -> bool {
        self.start
            .iter()
            .zip(&self.end)
            .zip(other.start.iter().zip(&other.end))
            .all(|((&s1, &e1), (&s2, &e2))| s1 < e2 && s2 < e1)
    }

    /// `ord`-th coordinate in row-major order (last dimension fastest).
    fn coord_at_ordinal(&self, mut ord: u64) -> Vec<u64> {
        let dim = self.ndim();
        let mut extents = vec![0u64; dim];
        for i in 0..dim {
            extents[i] = self.end[i].saturating_sub(self.start[i]);
        }
        let mut coord = vec![0u64; dim];
        for i in (0..dim).rev() {
            let e = extents[i].max(1);
            coord[i] = self.start[i] + ord % e;
            ord /= e;
        }
        coord
    }

    fn iter_coords(&self) -> impl Iterator<Item = Vec<u64>> + '_ {
        let n = self.size();
        (0..n).map(move |ord| self.coord_at_ordinal(ord))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Hyperslab(Vec<Block>),
    Points(Vec<Vec<u64>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    pub dims: Vec<u64>,
    /// `None` at index `i` means dimension `i` is unbounded.
    pub max_dims: Vec<Option<u64>>,
    pub selection: Selection,
}

impl Dataspace {
    pub fn simple(dims: Vec<u64>) -> Self {
        let max_dims = dims.iter().map(|&d| Some(d)).collect();
        Dataspace { dims, max_dims, selection: Selection::All }
    }

    pub fn simple_unlimited(dims: Vec<u64>) -> Self {
        let max_dims = vec![None; dims.len()];
        Dataspace { dims, max_dims, selection: Selection::All }
    }

    pub fn hyperslab(dims: Vec<u64>, start: Vec<u64>, end: Vec<u64>) -> Self {
        let max_dims = dims.iter().map(|&d| Some(d)).collect();
        Dataspace {
            dims,
            max_dims,
            selection: Selection::Hyperslab(vec![Block::new(start, end)]),
        }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    fn full_block(&self) -> Block {
        Block::new(vec![0; self.ndim()], self.dims.clone())
    }

    fn blocks(&self) -> Vec<Block> {
        match &self.selection {
            Selection::All => vec![self.full_block()],
            Selection::Hyperslab(blocks) => blocks.clone(),
            Selection::Points(_) => vec![],
        }
    }

    /// Number of elements under the selection.
    pub fn size(&self) -> u64 {
        match &self.selection {
            Selection::All => self.dims.iter().product(),
            Selection::Hyperslab(blocks) => blocks.iter().map(Block::size).sum(),
            Selection::Points(pts) => pts.len() as u64,
        }
    }

    /// Row-major strides of the dataspace's own extent (not the
    /// selection), used to turn a coordinate into a flat element index.
    fn strides(&self) -> Vec<u64> {
        let n = self.ndim();
        let mut strides = vec![1u64; n];
        for i in (0..n.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    fn flat_index(&self, coord: &[u64]) -> u64 {
        self.strides().iter().zip(coord).map(|(&s, &c)| s * c).sum()
    }

    fn contains(&self, coord: &[u64]) -> bool {
        match &self.selection {
            Selection::All => coord.iter().zip(&self.dims).all(|(&c, &d)| c < d),
            Selection::Hyperslab(blocks) => blocks.iter().any(|b| b.contains(coord)),
            Selection::Points(pts) => pts.iter().any(|p| p.as_slice() == coord),
        }
    }

    /// Selected coordinates in row-major order (blocks visited in list
    /// order, each block's interior visited row-major); this is also the
    /// canonical order `iterate` emits ranges in.
    fn iter_coords(&self) -> Vec<Vec<u64>> {
        match &self.selection {
            Selection::All => self.full_block().iter_coords().collect(),
            Selection::Hyperslab(blocks) => {
                blocks.iter().flat_map(|b| b.iter_coords()).collect()
            }
            Selection::Points(pts) => pts.clone(),
        }
    }

    fn coord_at_ordinal(&self, ord: u64) -> Vec<u64> {
        match &self.selection {
            Selection::All => self.full_block().coord_at_ordinal(ord),
            Selection::Hyperslab(blocks) => {
                let mut remaining = ord;
                for b in blocks {
                    let sz = b.size();
                    if remaining < sz {
                        return b.coord_at_ordinal(remaining);
                    }
                    remaining -= sz;
                }
                panic!("ordinal {ord} out of range for hyperslab selection");
            }
            Selection::Points(pts) => pts[ord as usize].clone(),
        }
    }

    /// True iff `self` and `other` share at least one element. Both must
    /// describe the same coordinate domain (same `dims`).
    pub fn intersects(&self, other: &Dataspace) -> bool {
        match (&self.selection, &other.selection) {
            (Selection::Points(_), _) | (_, Selection::Points(_)) => {
                let (pts_space, blocks_space) = if matches!(self.selection, Selection::Points(_))
                {
                    (self, other)
                } else {
                    (other, self)
                };
                pts_space.iter_coords().iter().any(|c| blocks_space.contains(c))
            }
            _ => {
                let a = self.blocks();
                let b = other.blocks();
                a.iter().any(|x| b.iter().any(|y| x.intersects(y)))
            }
        }
    }

    /// Return a new dataspace, shaped like `dst`, selecting exactly the
    /// elements of `dst` that correspond (by parallel iteration order) to
    /// the elements of `src` that fall inside `region`.
    ///
    /// `src` and `region` must share a coordinate domain (the dataset's
    /// file-space, in every caller in this crate); `dst` may have an
    /// entirely different shape, as long as it was paired with `src` in a
    /// write/read call with the same element count.
    pub fn project_intersection(src: &Dataspace, dst: &Dataspace, region: &Dataspace) -> Dataspace {
        let mut matched = Vec::new();
        for (ord, coord) in src.iter_coords().into_iter().enumerate() {
            if region.contains(&coord) {
                matched.push(dst.coord_at_ordinal(ord as u64));
            }
        }
        Dataspace {
            dims: dst.dims.clone(),
            max_dims: dst.max_dims.clone(),
            selection: Selection::Points(matched),
        }
    }

    /// Pair `self` with `other` element-for-element and merge each side's
    /// run of contiguous elements into a single range. Use this (not two
    /// independent `iterate()` calls zipped together) whenever `self` and
    /// `other` were produced as a matched pair by `project_intersection`
    /// over the same element sequence but addressed in two different flat
    /// layouts (e.g. a destination buffer's dataspace and a triple's own
    /// memory-space): each side collapses adjacent elements into ranges
    /// independently, so two merges can produce different-length range
    /// lists for the same logical element sequence, and zipping those
    /// lists silently truncates to the shorter one. Pairing before
    /// merging — and only merging where *both* sides stay contiguous —
    /// keeps every returned `(self_offset, other_offset, len)` triple
    /// referring to the same run of elements on both sides.
    pub fn paired_ranges(&self, element_size: usize, other: &Dataspace) -> Vec<(usize, usize, usize)> {
        let a_coords = self.iter_coords();
        let b_coords = other.iter_coords();
        assert_eq!(
            a_coords.len(),
            b_coords.len(),
            "paired dataspaces must enumerate the same element count"
        );

        let mut ranges: Vec<(usize, usize, usize)> = Vec::new();
        for (ca, cb) in a_coords.iter().zip(&b_coords) {
            let a_off = self.flat_index(ca) as usize * element_size;
            let b_off = other.flat_index(cb) as usize * element_size;
            if let Some(last) = ranges.last_mut() {
                if last.0 + last.2 == a_off && last.1 + last.2 == b_off {
                    last.2 += element_size;
                    continue;
                }
            }
            ranges.push((a_off, b_off, element_size));
        }
        ranges
    }

    /// Emit `(byte_offset, byte_length)` pairs covering the selection's
    /// elements in row-major order, collapsing adjacent elements (in that
    /// same order) into single ranges. Single-shot in spirit: callers
    /// should not call this more than once per logical read/write, since
    /// for a `Points` selection the emitted order is insertion order, not
    /// necessarily ascending by offset.
    pub fn iterate(&self, element_size: usize) -> Vec<(usize, usize)> {
        let coords = self.iter_coords();
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for coord in coords {
            let flat = self.flat_index(&coord) as usize;
            let byte_offset = flat * element_size;
            if let Some(last) = ranges.last_mut() {
                if last.0 + last.1 == byte_offset {
                    last.1 += element_size;
                    continue;
                }
            }
            ranges.push((byte_offset, element_size));
        }
        ranges
    }

    /// Update the current extent; `max_dims` is left untouched. Caller is
    /// responsible for checking `sizes[i] <= max_dims[i]` (spec §4.C).
    pub fn set_extent(&mut self, sizes: &[u64]) {
        self.dims = sizes.to_vec();
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let ndim = self.dims.len() as u32;
        let mut u32b = [0u8; 4];
        LittleEndian::write_u32(&mut u32b, ndim);
        buf.extend_from_slice(&u32b);

        for &d in &self.dims {
            let mut b = [0u8; 8];
            LittleEndian::write_u64(&mut b, d);
            buf.extend_from_slice(&b);
        }
        for m in &self.max_dims {
            let mut b = [0u8; 8];
            LittleEndian::write_u64(&mut b, m.unwrap_or(u64::MAX));
            buf.extend_from_slice(&b);
        }

        match &self.selection {
            Selection::All => buf.push(0),
            Selection::Hyperslab(blocks) => {
                buf.push(1);
                let mut cb = [0u8; 4];
                LittleEndian::write_u32(&mut cb, blocks.len() as u32);
                buf.extend_from_slice(&cb);
                for block in blocks {
                    for &v in block.start.iter().chain(block.end.iter()) {
                        let mut b = [0u8; 8];
                        LittleEndian::write_u64(&mut b, v);
                        buf.extend_from_slice(&b);
                    }
                }
            }
            Selection::Points(pts) => {
                buf.push(2);
                let mut cb = [0u8; 4];
                LittleEndian::write_u32(&mut cb, pts.len() as u32);
                buf.extend_from_slice(&cb);
                for p in pts {
                    for &v in p {
                        let mut b = [0u8; 8];
                        LittleEndian::write_u64(&mut b, v);
                        buf.extend_from_slice(&b);
                    }
                }
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<(Dataspace, usize)> {
        let mut pos = 0;
        let ndim = LittleEndian::read_u32(buf.get(pos..pos + 4)?) as usize;
        pos += 4;

        let mut dims = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            dims.push(LittleEndian::read_u64(buf.get(pos..pos + 8)?));
            pos += 8;
        }
        let mut max_dims = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let v = LittleEndian::read_u64(buf.get(pos..pos + 8)?);
            max_dims.push(if v == u64::MAX { None } else { Some(v) });
            pos += 8;
        }

        let tag = *buf.get(pos)?;
        pos += 1;
        let selection = match tag {
            0 => Selection::All,
            1 => {
                let count = LittleEndian::read_u32(buf.get(pos..pos + 4)?) as usize;
                pos += 4;
                let mut blocks = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut start = Vec::with_capacity(ndim);
                    for _ in 0..ndim {
                        start.push(LittleEndian::read_u64(buf.get(pos..pos + 8)?));
                        pos += 8;
                    }
                    let mut end = Vec::with_capacity(ndim);
                    for _ in 0..ndim {
                        end.push(LittleEndian::read_u64(buf.get(pos..pos + 8)?));
                        pos += 8;
                    }
                    blocks.push(Block::new(start, end));
                }
                Selection::Hyperslab(blocks)
            }
            2 => {
                let count = LittleEndian::read_u32(buf.get(pos..pos + 4)?) as usize;
                pos += 4;
                let mut pts = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut p = Vec::with_capacity(ndim);
                    for _ in 0..ndim {
                        p.push(LittleEndian::read_u64(buf.get(pos..pos + 8)?));
                        pos += 8;
                    }
                    pts.push(p);
                }
                Selection::Points(pts)
            }
            _ => return None,
        };

        Some((Dataspace { dims, max_dims, selection }, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_of_simple_space() {
        let ds = Dataspace::simple(vec![10, 10, 10]);
        assert_eq!(ds.size(), 1000);
    }

    #[test]
    fn hyperslab_size_and_iterate_covers_all_bytes() {
        let ds = Dataspace::hyperslab(vec![10, 10, 10], vec![2, 2, 2], vec![6, 6, 6]);
        assert_eq!(ds.size(), 4 * 4 * 4);
        let ranges = ds.iterate(4);
        let total: usize = ranges.iter().map(|(_, len)| len).sum();
        assert_eq!(total, ds.size() as usize * 4);
        // ascending and disjoint
        for w in ranges.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0);
        }
    }

    #[test]
    fn intersects_detects_overlap() {
        let a = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![5, 5]);
        let b = Dataspace::hyperslab(vec![10, 10], vec![4, 4], vec![8, 8]);
        let c = Dataspace::hyperslab(vec![10, 10], vec![5, 5], vec![8, 8]);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn project_intersection_matches_size() {
        let a = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![10, 10]);
        let b = Dataspace::simple(vec![100]); // flat memory buffer of 100 elements
        let region = Dataspace::hyperslab(vec![10, 10], vec![2, 2], vec![6, 6]);
        let proj = Dataspace::project_intersection(&a, &b, &region);
        assert_eq!(proj.size(), region.size());
    }

    #[test]
    fn round_trip_encode_decode() {
        let ds = Dataspace::hyperslab(vec![4, 4, 4], vec![0, 0, 0], vec![4, 4, 4]);
        let buf = ds.encode();
        let (decoded, used) = Dataspace::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, ds);
        assert_eq!(decoded.iterate(4), ds.iterate(4));
    }
}
