//! Per-dataset triple store: write/read replay (spec §4.C).

use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::{LowFiveError, Result};

/// A write either keeps a shallow reference into caller-owned memory or
/// deep-copies it. Only `Owned` is plain-safe Rust; `Borrowed` reproduces
/// the reference implementation's `const void*` triple, which is why its
/// constructor is `unsafe` — the caller attests the memory outlives the
/// dataset, exactly as the ownership policy's contract requires (spec
/// §4.C: "caller must keep memory live until the dataset is closed or
/// serving ends").
pub struct BorrowedBuf {
    ptr: *const u8,
    len: usize,
}

// Safety: callers of `Triple::borrowed` guarantee the referenced memory
// outlives the dataset and isn't mutated for the lifetime of the triple;
// under that contract sharing the pointer across threads is sound.
unsafe impl Send for BorrowedBuf {}
unsafe impl Sync for BorrowedBuf {}

impl BorrowedBuf {
    fn as_slice(&self) -> &[u8] {
        // Safety: contract documented on `BorrowedBuf` / `Triple::borrowed`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

pub enum TripleBuffer {
    Borrowed(BorrowedBuf),
    Owned(Vec<u8>),
    /// Variable-length strings: one string-table index per selected
    /// element of `memory_space`, stored as native-endian `usize` words so
    /// the triple lines up with `element_type.element_size()`.
    OwnedStrings(Vec<usize>),
}

impl TripleBuffer {
    fn as_bytes(&self) -> &[u8] {
        match self {
            TripleBuffer::Borrowed(b) => b.as_slice(),
            TripleBuffer::Owned(v) => v.as_slice(),
            TripleBuffer::OwnedStrings(idx) => {
                // usize and u8 have no common layout guarantee across
                // platforms in general, but within one process (the only
                // place this buffer is ever read back) it's exactly the
                // bytes we wrote.
                unsafe {
                    std::slice::from_raw_parts(
                        idx.as_ptr() as *const u8,
                        idx.len() * std::mem::size_of::<usize>(),
                    )
                }
            }
        }
    }
}

pub struct Triple {
    pub element_type: Datatype,
    pub memory_space: Dataspace,
    pub file_space: Dataspace,
    pub buffer: TripleBuffer,
}

impl Triple {
    fn bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    fn is_strings(&self) -> bool {
        matches!(self.buffer, TripleBuffer::OwnedStrings(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Borrowed,
    Owned,
}

pub struct DatasetStore {
    pub element_type: Datatype,
    pub space: Dataspace,
    pub ownership: Ownership,
    pub triples: Vec<Triple>,
    pub strings: Vec<String>,
}

impl DatasetStore {
    pub fn new(element_type: Datatype, space: Dataspace, ownership: Ownership) -> Self {
        DatasetStore { element_type, space, ownership, triples: Vec::new(), strings: Vec::new() }
    }

    fn check_type(&self, t: &Datatype) -> Result<()> {
        if !t.compatible(&self.element_type) {
            return Err(LowFiveError::metadata(format!(
                "type mismatch: dataset declares {:?} but triple uses {:?}",
                self.element_type, t
            )));
        }
        Ok(())
    }

    fn check_dim(&self, space: &Dataspace) -> Result<()> {
        if space.ndim() != self.space.ndim() {
            return Err(LowFiveError::metadata(format!(
                "dimensionality mismatch: dataset is {}-d but file_space is {}-d",
                self.space.ndim(),
                space.ndim()
            )));
        }
        Ok(())
    }

    /// Record a write of fixed-size elements. `memspace`/`filespace` of
    /// `None` mean "the dataset's own logical space" (HDF5's `H5S_ALL`).
    pub fn write(
        &mut self,
        element_type: Datatype,
        memspace: Option<Dataspace>,
        filespace: Option<Dataspace>,
        buf: &[u8],
    ) -> Result<()> {
        self.check_type(&element_type)?;
        let file_space = filespace.unwrap_or_else(|| self.space.clone());
        self.check_dim(&file_space)?;
        let memory_space = memspace.unwrap_or_else(|| Dataspace::simple(vec![file_space.size()]));

        let nbytes = memory_space.size() as usize * element_type.element_size();
        if buf.len() < nbytes {
            return Err(LowFiveError::metadata(format!(
                "write buffer too small: need {nbytes} bytes, got {}",
                buf.len()
            )));
        }

        let buffer = match self.ownership {
            Ownership::Borrowed => {
                // Safety: see `BorrowedBuf` contract; `buf` must outlive
                // the dataset per the ownership policy.
                TripleBuffer::Borrowed(BorrowedBuf { ptr: buf.as_ptr(), len: nbytes })
            }
            Ownership::Owned => TripleBuffer::Owned(buf[..nbytes].to_vec()),
        };

        self.triples.push(Triple { element_type, memory_space, file_space, buffer });
        Ok(())
    }

    /// Record a write of variable-length strings. Always owned: each
    /// string is interned into the dataset's string table and the triple
    /// stores table indices (spec §4.C).
    pub fn write_strings(
        &mut self,
        memspace: Option<Dataspace>,
        filespace: Option<Dataspace>,
        values: &[String],
    ) -> Result<()> {
        if !self.element_type.is_var_length_string() {
            return Err(LowFiveError::metadata("write_strings() on a non-string dataset"));
        }
        let file_space = filespace.unwrap_or_else(|| self.space.clone());
        self.check_dim(&file_space)?;
        let memory_space = memspace.unwrap_or_else(|| Dataspace::simple(vec![file_space.size()]));

        if values.len() as u64 != memory_space.size() {
            return Err(LowFiveError::metadata(format!(
                "string count {} does not match memory_space size {}",
                values.len(),
                memory_space.size()
            )));
        }

        let mut indices = Vec::with_capacity(values.len());
        for v in values {
            self.strings.push(v.clone());
            indices.push(self.strings.len() - 1);
        }

        self.triples.push(Triple {
            element_type: self.element_type.clone(),
            memory_space,
            file_space,
            buffer: TripleBuffer::OwnedStrings(indices),
        });
        Ok(())
    }

    /// Replay writes in insertion order into `out`; later-arrived
    /// overlapping bytes win (spec §4.C, §8 property 1).
    pub fn read(
        &self,
        mem_type: Datatype,
        memspace: Option<Dataspace>,
        filespace: Option<Dataspace>,
        out: &mut [u8],
    ) -> Result<()> {
        self.check_type(&mem_type)?;
        let file_space = filespace.unwrap_or_else(|| self.space.clone());
        self.check_dim(&file_space)?;
        let memory_space = memspace.unwrap_or_else(|| Dataspace::simple(vec![file_space.size()]));
        let elem_size = mem_type.element_size();

        for triple in &self.triples {
            let dst = Dataspace::project_intersection(&file_space, &memory_space, &triple.file_space);
            if dst.size() == 0 {
                continue;
            }
            let src = Dataspace::project_intersection(&triple.file_space, &triple.memory_space, &file_space);

            let src_bytes = triple.bytes();

            for (dst_off, src_off, len) in dst.paired_ranges(elem_size, &src) {
                let end = src_off + len;
                if end > src_bytes.len() || dst_off + len > out.len() {
                    return Err(LowFiveError::metadata("read projected out of bounds"));
                }
                out[dst_off..dst_off + len].copy_from_slice(&src_bytes[src_off..end]);
            }
        }
        Ok(())
    }

    /// Replay writes for a variable-length string dataset, returning one
    /// string per selected element of `memspace`; unwritten elements come
    /// back as empty strings (no null state exists in this representation,
    /// matching spec §8 S5: "empty string reported as empty, not null").
    pub fn read_strings(&self, memspace: Option<Dataspace>, filespace: Option<Dataspace>) -> Result<Vec<String>> {
        if !self.element_type.is_var_length_string() {
            return Err(LowFiveError::metadata("read_strings() on a non-string dataset"));
        }
        let file_space = filespace.unwrap_or_else(|| self.space.clone());
        self.check_dim(&file_space)?;
        let memory_space = memspace.unwrap_or_else(|| Dataspace::simple(vec![file_space.size()]));

        let mut out = vec![String::new(); memory_space.size() as usize];
        let idx_size = std::mem::size_of::<usize>();

        for triple in &self.triples {
            let TripleBuffer::OwnedStrings(indices) = &triple.buffer else {
                continue;
            };
            let dst = Dataspace::project_intersection(&file_space, &memory_space, &triple.file_space);
            if dst.size() == 0 {
                continue;
            }
            let src = Dataspace::project_intersection(&triple.file_space, &triple.memory_space, &file_space);

            for (dst_off, src_off, len) in dst.paired_ranges(idx_size, &src) {
                for step in (0..len).step_by(idx_size) {
                    let dst_elem = (dst_off + step) / idx_size;
                    let src_elem = (src_off + step) / idx_size;
                    let table_idx = indices[src_elem];
                    out[dst_elem] = self.strings[table_idx].clone();
                }
            }
        }
        Ok(out)
    }

    /// This rank's local fragments intersecting `query`, for the
    /// index/query server's `data` reply (spec §4.F/§6): one
    /// `(sub_file_space, bytes)` entry per triple whose file-space
    /// intersects `query`, so a consumer can apply each fragment without
    /// one rank's write zero-stomping a region a different triple (or a
    /// different rank entirely) owns. Variable-length string triples
    /// carry string-table indices, not portable bytes, so they're never
    /// part of the distributed query path and are skipped here.
    pub fn matching_fragments(&self, query: &Dataspace) -> Vec<(Dataspace, Vec<u8>)> {
        let mut out = Vec::new();
        for triple in &self.triples {
            if triple.is_strings() || !triple.file_space.intersects(query) {
                continue;
            }
            let sub = Dataspace::project_intersection(query, query, &triple.file_space);
            if sub.size() == 0 {
                continue;
            }
            let src = Dataspace::project_intersection(&triple.file_space, &triple.memory_space, &sub);
            let elem_size = triple.element_type.element_size();
            let src_bytes = triple.bytes();
            let mut bytes = vec![0u8; sub.size() as usize * elem_size];
            let mut dst_off = 0usize;
            for (src_off, len) in src.iterate(elem_size) {
                bytes[dst_off..dst_off + len].copy_from_slice(&src_bytes[src_off..src_off + len]);
                dst_off += len;
            }
            out.push((sub, bytes));
        }
        out
    }

    /// Update the logical extent; rejects shrinking below any existing
    /// triple's file-space (spec §9 open question: undefined behavior
    /// otherwise, so the boundary rejects it rather than guessing).
    pub fn set_extent(&mut self, sizes: &[u64]) -> Result<()> {
        if sizes.len() != self.space.ndim() {
            return Err(LowFiveError::metadata("set_extent: dimensionality mismatch"));
        }
        for (i, &s) in sizes.iter().enumerate() {
            if let Some(max) = self.space.max_dims[i] {
                if s > max {
                    return Err(LowFiveError::metadata(format!(
                        "set_extent: dimension {i} size {s} exceeds maxdims {max}"
                    )));
                }
            }
        }
        for triple in &self.triples {
            for (i, &s) in sizes.iter().enumerate() {
                let block_end = match &triple.file_space.selection {
                    crate::dataspace::Selection::Hyperslab(blocks) => {
                        blocks.iter().map(|b| b.end[i]).max().unwrap_or(0)
                    }
                    crate::dataspace::Selection::All => triple.file_space.dims[i],
                    crate::dataspace::Selection::Points(pts) => {
                        pts.iter().map(|p| p[i] + 1).max().unwrap_or(0)
                    }
                };
                if block_end > s {
                    return Err(LowFiveError::metadata(
                        "set_extent: existing triple's file-space exceeds the requested extent (undefined by spec, rejected)",
                    ));
                }
            }
        }
        self.space.set_extent(sizes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::TypeClass;

    fn f32_dataset(dims: Vec<u64>) -> DatasetStore {
        DatasetStore::new(Datatype::f32(), Dataspace::simple(dims), Ownership::Owned)
    }

    #[test]
    fn self_read_after_write_s1() {
        let mut ds = f32_dataset(vec![10, 10, 10]);
        let filespace = Dataspace::hyperslab(vec![10, 10, 10], vec![0, 0, 0], vec![4, 4, 4]);
        let buf: Vec<f32> = vec![7.0; filespace.size() as usize];
        let bytes: &[u8] =
            unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, buf.len() * 4) };
        ds.write(Datatype::f32(), None, Some(filespace), bytes).unwrap();

        let read_space = Dataspace::hyperslab(vec![10, 10, 10], vec![2, 2, 2], vec![6, 6, 6]);
        let mut out = vec![0u8; read_space.size() as usize * 4];
        ds.read(Datatype::f32(), Some(Dataspace::simple(vec![read_space.size()])), Some(read_space), &mut out)
            .unwrap();
        let out_f32: &[f32] =
            unsafe { std::slice::from_raw_parts(out.as_ptr() as *const f32, out.len() / 4) };

        // element (2,2,2) in read space is flat index 0 -> corresponds to
        // dataset coord (2,2,2), which lies in [0,4) on every axis -> 7.0
        assert_eq!(out_f32[0], 7.0);
        // element (5,5,5) -> last element of the read box -> outside the
        // write region, untouched (0.0)
        assert_eq!(out_f32[out_f32.len() - 1], 0.0);
        assert_eq!(out_f32.iter().filter(|&&v| v == 7.0).count(), 2 * 2 * 2);
    }

    #[test]
    fn overlapping_writes_last_wins_s2() {
        let mut ds = f32_dataset(vec![10, 10]);
        let w1 = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![10, 10]);
        let buf1 = vec![1.0f32; w1.size() as usize];
        let bytes1: &[u8] =
            unsafe { std::slice::from_raw_parts(buf1.as_ptr() as *const u8, buf1.len() * 4) };
        ds.write(Datatype::f32(), None, Some(w1), bytes1).unwrap();

        let w2 = Dataspace::hyperslab(vec![10, 10], vec![3, 3], vec![7, 7]);
        let buf2 = vec![2.0f32; w2.size() as usize];
        let bytes2: &[u8] =
            unsafe { std::slice::from_raw_parts(buf2.as_ptr() as *const u8, buf2.len() * 4) };
        ds.write(Datatype::f32(), None, Some(w2), bytes2).unwrap();

        let read_space = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![10, 10]);
        let mut out = vec![0u8; 100 * 4];
        ds.read(Datatype::f32(), Some(Dataspace::simple(vec![100])), Some(read_space), &mut out)
            .unwrap();
        let out_f32: &[f32] =
            unsafe { std::slice::from_raw_parts(out.as_ptr() as *const f32, 100) };

        for r in 0..10u64 {
            for c in 0..10u64 {
                let v = out_f32[(r * 10 + c) as usize];
                if (3..7).contains(&r) && (3..7).contains(&c) {
                    assert_eq!(v, 2.0);
                } else {
                    assert_eq!(v, 1.0);
                }
                assert_ne!(v, 0.0);
            }
        }
    }

    #[test]
    fn type_mismatch_is_metadata_error() {
        let mut ds = f32_dataset(vec![4]);
        let err = ds.write(Datatype::i32(), None, None, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, LowFiveError::Metadata(_)));
        assert!(!matches!(Datatype::i32().class, TypeClass::Float));
    }

    #[test]
    fn variable_length_strings_s5() {
        let mut ds = DatasetStore::new(
            Datatype::var_len_string(),
            Dataspace::simple(vec![3]),
            Ownership::Owned,
        );
        let values = vec!["alpha".to_string(), "".to_string(), "gamma".to_string()];
        ds.write_strings(None, None, &values).unwrap();

        let out = ds.read_strings(None, None).unwrap();
        assert_eq!(out, values);
        assert_eq!(out[1], "");
    }

    #[test]
    fn matching_fragments_covers_each_triple_once() {
        let mut ds = f32_dataset(vec![10, 10]);
        let w1 = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![5, 10]);
        let buf1 = vec![1.0f32; w1.size() as usize];
        let bytes1: &[u8] =
            unsafe { std::slice::from_raw_parts(buf1.as_ptr() as *const u8, buf1.len() * 4) };
        ds.write(Datatype::f32(), None, Some(w1), bytes1).unwrap();

        let query = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![10, 10]);
        let fragments = ds.matching_fragments(&query);
        assert_eq!(fragments.len(), 1);
        let (sub, bytes) = &fragments[0];
        assert_eq!(sub.size(), 50);
        assert_eq!(bytes.len(), 50 * 4);
        let floats: &[f32] =
            unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, 50) };
        assert!(floats.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn set_extent_rejects_shrinking_below_existing_triple() {
        let mut ds = f32_dataset(vec![10]);
        let w = Dataspace::hyperslab(vec![10], vec![0], vec![8]);
        ds.write(Datatype::f32(), None, Some(w), &vec![0u8; 32]).unwrap();
        assert!(ds.set_extent(&[5]).is_err());
        assert!(ds.set_extent(&[10]).is_ok());
    }
}
