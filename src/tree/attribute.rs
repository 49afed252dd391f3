//! Attribute storage: a single-triple dataset-like object (spec §4.D,
//! supplemented from `examples/original_source/src/metadata/attr.cpp`).
//!
//! Attributes differ from datasets in that HDF5 attributes are written
//! and read as a whole (no hyperslab selection), so one write replaces
//! the attribute's single value rather than appending a triple to a
//! replay log.

use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::{LowFiveError, Result};

pub struct AttributeStore {
    pub element_type: Datatype,
    pub space: Dataspace,
    bytes: Option<Vec<u8>>,
    strings: Option<Vec<String>>,
}

impl AttributeStore {
    pub fn new(element_type: Datatype, space: Dataspace) -> Self {
        AttributeStore { element_type, space, bytes: None, strings: None }
    }

    pub fn write(&mut self, element_type: Datatype, buf: &[u8]) -> Result<()> {
        if !element_type.compatible(&self.element_type) {
            return Err(LowFiveError::metadata("attribute write: type mismatch"));
        }
        let nbytes = self.space.size() as usize * element_type.element_size();
        if buf.len() < nbytes {
            return Err(LowFiveError::metadata("attribute write: buffer too small"));
        }
        self.bytes = Some(buf[..nbytes].to_vec());
        Ok(())
    }

    pub fn write_strings(&mut self, values: &[String]) -> Result<()> {
        if !self.element_type.is_var_length_string() {
            return Err(LowFiveError::metadata("attribute write_strings() on a non-string attribute"));
        }
        if values.len() as u64 != self.space.size() {
            return Err(LowFiveError::metadata("attribute write_strings: count mismatch"));
        }
        self.strings = Some(values.to_vec());
        Ok(())
    }

    pub fn read(&self, mem_type: Datatype, out: &mut [u8]) -> Result<()> {
        if !mem_type.compatible(&self.element_type) {
            return Err(LowFiveError::metadata("attribute read: type mismatch"));
        }
        let Some(bytes) = &self.bytes else {
            return Err(LowFiveError::metadata("attribute read: never written"));
        };
        let n = bytes.len().min(out.len());
        out[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    pub fn read_strings(&self) -> Result<Vec<String>> {
        self.strings
            .clone()
            .ok_or_else(|| LowFiveError::metadata("attribute read_strings: never written"))
    }

    pub fn exists(&self) -> bool {
        self.bytes.is_some() || self.strings.is_some()
    }
}
