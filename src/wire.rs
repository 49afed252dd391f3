//! Wire protocol: message-kind discriminator + payload codec (spec §6).
//!
//! Grounded on the teacher's `ws/terminal.rs` binary framing (a leading
//! discriminator byte followed by a raw payload); generalized here to a
//! 32-bit kind tag plus length-prefixed fields, per spec §6's grammar
//! table. Integers are little-endian fixed-width; strings and raw byte
//! payloads are `uint64` length + bytes.

use byteorder::{ByteOrder, LittleEndian};

use crate::dataspace::Dataspace;
use crate::datatype::{Datatype, TypeClass};
use crate::error::{LowFiveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ready,
    Id,
    Dimension,
    Domain,
    Redirect,
    Data,
    Done,
}

impl MessageKind {
    fn discriminator(self) -> u32 {
        match self {
            MessageKind::Ready => 0,
            MessageKind::Id => 1,
            MessageKind::Dimension => 2,
            MessageKind::Domain => 3,
            MessageKind::Redirect => 4,
            MessageKind::Data => 5,
            MessageKind::Done => 6,
        }
    }

    fn from_discriminator(d: u32) -> Result<Self> {
        Ok(match d {
            0 => MessageKind::Ready,
            1 => MessageKind::Id,
            2 => MessageKind::Dimension,
            3 => MessageKind::Domain,
            4 => MessageKind::Redirect,
            5 => MessageKind::Data,
            6 => MessageKind::Done,
            other => return Err(LowFiveError::protocol(format!("unknown message kind {other}"))),
        })
    }
}

/// Growable little-endian writer matching the grammar of spec §6.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(kind: MessageKind) -> Self {
        let mut buf = Vec::new();
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, kind.discriminator());
        buf.extend_from_slice(&b);
        Writer { buf }
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        let mut b = [0u8; 8];
        LittleEndian::write_u64(&mut b, v);
        self.buf.extend_from_slice(&b);
        self
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        self.put_u64(s.len() as u64);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_dataspace(&mut self, space: &Dataspace) -> &mut Self {
        self.put_bytes(&space.encode())
    }

    pub fn put_datatype(&mut self, ty: &Datatype) -> &mut Self {
        self.put_u32(type_class_tag(ty.class));
        self.put_u64(ty.size as u64)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-based reader for a single message buffer.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Parse the 32-bit kind discriminator and return a reader positioned
    /// just past it, ready to read the payload.
    pub fn new(buf: &'a [u8]) -> Result<(MessageKind, Self)> {
        if buf.len() < 4 {
            return Err(LowFiveError::protocol("message shorter than the kind discriminator"));
        }
        let kind = MessageKind::from_discriminator(LittleEndian::read_u32(&buf[..4]))?;
        Ok((kind, Reader { buf, pos: 4 }))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| LowFiveError::protocol("message truncated"))?;
        self.pos = end;
        Ok(slice)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = self.get_u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| LowFiveError::protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_dataspace(&mut self) -> Result<Dataspace> {
        let bytes = self.get_bytes()?;
        Dataspace::decode(&bytes)
            .map(|(space, _)| space)
            .ok_or_else(|| LowFiveError::protocol("malformed dataspace payload"))
    }

    pub fn get_datatype(&mut self) -> Result<Datatype> {
        let class = type_class_from_tag(self.get_u32()?)?;
        let size = self.get_u64()? as usize;
        Ok(Datatype { class, size })
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

fn type_class_tag(class: TypeClass) -> u32 {
    match class {
        TypeClass::Integer => 0,
        TypeClass::Unsigned => 1,
        TypeClass::Float => 2,
        TypeClass::String => 3,
        TypeClass::VarLenString => 4,
        TypeClass::Compound => 5,
        TypeClass::Opaque => 6,
    }
}

fn type_class_from_tag(tag: u32) -> Result<TypeClass> {
    Ok(match tag {
        0 => TypeClass::Integer,
        1 => TypeClass::Unsigned,
        2 => TypeClass::Float,
        3 => TypeClass::String,
        4 => TypeClass::VarLenString,
        5 => TypeClass::Compound,
        6 => TypeClass::Opaque,
        other => return Err(LowFiveError::protocol(format!("unknown type class tag {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_id_message() {
        let mut w = Writer::new(MessageKind::Id);
        w.put_string("/g/d");
        let bytes = w.into_bytes();

        let (kind, mut r) = Reader::new(&bytes).unwrap();
        assert_eq!(kind, MessageKind::Id);
        assert_eq!(r.get_string().unwrap(), "/g/d");
        assert!(r.at_end());
    }

    #[test]
    fn round_trips_redirect_message_with_dataspace_and_rank_list() {
        let space = Dataspace::hyperslab(vec![10, 10], vec![0, 0], vec![5, 5]);
        let mut w = Writer::new(MessageKind::Redirect);
        w.put_dataspace(&space);
        w.put_u32(2);
        w.put_dataspace(&space);
        w.put_u32(3);
        w.put_dataspace(&space);
        w.put_u32(7);
        let bytes = w.into_bytes();

        let (kind, mut r) = Reader::new(&bytes).unwrap();
        assert_eq!(kind, MessageKind::Redirect);
        let query = r.get_dataspace().unwrap();
        assert_eq!(query, space);
        let count = r.get_u32().unwrap();
        assert_eq!(count, 2);
        let (first_space, first_rank) = (r.get_dataspace().unwrap(), r.get_u32().unwrap());
        assert_eq!(first_space, space);
        assert_eq!(first_rank, 3);
        let (_second_space, second_rank) = (r.get_dataspace().unwrap(), r.get_u32().unwrap());
        assert_eq!(second_rank, 7);
        assert!(r.at_end());
    }

    #[test]
    fn truncated_message_is_protocol_error() {
        let err = Reader::new(&[0, 0]).unwrap_err();
        assert!(matches!(err, LowFiveError::Protocol(_)));
    }
}
