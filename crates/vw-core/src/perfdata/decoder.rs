//! Decoder for version 2 hsperfdata regions.
//!
//! Layout (offsets in bytes):
//!
//! ```text
//! prologue (32)
//!   0  magic          u32, always big-endian (0xcafec0c0)
//!   4  byte_order     u8   0 = big, 1 = little
//!   5  major          u8
//!   6  minor          u8
//!   7  accessible     u8
//!   8  used           i32
//!  12  overflow       i32
//!  16  mod_timestamp  i64
//!  24  entry_offset   i32
//!  28  num_entries    i32
//!
//! entry header (20)
//!   0  entry_length   i32
//!   4  name_offset    i32
//!   8  vector_length  i32  0 for scalars
//!  12  data_type      u8   'J' long, 'B' byte vector
//!  13  flags          u8
//!  14  units          u8
//!  15  variability    u8
//!  16  data_offset    i32
//! ```
//!
//! Entries are re-read on every sample so variables published after attach
//! show up on later ticks.

use std::sync::Arc;

use vw_common::{Error, InstanceId, Result};

use super::{
    Decoder, InstrumentationView, Units, Variability, VariableHandle, VariableKind,
    VariableSnapshot, VariableValue,
};
use crate::attach::AttachedBuffer;

pub const MAGIC: u32 = 0xcafe_c0c0;
pub const SUPPORTED_MAJOR: u8 = 2;
pub const PROLOGUE_LEN: usize = 32;
pub const ENTRY_HEADER_LEN: usize = 20;

pub const TYPE_LONG: u8 = b'J';
pub const TYPE_BYTE: u8 = b'B';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn i32_at(self, bytes: &[u8], at: usize) -> Option<i32> {
        let raw: [u8; 4] = bytes.get(at..at.checked_add(4)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Big => i32::from_be_bytes(raw),
            ByteOrder::Little => i32::from_le_bytes(raw),
        })
    }

    fn i64_at(self, bytes: &[u8], at: usize) -> Option<i64> {
        let raw: [u8; 8] = bytes.get(at..at.checked_add(8)?)?.try_into().ok()?;
        Some(match self {
            ByteOrder::Big => i64::from_be_bytes(raw),
            ByteOrder::Little => i64::from_le_bytes(raw),
        })
    }
}

/// Parsed region header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prologue {
    pub major: u8,
    pub minor: u8,
    pub accessible: bool,
    pub used: i32,
    pub overflow: i32,
    pub mod_timestamp: i64,
    pub entry_offset: i32,
    pub num_entries: i32,
    little_endian: bool,
}

impl Prologue {
    pub fn parse(bytes: &[u8], id: InstanceId) -> Result<Self> {
        let head = bytes
            .get(..PROLOGUE_LEN)
            .ok_or_else(|| Error::decode(id, "region shorter than prologue"))?;

        let magic = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
        if magic != MAGIC {
            return Err(Error::decode(id, format!("bad magic {:#010x}", magic)));
        }
        let order = match head[4] {
            0 => ByteOrder::Big,
            1 => ByteOrder::Little,
            other => return Err(Error::decode(id, format!("unknown byte order {}", other))),
        };
        let major = head[5];
        if major != SUPPORTED_MAJOR {
            return Err(Error::decode(
                id,
                format!("unsupported version {}.{}", major, head[6]),
            ));
        }

        let field = |at: usize| {
            order
                .i32_at(head, at)
                .ok_or_else(|| Error::decode(id, "truncated prologue"))
        };
        Ok(Prologue {
            major,
            minor: head[6],
            accessible: head[7] != 0,
            used: field(8)?,
            overflow: field(12)?,
            mod_timestamp: order
                .i64_at(head, 16)
                .ok_or_else(|| Error::decode(id, "truncated prologue"))?,
            entry_offset: field(24)?,
            num_entries: field(28)?,
            little_endian: order == ByteOrder::Little,
        })
    }

    fn order(&self) -> ByteOrder {
        if self.little_endian {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }
}

/// Default decoder for local instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfDataDecoder;

impl PerfDataDecoder {
    pub fn new() -> Self {
        PerfDataDecoder
    }
}

impl Decoder for PerfDataDecoder {
    fn decode(
        &self,
        buffer: Arc<AttachedBuffer>,
        id: InstanceId,
    ) -> Result<Box<dyn InstrumentationView>> {
        Prologue::parse(buffer.as_bytes(), id)?;
        Ok(Box::new(PerfDataView { buffer, id }))
    }
}

/// Live view over a v2 region.
pub struct PerfDataView {
    buffer: Arc<AttachedBuffer>,
    id: InstanceId,
}

impl PerfDataView {
    pub fn prologue(&self) -> Result<Prologue> {
        Prologue::parse(self.buffer.as_bytes(), self.id)
    }
}

impl InstrumentationView for PerfDataView {
    fn snapshot(&self) -> Result<VariableSnapshot> {
        decode_entries(self.buffer.as_bytes(), self.id)
    }
}

/// Decode every entry of a region.
pub fn decode_entries(bytes: &[u8], id: InstanceId) -> Result<VariableSnapshot> {
    let prologue = Prologue::parse(bytes, id)?;
    if !prologue.accessible {
        return Err(Error::decode(id, "region not yet accessible"));
    }
    let order = prologue.order();

    let limit = match usize::try_from(prologue.used) {
        Ok(used) if used >= PROLOGUE_LEN => used.min(bytes.len()),
        _ => bytes.len(),
    };
    let mut offset = usize::try_from(prologue.entry_offset)
        .map_err(|_| Error::decode(id, "negative entry offset"))?;
    let count = usize::try_from(prologue.num_entries)
        .map_err(|_| Error::decode(id, "negative entry count"))?;

    let mut variables = VariableSnapshot::new();
    for index in 0..count {
        let (handle, length) = decode_entry(&bytes[..limit], offset, order)
            .map_err(|reason| Error::decode(id, format!("entry {}: {}", index, reason)))?;
        variables.insert(handle.name.clone(), handle);
        offset += length;
    }
    Ok(variables)
}

fn decode_entry(
    bytes: &[u8],
    start: usize,
    order: ByteOrder,
) -> std::result::Result<(VariableHandle, usize), String> {
    let header = start
        .checked_add(ENTRY_HEADER_LEN)
        .and_then(|end| bytes.get(start..end))
        .ok_or("header out of bounds")?;

    let read = |at| order.i32_at(header, at).ok_or("truncated header");
    let entry_length = to_len(read(0)?, "entry length")?;
    let name_offset = to_len(read(4)?, "name offset")?;
    let vector_length = to_len(read(8)?, "vector length")?;
    let data_type = header[12];
    let units = Units::from_code(header[14]).ok_or_else(|| format!("unknown units {}", header[14]))?;
    let variability = Variability::from_code(header[15])
        .ok_or_else(|| format!("unknown variability {}", header[15]))?;
    let data_offset = to_len(read(16)?, "data offset")?;

    if entry_length < ENTRY_HEADER_LEN {
        return Err(format!("entry length {} too small", entry_length));
    }
    let entry = start
        .checked_add(entry_length)
        .and_then(|end| bytes.get(start..end))
        .ok_or("entry extends past region")?;

    let name_bytes = entry.get(name_offset..).ok_or("name out of bounds")?;
    let name_end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or("unterminated name")?;
    let name = std::str::from_utf8(&name_bytes[..name_end])
        .map_err(|_| "name is not utf-8")?
        .to_string();
    if name.is_empty() {
        return Err("empty name".to_string());
    }

    let (kind, value) = match data_type {
        TYPE_LONG if vector_length == 0 => {
            let value = order
                .i64_at(entry, data_offset)
                .ok_or("long value out of bounds")?;
            (VariableKind::Long, VariableValue::Long(value))
        }
        TYPE_BYTE if vector_length > 0 => {
            let data = data_offset
                .checked_add(vector_length)
                .and_then(|end| entry.get(data_offset..end))
                .ok_or("vector out of bounds")?;
            let value = if units == Units::String {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                VariableValue::Text(String::from_utf8_lossy(&data[..end]).into_owned())
            } else {
                VariableValue::Bytes(data.to_vec())
            };
            (VariableKind::ByteArray, value)
        }
        other => {
            return Err(format!(
                "unsupported type {:?} with vector length {}",
                other as char, vector_length
            ))
        }
    };

    Ok((
        VariableHandle {
            name,
            kind,
            units,
            variability,
            value,
        },
        entry_length,
    ))
}

fn to_len(value: i32, what: &str) -> std::result::Result<usize, String> {
    usize::try_from(value).map_err(|_| format!("negative {}", what))
}
