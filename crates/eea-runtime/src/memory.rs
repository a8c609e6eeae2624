//! Encoding of primitive values in guest linear memory.
//!
//! Every offset and length here comes from the guest and is checked against
//! the current memory size before anything is read or written. A failed
//! encode leaves memory untouched.

use eea_core::{Error, Result};
use std::ops::Range;

/// Width of a little-endian integer in guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    U8,
    U32,
    U64,
}

impl IntWidth {
    pub fn bytes(self) -> usize {
        match self {
            IntWidth::U8 => 1,
            IntWidth::U32 => 4,
            IntWidth::U64 => 8,
        }
    }

    fn max_value(self) -> u64 {
        match self {
            IntWidth::U8 => u8::MAX as u64,
            IntWidth::U32 => u32::MAX as u64,
            IntWidth::U64 => u64::MAX,
        }
    }
}

/// Where to write the byte length of an encoded string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthSlot {
    pub offset: u32,
    pub width: IntWidth,
}

impl LengthSlot {
    pub fn new(offset: u32, width: IntWidth) -> Self {
        Self { offset, width }
    }
}

fn checked_range(memory: &[u8], offset: u32, len: usize) -> Result<Range<usize>> {
    let start = offset as usize;
    match start.checked_add(len) {
        Some(end) if end <= memory.len() => Ok(start..end),
        _ => Err(Error::OutOfBounds {
            offset: offset as u64,
            len: len as u64,
            memory_size: memory.len(),
        }),
    }
}

fn check_fits(value: u64, width: IntWidth) -> Result<()> {
    if value > width.max_value() {
        return Err(Error::IntegerOverflow {
            value,
            width: width.bytes(),
        });
    }
    Ok(())
}

/// Write `text` as UTF-8 at `dest_offset`, optionally followed by its length.
///
/// Returns the number of bytes written. Fails without writing anything when
/// the text does not fit in `dest_capacity`, when either destination lies
/// outside memory, or when the length does not fit the slot's width.
pub fn encode_string(
    memory: &mut [u8],
    text: &str,
    dest_offset: u32,
    dest_capacity: u32,
    length_out: Option<LengthSlot>,
) -> Result<usize> {
    let bytes = text.as_bytes();
    if bytes.len() > dest_capacity as usize {
        return Err(Error::BufferOverflow {
            needed: bytes.len(),
            capacity: dest_capacity as usize,
        });
    }

    let dest = checked_range(memory, dest_offset, bytes.len())?;
    let length_dest = match length_out {
        Some(slot) => {
            check_fits(bytes.len() as u64, slot.width)?;
            Some((checked_range(memory, slot.offset, slot.width.bytes())?, slot.width))
        }
        None => None,
    };

    memory[dest].copy_from_slice(bytes);
    if let Some((range, width)) = length_dest {
        let le = (bytes.len() as u64).to_le_bytes();
        memory[range].copy_from_slice(&le[..width.bytes()]);
    }

    Ok(bytes.len())
}

/// Read `length` bytes at `offset` as UTF-8. Invalid UTF-8 is an error.
pub fn decode_string(memory: &[u8], offset: u32, length: u32) -> Result<String> {
    let range = checked_range(memory, offset, length as usize)?;
    let text = std::str::from_utf8(&memory[range])?;
    Ok(text.to_owned())
}

pub fn encode_int(memory: &mut [u8], offset: u32, width: IntWidth, value: u64) -> Result<()> {
    check_fits(value, width)?;
    let range = checked_range(memory, offset, width.bytes())?;
    memory[range].copy_from_slice(&value.to_le_bytes()[..width.bytes()]);
    Ok(())
}

pub fn decode_int(memory: &[u8], offset: u32, width: IntWidth) -> Result<u64> {
    let range = checked_range(memory, offset, width.bytes())?;
    let mut le = [0u8; 8];
    le[..width.bytes()].copy_from_slice(&memory[range]);
    Ok(u64::from_le_bytes(le))
}

pub fn encode_float32(memory: &mut [u8], offset: u32, value: f32) -> Result<()> {
    let range = checked_range(memory, offset, 4)?;
    memory[range].copy_from_slice(&value.to_le_bytes());
    Ok(())
}
