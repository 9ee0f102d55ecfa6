//! Self-contained MessagePack-subset wire format.
//!
//! Implements exactly the slice of MessagePack the value model needs:
//! integers, float64, str, bin, array and map families. Every payload this
//! encoder produces is readable by a standards-compliant MessagePack
//! consumer; the decoder additionally accepts float32 and any integer
//! family a foreign producer may have chosen.
//!
//! Encoding rules:
//! - integers use the smallest family that holds the value; a non-negative
//!   sint travels through the unsigned family, so signedness is not
//!   preserved across the wire (see `loadf`'s by-value integer matching)
//! - reals are always float64
//! - multi-byte fields are big-endian per the MessagePack spec, regardless
//!   of the container's configured endianness
//!
//! Markers with no counterpart in the value model (nil, bool, ext) fail
//! decode with `WireDecode`; claimed container lengths are never trusted
//! for preallocation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::MdError;
use crate::stack::Stack;
use crate::value::{Value, MAX_DEPTH};
use crate::wire::{BlockCodec, ByteReader, ByteWriter, Endianness, WireFormat};

// ── Frozen marker bytes (MessagePack spec) ───────────────────────────────────

const FIXMAP:   u8 = 0x80; // 0x80..=0x8f
const FIXARRAY: u8 = 0x90; // 0x90..=0x9f
const FIXSTR:   u8 = 0xa0; // 0xa0..=0xbf
const BIN8:     u8 = 0xc4;
const BIN16:    u8 = 0xc5;
const BIN32:    u8 = 0xc6;
const FLOAT32:  u8 = 0xca;
const FLOAT64:  u8 = 0xcb;
const UINT8:    u8 = 0xcc;
const UINT16:   u8 = 0xcd;
const UINT32:   u8 = 0xce;
const UINT64:   u8 = 0xcf;
const INT8:     u8 = 0xd0;
const INT16:    u8 = 0xd1;
const INT32:    u8 = 0xd2;
const INT64:    u8 = 0xd3;
const STR8:     u8 = 0xd9;
const STR16:    u8 = 0xda;
const STR32:    u8 = 0xdb;
const ARRAY16:  u8 = 0xdc;
const ARRAY32:  u8 = 0xdd;
const MAP16:    u8 = 0xde;
const MAP32:    u8 = 0xdf;

pub struct MsgPackCodec;

impl BlockCodec for MsgPackCodec {
    fn format(&self) -> WireFormat {
        WireFormat::MsgPack
    }

    fn encode(&self, stack: &Stack, _endian: Endianness) -> Result<Vec<u8>, MdError> {
        let mut w = ByteWriter::new(Endianness::Big);
        for &index in stack.live_indices() {
            write_value(stack, index, &mut w)?;
        }
        Ok(w.into_vec())
    }

    fn decode(&self, name: &str, _endian: Endianness, payload: &[u8]) -> Result<Stack, MdError> {
        let mut stack = Stack::new(name);
        let mut reader = ByteReader::new(payload, Endianness::Big);
        while reader.remaining() > 0 {
            decode_value(&mut reader, &mut stack, 0)?;
        }
        stack.mark_finalized();
        Ok(stack)
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

fn write_value(stack: &Stack, index: u32, w: &mut ByteWriter) -> Result<(), MdError> {
    match stack.at(index)? {
        Value::Uint(v) => {
            write_uint(*v, w);
            Ok(())
        }
        Value::Sint(v) => {
            write_sint(*v, w);
            Ok(())
        }
        Value::Real(v) => {
            w.u8(FLOAT64);
            w.f64(*v);
            Ok(())
        }
        Value::Zstr(s) => write_str(s, w),
        Value::Bytes(b) => write_bin(b, w),
        Value::Array(cells) => {
            let cells = cells.borrow();
            write_array_head(cells.len(), w)?;
            for &element in cells.iter() {
                write_value(stack, element, w)?;
            }
            Ok(())
        }
        Value::Hash(cells) => {
            let cells = cells.borrow();
            write_map_head(cells.len(), w)?;
            for &(key, value) in cells.iter() {
                write_value(stack, key, w)?;
                write_value(stack, value, w)?;
            }
            Ok(())
        }
    }
}

fn write_uint(v: u64, w: &mut ByteWriter) {
    if v <= 0x7f {
        w.u8(v as u8);
    } else if v <= u64::from(u8::MAX) {
        w.u8(UINT8);
        w.u8(v as u8);
    } else if v <= u64::from(u16::MAX) {
        w.u8(UINT16);
        w.u16(v as u16);
    } else if v <= u64::from(u32::MAX) {
        w.u8(UINT32);
        w.u32(v as u32);
    } else {
        w.u8(UINT64);
        w.u64(v);
    }
}

fn write_sint(v: i64, w: &mut ByteWriter) {
    if v >= 0 {
        return write_uint(v as u64, w);
    }
    if v >= -32 {
        // Negative fixint: the low byte already is 0xe0..=0xff.
        w.u8(v as u8);
    } else if v >= i64::from(i8::MIN) {
        w.u8(INT8);
        w.i8(v as i8);
    } else if v >= i64::from(i16::MIN) {
        w.u8(INT16);
        w.i16(v as i16);
    } else if v >= i64::from(i32::MIN) {
        w.u8(INT32);
        w.i32(v as i32);
    } else {
        w.u8(INT64);
        w.i64(v);
    }
}

fn write_str(s: &str, w: &mut ByteWriter) -> Result<(), MdError> {
    let n = s.len();
    if n <= 31 {
        w.u8(FIXSTR | n as u8);
    } else if n <= u8::MAX as usize {
        w.u8(STR8);
        w.u8(n as u8);
    } else if n <= u16::MAX as usize {
        w.u8(STR16);
        w.u16(n as u16);
    } else if n <= u32::MAX as usize {
        w.u8(STR32);
        w.u32(n as u32);
    } else {
        return Err(MdError::Oversize { kind: "string", len: n });
    }
    w.bytes(s.as_bytes());
    Ok(())
}

fn write_bin(b: &[u8], w: &mut ByteWriter) -> Result<(), MdError> {
    let n = b.len();
    if n <= u8::MAX as usize {
        w.u8(BIN8);
        w.u8(n as u8);
    } else if n <= u16::MAX as usize {
        w.u8(BIN16);
        w.u16(n as u16);
    } else if n <= u32::MAX as usize {
        w.u8(BIN32);
        w.u32(n as u32);
    } else {
        return Err(MdError::Oversize { kind: "byte string", len: n });
    }
    w.bytes(b);
    Ok(())
}

fn write_array_head(n: usize, w: &mut ByteWriter) -> Result<(), MdError> {
    if n <= 15 {
        w.u8(FIXARRAY | n as u8);
    } else if n <= u16::MAX as usize {
        w.u8(ARRAY16);
        w.u16(n as u16);
    } else if n <= u32::MAX as usize {
        w.u8(ARRAY32);
        w.u32(n as u32);
    } else {
        return Err(MdError::Oversize { kind: "array", len: n });
    }
    Ok(())
}

fn write_map_head(n: usize, w: &mut ByteWriter) -> Result<(), MdError> {
    if n <= 15 {
        w.u8(FIXMAP | n as u8);
    } else if n <= u16::MAX as usize {
        w.u8(MAP16);
        w.u16(n as u16);
    } else if n <= u32::MAX as usize {
        w.u8(MAP32);
        w.u32(n as u32);
    } else {
        return Err(MdError::Oversize { kind: "hash", len: n });
    }
    Ok(())
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Decode one value, leaving it live on top of `stack`. Returns its slot
/// index.
fn decode_value(reader: &mut ByteReader<'_>, stack: &mut Stack, depth: usize) -> Result<u32, MdError> {
    let marker = reader.u8()?;
    match marker {
        0x00..=0x7f => Ok(stack.commit_value(Value::Uint(u64::from(marker)))),
        0x80..=0x8f => decode_map(reader, stack, depth, usize::from(marker & 0x0f)),
        0x90..=0x9f => decode_array(reader, stack, depth, usize::from(marker & 0x0f)),
        0xa0..=0xbf => decode_str(reader, stack, usize::from(marker & 0x1f)),
        BIN8 => {
            let n = usize::from(reader.u8()?);
            decode_bin(reader, stack, n)
        }
        BIN16 => {
            let n = usize::from(reader.u16()?);
            decode_bin(reader, stack, n)
        }
        BIN32 => {
            let n = reader.u32()? as usize;
            decode_bin(reader, stack, n)
        }
        FLOAT32 => {
            let v = reader.f32()?;
            Ok(stack.commit_value(Value::Real(f64::from(v))))
        }
        FLOAT64 => {
            let v = reader.f64()?;
            Ok(stack.commit_value(Value::Real(v)))
        }
        UINT8 => {
            let v = reader.u8()?;
            Ok(stack.commit_value(Value::Uint(u64::from(v))))
        }
        UINT16 => {
            let v = reader.u16()?;
            Ok(stack.commit_value(Value::Uint(u64::from(v))))
        }
        UINT32 => {
            let v = reader.u32()?;
            Ok(stack.commit_value(Value::Uint(u64::from(v))))
        }
        UINT64 => {
            let v = reader.u64()?;
            Ok(stack.commit_value(Value::Uint(v)))
        }
        INT8 => {
            let v = reader.i8()?;
            Ok(stack.commit_value(Value::Sint(i64::from(v))))
        }
        INT16 => {
            let v = reader.i16()?;
            Ok(stack.commit_value(Value::Sint(i64::from(v))))
        }
        INT32 => {
            let v = reader.i32()?;
            Ok(stack.commit_value(Value::Sint(i64::from(v))))
        }
        INT64 => {
            let v = reader.i64()?;
            Ok(stack.commit_value(Value::Sint(v)))
        }
        STR8 => {
            let n = usize::from(reader.u8()?);
            decode_str(reader, stack, n)
        }
        STR16 => {
            let n = usize::from(reader.u16()?);
            decode_str(reader, stack, n)
        }
        STR32 => {
            let n = reader.u32()? as usize;
            decode_str(reader, stack, n)
        }
        ARRAY16 => {
            let n = usize::from(reader.u16()?);
            decode_array(reader, stack, depth, n)
        }
        ARRAY32 => {
            let n = reader.u32()? as usize;
            decode_array(reader, stack, depth, n)
        }
        MAP16 => {
            let n = usize::from(reader.u16()?);
            decode_map(reader, stack, depth, n)
        }
        MAP32 => {
            let n = reader.u32()? as usize;
            decode_map(reader, stack, depth, n)
        }
        0xe0..=0xff => Ok(stack.commit_value(Value::Sint(i64::from(marker as i8)))),
        other => Err(MdError::WireDecode(format!(
            "unsupported msgpack marker 0x{other:02x}"
        ))),
    }
}

fn decode_str(reader: &mut ByteReader<'_>, stack: &mut Stack, n: usize) -> Result<u32, MdError> {
    let bytes = reader.take(n)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| MdError::WireDecode("string payload is not valid UTF-8".to_string()))?;
    if s.bytes().any(|b| b == 0) {
        return Err(MdError::WireDecode("string payload contains NUL".to_string()));
    }
    Ok(stack.commit_value(Value::Zstr(Rc::from(s))))
}

fn decode_bin(reader: &mut ByteReader<'_>, stack: &mut Stack, n: usize) -> Result<u32, MdError> {
    let bytes = reader.take(n)?;
    Ok(stack.commit_value(Value::Bytes(Rc::from(bytes))))
}

fn decode_array(
    reader: &mut ByteReader<'_>,
    stack: &mut Stack,
    depth: usize,
    n: usize,
) -> Result<u32, MdError> {
    if depth >= MAX_DEPTH {
        return Err(MdError::WireDecode(
            "containers nest deeper than the 32-level limit".to_string(),
        ));
    }
    let cells = Rc::new(RefCell::new(Vec::new()));
    let index = stack.commit_value(Value::Array(Rc::clone(&cells)));
    for _ in 0..n {
        let element = decode_value(reader, stack, depth + 1)?;
        cells.borrow_mut().push(element);
        stack.discard_top();
    }
    Ok(index)
}

fn decode_map(
    reader: &mut ByteReader<'_>,
    stack: &mut Stack,
    depth: usize,
    n: usize,
) -> Result<u32, MdError> {
    if depth >= MAX_DEPTH {
        return Err(MdError::WireDecode(
            "containers nest deeper than the 32-level limit".to_string(),
        ));
    }
    let cells = Rc::new(RefCell::new(Vec::new()));
    let index = stack.commit_value(Value::Hash(Rc::clone(&cells)));
    for _ in 0..n {
        let key = decode_value(reader, stack, depth + 1)?;
        if !stack.at(key)?.is_scalar() {
            return Err(MdError::WireDecode("map key is a container".to_string()));
        }
        let value = decode_value(reader, stack, depth + 1)?;
        cells.borrow_mut().push((key, value));
        stack.discard_top();
        stack.discard_top();
    }
    Ok(index)
}
