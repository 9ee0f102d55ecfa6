//! Wire format registry: the frozen per-block payload codecs and the packed
//! `flags` word that records them in the block table.
//!
//! # Identity rules
//! Every block payload is written by exactly one wire format, named by a
//! one-byte code in the low byte of its BlockInfo `flags` word:
//!
//! | code   | format  |
//! |--------|---------|
//! | `0x01` | raw     |
//! | `0x04` | msgpack |
//!
//! Codes are frozen. `0x02` and `0x03` are burned and never reassigned; a
//! reader that meets them MUST fail with `InvalidFlags` rather than guess.
//!
//! The second byte of `flags` repeats the container's endianness byte
//! (LITTLE=1, BIG=2), so a block record remains self-describing even when
//! carved out of a damaged container. The upper sixteen bits are zero.
//!
//! # Endianness
//! The raw format honors the configured endianness for every multi-byte
//! field. The msgpack format is big-endian by definition, regardless of the
//! configured endianness; the `flags` encoding byte still records the
//! container setting.

pub(crate) mod msgpack;
pub(crate) mod raw;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::MdError;
use crate::stack::Stack;

pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;

// ── Frozen wire format codes ────────────────────────────────────────────────
//
// These values are permanent. A code is NEVER reused, even if a format is
// retired.

/// Fixed-layout raw format: native-width fields, no self-description.
pub const FMT_RAW:     u8 = 0x01;
/// MessagePack-subset format: self-describing, standard big-endian.
pub const FMT_MSGPACK: u8 = 0x04;

// ── Endianness ──────────────────────────────────────────────────────────────

/// Byte order of the container tables and raw-format payloads.
///
/// The discriminants are the on-disk values of the header endianness byte
/// and of the `flags` encoding byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little = 1,
    Big    = 2,
}

impl Endianness {
    /// On-disk byte value.
    #[inline]
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Decode a header endianness byte.
    pub fn from_byte(b: u8) -> Result<Self, MdError> {
        match b {
            1 => Ok(Endianness::Little),
            2 => Ok(Endianness::Big),
            other => Err(MdError::BadEndianByte(other)),
        }
    }

    /// Human-readable name (for diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            Endianness::Little => "little",
            Endianness::Big    => "big",
        }
    }

    #[inline]
    pub(crate) fn write_u32(self, buf: &mut [u8], v: u32) {
        match self {
            Endianness::Little => LittleEndian::write_u32(buf, v),
            Endianness::Big    => BigEndian::write_u32(buf, v),
        }
    }

    #[inline]
    pub(crate) fn write_u64(self, buf: &mut [u8], v: u64) {
        match self {
            Endianness::Little => LittleEndian::write_u64(buf, v),
            Endianness::Big    => BigEndian::write_u64(buf, v),
        }
    }
}

// ── Wire formats ─────────────────────────────────────────────────────────────

/// Runtime wire format discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Raw,
    MsgPack,
}

impl WireFormat {
    /// Frozen on-disk code (low byte of `flags`).
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            WireFormat::Raw     => FMT_RAW,
            WireFormat::MsgPack => FMT_MSGPACK,
        }
    }

    /// Resolve an on-disk code. Returns `None` for burned or unknown codes.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            FMT_RAW     => Some(WireFormat::Raw),
            FMT_MSGPACK => Some(WireFormat::MsgPack),
            _           => None,
        }
    }

    /// Human-readable name (for diagnostics only — never parsed).
    pub fn name(self) -> &'static str {
        match self {
            WireFormat::Raw     => "raw",
            WireFormat::MsgPack => "msgpack",
        }
    }
}

/// Pack a wire format and an encoding into a BlockInfo `flags` word.
///
/// Layout: bits 0..8 carry the format code, bits 8..16 the endianness byte,
/// bits 16..32 are zero. A msgpack block written little-endian therefore
/// packs to `0x0000_0104`.
#[inline]
pub fn pack_flags(format: WireFormat, encoding: Endianness) -> u32 {
    (u32::from(encoding.byte()) << 8) | u32::from(format.code())
}

/// Unpack a BlockInfo `flags` word.
///
/// Any unrecognized combination (unknown format code, unknown encoding
/// byte, nonzero upper bits) fails with [`MdError::InvalidFlags`].
pub fn unpack_flags(flags: u32) -> Result<(WireFormat, Endianness), MdError> {
    if flags >> 16 != 0 {
        return Err(MdError::InvalidFlags { flags });
    }
    let format = WireFormat::from_code((flags & 0xFF) as u8)
        .ok_or(MdError::InvalidFlags { flags })?;
    let encoding = Endianness::from_byte(((flags >> 8) & 0xFF) as u8)
        .map_err(|_| MdError::InvalidFlags { flags })?;
    Ok((format, encoding))
}

// ── Codec trait ──────────────────────────────────────────────────────────────

/// One per-block payload format.
pub trait BlockCodec: Send + Sync {
    fn format(&self) -> WireFormat;

    /// Serialize the live entries of `stack`, bottom of stack first.
    fn encode(&self, stack: &Stack, endian: Endianness) -> Result<Vec<u8>, MdError>;

    /// Parse one block payload into a finalized stack named `name`.
    fn decode(&self, name: &str, endian: Endianness, payload: &[u8]) -> Result<Stack, MdError>;
}

/// Resolve a wire format to its built-in codec.
pub fn get_codec(format: WireFormat) -> &'static dyn BlockCodec {
    match format {
        WireFormat::Raw     => &RawCodec,
        WireFormat::MsgPack => &MsgPackCodec,
    }
}

// ── Endian-aware cursors ─────────────────────────────────────────────────────

/// Bounds-checked reading cursor over a byte slice.
///
/// Every read that would pass the end of the slice fails with
/// [`MdError::Truncated`]; nothing in the decode path indexes blindly.
pub(crate) struct ByteReader<'a> {
    buf:    &'a [u8],
    pos:    usize,
    endian: Endianness,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], endian: Endianness) -> Self {
        ByteReader { buf, pos: 0, endian }
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume exactly `n` bytes.
    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8], MdError> {
        if n > self.remaining() {
            return Err(MdError::Truncated { needed: n, available: self.remaining() });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Consume bytes up to and including the next NUL; returns the bytes
    /// before it.
    pub(crate) fn take_until_nul(&mut self) -> Result<&'a [u8], MdError> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(n) => {
                let out = &rest[..n];
                self.pos += n + 1;
                Ok(out)
            }
            None => Err(MdError::WireDecode(
                "unterminated string: no NUL before end of payload".to_string(),
            )),
        }
    }

    /// Jump to an absolute offset.
    pub(crate) fn seek(&mut self, pos: usize) -> Result<(), MdError> {
        if pos > self.buf.len() {
            return Err(MdError::Truncated { needed: pos, available: self.buf.len() });
        }
        self.pos = pos;
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, MdError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn i8(&mut self) -> Result<i8, MdError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, MdError> {
        let b = self.take(2)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u16(b),
            Endianness::Big    => BigEndian::read_u16(b),
        })
    }

    pub(crate) fn u32(&mut self) -> Result<u32, MdError> {
        let b = self.take(4)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u32(b),
            Endianness::Big    => BigEndian::read_u32(b),
        })
    }

    pub(crate) fn u64(&mut self) -> Result<u64, MdError> {
        let b = self.take(8)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u64(b),
            Endianness::Big    => BigEndian::read_u64(b),
        })
    }

    pub(crate) fn i16(&mut self) -> Result<i16, MdError> {
        Ok(self.u16()? as i16)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, MdError> {
        Ok(self.u32()? as i32)
    }

    pub(crate) fn i64(&mut self) -> Result<i64, MdError> {
        Ok(self.u64()? as i64)
    }

    pub(crate) fn f32(&mut self) -> Result<f32, MdError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub(crate) fn f64(&mut self) -> Result<f64, MdError> {
        Ok(f64::from_bits(self.u64()?))
    }
}

/// Appending write cursor producing a `Vec<u8>` in the configured byte
/// order. Infallible; sizing errors cannot exist on the encode side.
pub(crate) struct ByteWriter {
    out:    Vec<u8>,
    endian: Endianness,
}

impl ByteWriter {
    pub(crate) fn new(endian: Endianness) -> Self {
        ByteWriter { out: Vec::new(), endian }
    }

    #[inline]
    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.out
    }

    #[inline]
    pub(crate) fn bytes(&mut self, b: &[u8]) {
        self.out.extend_from_slice(b);
    }

    #[inline]
    pub(crate) fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    #[inline]
    pub(crate) fn i8(&mut self, v: i8) {
        self.out.push(v as u8);
    }

    pub(crate) fn u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        match self.endian {
            Endianness::Little => LittleEndian::write_u16(&mut b, v),
            Endianness::Big    => BigEndian::write_u16(&mut b, v),
        }
        self.out.extend_from_slice(&b);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        match self.endian {
            Endianness::Little => LittleEndian::write_u32(&mut b, v),
            Endianness::Big    => BigEndian::write_u32(&mut b, v),
        }
        self.out.extend_from_slice(&b);
    }

    pub(crate) fn u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        match self.endian {
            Endianness::Little => LittleEndian::write_u64(&mut b, v),
            Endianness::Big    => BigEndian::write_u64(&mut b, v),
        }
        self.out.extend_from_slice(&b);
    }

    #[inline]
    pub(crate) fn i16(&mut self, v: i16) {
        self.u16(v as u16);
    }

    #[inline]
    pub(crate) fn i32(&mut self, v: i32) {
        self.u32(v as u32);
    }

    #[inline]
    pub(crate) fn i64(&mut self, v: i64) {
        self.u64(v as u64);
    }

    #[inline]
    pub(crate) fn f64(&mut self, v: f64) {
        self.u64(v.to_bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pack_to_the_reference_value() {
        assert_eq!(pack_flags(WireFormat::MsgPack, Endianness::Little), 0x0000_0104);
        assert_eq!(pack_flags(WireFormat::Raw, Endianness::Big), 0x0000_0201);
    }

    #[test]
    fn flags_round_trip_every_valid_pair() {
        for format in [WireFormat::Raw, WireFormat::MsgPack] {
            for encoding in [Endianness::Little, Endianness::Big] {
                let flags = pack_flags(format, encoding);
                assert_eq!(unpack_flags(flags).unwrap(), (format, encoding));
            }
        }
    }

    #[test]
    fn unrecognized_flags_are_rejected() {
        // Burned format codes.
        assert_eq!(unpack_flags(0x0102), Err(MdError::InvalidFlags { flags: 0x0102 }));
        assert_eq!(unpack_flags(0x0103), Err(MdError::InvalidFlags { flags: 0x0103 }));
        // Zero format, zero encoding.
        assert!(unpack_flags(0x0000).is_err());
        assert!(unpack_flags(0x0004).is_err());
        // Nonzero upper bits.
        assert_eq!(
            unpack_flags(0x0001_0104),
            Err(MdError::InvalidFlags { flags: 0x0001_0104 }),
        );
    }

    #[test]
    fn reader_reports_truncation_precisely() {
        let mut r = ByteReader::new(&[1, 2, 3], Endianness::Little);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(
            r.u32(),
            Err(MdError::Truncated { needed: 4, available: 2 }),
        );
        // A failed read consumes nothing.
        assert_eq!(r.u16().unwrap(), 0x0302);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn cursors_agree_in_both_byte_orders() {
        for endian in [Endianness::Little, Endianness::Big] {
            let mut w = ByteWriter::new(endian);
            w.u16(0xBEEF);
            w.u64(0x0123_4567_89AB_CDEF);
            w.i64(-40);
            w.f64(2.718281828);
            let image = w.into_vec();

            let mut r = ByteReader::new(&image, endian);
            assert_eq!(r.u16().unwrap(), 0xBEEF);
            assert_eq!(r.u64().unwrap(), 0x0123_4567_89AB_CDEF);
            assert_eq!(r.i64().unwrap(), -40);
            assert_eq!(r.f64().unwrap(), 2.718281828);
            assert_eq!(r.remaining(), 0);
        }
    }
}
