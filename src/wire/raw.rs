//! Fixed-layout raw wire format.
//!
//! No self-description: integers and reals are eight bytes in the
//! configured byte order, strings are their bytes plus a NUL terminator,
//! byte strings are their bare bytes (length travels out-of-band in the
//! consumer's format string), and containers contribute their members
//! depth-first with no markers. A loaded raw block therefore keeps its
//! payload verbatim; only a `loadf` call with the producer's format string
//! can type it.

use crate::error::MdError;
use crate::stack::Stack;
use crate::value::Value;
use crate::wire::{BlockCodec, ByteWriter, Endianness, WireFormat};

pub struct RawCodec;

impl BlockCodec for RawCodec {
    fn format(&self) -> WireFormat {
        WireFormat::Raw
    }

    fn encode(&self, stack: &Stack, endian: Endianness) -> Result<Vec<u8>, MdError> {
        let mut w = ByteWriter::new(endian);
        for &index in stack.live_indices() {
            write_value(stack, index, &mut w)?;
        }
        Ok(w.into_vec())
    }

    fn decode(&self, name: &str, endian: Endianness, payload: &[u8]) -> Result<Stack, MdError> {
        Ok(Stack::from_raw_view(name, endian, payload.to_vec()))
    }
}

fn write_value(stack: &Stack, index: u32, w: &mut ByteWriter) -> Result<(), MdError> {
    match stack.at(index)? {
        Value::Uint(v) => w.u64(*v),
        Value::Sint(v) => w.i64(*v),
        Value::Real(v) => w.f64(*v),
        Value::Zstr(s) => {
            w.bytes(s.as_bytes());
            w.u8(0);
        }
        Value::Bytes(b) => w.bytes(b),
        Value::Array(cells) => {
            for &element in cells.borrow().iter() {
                write_value(stack, element, w)?;
            }
        }
        Value::Hash(cells) => {
            for &(key, value) in cells.borrow().iter() {
                write_value(stack, key, w)?;
                write_value(stack, value, w)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmtstr::{FmtArg, FmtOut};

    fn scalar_stack() -> Stack {
        let mut s = Stack::new("t");
        s.push_uint(33).unwrap();
        s.push_sint(-191).unwrap();
        s.push_real(3.141592654).unwrap();
        s.push_zstr("Hello Metadata!").unwrap();
        s
    }

    #[test]
    fn scalars_round_trip_in_both_byte_orders() {
        for endian in [Endianness::Little, Endianness::Big] {
            let stack = scalar_stack();
            let payload = RawCodec.encode(&stack, endian).unwrap();
            // 3 fixed 8-byte fields + 15 string bytes + NUL.
            assert_eq!(payload.len(), 3 * 8 + 16);

            let loaded = RawCodec.decode("t", endian, &payload).unwrap();
            assert!(loaded.is_finalized());
            assert_eq!(loaded.raw_bytes().unwrap(), &payload[..]);

            let mut u = 0u64;
            let mut i = 0i64;
            let mut f = 0f64;
            let mut z = String::new();
            loaded
                .loadf(
                    "uifz",
                    &mut [
                        FmtOut::Uint(&mut u),
                        FmtOut::Sint(&mut i),
                        FmtOut::Real(&mut f),
                        FmtOut::Zstr(&mut z),
                    ],
                )
                .unwrap();
            assert_eq!(u, 33);
            assert_eq!(i, -191);
            assert_eq!(f, 3.141592654);
            assert_eq!(z, "Hello Metadata!");
        }
    }

    #[test]
    fn byte_strings_use_the_out_of_band_length() {
        let mut stack = Stack::new("t");
        stack.push_bytes(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        let payload = RawCodec.encode(&stack, Endianness::Little).unwrap();
        assert_eq!(payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let loaded = RawCodec.decode("t", Endianness::Little, &payload).unwrap();
        // The caller's pre-sized vector tells the reader how many bytes to take.
        let mut out = vec![0u8; 4];
        loaded.loadf("s", &mut [FmtOut::Bytes(&mut out)]).unwrap();
        assert_eq!(out, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn containers_flatten_depth_first() {
        let mut stack = Stack::new("t");
        stack
            .pushf(
                "[u,u,{i:f,f:[u]}]z",
                &[
                    FmtArg::Uint(1),
                    FmtArg::Uint(2),
                    FmtArg::Sint(-3),
                    FmtArg::Real(2.718),
                    FmtArg::Real(3.141),
                    FmtArg::Uint(3),
                    FmtArg::Zstr("finalize"),
                ],
            )
            .unwrap();

        let payload = RawCodec.encode(&stack, Endianness::Big).unwrap();
        // Six 8-byte scalars, no container markers, then "finalize\0".
        assert_eq!(payload.len(), 6 * 8 + 9);

        let loaded = RawCodec.decode("t", Endianness::Big, &payload).unwrap();
        let (mut a, mut b, mut f) = (0u64, 0u64, 0u64);
        let mut c = 0i64;
        let (mut d, mut e) = (0f64, 0f64);
        let mut g = String::new();
        loaded
            .loadf(
                "[u,u,{i:f,f:[u]}]z",
                &mut [
                    FmtOut::Uint(&mut a),
                    FmtOut::Uint(&mut b),
                    FmtOut::Sint(&mut c),
                    FmtOut::Real(&mut d),
                    FmtOut::Real(&mut e),
                    FmtOut::Uint(&mut f),
                    FmtOut::Zstr(&mut g),
                ],
            )
            .unwrap();
        assert_eq!((a, b, c, f), (1, 2, -3, 3));
        assert_eq!((d, e), (2.718, 3.141));
        assert_eq!(g, "finalize");
    }

    #[test]
    fn truncated_payloads_fail_without_reading_past_the_end() {
        let stack = scalar_stack();
        let payload = RawCodec.encode(&stack, Endianness::Little).unwrap();
        let loaded = RawCodec
            .decode("t", Endianness::Little, &payload[..10])
            .unwrap();
        let mut u = 0u64;
        let mut i = 0i64;
        assert!(matches!(
            loaded.loadf("ui", &mut [FmtOut::Uint(&mut u), FmtOut::Sint(&mut i)]),
            Err(MdError::Truncated { .. })
        ));
    }

    #[test]
    fn undescribed_trailing_bytes_are_an_error() {
        let loaded = RawCodec
            .decode("t", Endianness::Little, &[0u8; 12])
            .unwrap();
        let mut u = 0u64;
        assert!(matches!(
            loaded.loadf("u", &mut [FmtOut::Uint(&mut u)]),
            Err(MdError::WireDecode(_))
        ));
    }
}
