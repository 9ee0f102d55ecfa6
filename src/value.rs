//! Tagged value model: one typed payload per stack slot.
//!
//! Values are cheap to copy. String and byte payloads sit behind `Rc`, so a
//! cloned handle shares storage with the original. Containers never hold
//! other values directly; they hold the stack indices of their members,
//! which keeps the owning stack flat and cycle-free.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::MdError;

/// Containers nest at most this deep. The format grammar and the msgpack
/// decoder enforce the same bound, so no decode path can recurse without
/// limit on crafted input.
pub(crate) const MAX_DEPTH: usize = 32;

/// A single typed metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Unsigned 64-bit integer.
    Uint(u64),
    /// Signed 64-bit integer.
    Sint(i64),
    /// 64-bit real.
    Real(f64),
    /// UTF-8 string, NUL-terminated on the wire (no interior NUL allowed).
    Zstr(Rc<str>),
    /// Raw byte string; its length travels out-of-band in the raw format.
    Bytes(Rc<[u8]>),
    /// Ordered member slots, referenced by stack index.
    Array(Rc<RefCell<Vec<u32>>>),
    /// Key/value slot pairs, referenced by stack index.
    Hash(Rc<RefCell<Vec<(u32, u32)>>>),
}

impl Value {
    /// Human-readable kind name (for diagnostics only, never parsed).
    #[inline]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Uint(_) => "uint",
            Value::Sint(_) => "sint",
            Value::Real(_) => "real",
            Value::Zstr(_) => "zstr",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Hash(_) => "hash",
        }
    }

    /// Returns `true` for every kind a hashtable accepts as a key.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Hash(_))
    }

    pub fn as_uint(&self) -> Result<u64, MdError> {
        match self {
            Value::Uint(v) => Ok(*v),
            other => Err(type_err("uint", other)),
        }
    }

    pub fn as_sint(&self) -> Result<i64, MdError> {
        match self {
            Value::Sint(v) => Ok(*v),
            other => Err(type_err("sint", other)),
        }
    }

    pub fn as_real(&self) -> Result<f64, MdError> {
        match self {
            Value::Real(v) => Ok(*v),
            other => Err(type_err("real", other)),
        }
    }

    /// Borrowing view of a string payload. No copy is made.
    pub fn as_zstr(&self) -> Result<&str, MdError> {
        match self {
            Value::Zstr(s) => Ok(s),
            other => Err(type_err("zstr", other)),
        }
    }

    /// Borrowing view of a byte-string payload. No copy is made.
    pub fn as_bytes(&self) -> Result<&[u8], MdError> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(type_err("bytes", other)),
        }
    }

    /// Member indices of an array value, in append order.
    pub fn elements(&self) -> Result<Vec<u32>, MdError> {
        match self {
            Value::Array(cells) => Ok(cells.borrow().clone()),
            other => Err(type_err("array", other)),
        }
    }

    /// Key/value index pairs of a hash value, in insertion order.
    pub fn entries(&self) -> Result<Vec<(u32, u32)>, MdError> {
        match self {
            Value::Hash(cells) => Ok(cells.borrow().clone()),
            other => Err(type_err("hash", other)),
        }
    }
}

fn type_err(expected: &str, found: &Value) -> MdError {
    MdError::TypeErr {
        expected: expected.to_string(),
        found: found.kind().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_are_kind_exact() {
        let v = Value::Uint(33);
        assert_eq!(v.as_uint().unwrap(), 33);
        assert!(matches!(v.as_sint(), Err(MdError::TypeErr { .. })));
        assert!(matches!(v.as_zstr(), Err(MdError::TypeErr { .. })));

        let z = Value::Zstr(Rc::from("hello"));
        assert_eq!(z.as_zstr().unwrap(), "hello");
        assert!(matches!(z.as_bytes(), Err(MdError::TypeErr { .. })));
    }

    #[test]
    fn clone_shares_payload_storage() {
        let a = Value::Bytes(Rc::from(&b"abc"[..]));
        let b = a.clone();
        match (&a, &b) {
            (Value::Bytes(x), Value::Bytes(y)) => assert!(Rc::ptr_eq(x, y)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn cloned_container_handle_sees_appends() {
        let arr = Value::Array(Rc::new(RefCell::new(vec![1])));
        let alias = arr.clone();
        if let Value::Array(cells) = &arr {
            cells.borrow_mut().push(2);
        }
        assert_eq!(alias.elements().unwrap(), vec![1, 2]);
    }

    #[test]
    fn scalar_predicate() {
        assert!(Value::Real(1.0).is_scalar());
        assert!(Value::Bytes(Rc::from(&[1u8][..])).is_scalar());
        assert!(!Value::Array(Rc::new(RefCell::new(Vec::new()))).is_scalar());
        assert!(!Value::Hash(Rc::new(RefCell::new(Vec::new()))).is_scalar());
    }
}
