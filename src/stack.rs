//! Named, append-only value stacks (the "blocks" of a container).
//!
//! A stack is two things at once: a slot arena and a logical stack over it.
//! Every `push_*` appends a slot to the arena and a live entry on top of the
//! logical stack; `pop` lowers only the logical stack. Slot indices are
//! never reused, so a container that recorded the index of a since-popped
//! element keeps resolving it through [`Stack::at`].
//!
//! Containers may only reference slots pushed after them (see
//! [`Stack::arr_append`]), which keeps every container graph well-founded:
//! walking from a container toward its members always moves toward higher
//! indices and terminates.
//!
//! [`Stack::finalize`] freezes the stack one-way. Every mutator on a frozen
//! stack fails with [`MdError::StackFinalized`] before any other validation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::MdError;
use crate::fmtstr::{self, FmtArg, FmtOut};
use crate::value::Value;
use crate::wire::{Endianness, WireFormat};

/// Payload of a block loaded in raw format. The raw wire layout is not
/// self-describing, so the bytes are kept verbatim and only a `loadf` call
/// with the producer's format string can type them.
#[derive(Debug)]
pub(crate) struct RawView {
    pub(crate) endian: Endianness,
    pub(crate) bytes:  Vec<u8>,
}

/// A named, append-only, indexable sequence of typed values.
///
/// Obtained from [`Context::create_block`](crate::Context::create_block)
/// (producer side) or [`Context::get_block`](crate::Context::get_block)
/// (either side).
#[derive(Debug)]
pub struct Stack {
    name:      String,
    slots:     Vec<Value>,
    live:      Vec<u32>,
    out_fmt:   WireFormat,
    finalized: bool,
    raw_view:  Option<RawView>,
}

impl Stack {
    pub(crate) fn new(name: &str) -> Self {
        Stack {
            name:      name.to_string(),
            slots:     Vec::new(),
            live:      Vec::new(),
            out_fmt:   WireFormat::MsgPack,
            finalized: false,
            raw_view:  None,
        }
    }

    /// Wrap a loaded raw payload. The stack is born finalized and holds no
    /// typed slots; [`Stack::loadf`] reads values straight from the bytes.
    pub(crate) fn from_raw_view(name: &str, endian: Endianness, bytes: Vec<u8>) -> Self {
        let mut stack = Stack::new(name);
        stack.raw_view = Some(RawView { endian, bytes });
        stack.out_fmt = WireFormat::Raw;
        stack.finalized = true;
        stack
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Wire format used when the owning context serializes this block.
    #[inline]
    pub fn out_fmt(&self) -> WireFormat {
        self.out_fmt
    }

    /// Number of live entries (the logical stack, not the arena).
    #[inline]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Indices of the live entries, bottom of stack first.
    #[inline]
    pub fn live_indices(&self) -> &[u32] {
        &self.live
    }

    /// Raw payload bytes of a block loaded in raw format; `None` for stacks
    /// holding typed values.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        self.raw_view.as_ref().map(|view| view.bytes.as_slice())
    }

    #[inline]
    pub(crate) fn raw_view(&self) -> Option<&RawView> {
        self.raw_view.as_ref()
    }

    pub(crate) fn mark_finalized(&mut self) {
        self.finalized = true;
    }

    pub(crate) fn ensure_mutable(&self) -> Result<(), MdError> {
        if self.finalized {
            Err(MdError::StackFinalized)
        } else {
            Ok(())
        }
    }

    // ── Push operations ─────────────────────────────────────────────────────

    /// Append an unsigned integer. Returns the new slot index.
    pub fn push_uint(&mut self, v: u64) -> Result<u32, MdError> {
        self.ensure_mutable()?;
        Ok(self.commit(Value::Uint(v)))
    }

    /// Append a signed integer. Returns the new slot index.
    pub fn push_sint(&mut self, v: i64) -> Result<u32, MdError> {
        self.ensure_mutable()?;
        Ok(self.commit(Value::Sint(v)))
    }

    /// Append a real. Returns the new slot index.
    pub fn push_real(&mut self, v: f64) -> Result<u32, MdError> {
        self.ensure_mutable()?;
        Ok(self.commit(Value::Real(v)))
    }

    /// Append a string. Interior NUL bytes are rejected; the raw wire
    /// layout is NUL-terminated and cannot carry them.
    pub fn push_zstr(&mut self, v: &str) -> Result<u32, MdError> {
        self.ensure_mutable()?;
        if v.bytes().any(|b| b == 0) {
            return Err(MdError::TypeErr {
                expected: "zstr without interior NUL".to_string(),
                found:    "string containing NUL".to_string(),
            });
        }
        Ok(self.commit(Value::Zstr(Rc::from(v))))
    }

    /// Append a byte string. Returns the new slot index.
    pub fn push_bytes(&mut self, v: &[u8]) -> Result<u32, MdError> {
        self.ensure_mutable()?;
        Ok(self.commit(Value::Bytes(Rc::from(v))))
    }

    /// Append an empty array. `capacity` is a pre-allocation hint; element
    /// count is not enforced against it.
    pub fn push_arr(&mut self, capacity: usize) -> Result<u32, MdError> {
        self.ensure_mutable()?;
        Ok(self.commit(Value::Array(Rc::new(RefCell::new(Vec::with_capacity(capacity))))))
    }

    /// Append an empty hashtable. `capacity` is a pre-allocation hint.
    pub fn push_map(&mut self, capacity: usize) -> Result<u32, MdError> {
        self.ensure_mutable()?;
        Ok(self.commit(Value::Hash(Rc::new(RefCell::new(Vec::with_capacity(capacity))))))
    }

    fn commit(&mut self, value: Value) -> u32 {
        let index = self.slots.len();
        assert!(
            index <= u32::MAX as usize,
            "slot arena overflow: {index} slots exceeds u32::MAX"
        );
        self.slots.push(value);
        self.live.push(index as u32);
        index as u32
    }

    /// Append a pre-validated value. Emission path of the format codec and
    /// the wire decoders; callers have already run every check a `push_*`
    /// would.
    pub(crate) fn commit_value(&mut self, value: Value) -> u32 {
        self.commit(value)
    }

    /// Drop the top live entry without touching the arena. Emission path
    /// counterpart of `pop` for freshly linked container members.
    pub(crate) fn discard_top(&mut self) {
        self.live.pop();
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Index of the most recently pushed live entry.
    pub fn top(&self) -> Result<u32, MdError> {
        self.live.last().copied().ok_or(MdError::EmptyStack)
    }

    /// Bounds-checked slot access.
    ///
    /// Addresses the arena, so slots popped from the logical stack stay
    /// reachable while containers reference them.
    pub fn at(&self, index: u32) -> Result<&Value, MdError> {
        self.slots
            .get(index as usize)
            .ok_or(MdError::IndexErr { index, reason: "out of range" })
    }

    // ── Mutators ────────────────────────────────────────────────────────────

    /// Remove the top entry, returning its value handle (shared payload).
    ///
    /// Only the logical stack shrinks; the slot stays in the arena.
    pub fn pop(&mut self) -> Result<Value, MdError> {
        self.ensure_mutable()?;
        let index = self.live.pop().ok_or(MdError::EmptyStack)?;
        Ok(self.slots[index as usize].clone())
    }

    /// Append the value at `value_idx` to the array at `array_idx`.
    ///
    /// The array must have been pushed strictly before the value; forward
    /// and self references fail with `IndexErr`. The value is not removed
    /// from the stack — callers pop consumed elements once linked.
    pub fn arr_append(&mut self, array_idx: u32, value_idx: u32) -> Result<(), MdError> {
        self.ensure_mutable()?;
        self.check_bounds(array_idx)?;
        self.check_bounds(value_idx)?;
        let cells = match &self.slots[array_idx as usize] {
            Value::Array(cells) => Rc::clone(cells),
            other => {
                return Err(MdError::TypeErr {
                    expected: "array".to_string(),
                    found:    other.kind().to_string(),
                })
            }
        };
        self.check_order(array_idx, value_idx)?;
        cells.borrow_mut().push(value_idx);
        Ok(())
    }

    /// Link the key/value pair (`key_idx`, `value_idx`) into the hashtable
    /// at `hash_idx`.
    ///
    /// Keys must be scalar (never an array or hashtable). Both indices must
    /// point at slots pushed strictly after the hashtable. Neither slot is
    /// removed from the stack.
    pub fn hash_set_kv(&mut self, hash_idx: u32, key_idx: u32, value_idx: u32) -> Result<(), MdError> {
        self.ensure_mutable()?;
        self.check_bounds(hash_idx)?;
        self.check_bounds(key_idx)?;
        self.check_bounds(value_idx)?;
        let cells = match &self.slots[hash_idx as usize] {
            Value::Hash(cells) => Rc::clone(cells),
            other => {
                return Err(MdError::TypeErr {
                    expected: "hash".to_string(),
                    found:    other.kind().to_string(),
                })
            }
        };
        let key = &self.slots[key_idx as usize];
        if !key.is_scalar() {
            return Err(MdError::KeyErr { found: key.kind().to_string() });
        }
        self.check_order(hash_idx, key_idx)?;
        self.check_order(hash_idx, value_idx)?;
        cells.borrow_mut().push((key_idx, value_idx));
        Ok(())
    }

    /// Select the wire format the owning context serializes this block
    /// with. Defaults to msgpack.
    pub fn set_out_fmt(&mut self, fmt: WireFormat) -> Result<(), MdError> {
        self.ensure_mutable()?;
        self.out_fmt = fmt;
        Ok(())
    }

    /// Freeze the stack. One-way; a second call fails like any other
    /// mutator.
    pub fn finalize(&mut self) -> Result<(), MdError> {
        self.ensure_mutable()?;
        self.finalized = true;
        Ok(())
    }

    // ── Format-string codec ─────────────────────────────────────────────────

    /// Push a whole value tree described by a format string.
    ///
    /// See the [`fmtstr`](crate::fmtstr) grammar: `u` uint, `i` sint, `f`
    /// real, `z` string, `s` byte string, `[..]` array, `{k:v,..}` hash.
    /// Fully transactional: a malformed format or argument list leaves the
    /// stack exactly as it was.
    pub fn pushf(&mut self, fmt: &str, args: &[FmtArg<'_>]) -> Result<(), MdError> {
        fmtstr::pushf(self, fmt, args)
    }

    /// Read values back from the top of the stack per a format string,
    /// writing into caller-supplied out slots in push order.
    ///
    /// Nothing is written unless the whole walk succeeds.
    pub fn loadf(&self, fmt: &str, outs: &mut [FmtOut<'_>]) -> Result<(), MdError> {
        fmtstr::loadf(self, fmt, outs)
    }

    // ── Internal checks ─────────────────────────────────────────────────────

    fn check_bounds(&self, index: u32) -> Result<(), MdError> {
        if (index as usize) < self.slots.len() {
            Ok(())
        } else {
            Err(MdError::IndexErr { index, reason: "out of range" })
        }
    }

    fn check_order(&self, container_idx: u32, member_idx: u32) -> Result<(), MdError> {
        if member_idx > container_idx {
            Ok(())
        } else {
            Err(MdError::IndexErr {
                index:  member_idx,
                reason: "container must be pushed before the value attached to it",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_returns_monotonic_indices() {
        let mut s = Stack::new("t");
        assert_eq!(s.push_uint(1).unwrap(), 0);
        assert_eq!(s.push_sint(-2).unwrap(), 1);
        assert_eq!(s.push_real(0.5).unwrap(), 2);
        assert_eq!(s.top().unwrap(), 2);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn pop_lowers_the_stack_but_keeps_the_slot() {
        let mut s = Stack::new("t");
        s.push_uint(7).unwrap();
        let popped = s.pop().unwrap();
        assert_eq!(popped.as_uint().unwrap(), 7);
        assert!(s.is_empty());
        // The arena still holds slot 0 and new pushes do not reuse it.
        assert_eq!(s.at(0).unwrap().as_uint().unwrap(), 7);
        assert_eq!(s.push_uint(8).unwrap(), 1);
    }

    #[test]
    fn empty_stack_errors() {
        let mut s = Stack::new("t");
        assert_eq!(s.top(), Err(MdError::EmptyStack));
        assert_eq!(s.pop().unwrap_err(), MdError::EmptyStack);
    }

    #[test]
    fn arr_append_enforces_push_order() {
        let mut s = Stack::new("t");
        let arr = s.push_arr(1).unwrap();
        let elem = s.push_uint(5).unwrap();
        s.arr_append(arr, elem).unwrap();
        assert_eq!(s.at(arr).unwrap().elements().unwrap(), vec![elem]);

        // Element pushed before the array: rejected.
        let early = s.push_uint(6).unwrap();
        let late_arr = s.push_arr(1).unwrap();
        assert!(matches!(
            s.arr_append(late_arr, early),
            Err(MdError::IndexErr { .. })
        ));
        // Self reference: rejected.
        assert!(matches!(
            s.arr_append(late_arr, late_arr),
            Err(MdError::IndexErr { .. })
        ));
    }

    #[test]
    fn arr_append_rejects_non_arrays_and_bad_indices() {
        let mut s = Stack::new("t");
        let scalar = s.push_uint(1).unwrap();
        let elem = s.push_uint(2).unwrap();
        assert!(matches!(
            s.arr_append(scalar, elem),
            Err(MdError::TypeErr { .. })
        ));
        assert!(matches!(
            s.arr_append(99, elem),
            Err(MdError::IndexErr { index: 99, .. })
        ));
    }

    #[test]
    fn hash_keys_must_be_scalar() {
        let mut s = Stack::new("t");
        let hash = s.push_map(1).unwrap();
        let arr_key = s.push_arr(0).unwrap();
        let bytes_key = s.push_bytes(b"k").unwrap();
        let val = s.push_uint(1).unwrap();

        assert_eq!(
            s.hash_set_kv(hash, arr_key, val),
            Err(MdError::KeyErr { found: "array".to_string() })
        );
        // A byte string is a legal scalar key.
        s.hash_set_kv(hash, bytes_key, val).unwrap();

        // Target that is not a hash.
        assert!(matches!(
            s.hash_set_kv(val, bytes_key, val),
            Err(MdError::TypeErr { .. })
        ));
    }

    #[test]
    fn interior_nul_strings_are_rejected() {
        let mut s = Stack::new("t");
        assert!(matches!(s.push_zstr("a\0b"), Err(MdError::TypeErr { .. })));
        assert!(s.is_empty());
        s.push_zstr("ab").unwrap();
    }

    #[test]
    fn finalize_freezes_every_mutator() {
        let mut s = Stack::new("t");
        let arr = s.push_arr(0).unwrap();
        let elem = s.push_uint(1).unwrap();
        s.finalize().unwrap();
        assert!(s.is_finalized());

        assert_eq!(s.push_uint(1), Err(MdError::StackFinalized));
        assert_eq!(s.push_zstr("x"), Err(MdError::StackFinalized));
        assert_eq!(s.pop().unwrap_err(), MdError::StackFinalized);
        assert_eq!(s.arr_append(arr, elem), Err(MdError::StackFinalized));
        assert_eq!(s.hash_set_kv(arr, elem, elem), Err(MdError::StackFinalized));
        assert_eq!(s.set_out_fmt(WireFormat::Raw), Err(MdError::StackFinalized));
        assert_eq!(s.finalize(), Err(MdError::StackFinalized));

        // Reads still work.
        assert_eq!(s.top().unwrap(), elem);
        assert_eq!(s.at(elem).unwrap().as_uint().unwrap(), 1);
    }

    #[test]
    fn default_wire_format_is_msgpack() {
        let mut s = Stack::new("t");
        assert_eq!(s.out_fmt(), WireFormat::MsgPack);
        s.set_out_fmt(WireFormat::Raw).unwrap();
        assert_eq!(s.out_fmt(), WireFormat::Raw);
    }
}
