//! The format-string mini-language: bulk push (`pushf`) and bulk read
//! (`loadf`).
//!
//! # Grammar
//! ```text
//! format := item+                       top-level items are juxtaposed
//! item   := 'u' | 'i' | 'f' | 'z' | 's' | array | hash
//! array  := '[' [ item (',' item)* ] ']'
//! hash   := '{' [ pair (',' pair)* ] '}'
//! pair   := scalar-item ':' item
//! ```
//!
//! `u` uint64, `i` int64, `f` real, `z` NUL-terminated string, `s` byte
//! string whose length travels out-of-band. Hash keys must be scalar items.
//! Containers nest at most 32 levels.
//!
//! # Transactionality
//! `pushf` parses the whole format and binds every argument before the
//! first push, so a malformed format, a wrong argument kind, or a wrong
//! argument count leaves the stack exactly as it was. `loadf` extracts the
//! whole tree into temporaries before writing any out slot.
//!
//! # Numeric readback
//! `loadf` matches integers by value, not by stored tag: `u` accepts a
//! non-negative sint and `i` accepts a uint within `i64` range. MessagePack
//! re-encodes integers in their smallest family, so the producer's
//! signedness does not survive that wire.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::MdError;
use crate::stack::Stack;
use crate::value::{Value, MAX_DEPTH};
use crate::wire::ByteReader;

/// One argument consumed by [`Stack::pushf`].
#[derive(Debug, Clone, Copy)]
pub enum FmtArg<'a> {
    Uint(u64),
    Sint(i64),
    Real(f64),
    Zstr(&'a str),
    Bytes(&'a [u8]),
}

/// One out slot filled by [`Stack::loadf`].
#[derive(Debug)]
pub enum FmtOut<'a> {
    Uint(&'a mut u64),
    Sint(&'a mut i64),
    Real(&'a mut f64),
    Zstr(&'a mut String),
    /// When reading a raw-format payload the entry length on call is the
    /// byte count to consume (the out-of-band length contract); when
    /// reading stored values the vector is replaced with the stored bytes.
    Bytes(&'a mut Vec<u8>),
}

// ── Token tree ───────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Token {
    Uint,
    Sint,
    Real,
    Zstr,
    Bytes,
    Array(Vec<Token>),
    Hash(Vec<(Token, Token)>),
}

fn token_kind(token: &Token) -> &'static str {
    match token {
        Token::Uint => "uint",
        Token::Sint => "sint",
        Token::Real => "real",
        Token::Zstr => "zstr",
        Token::Bytes => "bytes",
        Token::Array(_) => "array",
        Token::Hash(_) => "hash",
    }
}

fn count_scalars(tokens: &[Token]) -> usize {
    tokens.iter().map(count_in).sum()
}

fn count_in(token: &Token) -> usize {
    match token {
        Token::Array(items) => items.iter().map(count_in).sum(),
        Token::Hash(pairs) => pairs.iter().map(|(k, v)| count_in(k) + count_in(v)).sum(),
        _ => 1,
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

struct Parser<'f> {
    fmt: &'f [u8],
    pos: usize,
}

impl<'f> Parser<'f> {
    fn parse(fmt: &'f str) -> Result<Vec<Token>, MdError> {
        let mut p = Parser { fmt: fmt.as_bytes(), pos: 0 };
        let mut items = Vec::new();
        while p.pos < p.fmt.len() {
            items.push(p.token(0)?);
        }
        Ok(items)
    }

    fn token(&mut self, depth: usize) -> Result<Token, MdError> {
        match self.fmt[self.pos] {
            b'u' => { self.pos += 1; Ok(Token::Uint) }
            b'i' => { self.pos += 1; Ok(Token::Sint) }
            b'f' => { self.pos += 1; Ok(Token::Real) }
            b'z' => { self.pos += 1; Ok(Token::Zstr) }
            b's' => { self.pos += 1; Ok(Token::Bytes) }
            b'[' => self.array(depth),
            b'{' => self.hash(depth),
            other => Err(self.err(format!("unknown format character '{}'", printable(other)))),
        }
    }

    fn array(&mut self, depth: usize) -> Result<Token, MdError> {
        if depth >= MAX_DEPTH {
            return Err(self.err("containers nest deeper than the 32-level limit"));
        }
        let open = self.pos;
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.err_at(open, "unterminated '['")),
                Some(b']') => {
                    self.pos += 1;
                    return Ok(Token::Array(items));
                }
                _ => {}
            }
            if !items.is_empty() {
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(other) => {
                        return Err(self.err(format!(
                            "expected ',' or ']', found '{}'",
                            printable(other)
                        )))
                    }
                    None => return Err(self.err_at(open, "unterminated '['")),
                }
                match self.peek() {
                    None => return Err(self.err_at(open, "unterminated '['")),
                    Some(b']') => return Err(self.err("trailing ',' in array")),
                    _ => {}
                }
            }
            items.push(self.token(depth + 1)?);
        }
    }

    fn hash(&mut self, depth: usize) -> Result<Token, MdError> {
        if depth >= MAX_DEPTH {
            return Err(self.err("containers nest deeper than the 32-level limit"));
        }
        let open = self.pos;
        self.pos += 1;
        let mut pairs = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.err_at(open, "unterminated '{'")),
                Some(b'}') => {
                    self.pos += 1;
                    return Ok(Token::Hash(pairs));
                }
                _ => {}
            }
            if !pairs.is_empty() {
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(other) => {
                        return Err(self.err(format!(
                            "expected ',' or '}}', found '{}'",
                            printable(other)
                        )))
                    }
                    None => return Err(self.err_at(open, "unterminated '{'")),
                }
                match self.peek() {
                    None => return Err(self.err_at(open, "unterminated '{'")),
                    Some(b'}') => return Err(self.err("trailing ',' in hash")),
                    _ => {}
                }
            }
            let key_pos = self.pos;
            let key = self.token(depth + 1)?;
            if matches!(key, Token::Array(_) | Token::Hash(_)) {
                return Err(self.err_at(key_pos, "hash keys must be scalar"));
            }
            match self.peek() {
                Some(b':') => self.pos += 1,
                Some(other) => {
                    return Err(self.err(format!(
                        "expected ':' after hash key, found '{}'",
                        printable(other)
                    )))
                }
                None => return Err(self.err_at(open, "unterminated '{'")),
            }
            if self.peek().is_none() {
                return Err(self.err_at(open, "unterminated '{'"));
            }
            let value = self.token(depth + 1)?;
            pairs.push((key, value));
        }
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.fmt.get(self.pos).copied()
    }

    fn err(&self, reason: impl Into<String>) -> MdError {
        self.err_at(self.pos, reason)
    }

    fn err_at(&self, pos: usize, reason: impl Into<String>) -> MdError {
        MdError::InvalidFmtStr { pos, reason: reason.into() }
    }
}

fn printable(b: u8) -> String {
    if b.is_ascii_graphic() || b == b' ' {
        (b as char).to_string()
    } else {
        format!("\\x{b:02x}")
    }
}

// ── pushf: validate, bind, emit ──────────────────────────────────────────────

/// Argument tree with every scalar bound. Emission over a bound tree cannot
/// fail, which is what makes `pushf` transactional.
enum Planned<'a> {
    Uint(u64),
    Sint(i64),
    Real(f64),
    Zstr(&'a str),
    Bytes(&'a [u8]),
    Array(Vec<Planned<'a>>),
    Hash(Vec<(Planned<'a>, Planned<'a>)>),
}

pub(crate) fn pushf(stack: &mut Stack, fmt: &str, args: &[FmtArg<'_>]) -> Result<(), MdError> {
    stack.ensure_mutable()?;
    if fmt.is_empty() {
        return Err(MdError::EmptyStack);
    }
    let tokens = Parser::parse(fmt)?;
    let needed = count_scalars(&tokens);
    if needed != args.len() {
        return Err(MdError::InvalidFmtStr {
            pos:    fmt.len(),
            reason: format!("format consumes {needed} values, {} supplied", args.len()),
        });
    }
    let mut cursor = 0usize;
    let mut plan = Vec::with_capacity(tokens.len());
    for token in &tokens {
        plan.push(bind(token, args, &mut cursor)?);
    }
    for planned in &plan {
        emit(stack, planned);
    }
    Ok(())
}

fn bind<'a>(token: &Token, args: &[FmtArg<'a>], cursor: &mut usize) -> Result<Planned<'a>, MdError> {
    match token {
        Token::Uint => match *next(args, cursor) {
            FmtArg::Uint(v) => Ok(Planned::Uint(v)),
            other => Err(arg_mismatch("uint", &other)),
        },
        Token::Sint => match *next(args, cursor) {
            FmtArg::Sint(v) => Ok(Planned::Sint(v)),
            other => Err(arg_mismatch("sint", &other)),
        },
        Token::Real => match *next(args, cursor) {
            FmtArg::Real(v) => Ok(Planned::Real(v)),
            other => Err(arg_mismatch("real", &other)),
        },
        Token::Zstr => match *next(args, cursor) {
            FmtArg::Zstr(s) => {
                if s.bytes().any(|b| b == 0) {
                    Err(MdError::TypeErr {
                        expected: "zstr without interior NUL".to_string(),
                        found:    "string containing NUL".to_string(),
                    })
                } else {
                    Ok(Planned::Zstr(s))
                }
            }
            other => Err(arg_mismatch("zstr", &other)),
        },
        Token::Bytes => match *next(args, cursor) {
            FmtArg::Bytes(b) => Ok(Planned::Bytes(b)),
            other => Err(arg_mismatch("bytes", &other)),
        },
        Token::Array(items) => {
            let mut bound = Vec::with_capacity(items.len());
            for item in items {
                bound.push(bind(item, args, cursor)?);
            }
            Ok(Planned::Array(bound))
        }
        Token::Hash(pairs) => {
            let mut bound = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                let key = bind(k, args, cursor)?;
                let value = bind(v, args, cursor)?;
                bound.push((key, value));
            }
            Ok(Planned::Hash(bound))
        }
    }
}

fn next<'s, 'a>(args: &'s [FmtArg<'a>], cursor: &mut usize) -> &'s FmtArg<'a> {
    let arg = &args[*cursor];
    *cursor += 1;
    arg
}

fn arg_kind(arg: &FmtArg<'_>) -> &'static str {
    match arg {
        FmtArg::Uint(_) => "uint",
        FmtArg::Sint(_) => "sint",
        FmtArg::Real(_) => "real",
        FmtArg::Zstr(_) => "zstr",
        FmtArg::Bytes(_) => "bytes",
    }
}

fn arg_mismatch(expected: &str, found: &FmtArg<'_>) -> MdError {
    MdError::TypeErr {
        expected: expected.to_string(),
        found:    arg_kind(found).to_string(),
    }
}

/// Emit a bound tree exactly as a by-hand caller would: container first,
/// members pushed above it, linked, then popped. Leaves the root live.
fn emit(stack: &mut Stack, planned: &Planned<'_>) -> u32 {
    match planned {
        Planned::Uint(v) => stack.commit_value(Value::Uint(*v)),
        Planned::Sint(v) => stack.commit_value(Value::Sint(*v)),
        Planned::Real(v) => stack.commit_value(Value::Real(*v)),
        Planned::Zstr(s) => stack.commit_value(Value::Zstr(Rc::from(*s))),
        Planned::Bytes(b) => stack.commit_value(Value::Bytes(Rc::from(*b))),
        Planned::Array(items) => {
            let cells = Rc::new(RefCell::new(Vec::with_capacity(items.len())));
            let index = stack.commit_value(Value::Array(Rc::clone(&cells)));
            for item in items {
                let element = emit(stack, item);
                cells.borrow_mut().push(element);
                stack.discard_top();
            }
            index
        }
        Planned::Hash(pairs) => {
            let cells = Rc::new(RefCell::new(Vec::with_capacity(pairs.len())));
            let index = stack.commit_value(Value::Hash(Rc::clone(&cells)));
            for (k, v) in pairs {
                let key = emit(stack, k);
                let value = emit(stack, v);
                cells.borrow_mut().push((key, value));
                stack.discard_top();
                stack.discard_top();
            }
            index
        }
    }
}

// ── loadf: validate, extract, commit ─────────────────────────────────────────

enum Extracted {
    Uint(u64),
    Sint(i64),
    Real(f64),
    Zstr(String),
    Bytes(Vec<u8>),
}

fn extracted_kind(tmp: &Extracted) -> &'static str {
    match tmp {
        Extracted::Uint(_) => "uint",
        Extracted::Sint(_) => "sint",
        Extracted::Real(_) => "real",
        Extracted::Zstr(_) => "zstr",
        Extracted::Bytes(_) => "bytes",
    }
}

fn out_kind(out: &FmtOut<'_>) -> &'static str {
    match out {
        FmtOut::Uint(_) => "uint",
        FmtOut::Sint(_) => "sint",
        FmtOut::Real(_) => "real",
        FmtOut::Zstr(_) => "zstr",
        FmtOut::Bytes(_) => "bytes",
    }
}

pub(crate) fn loadf(stack: &Stack, fmt: &str, outs: &mut [FmtOut<'_>]) -> Result<(), MdError> {
    if fmt.is_empty() {
        return Err(MdError::EmptyStack);
    }
    let tokens = Parser::parse(fmt)?;
    let needed = count_scalars(&tokens);
    if needed != outs.len() {
        return Err(MdError::InvalidFmtStr {
            pos:    fmt.len(),
            reason: format!("format yields {needed} values, {} out slots supplied", outs.len()),
        });
    }

    // Kind-check every out slot (and record the expected byte counts for
    // raw reads) before extracting anything.
    let mut raw_lens = Vec::with_capacity(needed);
    {
        let mut cursor = 0usize;
        for token in &tokens {
            check_outs(token, outs, &mut cursor, &mut raw_lens)?;
        }
    }

    let mut temps = Vec::with_capacity(needed);
    match stack.raw_view() {
        Some(view) => {
            let mut reader = ByteReader::new(&view.bytes, view.endian);
            for token in &tokens {
                extract_raw(&mut reader, token, &raw_lens, &mut temps)?;
            }
            if reader.remaining() != 0 {
                return Err(MdError::WireDecode(format!(
                    "raw payload has {} trailing bytes the format does not describe",
                    reader.remaining()
                )));
            }
        }
        None => {
            let live = stack.live_indices();
            if live.len() < tokens.len() {
                return Err(MdError::EmptyStack);
            }
            let base = live.len() - tokens.len();
            for (j, token) in tokens.iter().enumerate() {
                extract_value(stack, token, live[base + j], &mut temps)?;
            }
        }
    }

    for (tmp, out) in temps.into_iter().zip(outs.iter_mut()) {
        store(tmp, out)?;
    }
    Ok(())
}

fn check_outs(
    token: &Token,
    outs: &[FmtOut<'_>],
    cursor: &mut usize,
    raw_lens: &mut Vec<usize>,
) -> Result<(), MdError> {
    match token {
        Token::Array(items) => {
            for item in items {
                check_outs(item, outs, cursor, raw_lens)?;
            }
            Ok(())
        }
        Token::Hash(pairs) => {
            for (k, v) in pairs {
                check_outs(k, outs, cursor, raw_lens)?;
                check_outs(v, outs, cursor, raw_lens)?;
            }
            Ok(())
        }
        scalar => {
            let out = &outs[*cursor];
            *cursor += 1;
            let expected = token_kind(scalar);
            if out_kind(out) != expected {
                return Err(MdError::TypeErr {
                    expected: expected.to_string(),
                    found:    out_kind(out).to_string(),
                });
            }
            raw_lens.push(match out {
                FmtOut::Bytes(v) => v.len(),
                _ => 0,
            });
            Ok(())
        }
    }
}

fn extract_value(
    stack: &Stack,
    token: &Token,
    index: u32,
    temps: &mut Vec<Extracted>,
) -> Result<(), MdError> {
    let value = stack.at(index)?;
    match token {
        Token::Uint => match value {
            Value::Uint(v) => {
                temps.push(Extracted::Uint(*v));
                Ok(())
            }
            Value::Sint(v) if *v >= 0 => {
                temps.push(Extracted::Uint(*v as u64));
                Ok(())
            }
            Value::Sint(_) => Err(MdError::TypeErr {
                expected: "uint".to_string(),
                found:    "negative sint".to_string(),
            }),
            other => Err(value_mismatch("uint", other)),
        },
        Token::Sint => match value {
            Value::Sint(v) => {
                temps.push(Extracted::Sint(*v));
                Ok(())
            }
            Value::Uint(v) if *v <= i64::MAX as u64 => {
                temps.push(Extracted::Sint(*v as i64));
                Ok(())
            }
            Value::Uint(_) => Err(MdError::TypeErr {
                expected: "sint".to_string(),
                found:    "uint above i64::MAX".to_string(),
            }),
            other => Err(value_mismatch("sint", other)),
        },
        Token::Real => match value {
            Value::Real(v) => {
                temps.push(Extracted::Real(*v));
                Ok(())
            }
            other => Err(value_mismatch("real", other)),
        },
        Token::Zstr => match value {
            Value::Zstr(s) => {
                temps.push(Extracted::Zstr(s.to_string()));
                Ok(())
            }
            other => Err(value_mismatch("zstr", other)),
        },
        Token::Bytes => match value {
            Value::Bytes(b) => {
                temps.push(Extracted::Bytes(b.to_vec()));
                Ok(())
            }
            other => Err(value_mismatch("bytes", other)),
        },
        Token::Array(items) => {
            let elements = value.elements()?;
            if elements.len() != items.len() {
                return Err(MdError::TypeErr {
                    expected: format!("array of {} elements", items.len()),
                    found:    format!("array of {} elements", elements.len()),
                });
            }
            for (item, element) in items.iter().zip(elements) {
                extract_value(stack, item, element, temps)?;
            }
            Ok(())
        }
        Token::Hash(pairs) => {
            let entries = value.entries()?;
            if entries.len() != pairs.len() {
                return Err(MdError::TypeErr {
                    expected: format!("hash of {} pairs", pairs.len()),
                    found:    format!("hash of {} pairs", entries.len()),
                });
            }
            for ((kt, vt), (ki, vi)) in pairs.iter().zip(entries) {
                extract_value(stack, kt, ki, temps)?;
                extract_value(stack, vt, vi, temps)?;
            }
            Ok(())
        }
    }
}

fn value_mismatch(expected: &str, found: &Value) -> MdError {
    MdError::TypeErr {
        expected: expected.to_string(),
        found:    found.kind().to_string(),
    }
}

fn extract_raw(
    reader: &mut ByteReader<'_>,
    token: &Token,
    raw_lens: &[usize],
    temps: &mut Vec<Extracted>,
) -> Result<(), MdError> {
    match token {
        Token::Uint => {
            let v = reader.u64()?;
            temps.push(Extracted::Uint(v));
            Ok(())
        }
        Token::Sint => {
            let v = reader.i64()?;
            temps.push(Extracted::Sint(v));
            Ok(())
        }
        Token::Real => {
            let v = reader.f64()?;
            temps.push(Extracted::Real(v));
            Ok(())
        }
        Token::Zstr => {
            let bytes = reader.take_until_nul()?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| MdError::WireDecode("string payload is not valid UTF-8".to_string()))?;
            temps.push(Extracted::Zstr(s.to_string()));
            Ok(())
        }
        Token::Bytes => {
            let n = raw_lens[temps.len()];
            let bytes = reader.take(n)?;
            temps.push(Extracted::Bytes(bytes.to_vec()));
            Ok(())
        }
        Token::Array(items) => {
            for item in items {
                extract_raw(reader, item, raw_lens, temps)?;
            }
            Ok(())
        }
        Token::Hash(pairs) => {
            for (k, v) in pairs {
                extract_raw(reader, k, raw_lens, temps)?;
                extract_raw(reader, v, raw_lens, temps)?;
            }
            Ok(())
        }
    }
}

fn store(tmp: Extracted, out: &mut FmtOut<'_>) -> Result<(), MdError> {
    match (tmp, out) {
        (Extracted::Uint(v), FmtOut::Uint(slot)) => {
            **slot = v;
            Ok(())
        }
        (Extracted::Sint(v), FmtOut::Sint(slot)) => {
            **slot = v;
            Ok(())
        }
        (Extracted::Real(v), FmtOut::Real(slot)) => {
            **slot = v;
            Ok(())
        }
        (Extracted::Zstr(s), FmtOut::Zstr(slot)) => {
            **slot = s;
            Ok(())
        }
        (Extracted::Bytes(b), FmtOut::Bytes(slot)) => {
            **slot = b;
            Ok(())
        }
        (tmp, out) => Err(MdError::TypeErr {
            expected: out_kind(out).to_string(),
            found:    extracted_kind(&tmp).to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> Stack {
        Stack::new("t")
    }

    #[test]
    fn parses_the_reference_format() {
        let tokens = Parser::parse("[u,u,{i:f,f:[u]}]z").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(count_scalars(&tokens), 7);
    }

    #[test]
    fn rejects_malformed_formats() {
        assert!(matches!(
            Parser::parse("[u,u").unwrap_err(),
            MdError::InvalidFmtStr { pos: 0, .. }
        ));
        assert!(matches!(
            Parser::parse("x").unwrap_err(),
            MdError::InvalidFmtStr { pos: 0, .. }
        ));
        assert!(matches!(
            Parser::parse("{u}").unwrap_err(),
            MdError::InvalidFmtStr { .. }
        ));
        assert!(matches!(
            Parser::parse("{[u]:u}").unwrap_err(),
            MdError::InvalidFmtStr { pos: 1, .. }
        ));
        assert!(matches!(
            Parser::parse("[u,]").unwrap_err(),
            MdError::InvalidFmtStr { .. }
        ));
        assert!(matches!(
            Parser::parse("{u:u,}").unwrap_err(),
            MdError::InvalidFmtStr { .. }
        ));
        assert!(matches!(
            Parser::parse("[uu]").unwrap_err(),
            MdError::InvalidFmtStr { .. }
        ));
    }

    #[test]
    fn nesting_is_capped() {
        let deep_ok = format!("{}u{}", "[".repeat(32), "]".repeat(32));
        assert!(Parser::parse(&deep_ok).is_ok());
        let too_deep = format!("{}u{}", "[".repeat(33), "]".repeat(33));
        assert!(matches!(
            Parser::parse(&too_deep).unwrap_err(),
            MdError::InvalidFmtStr { .. }
        ));
    }

    #[test]
    fn pushf_builds_the_reference_tree() {
        let mut s = stack();
        s.pushf(
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

        // Two live entries: the outer array and the trailing string.
        assert_eq!(s.len(), 2);
        let top = s.top().unwrap();
        assert_eq!(s.at(top).unwrap().as_zstr().unwrap(), "finalize");

        let root = s.live_indices()[0];
        let elements = s.at(root).unwrap().elements().unwrap();
        assert_eq!(elements.len(), 3);
        assert_eq!(s.at(elements[0]).unwrap().as_uint().unwrap(), 1);
        assert_eq!(s.at(elements[1]).unwrap().as_uint().unwrap(), 2);
        let entries = s.at(elements[2]).unwrap().entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(s.at(entries[0].0).unwrap().as_sint().unwrap(), -3);
        assert_eq!(s.at(entries[0].1).unwrap().as_real().unwrap(), 2.718);
        assert_eq!(s.at(entries[1].0).unwrap().as_real().unwrap(), 3.141);
        let inner = s.at(entries[1].1).unwrap().elements().unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(s.at(inner[0]).unwrap().as_uint().unwrap(), 3);
    }

    #[test]
    fn loadf_is_the_inverse_of_pushf() {
        let mut s = stack();
        s.pushf(
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

        let (mut a, mut b, mut c) = (0u64, 0u64, 0i64);
        let (mut d, mut e) = (0f64, 0f64);
        let mut f = 0u64;
        let mut g = String::new();
        s.loadf(
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

        assert_eq!((a, b, c), (1, 2, -3));
        assert_eq!((d, e), (2.718, 3.141));
        assert_eq!(f, 3);
        assert_eq!(g, "finalize");
    }

    #[test]
    fn empty_format_is_an_explicit_error() {
        let mut s = stack();
        assert_eq!(s.pushf("", &[]), Err(MdError::EmptyStack));
        assert_eq!(s.loadf("", &mut []), Err(MdError::EmptyStack));
    }

    #[test]
    fn failed_pushf_leaves_the_stack_untouched() {
        let mut s = stack();
        let err = s
            .pushf("[u,u", &[FmtArg::Uint(1), FmtArg::Uint(2)])
            .unwrap_err();
        assert!(matches!(err, MdError::InvalidFmtStr { .. }));
        assert_eq!(s.top(), Err(MdError::EmptyStack));
        assert!(s.is_empty());

        // Wrong argument kind, valid grammar: still untouched.
        s.push_uint(9).unwrap();
        let err = s.pushf("uz", &[FmtArg::Uint(1), FmtArg::Uint(2)]).unwrap_err();
        assert!(matches!(err, MdError::TypeErr { .. }));
        assert_eq!(s.len(), 1);

        // Wrong argument count.
        let err = s.pushf("uu", &[FmtArg::Uint(1)]).unwrap_err();
        assert!(matches!(err, MdError::InvalidFmtStr { .. }));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn loadf_reads_the_top_entries_only() {
        let mut s = stack();
        s.push_uint(10).unwrap();
        s.push_zstr("top").unwrap();

        let mut out = String::new();
        s.loadf("z", &mut [FmtOut::Zstr(&mut out)]).unwrap();
        assert_eq!(out, "top");

        let mut u = 0u64;
        let mut z = String::new();
        s.loadf("uz", &mut [FmtOut::Uint(&mut u), FmtOut::Zstr(&mut z)])
            .unwrap();
        assert_eq!((u, z.as_str()), (10, "top"));
    }

    #[test]
    fn loadf_integers_match_by_value() {
        let mut s = stack();
        s.push_sint(5).unwrap();
        let mut u = 0u64;
        s.loadf("u", &mut [FmtOut::Uint(&mut u)]).unwrap();
        assert_eq!(u, 5);

        let mut s = stack();
        s.push_sint(-1).unwrap();
        let mut u = 0u64;
        assert!(matches!(
            s.loadf("u", &mut [FmtOut::Uint(&mut u)]),
            Err(MdError::TypeErr { .. })
        ));

        let mut s = stack();
        s.push_uint(7).unwrap();
        let mut i = 0i64;
        s.loadf("i", &mut [FmtOut::Sint(&mut i)]).unwrap();
        assert_eq!(i, 7);

        let mut s = stack();
        s.push_uint(u64::MAX).unwrap();
        let mut i = 0i64;
        assert!(matches!(
            s.loadf("i", &mut [FmtOut::Sint(&mut i)]),
            Err(MdError::TypeErr { .. })
        ));
    }

    #[test]
    fn loadf_mismatch_writes_nothing() {
        let mut s = stack();
        s.push_uint(1).unwrap();
        s.push_zstr("x").unwrap();

        let mut u = 99u64;
        let mut z = "untouched".to_string();
        // Fails on the second position: stack holds zstr on top, wants uint
        // below, but the first token mismatches the stored kinds.
        let err = s
            .loadf("zu", &mut [FmtOut::Zstr(&mut z), FmtOut::Uint(&mut u)])
            .unwrap_err();
        assert!(matches!(err, MdError::TypeErr { .. }));
        assert_eq!(u, 99);
        assert_eq!(z, "untouched");
    }

    #[test]
    fn loadf_shape_mismatch_is_reported() {
        let mut s = stack();
        s.pushf("[u,u]", &[FmtArg::Uint(1), FmtArg::Uint(2)]).unwrap();
        let mut a = 0u64;
        assert!(matches!(
            s.loadf("[u]", &mut [FmtOut::Uint(&mut a)]),
            Err(MdError::TypeErr { .. })
        ));
    }

    #[test]
    fn loadf_replaces_byte_out_slots_from_values() {
        let mut s = stack();
        s.push_bytes(&[1, 2, 3, 4, 5]).unwrap();
        let mut out = Vec::new();
        s.loadf("s", &mut [FmtOut::Bytes(&mut out)]).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn loadf_needs_enough_live_entries() {
        let mut s = stack();
        s.push_uint(1).unwrap();
        let mut a = 0u64;
        let mut b = 0u64;
        assert_eq!(
            s.loadf("uu", &mut [FmtOut::Uint(&mut a), FmtOut::Uint(&mut b)]),
            Err(MdError::EmptyStack)
        );
    }
}
