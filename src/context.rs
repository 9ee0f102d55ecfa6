//! Producer/consumer entry point: a named set of blocks plus the container
//! codec that binds them into one image.
//!
//! A context is either **building** — blocks are created, filled, then
//! serialized by [`Context::finalize`] — or **loaded**: an existing image
//! whose table structure is validated up front and whose block payloads are
//! parsed lazily on first [`Context::get_block`]. Loaded contexts and the
//! stacks they hand out are frozen; every mutator fails with
//! [`MdError::StackFinalized`].
//!
//! ```
//! use camd::{Context, FmtArg, FmtOut};
//!
//! let mut ctx = Context::new();
//! let block = ctx.create_block("compiler")?;
//! block.pushf("[u,u]z", &[FmtArg::Uint(1), FmtArg::Uint(2), FmtArg::Zstr("ok")])?;
//! ctx.finalize()?;
//! let image = ctx.into_bytes().unwrap();
//!
//! let mut loaded = Context::load_bytes(&image)?;
//! let block = loaded.get_block("compiler")?;
//! let (mut a, mut b) = (0u64, 0u64);
//! let mut tag = String::new();
//! block.loadf(
//!     "[u,u]z",
//!     &mut [FmtOut::Uint(&mut a), FmtOut::Uint(&mut b), FmtOut::Zstr(&mut tag)],
//! )?;
//! assert_eq!((a, b, tag.as_str()), (1, 2, "ok"));
//! # Ok::<(), camd::MdError>(())
//! ```

use std::ffi::c_void;
use std::ptr;

use serde::Serialize;

use crate::container::{self, BlockRecord, ContainerHeader};
use crate::error::MdError;
use crate::hooks::{BufferHooks, HookAdapter, MdHooks};
use crate::stack::Stack;
use crate::wire::{get_codec, pack_flags, Endianness};

/// Header fields of a loaded container, for inspection and reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub endianness:        &'static str,
    pub version:           u8,
    pub block_list_offset: u32,
    pub n_blocks:          u32,
    pub image_len:         usize,
}

/// One loaded block's table entry, for inspection and reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BlockSummary {
    pub name:     String,
    pub offset:   u64,
    pub size:     u64,
    pub name_idx: u32,
    pub flags:    u32,
    pub format:   &'static str,
    pub encoding: &'static str,
}

#[derive(Debug)]
enum Mode {
    Build {
        blocks: Vec<Stack>,
    },
    Loaded {
        image:   Vec<u8>,
        header:  ContainerHeader,
        entries: Vec<LoadedBlock>,
    },
}

#[derive(Debug)]
struct LoadedBlock {
    record: BlockRecord,
    stack:  Option<Stack>,
}

/// Owner of a set of named blocks and of the hooks that move their bytes.
#[derive(Debug)]
pub struct Context {
    adapter:   HookAdapter,
    sink:      Option<BufferHooks>,
    endian:    Endianness,
    finalized: bool,
    mode:      Mode,
}

impl Context {
    /// Builder backed by an internal in-memory sink; retrieve the finished
    /// image with [`Context::into_bytes`] after [`Context::finalize`].
    pub fn new() -> Self {
        let sink = BufferHooks::new();
        let adapter = HookAdapter::new(sink.vtable(), sink.userdata());
        Context {
            adapter,
            sink: Some(sink),
            endian: Endianness::Little,
            finalized: false,
            mode: Mode::Build { blocks: Vec::new() },
        }
    }

    /// Builder streaming its output through a caller-supplied hook set.
    ///
    /// The vtable entries must uphold the contracts documented on
    /// [`MdHooks`]; `userdata` must stay valid for the context's lifetime.
    pub fn with_hooks(hooks: MdHooks, userdata: *mut c_void) -> Self {
        Context {
            adapter: HookAdapter::new(hooks, userdata),
            sink: None,
            endian: Endianness::Little,
            finalized: false,
            mode: Mode::Build { blocks: Vec::new() },
        }
    }

    /// Load an existing container through the `map` hook.
    ///
    /// The mapped image is copied and fully table-validated before this
    /// returns; the mapping may be released afterwards. All-or-nothing: any
    /// structural defect fails the load.
    pub fn load(hooks: MdHooks, userdata: *mut c_void) -> Result<Self, MdError> {
        let adapter = HookAdapter::new(hooks, userdata);
        let image = adapter.map_source()?.to_vec();
        Self::from_image(adapter, image)
    }

    /// Load an existing container from a byte slice.
    pub fn load_bytes(image: &[u8]) -> Result<Self, MdError> {
        let adapter = HookAdapter::new(MdHooks::none(), ptr::null_mut());
        Self::from_image(adapter, image.to_vec())
    }

    fn from_image(adapter: HookAdapter, image: Vec<u8>) -> Result<Self, MdError> {
        let (header, records) = container::decode(&image)?;
        log::debug!(
            "loaded container: {} blocks, {} bytes, {} endian",
            records.len(),
            image.len(),
            header.endian.name(),
        );
        let entries = records
            .into_iter()
            .map(|record| LoadedBlock { record, stack: None })
            .collect();
        Ok(Context {
            adapter,
            sink: None,
            endian: header.endian,
            finalized: true,
            mode: Mode::Loaded { image, header, entries },
        })
    }

    // ── Block management ────────────────────────────────────────────────────

    /// Create an empty block. Fails with [`MdError::DuplicateBlock`] when
    /// the name is taken.
    pub fn create_block(&mut self, name: &str) -> Result<&mut Stack, MdError> {
        self.ensure_building()?;
        if name.bytes().any(|b| b == 0) {
            return Err(MdError::NameTable("block name contains NUL".to_string()));
        }
        let blocks = match &mut self.mode {
            Mode::Build { blocks } => blocks,
            Mode::Loaded { .. } => return Err(MdError::StackFinalized),
        };
        if blocks.iter().any(|b| b.name() == name) {
            return Err(MdError::DuplicateBlock(name.to_string()));
        }
        log::debug!("created block '{name}'");
        blocks.push(Stack::new(name));
        blocks
            .last_mut()
            .ok_or_else(|| MdError::UnknownBlock(name.to_string()))
    }

    /// Look up a block by name.
    ///
    /// On a loaded context the first access parses the block's payload with
    /// its recorded wire codec; later accesses return the same stack.
    pub fn get_block(&mut self, name: &str) -> Result<&mut Stack, MdError> {
        match &mut self.mode {
            Mode::Build { blocks } => blocks
                .iter_mut()
                .find(|b| b.name() == name)
                .ok_or_else(|| MdError::UnknownBlock(name.to_string())),
            Mode::Loaded { image, entries, .. } => {
                let entry = entries
                    .iter_mut()
                    .find(|e| e.record.name == name)
                    .ok_or_else(|| MdError::UnknownBlock(name.to_string()))?;
                if entry.stack.is_none() {
                    let start = entry.record.offset as usize;
                    let payload = &image[start..start + entry.record.size as usize];
                    let stack = get_codec(entry.record.format).decode(
                        &entry.record.name,
                        entry.record.encoding,
                        payload,
                    )?;
                    log::debug!(
                        "decoded block '{}': {} payload bytes, {} format",
                        entry.record.name,
                        payload.len(),
                        entry.record.format.name(),
                    );
                    entry.stack = Some(stack);
                }
                entry
                    .stack
                    .as_mut()
                    .ok_or_else(|| MdError::UnknownBlock(name.to_string()))
            }
        }
    }

    // ── Serialization ───────────────────────────────────────────────────────

    /// Freeze every block and stream the container image out.
    ///
    /// Unfinalized blocks are finalized first. The image goes through the
    /// `write` hook in chunks, then `finalize` fires exactly once. One-way:
    /// afterwards the context rejects every mutator.
    pub fn finalize(&mut self) -> Result<(), MdError> {
        self.ensure_building()?;
        let blocks = match &mut self.mode {
            Mode::Build { blocks } => blocks,
            Mode::Loaded { .. } => return Err(MdError::StackFinalized),
        };
        for stack in blocks.iter_mut() {
            if !stack.is_finalized() {
                stack.mark_finalized();
            }
        }

        let mut payloads = Vec::with_capacity(blocks.len());
        for stack in blocks.iter() {
            payloads.push(get_codec(stack.out_fmt()).encode(stack, self.endian)?);
        }
        let encoded: Vec<container::EncodedBlock<'_>> = blocks
            .iter()
            .zip(&payloads)
            .map(|(stack, payload)| container::EncodedBlock {
                name:    stack.name(),
                payload,
                flags:   pack_flags(stack.out_fmt(), self.endian),
            })
            .collect();

        let total = container::encoded_size(&encoded)?;
        let mut staging = self.adapter.allocate(total)?;
        container::encode_into(&encoded, self.endian, staging.as_mut_slice())?;
        self.adapter.write_all(staging.as_slice())?;
        self.adapter.finish()?;

        log::debug!(
            "context finalized: {} blocks, {total} byte image, {} endian",
            encoded.len(),
            self.endian.name(),
        );
        self.finalized = true;
        Ok(())
    }

    /// Take the finished image out of a self-sinking context
    /// ([`Context::new`]). `None` when output went to caller hooks.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        self.sink.map(BufferHooks::into_bytes)
    }

    // ── Configuration and inspection ────────────────────────────────────────

    /// Byte order for the container tables and raw-format payloads.
    /// Defaults to little-endian.
    pub fn set_endianness(&mut self, endian: Endianness) -> Result<(), MdError> {
        self.ensure_building()?;
        self.endian = endian;
        Ok(())
    }

    #[inline]
    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn block_count(&self) -> usize {
        match &self.mode {
            Mode::Build { blocks } => blocks.len(),
            Mode::Loaded { entries, .. } => entries.len(),
        }
    }

    /// Block names in table order (creation order for builders).
    pub fn block_names(&self) -> Vec<&str> {
        match &self.mode {
            Mode::Build { blocks } => blocks.iter().map(Stack::name).collect(),
            Mode::Loaded { entries, .. } => {
                entries.iter().map(|e| e.record.name.as_str()).collect()
            }
        }
    }

    /// Header fields of a loaded container; `None` while building.
    pub fn info(&self) -> Option<ContainerInfo> {
        match &self.mode {
            Mode::Build { .. } => None,
            Mode::Loaded { image, header, .. } => Some(ContainerInfo {
                endianness:        header.endian.name(),
                version:           header.version,
                block_list_offset: header.block_list_offset,
                n_blocks:          header.n_blocks,
                image_len:         image.len(),
            }),
        }
    }

    /// Table entries of a loaded container; `None` while building.
    pub fn summaries(&self) -> Option<Vec<BlockSummary>> {
        match &self.mode {
            Mode::Build { .. } => None,
            Mode::Loaded { entries, .. } => Some(
                entries
                    .iter()
                    .map(|e| BlockSummary {
                        name:     e.record.name.clone(),
                        offset:   e.record.offset,
                        size:     e.record.size,
                        name_idx: e.record.name_idx,
                        flags:    e.record.flags,
                        format:   e.record.format.name(),
                        encoding: e.record.encoding.name(),
                    })
                    .collect(),
            ),
        }
    }

    /// Serialized payload bytes of one loaded block, before any decoding.
    /// `None` while building or for an unknown name.
    pub fn block_payload(&self, name: &str) -> Option<&[u8]> {
        match &self.mode {
            Mode::Build { .. } => None,
            Mode::Loaded { image, entries, .. } => {
                let e = entries.iter().find(|e| e.record.name == name)?;
                let start = e.record.offset as usize;
                Some(&image[start..start + e.record.size as usize])
            }
        }
    }

    fn ensure_building(&self) -> Result<(), MdError> {
        if self.finalized {
            Err(MdError::StackFinalized)
        } else {
            Ok(())
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fmtstr::{FmtArg, FmtOut};
    use crate::wire::WireFormat;

    fn two_block_image(endian: Endianness) -> Vec<u8> {
        let mut ctx = Context::new();
        ctx.set_endianness(endian).unwrap();

        let compiler = ctx.create_block("compiler").unwrap();
        compiler
            .pushf(
                "uz",
                &[FmtArg::Uint(42), FmtArg::Zstr("target=riscv64")],
            )
            .unwrap();

        let host = ctx.create_block("host").unwrap();
        host.set_out_fmt(WireFormat::Raw).unwrap();
        host.push_sint(-191).unwrap();
        host.push_real(3.141_592_654).unwrap();

        ctx.finalize().unwrap();
        ctx.into_bytes().unwrap()
    }

    #[test]
    fn build_load_round_trip_both_endians() {
        for endian in [Endianness::Little, Endianness::Big] {
            let image = two_block_image(endian);
            let mut ctx = Context::load_bytes(&image).unwrap();
            assert_eq!(ctx.endianness(), endian);
            assert_eq!(ctx.block_names(), vec!["compiler", "host"]);

            let compiler = ctx.get_block("compiler").unwrap();
            let mut version = 0u64;
            let mut triple = String::new();
            compiler
                .loadf("uz", &mut [FmtOut::Uint(&mut version), FmtOut::Zstr(&mut triple)])
                .unwrap();
            assert_eq!(version, 42);
            assert_eq!(triple, "target=riscv64");

            let host = ctx.get_block("host").unwrap();
            let mut level = 0i64;
            let mut pi = 0f64;
            host.loadf("if", &mut [FmtOut::Sint(&mut level), FmtOut::Real(&mut pi)])
                .unwrap();
            assert_eq!(level, -191);
            assert_eq!(pi, 3.141_592_654);
        }
    }

    #[test]
    fn create_block_rejects_duplicates_and_nul_names() {
        let mut ctx = Context::new();
        ctx.create_block("compiler").unwrap();
        assert_eq!(
            ctx.create_block("compiler").unwrap_err(),
            MdError::DuplicateBlock("compiler".to_string()),
        );
        assert!(matches!(
            ctx.create_block("bad\0name"),
            Err(MdError::NameTable(_))
        ));
    }

    #[test]
    fn get_block_unknown_name() {
        let mut ctx = Context::new();
        assert_eq!(
            ctx.get_block("absent").unwrap_err(),
            MdError::UnknownBlock("absent".to_string()),
        );
    }

    #[test]
    fn finalize_freezes_the_context() {
        let mut ctx = Context::new();
        ctx.create_block("compiler").unwrap().push_uint(1).unwrap();
        ctx.finalize().unwrap();
        assert!(ctx.is_finalized());

        assert_eq!(ctx.create_block("late").unwrap_err(), MdError::StackFinalized);
        assert_eq!(ctx.finalize().unwrap_err(), MdError::StackFinalized);
        assert_eq!(
            ctx.set_endianness(Endianness::Big).unwrap_err(),
            MdError::StackFinalized,
        );
        // Reads survive the freeze.
        assert_eq!(ctx.block_count(), 1);
    }

    #[test]
    fn finalize_marks_unfinalized_blocks() {
        let mut ctx = Context::new();
        ctx.create_block("compiler").unwrap().push_uint(1).unwrap();
        ctx.finalize().unwrap();

        let image = ctx.into_bytes().unwrap();
        let mut loaded = Context::load_bytes(&image).unwrap();
        assert!(loaded.get_block("compiler").unwrap().is_finalized());
    }

    #[test]
    fn loaded_contexts_are_read_only() {
        let image = two_block_image(Endianness::Little);
        let mut ctx = Context::load_bytes(&image).unwrap();
        assert!(ctx.is_finalized());

        assert_eq!(ctx.create_block("extra").unwrap_err(), MdError::StackFinalized);
        assert_eq!(ctx.finalize().unwrap_err(), MdError::StackFinalized);

        let block = ctx.get_block("compiler").unwrap();
        assert_eq!(block.push_uint(9).unwrap_err(), MdError::StackFinalized);
    }

    #[test]
    fn caller_hooks_observe_the_protocol() {
        let buf = BufferHooks::new();
        let mut ctx = Context::with_hooks(buf.vtable(), buf.userdata());
        ctx.create_block("compiler").unwrap().push_uint(7).unwrap();
        ctx.finalize().unwrap();

        assert!(buf.is_finalized());
        assert_eq!(buf.write_calls(), 1);
        assert_eq!(buf.finalize_calls(), 1);
        assert_eq!(buf.live_allocs(), 0);
        assert!(ctx.into_bytes().is_none());

        let mut loaded = Context::load_bytes(buf.bytes()).unwrap();
        assert_eq!(loaded.get_block("compiler").unwrap().len(), 1);
    }

    #[test]
    fn load_reads_through_the_map_hook() {
        let image = two_block_image(Endianness::Little);
        let src = BufferHooks::with_source(image);
        let mut ctx = Context::load(src.vtable(), src.userdata()).unwrap();
        assert_eq!(ctx.block_count(), 2);
        assert!(ctx.get_block("host").is_ok());
    }

    #[test]
    fn summaries_expose_the_table() {
        let image = two_block_image(Endianness::Little);
        let ctx = Context::load_bytes(&image).unwrap();

        let info = ctx.info().unwrap();
        assert_eq!(info.endianness, "little");
        assert_eq!(info.version, 1);
        assert_eq!(info.n_blocks, 2);
        assert_eq!(info.image_len, image.len());

        let summaries = ctx.summaries().unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].name, "compiler");
        assert_eq!(summaries[0].name_idx, 0);
        assert_eq!(summaries[0].format, "msgpack");
        assert_eq!(summaries[0].flags, 0x0104);
        assert_eq!(summaries[1].name, "host");
        assert_eq!(summaries[1].name_idx, 9);
        assert_eq!(summaries[1].format, "raw");

        let payload = ctx.block_payload("host").unwrap();
        assert_eq!(payload.len() as u64, summaries[1].size);

        // Builders have no table yet.
        assert!(Context::new().info().is_none());
        assert!(Context::new().summaries().is_none());
    }

    #[test]
    fn empty_context_serializes_to_a_bare_header() {
        let mut ctx = Context::new();
        ctx.finalize().unwrap();
        let image = ctx.into_bytes().unwrap();
        assert_eq!(image.len(), 16);

        let ctx = Context::load_bytes(&image).unwrap();
        assert_eq!(ctx.block_count(), 0);
    }
}
