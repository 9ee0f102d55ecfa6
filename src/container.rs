//! Container image layout: the framing that carries serialized blocks.
//!
//! ```text
//! offset 0   ┌──────────────────────────────────────────────┐
//!            │ Header (16 bytes)                            │
//!            │   magic[4] = "CAMD"                          │
//!            │   endianness u8   (LITTLE=1, BIG=2)          │
//!            │   version    u8   (= 1)                      │
//!            │   pad[2]                                     │
//!            │   block_list_offset u32                      │
//!            │   n_blocks          u32                      │
//! offset 16  ├──────────────────────────────────────────────┤
//!            │ Name table: NUL-terminated names, back to    │
//!            │ back, padded to an 8-byte boundary           │
//!            ├──────────────────────────────────────────────┤ ← block_list_offset
//!            │ BlockInfo × n_blocks (24 bytes each)         │
//!            │   offset u64   (from image start)            │
//!            │   size   u64                                 │
//!            │   name_idx u32 (byte offset into name table) │
//!            │   flags    u32 (see `wire::pack_flags`)      │
//!            ├──────────────────────────────────────────────┤
//!            │ Payloads, creation order, each padded to 8   │
//!            └──────────────────────────────────────────────┘
//! ```
//!
//! The endianness byte governs every multi-byte field after it, the
//! header's own `u32` fields included. Decode validates the whole table
//! structure up front — magic, endianness, version, block-list bounds,
//! name resolution, flag words, payload bounds — without touching payload
//! bytes; payload parsing stays with the per-block wire codecs.

use crate::error::MdError;
use crate::wire::{unpack_flags, ByteReader, Endianness, WireFormat};

pub(crate) const MAGIC:          [u8; 4] = *b"CAMD";
pub(crate) const VERSION:        u8      = 1;
pub(crate) const HEADER_LEN:     usize   = 16;
pub(crate) const BLOCK_INFO_LEN: usize   = 24;
pub(crate) const ALIGN:          usize   = 8;

/// One block as handed to the encoder: payload already serialized by its
/// wire codec, flags already packed.
pub(crate) struct EncodedBlock<'a> {
    pub(crate) name:    &'a str,
    pub(crate) payload: &'a [u8],
    pub(crate) flags:   u32,
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContainerHeader {
    pub(crate) endian:            Endianness,
    pub(crate) version:           u8,
    pub(crate) block_list_offset: u32,
    pub(crate) n_blocks:          u32,
}

/// One fully validated BlockInfo entry with its name resolved.
///
/// `offset`/`size` are guaranteed in-bounds for the image the record was
/// decoded from.
#[derive(Debug, Clone)]
pub(crate) struct BlockRecord {
    pub(crate) name:     String,
    pub(crate) offset:   u64,
    pub(crate) size:     u64,
    pub(crate) name_idx: u32,
    pub(crate) flags:    u32,
    pub(crate) format:   WireFormat,
    pub(crate) encoding: Endianness,
}

#[inline]
fn align_up(n: usize) -> Option<usize> {
    Some(n.checked_add(ALIGN - 1)? & !(ALIGN - 1))
}

// ── Encode ───────────────────────────────────────────────────────────────────

struct ImageLayout {
    name_offsets:      Vec<u32>,
    block_list_offset: usize,
    payload_offsets:   Vec<u64>,
    total:             usize,
}

fn layout(blocks: &[EncodedBlock<'_>]) -> Result<ImageLayout, MdError> {
    if blocks.len() > u32::MAX as usize {
        return Err(MdError::Oversize { kind: "block table", len: blocks.len() });
    }

    let mut name_offsets = Vec::with_capacity(blocks.len());
    let mut names_len: usize = 0;
    for block in blocks {
        name_offsets.push(names_len as u32);
        names_len = names_len
            .checked_add(block.name.len() + 1)
            .ok_or(MdError::OutOfMemory)?;
        if names_len > u32::MAX as usize {
            return Err(MdError::Oversize { kind: "name table", len: names_len });
        }
    }

    let table_len = align_up(names_len).ok_or(MdError::OutOfMemory)?;
    let block_list_offset = HEADER_LEN + table_len;
    if block_list_offset > u32::MAX as usize {
        return Err(MdError::Oversize { kind: "name table", len: names_len });
    }

    let infos_len = blocks
        .len()
        .checked_mul(BLOCK_INFO_LEN)
        .ok_or(MdError::OutOfMemory)?;
    let mut cursor = block_list_offset
        .checked_add(infos_len)
        .ok_or(MdError::OutOfMemory)?;

    let mut payload_offsets = Vec::with_capacity(blocks.len());
    for block in blocks {
        payload_offsets.push(cursor as u64);
        let padded = align_up(block.payload.len()).ok_or(MdError::OutOfMemory)?;
        cursor = cursor.checked_add(padded).ok_or(MdError::OutOfMemory)?;
    }

    Ok(ImageLayout { name_offsets, block_list_offset, payload_offsets, total: cursor })
}

/// Total image size for `blocks`, padding included.
pub(crate) fn encoded_size(blocks: &[EncodedBlock<'_>]) -> Result<usize, MdError> {
    layout(blocks).map(|l| l.total)
}

/// Write the full image into `image`, which must be zeroed and exactly
/// [`encoded_size`] bytes long. Padding and NUL terminators are never
/// written explicitly; they are the zeroes already there.
pub(crate) fn encode_into(
    blocks: &[EncodedBlock<'_>],
    endian: Endianness,
    image: &mut [u8],
) -> Result<(), MdError> {
    let layout = layout(blocks)?;
    debug_assert_eq!(image.len(), layout.total);

    image[..4].copy_from_slice(&MAGIC);
    image[4] = endian.byte();
    image[5] = VERSION;
    endian.write_u32(&mut image[8..12], layout.block_list_offset as u32);
    endian.write_u32(&mut image[12..16], blocks.len() as u32);

    for (block, &name_off) in blocks.iter().zip(&layout.name_offsets) {
        let at = HEADER_LEN + name_off as usize;
        image[at..at + block.name.len()].copy_from_slice(block.name.as_bytes());
    }

    for (i, block) in blocks.iter().enumerate() {
        let at = layout.block_list_offset + i * BLOCK_INFO_LEN;
        endian.write_u64(&mut image[at..at + 8], layout.payload_offsets[i]);
        endian.write_u64(&mut image[at + 8..at + 16], block.payload.len() as u64);
        endian.write_u32(&mut image[at + 16..at + 20], layout.name_offsets[i]);
        endian.write_u32(&mut image[at + 20..at + 24], block.flags);
    }

    for (block, &payload_off) in blocks.iter().zip(&layout.payload_offsets) {
        let at = payload_off as usize;
        image[at..at + block.payload.len()].copy_from_slice(block.payload);
    }
    Ok(())
}

// ── Decode ───────────────────────────────────────────────────────────────────

/// Validate a whole image and return its header plus one record per block.
///
/// All-or-nothing: any structural defect fails the decode and nothing of
/// the image is trusted afterwards.
pub(crate) fn decode(image: &[u8]) -> Result<(ContainerHeader, Vec<BlockRecord>), MdError> {
    if image.len() < HEADER_LEN {
        return Err(MdError::Truncated { needed: HEADER_LEN, available: image.len() });
    }
    if image[..4] != MAGIC {
        return Err(MdError::BadMagic);
    }
    let endian = Endianness::from_byte(image[4])?;
    let version = image[5];
    if version != VERSION {
        return Err(MdError::UnsupportedVersion(version));
    }

    let mut reader = ByteReader::new(image, endian);
    reader.seek(8)?;
    let block_list_offset = reader.u32()?;
    let n_blocks = reader.u32()?;

    let list_off = block_list_offset as usize;
    if list_off < HEADER_LEN {
        return Err(MdError::NameTable(
            "block list offset points inside the header".to_string(),
        ));
    }
    let list_end =
        list_off as u64 + u64::from(n_blocks) * BLOCK_INFO_LEN as u64;
    if list_end > image.len() as u64 {
        return Err(MdError::Truncated {
            needed:    list_end.min(usize::MAX as u64) as usize,
            available: image.len(),
        });
    }
    let table = &image[HEADER_LEN..list_off];

    reader.seek(list_off)?;
    let mut records = Vec::with_capacity(n_blocks as usize);
    for _ in 0..n_blocks {
        let offset = reader.u64()?;
        let size = reader.u64()?;
        let name_idx = reader.u32()?;
        let flags = reader.u32()?;

        let name = resolve_name(table, name_idx)?;
        let (format, encoding) = unpack_flags(flags)?;

        match offset.checked_add(size) {
            Some(end) if end <= image.len() as u64 => {}
            _ => {
                return Err(MdError::BlockBounds {
                    name,
                    offset,
                    size,
                    available: image.len() as u64,
                })
            }
        }
        if records.iter().any(|r: &BlockRecord| r.name == name) {
            return Err(MdError::DuplicateBlock(name));
        }

        records.push(BlockRecord { name, offset, size, name_idx, flags, format, encoding });
    }

    let header = ContainerHeader { endian, version, block_list_offset, n_blocks };
    Ok((header, records))
}

fn resolve_name(table: &[u8], name_idx: u32) -> Result<String, MdError> {
    let start = name_idx as usize;
    if start >= table.len() {
        return Err(MdError::NameTable(format!(
            "name offset {name_idx} is outside the {}-byte table",
            table.len()
        )));
    }
    let rest = &table[start..];
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| {
            MdError::NameTable(format!("name at offset {name_idx} is not NUL-terminated"))
        })?;
    let name = std::str::from_utf8(&rest[..end]).map_err(|_| {
        MdError::NameTable(format!("name at offset {name_idx} is not valid UTF-8"))
    })?;
    Ok(name.to_string())
}
