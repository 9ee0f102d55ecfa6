use thiserror::Error;

/// Unified error taxonomy for the metadata engine.
///
/// Every fallible operation returns one of these codes instead of panicking.
/// Composite operations (`pushf`, whole-container decode) are all-or-nothing:
/// on failure, previously committed state is left untouched.
#[derive(Error, Debug, PartialEq)]
pub enum MdError {
    /// The allocation hook returned null, or an internal size computation
    /// overflowed while sizing a hook allocation.
    #[error("Allocation failed (out of memory)")]
    OutOfMemory,

    /// A mutating operation was applied to a finalized stack or context.
    #[error("Stack is finalized")]
    StackFinalized,

    /// `pop`/`top` on an empty stack, an empty format string, or a format
    /// string describing more top-level values than the stack holds.
    #[error("Empty stack")]
    EmptyStack,

    /// An operation was applied to the wrong value kind.
    #[error("Type error: expected {expected}, found {found}")]
    TypeErr { expected: String, found: String },

    /// A hashtable key slot holds a container value.
    #[error("Hash key must be a scalar value, found {found}")]
    KeyErr { found: String },

    /// A stack index is out of range, or a container/element ordering rule
    /// was violated.
    #[error("Bad stack index {index}: {reason}")]
    IndexErr { index: u32, reason: &'static str },

    /// Malformed format-string grammar, or an argument list whose arity does
    /// not match the format.
    #[error("Invalid format string at byte {pos}: {reason}")]
    InvalidFmtStr { pos: usize, reason: String },

    /// The packed format/encoding value in a block-info entry is not a
    /// recognized combination.
    #[error("Invalid block flags {flags:#010x}")]
    InvalidFlags { flags: u32 },

    /// The container does not start with the `CAMD` magic bytes.
    #[error("Invalid magic number")]
    BadMagic,

    /// The header endianness byte is neither little (1) nor big (2).
    #[error("Invalid endianness byte {0:#04x}")]
    BadEndianByte(u8),

    /// The header version byte is not one this build can decode.
    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u8),

    /// The supplied buffer ends before a declared structure does.
    #[error("Truncated container: need {needed} bytes, only {available} available")]
    Truncated { needed: usize, available: usize },

    /// A block-info entry declares a payload range outside the buffer.
    #[error("Block '{name}': range {offset}+{size} exceeds the {available}-byte container")]
    BlockBounds {
        name: String,
        offset: u64,
        size: u64,
        available: u64,
    },

    /// A block name could not be resolved from the name string table.
    #[error("Name table error: {0}")]
    NameTable(String),

    /// A block payload is not decodable under its declared wire format.
    #[error("Wire decode error: {0}")]
    WireDecode(String),

    /// A string, byte string, or container holds more items than the wire
    /// format's length fields can describe.
    #[error("{kind} of length {len} exceeds the wire format's u32 limit")]
    Oversize { kind: &'static str, len: usize },

    /// `create_block` with a name that already exists.
    #[error("Duplicate block name '{0}'")]
    DuplicateBlock(String),

    /// `get_block` with a name that does not exist.
    #[error("No block named '{0}'")]
    UnknownBlock(String),

    /// A caller-supplied hook is missing or reported failure.
    /// `status` is the raw hook return code; see [`crate::hooks::status`].
    #[error("Hook '{hook}' failed with status {status}")]
    HookErr { hook: &'static str, status: i32 },
}
