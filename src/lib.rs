pub mod context;
pub mod error;
pub mod fmtstr;
pub mod hooks;
pub mod stack;
pub mod value;
pub mod wire;

mod container;

pub use context::{BlockSummary, ContainerInfo, Context};
pub use error::MdError;
pub use fmtstr::{FmtArg, FmtOut};
pub use hooks::{BufferHooks, MdHooks};
pub use stack::Stack;
pub use value::Value;
pub use wire::{get_codec, BlockCodec, Endianness, WireFormat};
