// Shared asynchronous I/O engine
// Generation-stamped handles, request merging, and pluggable kernel/worker/signal/IOCP providers.

pub mod backend;
pub mod bounce;
pub mod callbacks;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod handle;
pub mod metrics;
pub mod provider;
pub mod ring;
pub mod slab;
pub mod staging;
pub mod submission;

pub use config::{AioBackend, AioConfig};
pub use engine::{AioEngine, EngineHooks};
pub use error::{AioError, Result};
pub use handle::{Handle, OpKind, ReadMode, Reference, RelationTag};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
