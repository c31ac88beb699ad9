// src/lib.rs
pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod mmap;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod slab;
pub mod syscalls;
pub mod timer;

// Re-exports for users
pub use buffer::ByteBuffer;
pub use config::{ServerConfig, TriggerMode};
pub use error::{ServerError, ServerResult};
pub use http::Request;
pub use parser::{HttpParser, ParseError, ParseStatus};
pub use pool::WorkerPool;
pub use reactor::{Reactor, ShutdownHandle};
pub use response::Response;
pub use timer::TimerHeap;
