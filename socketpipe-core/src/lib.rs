//! socketpipe-core
//!
//! Runtime-agnostic kernel shared by the socket-facing `socketpipe` crate:
//! - Segment-based, pool-backed, refcounted byte buffer (`segment`)
//! - Backpressured single-producer/single-consumer pipe (`pipe`)
//! - Reusable single-completion primitive (`completion`)
//! - Fixed-size worker thread pool with overflow spillover (`worker_pool`)
//! - Scheduler selection shared by the pipe and completion types (`scheduler`)
//! - First-writer-wins shutdown classification (`shutdown`)
//! - Error types (`error`)
//!
//! Everything outside `segment` is safe code; `segment` is the crate's one
//! carve-out for raw allocation, and is audited in isolation.

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod completion;
pub mod error;
pub mod pipe;
pub mod scheduler;
pub mod segment;
pub mod shutdown;
pub mod worker_pool;

pub mod prelude {
    pub use crate::completion::{AwaitableCompletion, IoCompletion};
    pub use crate::error::{Error, Result};
    pub use crate::pipe::{pipe, FlushResult, PipeOptions, PipeReader, PipeWriter, ReadResult};
    pub use crate::scheduler::Scheduler;
    pub use crate::segment::{BlockPool, BufferSequence, Position, SegmentBuffer};
    pub use crate::shutdown::{ShutdownKind, ShutdownState};
    pub use crate::worker_pool::WorkerPool;
}
