//! Client-side core of a read-only, HTTP-backed, content-addressed
//! caching filesystem (spec.md section 1).
//!
//! This crate is the engine an out-of-process kernel adapter (FUSE or
//! similar, excluded per spec.md section 1 "Out of scope") drives
//! through [`core::Fs123Core`]. It owns the layered backend pipeline
//! (HTTP client, disk cache, optional distributed peer cache), the
//! inode/attribute/symlink consistency layer, the open-file scanner,
//! and the ESTALE detection protocol described in spec.md sections
//! 4.1-4.4.

pub mod assembly;
pub mod attrcache;
pub mod backend;
pub mod config;
pub mod core;
pub mod dirchunk;
pub mod error;
pub mod hash;
pub mod inomap;
pub mod log_budget;
pub mod maintenance;
pub mod netstring;
pub mod openfilemap;
pub mod reply;
pub mod special;
pub mod stat;
pub mod stats;
pub mod symlinkcache;

pub use assembly::{assemble, spawn_background_tasks, Assembled, DistribTopology};
pub use config::CoreConfig;
pub use core::{DirListEntry, Fs123Core, KernelNotifier, NullNotifier, OpenHandle};
pub use error::{CoreError, Result};
pub use reply::{Req, Reply};
