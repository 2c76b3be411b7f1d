//! Types shared between the Vali kernel and its userspace.
//!
//! Everything in here crosses the system call boundary, so the layouts are
//! kept plain: integer newtypes, flag sets and error codes.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod error;
pub mod flags;
pub mod ids;

pub use error::{OsError, OsResult, SleepResult};
pub use flags::{IoEvents, MutexFlags, ThreadFlags};
pub use ids::{CpuId, HandleId, HandleType, ThreadId};
