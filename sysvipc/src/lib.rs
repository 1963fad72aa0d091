//! System V shared memory segments and counting semaphores.
//!
//! Cooperating processes agree on an integer [`Key`] out of band. One of them
//! creates a [`SharedSegment`] and a [`Semaphore`] under that key, the others
//! attach to them, and the semaphore orders their accesses to the memory:
//!
//! ```no_run
//! use sysvipc::{Mode, Semaphore, SharedSegment};
//!
//! const KEY: sysvipc::Key = 0x823;
//!
//! let sem = Semaphore::new(KEY, Mode::default())?;
//! let shm = SharedSegment::open(KEY, 4096, Mode::default())?;
//!
//! unsafe { shm.as_ptr().write_volatile(1) };
//! sem.release(1)?;
//! # Ok::<(), sysvipc::Error>(())
//! ```
//!
//! Kernel objects outlive the handles that refer to them. A segment is only
//! removed by [`SharedSegment::destroy`] or by dropping a handle built with
//! [`Disposal::Destroy`]; a semaphore only by [`Semaphore::destroy`].
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "unix")]
mod error;
pub mod mode;
pub mod os;
#[cfg(feature = "unix")]
pub mod sem;
#[cfg(feature = "unix")]
pub mod shm;
mod tests;

/// Identifier of an IPC object in the system-wide namespace (`key_t`).
pub type Key = i32;

/// Lets the kernel pick a fresh, unnamed object instead of looking one up.
pub const IPC_PRIVATE: Key = 0;

pub use mode::Mode;

#[cfg(feature = "unix")]
pub use self::{
    error::{Error, Result},
    sem::Semaphore,
    shm::{Disposal, DisposeHook, Permissions, SegmentStats, SharedSegment},
};
