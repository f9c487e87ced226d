//! Completion bridge: single-shot engine callbacks as awaitable futures.
//!
//! The engine reports the outcome of every asynchronous call by invoking a
//! callback exactly once, on a thread of its choosing. This module turns that
//! into a [`Completion`] the caller can `.await`:
//!
//! ```text
//! facade ──issue()──► CompletionRegistry ──token──► binding ──► engine
//!    ▲                  (token → closure)              │          │
//!    │                                                 │◄─────────┘ callback(args)
//!    └──── Completion ◄── oneshot ◄── closure ◄── complete(token, args)
//! ```
//!
//! The registry entry owns the closure, so the closure stays alive for
//! exactly as long as the call is outstanding, whether or not anyone is still
//! awaiting the result. The binding decides how a callback is matched back to
//! its [`CallToken`]; the engine's callbacks themselves carry no context.

mod completion;
mod registry;

pub use completion::Completion;
pub use registry::CompletionRegistry;

use std::ptr;

use crate::error::BridgeError;
use crate::ffi::RawHandle;

/// Identifies one outstanding engine call. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallToken(usize);

impl CallToken {
    pub(crate) fn new(id: usize) -> Self {
        Self(id)
    }

    /// Numeric value of the token.
    pub fn id(self) -> usize {
        self.0
    }
}

/// Raw arguments of one engine callback.
///
/// Pointers are only valid for the duration of the callback.
#[derive(Debug, Clone, Copy)]
pub enum CallbackArgs {
    /// A call that produces a resource (initialize, open_archive).
    Resource { raw: RawHandle, status: u32 },
    /// A call with no payload (download_file).
    Status { status: u32 },
    /// A call that lends a byte buffer (get_file_bytes).
    Data {
        data: *const u8,
        len: usize,
        status: u32,
    },
}

impl CallbackArgs {
    /// The engine status code carried by the callback.
    pub fn status(&self) -> u32 {
        match self {
            Self::Resource { status, .. } | Self::Status { status } | Self::Data { status, .. } => {
                *status
            }
        }
    }

    /// The delivered resource, or null for callbacks that carry none.
    pub fn resource(&self) -> RawHandle {
        match self {
            Self::Resource { raw, .. } => *raw,
            _ => ptr::null_mut(),
        }
    }

    /// The lent buffer as `(pointer, length)`; `(null, 0)` if none.
    pub fn data(&self) -> (*const u8, usize) {
        match self {
            Self::Data { data, len, .. } => (*data, *len),
            _ => (ptr::null(), 0),
        }
    }
}

/// How an outstanding call ended.
pub(crate) enum Resolution {
    /// The engine called back.
    Callback(CallbackArgs),
    /// The foreign call could not be started.
    NotStarted(BridgeError),
}
