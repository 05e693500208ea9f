//! Master-level asynchronous requests: SII writes, raw register access and FoE transfers.
//!
//! These mirror the userspace tool surface: the application (or an ioctl-style shim above this
//! crate) queues a request, the master FSM picks it up between cyclic work and the caller polls
//! its state.

use crate::error::Error;
use crate::slave_config::{RequestDirection, RequestState};

/// Handle to a queued SII write request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SiiRequestHandle(pub(crate) usize);

/// Handle to a queued register access request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegRequestHandle(pub(crate) usize);

/// Handle to a queued FoE transfer request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FoeRequestHandle(pub(crate) usize);

/// A queued SII write: a run of words written starting at `word_offset`.
#[derive(Debug)]
pub(crate) struct SiiWriteRequest {
    /// Ring position of the target slave.
    pub position: u16,
    /// First word address to write.
    pub word_offset: u16,
    /// Words to write.
    pub words: Vec<u16>,
    /// Progress through `words`.
    pub pos: usize,
    /// Request state.
    pub state: RequestState,
}

/// A queued raw register access.
#[derive(Debug)]
pub(crate) struct RegRequest {
    /// Ring position of the target slave.
    pub position: u16,
    /// Physical memory address.
    pub address: u16,
    /// Write data, or the read buffer after completion.
    pub data: Vec<u8>,
    /// Number of bytes to transfer.
    pub length: usize,
    /// Transfer direction.
    pub direction: RequestDirection,
    /// Request state.
    pub state: RequestState,
}

/// A queued FoE file transfer.
#[derive(Debug)]
pub(crate) struct FoeRequest {
    /// Ring position of the target slave.
    pub position: u16,
    /// File name sent in the request header.
    pub file_name: String,
    /// Password field of the request header.
    pub password: u32,
    /// File contents: source for writes, result buffer for reads.
    pub data: Vec<u8>,
    /// Read size bound.
    pub max_size: usize,
    /// Transfer direction.
    pub direction: RequestDirection,
    /// Request state.
    pub state: RequestState,
    /// Failure detail of the last attempt.
    pub error: Option<Error>,
}
