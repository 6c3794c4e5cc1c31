// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy and request completion codes for the messaging core.

use thiserror::Error;

/// Library-surface error taxonomy.
///
/// Per-packet decode/validation failures do not produce these — they are
/// counted and dropped (the sender retransmits). These are returned from
/// synchronous calls (`open`, `register`, `connect`) and wrapped into
/// [`Status::Disconnected`] for asynchronous per-request failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("bad endpoint")]
    BadEndpoint,
    #[error("endpoint closed")]
    EndpointClosed,
    #[error("bad session")]
    BadSession,
    #[error("bad magic")]
    BadMagic,
    #[error("bad match mask")]
    BadMatchMask,
    #[error("bad matching for ctxid")]
    BadMatchingForCtxid,
    #[error("no system resources")]
    NoSystemResources,
    #[error("no resources")]
    NoResources,
    #[error("invalid argument")]
    InternalMiscEinval,
    #[error("no such device")]
    InternalMiscEnodev,
    #[error("unexpected errno")]
    InternalUnexpectedErrno,
    #[error("already initialized")]
    AlreadyInitialized,
    #[error("not initialized")]
    NotInitialized,
    #[error("bad library ABI")]
    BadLibAbi,
    #[error("bad kernel ABI")]
    BadKernelAbi,
    #[error("no driver")]
    NoDriver,
    #[error("cancel not supported")]
    CancelNotSupported,
    #[error("not supported with ctxids")]
    NotSupportedWithCtxid,
    #[error("not supported from within a handler")]
    NotSupportedInHandler,
    #[error("bad error code")]
    BadError,
    #[error("remote nack: {0}")]
    NackRemote(NackType),
    #[error("region id {0} unknown")]
    BadRegionId(u32),
    #[error("region table full")]
    RegionTableFull,
    #[error("pin failure: {0}")]
    PinFailure(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Reasons carried by a `nack-lib` packet (§6 wire body), and by the
/// symmetric `nack-mcp` class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackType {
    BadEndpoint,
    EndpointClosed,
    BadSession,
    BadRdmaId,
    BadRdmaSeqnum,
    BadRdmaOffset,
}

impl std::fmt::Display for NackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NackType::BadEndpoint => "bad-endpoint",
            NackType::EndpointClosed => "endpoint-closed",
            NackType::BadSession => "bad-session",
            NackType::BadRdmaId => "bad-rdma-id",
            NackType::BadRdmaSeqnum => "bad-rdma-seqnum",
            NackType::BadRdmaOffset => "bad-rdma-offset",
        };
        f.write_str(s)
    }
}

impl NackType {
    pub fn wire_code(self) -> u8 {
        match self {
            NackType::BadEndpoint => 0,
            NackType::EndpointClosed => 1,
            NackType::BadSession => 2,
            NackType::BadRdmaId => 3,
            NackType::BadRdmaSeqnum => 4,
            NackType::BadRdmaOffset => 5,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => NackType::BadEndpoint,
            1 => NackType::EndpointClosed,
            2 => NackType::BadSession,
            3 => NackType::BadRdmaId,
            4 => NackType::BadRdmaSeqnum,
            5 => NackType::BadRdmaOffset,
            _ => return None,
        })
    }
}

/// Terminal completion code of a [`crate::request::Request`].
///
/// Populated on the request's `status` when it moves to `done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    Truncated,
    Cancelled,
    Aborted,
    Timeout,
    Disconnected(Error),
    Nack(NackType),
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::Truncated)
    }
}
