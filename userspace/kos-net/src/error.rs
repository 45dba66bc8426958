// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network error model. Every variant maps onto an errno for the syscall
//! surface; malformed input never leaves the stack as an error, it is counted
//! and dropped.

use kos_abi::Errno;
use thiserror::Error;

/// Result alias used across the stack.
pub type Result<T> = core::result::Result<T, NetError>;

/// Errors surfaced by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NetError {
    /// Bad argument, size or flag combination.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Packet failed header validation.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    /// Header or pseudo-header checksum mismatch.
    #[error("checksum mismatch")]
    Checksum,
    /// No route matches the destination.
    #[error("no route to network")]
    NoRoute,
    /// Next hop did not answer ARP.
    #[error("host unreachable")]
    HostUnreachable,
    /// Operation would block (pending ARP, empty queue).
    #[error("operation would block")]
    WouldBlock,
    /// Datagram exceeds the MTU with DF set.
    #[error("message too long")]
    MsgSize,
    /// Local address already bound.
    #[error("address in use")]
    AddrInUse,
    /// Address not local or ephemeral pool exhausted.
    #[error("address not available")]
    AddrNotAvail,
    /// Peer refused the connection.
    #[error("connection refused")]
    ConnRefused,
    /// Peer reset the connection.
    #[error("connection reset")]
    ConnReset,
    /// Connection aborted locally.
    #[error("connection aborted")]
    ConnAborted,
    /// Retransmissions or a wait deadline expired.
    #[error("timed out")]
    TimedOut,
    /// Socket is not connected.
    #[error("not connected")]
    NotConnected,
    /// Socket is already connected.
    #[error("already connected")]
    IsConnected,
    /// Queue or table full.
    #[error("no buffer space")]
    NoBufs,
    /// Handle refers to a closed socket.
    #[error("bad socket")]
    BadSocket,
    /// Operation not supported in this state or on this socket type.
    #[error("operation not supported")]
    NotSupported,
    /// A connect is already in progress.
    #[error("operation already in progress")]
    Already,
    /// Writing after the local side shut down.
    #[error("broken pipe")]
    Pipe,
    /// Unknown interface or table entry.
    #[error("not found")]
    NotFound,
    /// Entry already present.
    #[error("already exists")]
    Exists,
}

impl NetError {
    /// Errno for the syscall surface.
    pub const fn errno(self) -> Errno {
        match self {
            Self::Invalid(_) => Errno::EINVAL,
            Self::Malformed(_) | Self::Checksum => Errno::EPROTO,
            Self::NoRoute => Errno::ENOROUTE,
            Self::HostUnreachable => Errno::EHOSTUNREACH,
            Self::WouldBlock => Errno::EAGAIN,
            Self::MsgSize => Errno::EMSGSIZE,
            Self::AddrInUse => Errno::EADDRINUSE,
            Self::AddrNotAvail => Errno::EADDRNOTAVAIL,
            Self::ConnRefused => Errno::ECONNREFUSED,
            Self::ConnReset => Errno::ECONNRESET,
            Self::ConnAborted => Errno::ECONNABORTED,
            Self::TimedOut => Errno::ETIMEDOUT,
            Self::NotConnected => Errno::ENOTCONN,
            Self::IsConnected => Errno::EISCONN,
            Self::NoBufs => Errno::ENOBUFS,
            Self::BadSocket => Errno::EBADF,
            Self::NotSupported => Errno::EOPNOTSUPP,
            Self::Already => Errno::EALREADY,
            Self::Pipe => Errno::EPIPE,
            Self::NotFound => Errno::ENOENT,
            Self::Exists => Errno::EEXIST,
        }
    }

    /// Negative errno.
    pub const fn code(self) -> i32 {
        -self.errno().code()
    }
}

impl From<NetError> for Errno {
    fn from(err: NetError) -> Self {
        err.errno()
    }
}
