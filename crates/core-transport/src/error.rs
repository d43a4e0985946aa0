//! Transport and dialog error taxonomy.
//!
//! Every fallible call in this crate returns `MvlcError`. Higher layers
//! classify errors through `category()` instead of matching on the concrete
//! variant; the category set is closed.

use std::io;

use core_proto::frame::FrameFlags;
use thiserror::Error;

/// Higher-level classification of transport and dialog errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Connection,
    Io,
    Timeout,
    ShortTransfer,
    Protocol,
    Vme,
}

#[derive(Debug, Error)]
pub enum MvlcError {
    #[error("already connected")]
    IsConnected,

    #[error("not connected")]
    IsDisconnected,

    #[error("empty hostname")]
    EmptyHostname,

    #[error("host lookup failed for {host}")]
    HostLookup { host: String },

    #[error("could not bind two consecutive local UDP ports")]
    BindLocal,

    #[error("controller is in use: stack triggers are active")]
    InUse,

    #[error("invalid pipe")]
    InvalidPipe,

    #[error("read timed out")]
    ReadTimeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("short write: {transferred} of {expected} bytes")]
    ShortWrite { transferred: usize, expected: usize },

    #[error("short read: {transferred} of {expected} bytes")]
    ShortRead { transferred: usize, expected: usize },

    #[error("packet channel {0} out of range")]
    PacketChannelOutOfRange(u8),

    #[error("no response received")]
    NoResponseReceived,

    #[error("invalid buffer header 0x{0:08x}")]
    InvalidBufferHeader(u32),

    #[error("unexpected response size: wanted {wanted} words, got {got}")]
    UnexpectedResponseSize { wanted: usize, got: usize },

    #[error("mirror request is empty")]
    MirrorEmptyRequest,

    #[error("mirror response is empty")]
    MirrorEmptyResponse,

    #[error("mirror response shorter than the request")]
    MirrorShortResponse,

    #[error("mirror response differs from request at word {index}")]
    MirrorNotEqual { index: usize },

    #[error("stack frame signals {flags:?}")]
    StackFrameError { flags: FrameFlags },

    #[error("no VME response")]
    NoVmeResponse,

    #[error("stack of {words} words exceeds the stack memory area")]
    StackMemoryExceeded { words: usize },

    #[error("command argument out of range")]
    CommandArgOutOfRange,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl MvlcError {
    pub fn category(&self) -> ErrorCategory {
        use MvlcError::*;

        match self {
            IsConnected | IsDisconnected | EmptyHostname | HostLookup { .. } | BindLocal
            | InUse | InvalidPipe => ErrorCategory::Connection,

            ReadTimeout | WriteTimeout => ErrorCategory::Timeout,

            ShortWrite { .. } | ShortRead { .. } => ErrorCategory::ShortTransfer,

            PacketChannelOutOfRange(_)
            | NoResponseReceived
            | InvalidBufferHeader(_)
            | UnexpectedResponseSize { .. }
            | MirrorEmptyRequest
            | MirrorEmptyResponse
            | MirrorShortResponse
            | MirrorNotEqual { .. }
            | StackMemoryExceeded { .. }
            | CommandArgOutOfRange => ErrorCategory::Protocol,

            StackFrameError { .. } | NoVmeResponse => ErrorCategory::Vme,

            Io(_) => ErrorCategory::Io,
        }
    }

    /// Timeouts on reads with an empty receive buffer are non-fatal; the
    /// readout loop keeps polling until the stop flag is raised.
    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }
}

/// Maps an I/O error from a socket or bulk-device call, turning timeout
/// kinds into the dedicated timeout variants.
pub(crate) fn map_read_io(e: io::Error) -> MvlcError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => MvlcError::ReadTimeout,
        _ => MvlcError::Io(e),
    }
}

pub(crate) fn map_write_io(e: io::Error) -> MvlcError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => MvlcError::WriteTimeout,
        _ => MvlcError::Io(e),
    }
}
