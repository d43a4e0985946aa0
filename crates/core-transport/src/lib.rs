//! Pipe I/O to the MVLC controller over USB bulk endpoints or dual UDP
//! sockets, plus the synchronous command dialog running on the command pipe.
//!
//! The `Transport` trait hides the two physical variants behind byte-level
//! `read`/`write` with per-pipe timeouts. Reads go through an internal
//! per-pipe staging buffer holding whatever remains of the last transport
//! unit (a datagram for Ethernet, a bulk chunk for USB); callers see a plain
//! byte stream.

pub mod dialog;
pub mod error;
pub mod eth;
pub mod packet;
pub mod stack;
pub mod superbuf;
pub mod usb;

pub use dialog::CommandDialog;
pub use error::{ErrorCategory, MvlcError};

use core_proto::{ConnectionType, Pipe};

/// Byte-level pipe I/O to the controller.
///
/// `read` fills as much of `dest` as the staging buffer and incoming
/// transport units allow. A timeout with part of the data already copied
/// returns `Ok(partial)`; a timeout with nothing read returns
/// `Err(MvlcError::ReadTimeout)`.
pub trait Transport: Send {
    fn connect(&mut self) -> Result<(), MvlcError>;
    fn disconnect(&mut self) -> Result<(), MvlcError>;
    fn is_connected(&self) -> bool;
    fn connection_type(&self) -> ConnectionType;

    fn write(&mut self, pipe: Pipe, data: &[u8]) -> Result<usize, MvlcError>;
    fn read(&mut self, pipe: Pipe, dest: &mut [u8]) -> Result<usize, MvlcError>;

    fn set_read_timeout(&mut self, pipe: Pipe, ms: u32) -> Result<(), MvlcError>;
    fn set_write_timeout(&mut self, pipe: Pipe, ms: u32) -> Result<(), MvlcError>;
    fn read_timeout(&self, pipe: Pipe) -> u32;
    fn write_timeout(&self, pipe: Pipe) -> u32;
}

/// Writes a word buffer as little-endian bytes, checking for short writes.
pub fn write_words(
    transport: &mut dyn Transport,
    pipe: Pipe,
    words: &[u32],
) -> Result<(), MvlcError> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for w in words {
        bytes.extend_from_slice(&w.to_le_bytes());
    }

    let transferred = transport.write(pipe, &bytes)?;

    if transferred != bytes.len() {
        return Err(MvlcError::ShortWrite {
            transferred,
            expected: bytes.len(),
        });
    }

    Ok(())
}

/// Reads exactly `count` words, returning `ShortRead` when the transport
/// cannot deliver them.
pub fn read_words(
    transport: &mut dyn Transport,
    pipe: Pipe,
    dest: &mut Vec<u32>,
    count: usize,
) -> Result<(), MvlcError> {
    let mut bytes = vec![0u8; count * 4];
    let transferred = transport.read(pipe, &mut bytes)?;

    if transferred != bytes.len() {
        return Err(MvlcError::ShortRead {
            transferred,
            expected: bytes.len(),
        });
    }

    dest.extend(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
    );

    Ok(())
}
