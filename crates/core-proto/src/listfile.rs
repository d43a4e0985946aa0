//! Listfile container format.
//!
//! A listfile begins with an 8-byte magic identifying the transport the data
//! was recorded from, followed by a stream of 32-bit little-endian words
//! identical to the on-wire framed data, interleaved with system events.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::system_event::{self, subtype};
use crate::ConnectionType;

pub const FILE_MAGIC_LEN: usize = 8;
pub const FILE_MAGIC_ETH: &[u8; 8] = b"MVLC_ETH";
pub const FILE_MAGIC_USB: &[u8; 8] = b"MVLC_USB";

#[derive(Debug, Error)]
pub enum ListfileError {
    #[error("unknown listfile magic {0:02x?}")]
    BadMagic([u8; FILE_MAGIC_LEN]),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn file_magic(connection: ConnectionType) -> &'static [u8; FILE_MAGIC_LEN] {
    match connection {
        ConnectionType::Eth => FILE_MAGIC_ETH,
        ConnectionType::Usb => FILE_MAGIC_USB,
    }
}

/// Reads and classifies the magic at the current stream position.
pub fn read_file_magic(reader: &mut impl Read) -> Result<ConnectionType, ListfileError> {
    let mut magic = [0u8; FILE_MAGIC_LEN];
    reader.read_exact(&mut magic)?;

    match &magic {
        FILE_MAGIC_ETH => Ok(ConnectionType::Eth),
        FILE_MAGIC_USB => Ok(ConnectionType::Usb),
        _ => Err(ListfileError::BadMagic(magic)),
    }
}

/// Sequential listfile writer. Raw readout words pass through unmodified;
/// system events get framed here.
pub struct ListfileWriter<W: Write> {
    writer: W,
    bytes_written: u64,
}

/// Maximum payload words of one system event frame part.
const MAX_PART_WORDS: usize = system_event::LENGTH_MASK as usize;

impl<W: Write> ListfileWriter<W> {
    /// Writes the magic for `connection` and returns the writer.
    pub fn new(mut writer: W, connection: ConnectionType) -> Result<Self, ListfileError> {
        let magic = file_magic(connection);
        writer.write_all(magic)?;

        let mut result = Self {
            writer,
            bytes_written: FILE_MAGIC_LEN as u64,
        };

        // The endian marker is the first word any reader sees.
        result.write_system_event(subtype::ENDIAN_MARKER, &[system_event::ENDIAN_MARKER_VALUE])?;

        Ok(result)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes raw on-wire words unmodified.
    pub fn write_words(&mut self, words: &[u32]) -> Result<(), ListfileError> {
        for &w in words {
            self.writer.write_all(&w.to_le_bytes())?;
        }
        self.bytes_written += (words.len() * 4) as u64;
        Ok(())
    }

    /// Frames `payload` as a system event of the given subtype, splitting
    /// into continuation parts if it exceeds the 13-bit length field.
    pub fn write_system_event(&mut self, sub: u8, payload: &[u32]) -> Result<(), ListfileError> {
        if payload.is_empty() {
            return self.write_words(&[system_event::make_header(sub, 0, false)]);
        }

        let mut chunks = payload.chunks(MAX_PART_WORDS).peekable();

        while let Some(chunk) = chunks.next() {
            let cont = chunks.peek().is_some();
            self.write_words(&[system_event::make_header(sub, chunk.len() as u16, cont)])?;
            self.write_words(chunk)?;
        }

        Ok(())
    }

    pub fn write_timestamp(&mut self, unix_seconds: u64) -> Result<(), ListfileError> {
        let lo = unix_seconds as u32;
        let hi = (unix_seconds >> 32) as u32;
        self.write_system_event(subtype::UNIX_TIMESTAMP, &[lo, hi])
    }

    pub fn write_pause(&mut self) -> Result<(), ListfileError> {
        self.write_system_event(subtype::PAUSE, &[])
    }

    pub fn write_resume(&mut self) -> Result<(), ListfileError> {
        self.write_system_event(subtype::RESUME, &[])
    }

    /// Terminates the stream. No further words should follow.
    pub fn write_end_of_file(&mut self) -> Result<(), ListfileError> {
        self.write_system_event(subtype::END_OF_FILE, &[])
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads one 32-bit word from the stream, `None` at a clean end of file.
pub fn read_word(reader: &mut impl Read) -> Result<Option<u32>, ListfileError> {
    let mut buf = [0u8; 4];

    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
