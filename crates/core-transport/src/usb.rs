//! USB transport: one bulk IN/OUT endpoint pair per pipe.
//!
//! The vendor driver delivers arbitrary chunks of up to 1 MiB per read with
//! no packet-level framing; frame headers are embedded in the stream only.
//! The low-level endpoint access is behind the `BulkDevice` trait so the
//! driver binding stays outside this crate; the transport contributes the
//! per-pipe staging buffers and the byte-stream semantics on top.

use std::io;

use core_proto::usb::SINGLE_TRANSFER_MAX_BYTES;
use core_proto::{ConnectionType, Pipe, DEFAULT_READ_TIMEOUT_MS, DEFAULT_WRITE_TIMEOUT_MS, PIPE_COUNT};
use tracing::{debug, trace};

use crate::error::{map_read_io, map_write_io, MvlcError};
use crate::Transport;

/// Low-level bulk endpoint access as exposed by the device driver.
///
/// `read_chunk` may return any number of bytes up to the destination size;
/// a timeout with no data surfaces as an `io::ErrorKind::TimedOut` /
/// `WouldBlock` error.
pub trait BulkDevice: Send {
    fn open(&mut self) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
    fn read_chunk(&mut self, pipe: Pipe, dest: &mut [u8], timeout_ms: u32) -> io::Result<usize>;
    fn write_chunk(&mut self, pipe: Pipe, data: &[u8], timeout_ms: u32) -> io::Result<usize>;
}

struct ReadBuffer {
    mem: Vec<u8>,
    first: usize,
    last: usize,
}

impl ReadBuffer {
    fn new() -> Self {
        Self {
            mem: vec![0u8; SINGLE_TRANSFER_MAX_BYTES],
            first: 0,
            last: 0,
        }
    }

    fn size(&self) -> usize {
        self.last - self.first
    }

    fn copy_out(&mut self, dest: &mut [u8]) -> usize {
        let n = self.size().min(dest.len());
        dest[..n].copy_from_slice(&self.mem[self.first..self.first + n]);
        self.first += n;
        n
    }
}

pub struct UsbTransport<D: BulkDevice> {
    device: D,
    connected: bool,
    read_timeouts_ms: [u32; PIPE_COUNT],
    write_timeouts_ms: [u32; PIPE_COUNT],
    read_buffers: [ReadBuffer; PIPE_COUNT],
}

impl<D: BulkDevice> UsbTransport<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            connected: false,
            read_timeouts_ms: [DEFAULT_READ_TIMEOUT_MS; PIPE_COUNT],
            write_timeouts_ms: [DEFAULT_WRITE_TIMEOUT_MS; PIPE_COUNT],
            read_buffers: [ReadBuffer::new(), ReadBuffer::new()],
        }
    }

    /// Bytes currently staged for `pipe`.
    pub fn staged(&self, pipe: Pipe) -> usize {
        self.read_buffers[pipe.index()].size()
    }
}

impl<D: BulkDevice> Transport for UsbTransport<D> {
    fn connect(&mut self) -> Result<(), MvlcError> {
        if self.connected {
            return Err(MvlcError::IsConnected);
        }

        self.device.open().map_err(MvlcError::Io)?;
        self.connected = true;

        for buf in &mut self.read_buffers {
            buf.first = 0;
            buf.last = 0;
        }

        debug!(target: "transport.usb", "connected");

        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), MvlcError> {
        if !self.connected {
            return Err(MvlcError::IsDisconnected);
        }

        self.device.close().map_err(MvlcError::Io)?;
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    fn write(&mut self, pipe: Pipe, data: &[u8]) -> Result<usize, MvlcError> {
        if !self.connected {
            return Err(MvlcError::IsDisconnected);
        }

        self.device
            .write_chunk(pipe, data, self.write_timeouts_ms[pipe.index()])
            .map_err(map_write_io)
    }

    fn read(&mut self, pipe: Pipe, dest: &mut [u8]) -> Result<usize, MvlcError> {
        if !self.connected {
            return Err(MvlcError::IsDisconnected);
        }

        let timeout = self.read_timeouts_ms[pipe.index()];
        let buffer = &mut self.read_buffers[pipe.index()];

        let mut transferred = buffer.copy_out(dest);

        while transferred < dest.len() {
            debug_assert_eq!(buffer.size(), 0);

            buffer.first = 0;
            buffer.last = 0;

            let res = self.device.read_chunk(pipe, &mut buffer.mem, timeout);

            match res {
                Ok(0) => break,
                Ok(n) => {
                    trace!(target: "transport.usb", pipe = pipe.index(), bytes = n, "chunk");
                    buffer.last = n;
                    transferred += buffer.copy_out(&mut dest[transferred..]);
                }
                Err(e) => {
                    let e = map_read_io(e);
                    if e.is_timeout() && transferred > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }

        Ok(transferred)
    }

    fn set_read_timeout(&mut self, pipe: Pipe, ms: u32) -> Result<(), MvlcError> {
        self.read_timeouts_ms[pipe.index()] = ms;
        Ok(())
    }

    fn set_write_timeout(&mut self, pipe: Pipe, ms: u32) -> Result<(), MvlcError> {
        self.write_timeouts_ms[pipe.index()] = ms;
        Ok(())
    }

    fn read_timeout(&self, pipe: Pipe) -> u32 {
        self.read_timeouts_ms[pipe.index()]
    }

    fn write_timeout(&self, pipe: Pipe) -> u32 {
        self.write_timeouts_ms[pipe.index()]
    }
}
