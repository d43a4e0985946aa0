//! Buffer-level readout sources on top of the transports.
//!
//! The readout worker is transport agnostic; what differs is how raw
//! buffers are assembled. Ethernet buffers are sequences of whole
//! datagrams including their two packet header words (the parser needs
//! them for loss detection and resync); USB buffers are plain slices of
//! the framed word stream.

use core_proto::{ConnectionType, Pipe};
use core_transport::eth::EthTransport;
use core_transport::{MvlcError, Transport};

/// Pulls readout words from a transport into buffers.
///
/// `read_words` appends to `dest` up to roughly `max_words`, returning the
/// number of words appended. A timeout with nothing appended returns
/// `Err(ReadTimeout)`; any other error ends the readout stream.
pub trait ReadoutSource: Send {
    fn connection_type(&self) -> ConnectionType;
    fn read_words(&mut self, dest: &mut Vec<u32>, max_words: usize) -> Result<usize, MvlcError>;
}

/// Ethernet: accumulates whole datagrams, headers included.
pub struct EthReadoutSource {
    transport: EthTransport,
    packet: Vec<u8>,
}

const MAX_PACKET_WORDS: usize = core_proto::eth::JUMBO_FRAME_MAX_SIZE / 4;

impl EthReadoutSource {
    pub fn new(transport: EthTransport) -> Self {
        Self {
            transport,
            packet: vec![0u8; core_proto::eth::JUMBO_FRAME_MAX_SIZE],
        }
    }

    pub fn transport(&self) -> &EthTransport {
        &self.transport
    }

    pub fn into_transport(self) -> EthTransport {
        self.transport
    }
}

impl ReadoutSource for EthReadoutSource {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Eth
    }

    fn read_words(&mut self, dest: &mut Vec<u32>, max_words: usize) -> Result<usize, MvlcError> {
        let start = dest.len();

        loop {
            match self.transport.read_packet(Pipe::Data, &mut self.packet) {
                Ok(res) => {
                    let byte_count =
                        core_proto::eth::HEADER_BYTES + res.available_payload_words() * 4;

                    dest.extend(
                        self.packet[..byte_count]
                            .chunks_exact(4)
                            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                    );
                }
                Err(e) if e.is_timeout() => {
                    if dest.len() > start {
                        break;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            // Stop while a further max-size packet would still fit.
            if dest.len() - start + MAX_PACKET_WORDS > max_words {
                break;
            }
        }

        Ok(dest.len() - start)
    }
}

/// USB: plain byte stream chopped into word buffers. A trailing partial
/// word of a transport read is carried over so words never split across
/// buffers.
pub struct UsbReadoutSource<T: Transport> {
    transport: T,
    residual: [u8; 4],
    residual_len: usize,
    bytes: Vec<u8>,
}

impl<T: Transport> UsbReadoutSource<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            residual: [0; 4],
            residual_len: 0,
            bytes: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> ReadoutSource for UsbReadoutSource<T> {
    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    fn read_words(&mut self, dest: &mut Vec<u32>, max_words: usize) -> Result<usize, MvlcError> {
        self.bytes.clear();
        self.bytes.resize(self.residual_len + max_words * 4, 0);
        self.bytes[..self.residual_len].copy_from_slice(&self.residual[..self.residual_len]);

        let n = match self.transport.read(Pipe::Data, &mut self.bytes[self.residual_len..]) {
            Ok(n) => n,
            Err(e) => return Err(e),
        };

        let total = self.residual_len + n;
        let word_count = total / 4;

        dest.extend(
            self.bytes[..word_count * 4]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );

        self.residual_len = total % 4;
        self.residual[..self.residual_len]
            .copy_from_slice(&self.bytes[word_count * 4..total]);

        Ok(word_count)
    }
}
