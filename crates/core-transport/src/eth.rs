//! Ethernet transport: two UDP sockets pinned to the controller's command
//! and data ports.
//!
//! Binding then connecting pins each socket to datagrams originating from
//! the controller only. The local ports must be two consecutive numbers;
//! candidates are scanned upwards from the first dynamic port. Reads operate
//! on whole datagrams; `read` linearizes their payloads through a per-pipe
//! staging buffer while `read_packet` exposes single datagrams to the
//! readout path.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use core_proto::eth::{
    COMMAND_PORT, DATA_PORT, HEADER_BYTES, JUMBO_FRAME_MAX_SIZE, NUM_PACKET_CHANNELS,
};
use core_proto::{stacks, ConnectionType, Pipe, DEFAULT_READ_TIMEOUT_MS, DEFAULT_WRITE_TIMEOUT_MS, PIPE_COUNT};
use tracing::{debug, trace, warn};

use crate::dialog::CommandDialog;
use crate::error::{map_read_io, map_write_io, MvlcError};
use crate::packet::{ChannelTracker, PacketChannelStats, PacketReadResult, PipeStats};
use crate::Transport;

const FIRST_DYNAMIC_PORT: u16 = 49152;

// Standard MTU 1500 minus IPv4 (20) and UDP (8) headers. Outgoing command
// buffers must fit one datagram.
const MAX_OUTGOING_PAYLOAD_SIZE: usize = 1500 - 20 - 8;

/// Staging buffer holding the unconsumed payload of the last datagram.
struct ReceiveBuffer {
    mem: Vec<u8>,
    start: usize,
    end: usize,
}

impl ReceiveBuffer {
    fn new() -> Self {
        Self {
            mem: vec![0u8; JUMBO_FRAME_MAX_SIZE],
            start: 0,
            end: 0,
        }
    }

    fn available(&self) -> usize {
        self.end - self.start
    }

    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Copies as much buffered payload as fits into `dest`, returning the
    /// number of bytes moved.
    fn copy_out(&mut self, dest: &mut [u8]) -> usize {
        let n = self.available().min(dest.len());
        dest[..n].copy_from_slice(&self.mem[self.start..self.start + n]);
        self.start += n;
        n
    }
}

pub struct EthTransport {
    host: String,
    cmd_sock: Option<UdpSocket>,
    data_sock: Option<UdpSocket>,
    read_timeouts_ms: [u32; PIPE_COUNT],
    write_timeouts_ms: [u32; PIPE_COUNT],
    receive_buffers: [ReceiveBuffer; PIPE_COUNT],
    tracker: ChannelTracker,
    pipe_stats: [PipeStats; PIPE_COUNT],
    channel_stats: [PacketChannelStats; NUM_PACKET_CHANNELS],
    disable_triggers_on_connect: bool,
}

impl EthTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            cmd_sock: None,
            data_sock: None,
            read_timeouts_ms: [DEFAULT_READ_TIMEOUT_MS; PIPE_COUNT],
            write_timeouts_ms: [DEFAULT_WRITE_TIMEOUT_MS; PIPE_COUNT],
            receive_buffers: [ReceiveBuffer::new(), ReceiveBuffer::new()],
            tracker: ChannelTracker::default(),
            pipe_stats: Default::default(),
            channel_stats: Default::default(),
            disable_triggers_on_connect: false,
        }
    }

    /// When set, active stack triggers found during the connect probe are
    /// disabled instead of failing with `InUse`.
    pub fn set_disable_triggers_on_connect(&mut self, b: bool) {
        self.disable_triggers_on_connect = b;
    }

    pub fn pipe_stats(&self) -> &[PipeStats; PIPE_COUNT] {
        &self.pipe_stats
    }

    pub fn packet_channel_stats(&self) -> &[PacketChannelStats; NUM_PACKET_CHANNELS] {
        &self.channel_stats
    }

    pub fn reset_stats(&mut self) {
        self.pipe_stats = Default::default();
        self.channel_stats = Default::default();
    }

    fn socket(&self, pipe: Pipe) -> Result<&UdpSocket, MvlcError> {
        let sock = match pipe {
            Pipe::Command => self.cmd_sock.as_ref(),
            Pipe::Data => self.data_sock.as_ref(),
        };
        sock.ok_or(MvlcError::IsDisconnected)
    }

    fn close_sockets(&mut self) {
        self.cmd_sock = None;
        self.data_sock = None;
    }

    fn apply_read_timeout(sock: &UdpSocket, ms: u32) -> Result<(), MvlcError> {
        let timeout = (ms > 0).then(|| Duration::from_millis(ms as u64));
        sock.set_read_timeout(timeout).map_err(MvlcError::Io)
    }

    fn lookup(&self) -> Result<(SocketAddr, SocketAddr), MvlcError> {
        if self.host.is_empty() {
            return Err(MvlcError::EmptyHostname);
        }

        let cmd_addr = (self.host.as_str(), COMMAND_PORT)
            .to_socket_addrs()
            .map_err(|_| MvlcError::HostLookup { host: self.host.clone() })?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| MvlcError::HostLookup { host: self.host.clone() })?;

        let mut data_addr = cmd_addr;
        data_addr.set_port(DATA_PORT);

        Ok((cmd_addr, data_addr))
    }

    /// Binds two consecutive local UDP ports, scanning upwards from the
    /// first dynamic port. Leaves one spare port at the top for the data
    /// socket.
    fn bind_socket_pair() -> Result<(UdpSocket, UdpSocket), MvlcError> {
        for local_cmd_port in FIRST_DYNAMIC_PORT..u16::MAX {
            let cmd = match UdpSocket::bind(("0.0.0.0", local_cmd_port)) {
                Ok(s) => s,
                Err(_) => continue,
            };

            match UdpSocket::bind(("0.0.0.0", local_cmd_port + 1)) {
                Ok(data) => return Ok((cmd, data)),
                Err(_) => continue,
            }
        }

        Err(MvlcError::BindLocal)
    }

    /// Probes the stack trigger registers. A non-zero trigger config means
    /// another client is driving the controller.
    fn probe_triggers(&mut self) -> Result<(), MvlcError> {
        let mut dialog = CommandDialog::new();
        let mut in_use = false;

        for stack_id in 0..stacks::STACK_COUNT {
            let addr = stacks::trigger_register(stack_id);
            let value = dialog.read_register(self, addr)?;

            if value != stacks::TriggerType::NoTrigger as u32 {
                in_use = true;
                break;
            }
        }

        if in_use && !self.disable_triggers_on_connect {
            warn!(target: "transport.eth", "controller in use: stack triggers active");
            return Err(MvlcError::InUse);
        }

        if in_use {
            debug!(target: "transport.eth", "disabling active stack triggers");
            crate::stack::disable_all_triggers(&mut dialog, self)?;
        }

        Ok(())
    }

    /// Receives one datagram into `dest`, decoding the two-word packet
    /// header and updating loss accounting. On a timeout with nothing
    /// received the error is `ReadTimeout` and no state changes.
    pub fn read_packet(
        &mut self,
        pipe: Pipe,
        dest: &mut [u8],
    ) -> Result<PacketReadResult, MvlcError> {
        self.pipe_stats[pipe.index()].receive_attempts += 1;

        let sock = self.socket(pipe)?;
        let bytes_transferred = sock.recv(dest).map_err(map_read_io)?;

        let stats = &mut self.pipe_stats[pipe.index()];
        stats.received_packets += 1;
        stats.received_bytes += bytes_transferred as u64;

        let mut res = PacketReadResult {
            bytes_transferred,
            ..Default::default()
        };

        if !res.has_headers() {
            stats.short_packets += 1;
            warn!(target: "transport.eth", pipe = pipe.index(), bytes = bytes_transferred,
                  "received datagram smaller than the packet header");
            return Err(MvlcError::ShortRead {
                transferred: bytes_transferred,
                expected: HEADER_BYTES,
            });
        }

        res.header0 = u32::from_le_bytes([dest[0], dest[1], dest[2], dest[3]]);
        res.header1 = u32::from_le_bytes([dest[4], dest[5], dest[6], dest[7]]);

        trace!(target: "transport.eth", pipe = pipe.index(),
               channel = res.packet_channel(), number = res.packet_number(),
               words = res.data_word_count(), next_header = res.next_header_pointer(),
               "packet");

        if res.leftover_bytes() > 0 {
            stats.packets_with_residue += 1;
        }

        let channel = res.packet_channel();

        if channel as usize >= NUM_PACKET_CHANNELS {
            stats.packet_channel_out_of_range += 1;
            return Err(MvlcError::PacketChannelOutOfRange(channel));
        }

        res.lost_packets = self.tracker.record(channel, res.packet_number());

        let stats = &mut self.pipe_stats[pipe.index()];
        stats.lost_packets += res.lost_packets as u64;

        let cstats = &mut self.channel_stats[channel as usize];
        cstats.received_packets += 1;
        cstats.received_bytes += bytes_transferred as u64;
        cstats.lost_packets += res.lost_packets as u64;

        if res.lost_packets > 0 {
            debug!(target: "transport.eth", pipe = pipe.index(), channel,
                   number = res.packet_number(), lost = res.lost_packets, "packet loss");
        }

        // Sanity check on the header pointer: it must land inside the
        // received payload.
        if res.has_next_header_pointer() {
            if res.next_header_pointer() as usize >= res.available_payload_words() {
                self.pipe_stats[pipe.index()].header_out_of_range += 1;
                self.channel_stats[channel as usize].header_out_of_range += 1;
            }
        } else {
            self.pipe_stats[pipe.index()].no_header += 1;
            self.channel_stats[channel as usize].no_header += 1;
        }

        Ok(res)
    }
}

impl Transport for EthTransport {
    fn connect(&mut self) -> Result<(), MvlcError> {
        if self.is_connected() {
            return Err(MvlcError::IsConnected);
        }

        self.reset_stats();
        self.tracker.reset();
        for buf in &mut self.receive_buffers {
            buf.reset();
        }

        let (cmd_addr, data_addr) = self.lookup()?;

        let (cmd_sock, data_sock) = Self::bind_socket_pair()?;

        // Pin the sockets to the controller so only its datagrams arrive.
        cmd_sock.connect(cmd_addr).map_err(MvlcError::Io)?;
        data_sock.connect(data_addr).map_err(MvlcError::Io)?;

        Self::apply_read_timeout(&cmd_sock, self.read_timeouts_ms[Pipe::Command.index()])?;
        Self::apply_read_timeout(&data_sock, self.read_timeouts_ms[Pipe::Data.index()])?;

        self.cmd_sock = Some(cmd_sock);
        self.data_sock = Some(data_sock);

        if let Err(e) = self.probe_triggers() {
            self.close_sockets();
            return Err(e);
        }

        debug!(target: "transport.eth", host = %self.host, "connected");

        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), MvlcError> {
        if !self.is_connected() {
            return Err(MvlcError::IsDisconnected);
        }

        self.close_sockets();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.cmd_sock.is_some() && self.data_sock.is_some()
    }

    fn connection_type(&self) -> ConnectionType {
        ConnectionType::Eth
    }

    fn write(&mut self, pipe: Pipe, data: &[u8]) -> Result<usize, MvlcError> {
        if data.len() > MAX_OUTGOING_PAYLOAD_SIZE {
            return Err(MvlcError::CommandArgOutOfRange);
        }

        let sock = self.socket(pipe)?;
        sock.send(data).map_err(map_write_io)
    }

    fn read(&mut self, pipe: Pipe, dest: &mut [u8]) -> Result<usize, MvlcError> {
        if !self.is_connected() {
            return Err(MvlcError::IsDisconnected);
        }

        let mut transferred = {
            let buffer = &mut self.receive_buffers[pipe.index()];
            buffer.copy_out(dest)
        };

        while transferred < dest.len() {
            debug_assert_eq!(self.receive_buffers[pipe.index()].available(), 0);

            // Receive the next datagram into the staging buffer, then hand
            // its payload out from there.
            let mut packet_mem = std::mem::take(&mut self.receive_buffers[pipe.index()].mem);

            let res = self.read_packet(pipe, &mut packet_mem);

            let buffer = &mut self.receive_buffers[pipe.index()];
            buffer.mem = packet_mem;

            match res {
                Ok(packet) => {
                    buffer.start = HEADER_BYTES;
                    buffer.end = HEADER_BYTES + packet.available_payload_words() * 4;
                    transferred += buffer.copy_out(&mut dest[transferred..]);
                }
                Err(e) if e.is_timeout() => {
                    if transferred > 0 {
                        break;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(transferred)
    }

    fn set_read_timeout(&mut self, pipe: Pipe, ms: u32) -> Result<(), MvlcError> {
        self.read_timeouts_ms[pipe.index()] = ms;

        if let Ok(sock) = self.socket(pipe) {
            Self::apply_read_timeout(sock, ms)?;
        }

        Ok(())
    }

    fn set_write_timeout(&mut self, pipe: Pipe, ms: u32) -> Result<(), MvlcError> {
        // UDP sends do not block on the controller; the value is only
        // recorded.
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

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a transport whose sockets are wired to a local peer socket
    /// standing in for the controller, bypassing `connect()`.
    fn wired_pair() -> (EthTransport, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();

        let cmd = UdpSocket::bind("127.0.0.1:0").unwrap();
        let data = UdpSocket::bind("127.0.0.1:0").unwrap();
        cmd.connect(peer.local_addr().unwrap()).unwrap();
        data.connect(peer.local_addr().unwrap()).unwrap();
        cmd.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        data.set_read_timeout(Some(Duration::from_millis(100))).unwrap();

        let mut t = EthTransport::new("127.0.0.1");
        t.cmd_sock = Some(cmd);
        t.data_sock = Some(data);

        (t, peer)
    }

    fn send_packet(peer: &UdpSocket, to: SocketAddr, header0: u32, header1: u32, payload: &[u32]) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&header0.to_le_bytes());
        bytes.extend_from_slice(&header1.to_le_bytes());
        for w in payload {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        peer.send_to(&bytes, to).unwrap();
    }

    fn make_header0(channel: u8, number: u16, words: u16) -> u32 {
        ((channel as u32) << 28) | ((number as u32 & 0xfff) << 16) | words as u32
    }

    #[test]
    fn bind_socket_pair_yields_consecutive_ports() {
        let (a, b) = EthTransport::bind_socket_pair().unwrap();
        let pa = a.local_addr().unwrap().port();
        let pb = b.local_addr().unwrap().port();
        assert!(pa >= FIRST_DYNAMIC_PORT);
        assert_eq!(pb, pa + 1);
    }

    #[test]
    fn read_packet_decodes_headers_and_counts_loss() {
        let (mut t, peer) = wired_pair();
        let data_addr = t.data_sock.as_ref().unwrap().local_addr().unwrap();

        send_packet(&peer, data_addr, make_header0(2, 10, 2), 0xFFF, &[0xAAAA, 0xBBBB]);
        send_packet(&peer, data_addr, make_header0(2, 14, 1), 0, &[0xCCCC]);

        let mut buf = [0u8; 9000];

        let p1 = t.read_packet(Pipe::Data, &mut buf).unwrap();
        assert_eq!(p1.packet_channel(), 2);
        assert_eq!(p1.packet_number(), 10);
        assert_eq!(p1.lost_packets, 0);
        assert!(!p1.has_next_header_pointer());

        let p2 = t.read_packet(Pipe::Data, &mut buf).unwrap();
        assert_eq!(p2.lost_packets, 3);
        assert_eq!(t.pipe_stats()[Pipe::Data.index()].lost_packets, 3);
        assert_eq!(t.packet_channel_stats()[2].lost_packets, 3);
    }

    #[test]
    fn read_spans_multiple_packets_through_staging_buffer() {
        let (mut t, peer) = wired_pair();
        let cmd_addr = t.cmd_sock.as_ref().unwrap().local_addr().unwrap();

        send_packet(&peer, cmd_addr, make_header0(0, 1, 2), 0, &[0x1111, 0x2222]);
        send_packet(&peer, cmd_addr, make_header0(0, 2, 2), 0, &[0x3333, 0x4444]);

        // Request 3 words: 2 from the first packet, 1 from the second; the
        // remaining word of packet 2 stays staged.
        let mut dest = [0u8; 12];
        let n = t.read(Pipe::Command, &mut dest).unwrap();
        assert_eq!(n, 12);

        let words: Vec<u32> = dest
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![0x1111, 0x2222, 0x3333]);

        let mut rest = [0u8; 4];
        let n = t.read(Pipe::Command, &mut rest).unwrap();
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(rest), 0x4444);
    }

    #[test]
    fn read_timeout_with_no_data_is_an_error() {
        let (mut t, _peer) = wired_pair();
        let mut dest = [0u8; 4];
        let err = t.read(Pipe::Command, &mut dest).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn read_timeout_after_partial_fill_returns_partial() {
        let (mut t, peer) = wired_pair();
        let cmd_addr = t.cmd_sock.as_ref().unwrap().local_addr().unwrap();

        send_packet(&peer, cmd_addr, make_header0(0, 1, 1), 0, &[0xDEAD]);

        let mut dest = [0u8; 8];
        let n = t.read(Pipe::Command, &mut dest).unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let (mut t, _peer) = wired_pair();
        let data = vec![0u8; MAX_OUTGOING_PAYLOAD_SIZE + 1];
        assert!(matches!(
            t.write(Pipe::Command, &data),
            Err(MvlcError::CommandArgOutOfRange)
        ));
    }
}
