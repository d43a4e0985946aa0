//! Ethernet packet reassembly support: per-datagram header decoding,
//! packet-number based loss accounting and receive statistics.
//!
//! Each datagram from the controller starts with two header words. Three
//! logical packet channels multiplex on the data socket, each with an
//! independent 12-bit packet number counter; gaps in the sequence are
//! counted as lost packets.

use core_proto::eth::{header0, header1, NUM_PACKET_CHANNELS};

/// Decoded view of one received datagram. The payload stays in the receive
/// buffer this was parsed from; only sizes and header fields live here.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketReadResult {
    pub bytes_transferred: usize,
    pub header0: u32,
    pub header1: u32,
    /// Loss detected on this packet's channel relative to its predecessor.
    pub lost_packets: u32,
}

impl PacketReadResult {
    /// True if the datagram is large enough to carry the two header words.
    pub fn has_headers(&self) -> bool {
        self.bytes_transferred >= core_proto::eth::HEADER_BYTES
    }

    pub fn packet_channel(&self) -> u8 {
        ((self.header0 >> header0::PACKET_CHANNEL_SHIFT) & header0::PACKET_CHANNEL_MASK) as u8
    }

    pub fn packet_number(&self) -> u16 {
        ((self.header0 >> header0::PACKET_NUMBER_SHIFT) & header0::PACKET_NUMBER_MASK) as u16
    }

    /// Number of data words following the two header words, as declared by
    /// the controller.
    pub fn data_word_count(&self) -> u16 {
        ((self.header0 >> header0::NUM_DATA_WORDS_SHIFT) & header0::NUM_DATA_WORDS_MASK) as u16
    }

    pub fn udp_timestamp(&self) -> u32 {
        (self.header1 >> header1::TIMESTAMP_SHIFT) & header1::TIMESTAMP_MASK
    }

    /// Word offset of the first frame header inside the payload, or
    /// `NO_HEADER_POINTER_PRESENT` when the packet carries only
    /// continuation data.
    pub fn next_header_pointer(&self) -> u32 {
        (self.header1 >> header1::HEADER_POINTER_SHIFT) & header1::HEADER_POINTER_MASK
    }

    pub fn has_next_header_pointer(&self) -> bool {
        self.next_header_pointer() != header1::NO_HEADER_POINTER_PRESENT
    }

    /// Payload words actually received, derived from the datagram size.
    pub fn available_payload_words(&self) -> usize {
        self.bytes_transferred
            .saturating_sub(core_proto::eth::HEADER_BYTES)
            / 4
    }

    /// Trailing bytes that do not form a complete word.
    pub fn leftover_bytes(&self) -> usize {
        self.bytes_transferred.saturating_sub(core_proto::eth::HEADER_BYTES) % 4
    }
}

/// Packet loss between two consecutively received packet numbers of one
/// channel, accounting for the 12-bit wrap: `(current - last - 1) mod 4096`.
/// `last < 0` means "no previous packet": no loss can be derived.
pub fn calc_packet_loss(last: i32, current: u16) -> u32 {
    if last < 0 {
        return 0;
    }

    const PACKET_NUMBER_MAX: i32 = header0::PACKET_NUMBER_MASK as i32;

    let diff = current as i32 - last;

    if diff < 1 {
        (PACKET_NUMBER_MAX + diff) as u32
    } else {
        (diff - 1) as u32
    }
}

/// Receive statistics of one pipe.
#[derive(Debug, Clone, Default)]
pub struct PipeStats {
    pub receive_attempts: u64,
    pub received_packets: u64,
    pub received_bytes: u64,
    pub short_packets: u64,
    pub packets_with_residue: u64,
    pub packet_channel_out_of_range: u64,
    pub lost_packets: u64,
    pub no_header: u64,
    pub header_out_of_range: u64,
}

/// Receive statistics of one packet channel.
#[derive(Debug, Clone, Default)]
pub struct PacketChannelStats {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub lost_packets: u64,
    pub no_header: u64,
    pub header_out_of_range: u64,
}

/// Per-channel packet number tracking. `-1` marks "no packet seen yet".
#[derive(Debug, Clone)]
pub struct ChannelTracker {
    last_packet_numbers: [i32; NUM_PACKET_CHANNELS],
}

impl Default for ChannelTracker {
    fn default() -> Self {
        Self {
            last_packet_numbers: [-1; NUM_PACKET_CHANNELS],
        }
    }
}

impl ChannelTracker {
    pub fn reset(&mut self) {
        self.last_packet_numbers = [-1; NUM_PACKET_CHANNELS];
    }

    /// Records `packet_number` for `channel` and returns the loss relative
    /// to the previously recorded number.
    pub fn record(&mut self, channel: u8, packet_number: u16) -> u32 {
        let slot = &mut self.last_packet_numbers[channel as usize];
        let loss = calc_packet_loss(*slot, packet_number);
        *slot = packet_number as i32;
        loss
    }

    pub fn last_packet_number(&self, channel: u8) -> i32 {
        self.last_packet_numbers[channel as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_with_no_previous_packet_is_zero() {
        assert_eq!(calc_packet_loss(-1, 0), 0);
        assert_eq!(calc_packet_loss(-1, 4095), 0);
    }

    #[test]
    fn loss_simple_gap() {
        assert_eq!(calc_packet_loss(5, 10), 4);
        assert_eq!(calc_packet_loss(5, 6), 0);
    }

    #[test]
    fn loss_across_wrap() {
        assert_eq!(calc_packet_loss(4094, 1), 2);
        assert_eq!(calc_packet_loss(4095, 0), 0);
    }

    #[test]
    fn loss_accumulates_over_sequence() {
        // lost = sum((p[i+1] - p[i] - 1) mod 4096)
        let seq = [3u16, 4, 8, 9, 4095, 2];
        let mut tracker = ChannelTracker::default();
        let total: u32 = seq.iter().map(|&p| tracker.record(0, p)).sum();
        // gaps: 0 + 3 + 0 + 4085 + 2
        assert_eq!(total, 3 + (4095 - 9 - 1) + 2);
    }

    #[test]
    fn channels_are_independent() {
        let mut tracker = ChannelTracker::default();
        assert_eq!(tracker.record(0, 10), 0);
        assert_eq!(tracker.record(1, 100), 0);
        assert_eq!(tracker.record(0, 12), 1);
        assert_eq!(tracker.record(1, 101), 0);
    }

    #[test]
    fn header_field_extraction() {
        // channel 2, packet number 0x123, 0x1ABC data words
        let header0 = (2u32 << 28) | (0x123 << 16) | 0x1ABC;
        // timestamp 0x54321, next header pointer 0x7
        let header1 = (0x54321u32 << 12) | 0x7;

        let res = PacketReadResult {
            bytes_transferred: 8 + 0x1ABC * 4,
            header0,
            header1,
            lost_packets: 0,
        };

        assert!(res.has_headers());
        assert_eq!(res.packet_channel(), 2);
        assert_eq!(res.packet_number(), 0x123);
        assert_eq!(res.data_word_count(), 0x1ABC);
        assert_eq!(res.udp_timestamp(), 0x54321);
        assert_eq!(res.next_header_pointer(), 0x7);
        assert!(res.has_next_header_pointer());
        assert_eq!(res.available_payload_words(), 0x1ABC);
        assert_eq!(res.leftover_bytes(), 0);
    }

    #[test]
    fn no_header_pointer_sentinel() {
        let res = PacketReadResult {
            bytes_transferred: 12,
            header0: 0,
            header1: 0xFFF,
            lost_packets: 0,
        };
        assert!(!res.has_next_header_pointer());
    }
}
