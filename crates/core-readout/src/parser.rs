//! The readout parser state machine.
//!
//! State carried across input buffers: the open stack frame (with its
//! remaining word count), the open block frame while inside a module's
//! dynamic part, the `(event, module, phase)` cursor and the work buffer
//! holding the linearized event assembled so far. Feeding a buffer advances
//! the machine; events are dispatched the moment their last module part
//! completes.

use core_proto::eth::{header0, header1};
use core_proto::frame::{extract_frame_info, FrameFlags, FrameType, get_frame_type};
use core_proto::stacks::FIRST_READOUT_STACK_ID;
use core_proto::system_event;
use tracing::{trace, warn};

use crate::{
    ModuleReadoutParts, ParseError, ReadoutConsumer, ReadoutParserCounters, ReadoutStructure,
};

pub const MAX_MODULES_PER_EVENT: usize = 20;

/// Tracks the words left in an open frame.
#[derive(Debug, Clone, Copy)]
struct FrameParseState {
    header: u32,
    words_left: u16,
}

impl FrameParseState {
    fn new(header: u32) -> Self {
        Self {
            header,
            words_left: extract_frame_info(header).len,
        }
    }

    fn flags(&self) -> FrameFlags {
        extract_frame_info(self.header).flags
    }

    fn stack(&self) -> u8 {
        extract_frame_info(self.header).stack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModulePhase {
    Prefix,
    Dynamic,
    Suffix,
}

#[derive(Debug, Clone, Copy, Default)]
struct Span {
    offset: u32,
    size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ModuleSpans {
    prefix: Span,
    dynamic: Span,
    suffix: Span,
}

pub struct ReadoutParser {
    structure: ReadoutStructure,

    // Linearized data of the event being assembled, plus the per-module
    // span map into it.
    work_buffer: Vec<u32>,
    spans: Vec<ModuleSpans>,

    event_index: Option<usize>,
    module_index: usize,
    phase: ModulePhase,
    phase_words_left: u32,

    // Always active while parsing readout data.
    cur_stack_frame: Option<FrameParseState>,
    // Active only while inside a module's dynamic part.
    cur_block_frame: Option<FrameParseState>,

    // System event rejoin state.
    cur_system_frame: Option<FrameParseState>,
    system_subtype: Option<u8>,
    system_event_buf: Vec<u32>,

    // Readout workers number buffers from 1, so 0 works as the seed for
    // loss calculation without special cases.
    last_buffer_number: u32,
    // -1 represents "no packet seen yet".
    last_packet_number: i32,

    pub counters: ReadoutParserCounters,
}

impl ReadoutParser {
    /// Builds a parser for the given readout structure.
    pub fn new(structure: ReadoutStructure) -> Result<Self, ParseError> {
        if structure.iter().any(|mods| mods.len() > MAX_MODULES_PER_EVENT) {
            return Err(ParseError::ModuleIndexOutOfRange);
        }

        Ok(Self {
            structure,
            work_buffer: Vec::new(),
            spans: Vec::new(),
            event_index: None,
            module_index: 0,
            phase: ModulePhase::Prefix,
            phase_words_left: 0,
            cur_stack_frame: None,
            cur_block_frame: None,
            cur_system_frame: None,
            system_subtype: None,
            system_event_buf: Vec::new(),
            last_buffer_number: 0,
            last_packet_number: -1,
            counters: ReadoutParserCounters::default(),
        })
    }

    pub fn structure(&self) -> &ReadoutStructure {
        &self.structure
    }

    /// True when no frame or system event is open: the next word must be a
    /// frame header.
    fn is_idle(&self) -> bool {
        self.cur_stack_frame.is_none()
            && self.cur_system_frame.is_none()
            && self.system_subtype.is_none()
    }

    /// Drops any partially assembled event and open frames. Used after
    /// buffer/packet loss and parse errors; counters survive.
    fn reset_event_state(&mut self) {
        self.event_index = None;
        self.module_index = 0;
        self.phase = ModulePhase::Prefix;
        self.phase_words_left = 0;
        self.cur_stack_frame = None;
        self.cur_block_frame = None;
        self.cur_system_frame = None;
        self.system_subtype = None;
        self.system_event_buf.clear();
        self.work_buffer.clear();
    }

    fn note_error(&mut self, e: ParseError) {
        self.counters.parse_errors[e.index()] += 1;
        warn!(target: "readout.parser", error = %e, "parse error");
    }

    /// Parses a USB readout buffer: a raw slice of the framed word stream.
    pub fn parse_buffer_usb(
        &mut self,
        consumer: &mut dyn ReadoutConsumer,
        buffer_number: u32,
        words: &[u32],
    ) -> Result<(), ParseError> {
        self.account_buffer(buffer_number);

        let mut pos = 0usize;
        let mut result = self.parse_contents(consumer, words, &mut pos);

        // Whole-buffer watchdog: a successful parse must have consumed
        // every word.
        if result.is_ok() && pos != words.len() {
            result = Err(ParseError::ContentsNotAdvancing);
        }

        if let Err(e) = result {
            self.note_error(e);
            self.counters.unused_bytes += ((words.len() - pos) * 4) as u64;
            self.reset_event_state();
        }

        self.counters.buffers_processed += 1;
        result
    }

    /// Parses an Ethernet readout buffer: a sequence of received datagrams
    /// including their two-word packet headers. Recovery from packet loss
    /// and parse errors happens at packet granularity using the embedded
    /// next-header pointer.
    pub fn parse_buffer_eth(
        &mut self,
        consumer: &mut dyn ReadoutConsumer,
        buffer_number: u32,
        words: &[u32],
    ) -> Result<(), ParseError> {
        self.account_buffer(buffer_number);

        let mut pos = 0usize;
        let mut first_error = None;

        while words.len() - pos >= core_proto::eth::HEADER_WORDS {
            let packet_start = pos;
            let h0 = words[pos];
            let h1 = words[pos + 1];

            let word_count =
                ((h0 >> header0::NUM_DATA_WORDS_SHIFT) & header0::NUM_DATA_WORDS_MASK) as usize;
            let packet_number =
                ((h0 >> header0::PACKET_NUMBER_SHIFT) & header0::PACKET_NUMBER_MASK) as u16;
            let next_header_pointer =
                (h1 >> header1::HEADER_POINTER_SHIFT) & header1::HEADER_POINTER_MASK;

            let payload_start = pos + core_proto::eth::HEADER_WORDS;
            let payload_end = payload_start + word_count;

            if payload_end > words.len() {
                // The declared packet length exceeds the buffer: parsing
                // cannot advance over this packet.
                self.note_error(ParseError::EthPacketNotAdvancing);
                self.counters.unused_bytes += ((words.len() - pos) * 4) as u64;
                self.reset_event_state();
                first_error.get_or_insert(ParseError::EthPacketNotAdvancing);
                break;
            }

            self.counters.eth_packets_processed += 1;

            let loss = calc_packet_loss(self.last_packet_number, packet_number);
            self.last_packet_number = packet_number as i32;

            if loss > 0 {
                trace!(target: "readout.parser", packet_number, loss, "eth packet loss");
                self.counters.eth_packet_loss += loss as u64;
                self.reset_event_state();
            }

            let payload = &words[payload_start..payload_end];
            let mut ppos = 0usize;

            if self.is_idle() {
                // Desynchronized (or fresh): anchor on the packet's first
                // embedded frame header.
                if next_header_pointer == header1::NO_HEADER_POINTER_PRESENT {
                    self.counters.unused_bytes += (payload.len() * 4) as u64;
                    pos = payload_end;
                    continue;
                }

                let nhp = next_header_pointer as usize;

                if nhp >= payload.len() {
                    self.counters.unused_bytes += (payload.len() * 4) as u64;
                    pos = payload_end;
                    continue;
                }

                self.counters.unused_bytes += (nhp * 4) as u64;
                ppos = nhp;
            }

            if let Err(e) = self.parse_contents(consumer, payload, &mut ppos) {
                self.note_error(e);
                self.counters.unused_bytes += ((payload.len() - ppos) * 4) as u64;
                self.reset_event_state();
                first_error.get_or_insert(e);
            }

            pos = payload_end;

            // Per-packet watchdog: the cursor must move past every packet.
            if pos <= packet_start {
                self.note_error(ParseError::EthPacketNotAdvancing);
                self.counters.unused_bytes += ((words.len() - pos) * 4) as u64;
                first_error.get_or_insert(ParseError::EthPacketNotAdvancing);
                break;
            }
        }

        if pos < words.len() && words.len() - pos < core_proto::eth::HEADER_WORDS {
            // Trailing words too short to form a packet header: the buffer
            // cannot be advanced any further.
            self.note_error(ParseError::EthBufferNotAdvancing);
            self.counters.unused_bytes += ((words.len() - pos) * 4) as u64;
            first_error.get_or_insert(ParseError::EthBufferNotAdvancing);
        }

        self.counters.buffers_processed += 1;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn account_buffer(&mut self, buffer_number: u32) {
        let loss = buffer_number
            .wrapping_sub(self.last_buffer_number)
            .wrapping_sub(1);

        if loss > 0 && self.last_buffer_number != buffer_number {
            self.counters.internal_buffer_loss += loss as u64;
            self.reset_event_state();
        }

        self.last_buffer_number = buffer_number;
    }

    /// Core word-stream state machine. Advances `pos` through `words`;
    /// state persists across calls so inputs may end anywhere.
    fn parse_contents(
        &mut self,
        consumer: &mut dyn ReadoutConsumer,
        words: &[u32],
        pos: &mut usize,
    ) -> Result<(), ParseError> {
        while *pos < words.len() {
            let fingerprint = self.fingerprint(*pos);

            self.parse_step(consumer, words, pos)?;

            // The machine must consume input or advance its cursor on
            // every iteration; anything else means it is stuck.
            if self.fingerprint(*pos) == fingerprint {
                return Err(ParseError::ContentsNotAdvancing);
            }
        }

        // Input exhausted; run any transitions that need no words (empty
        // trailing parts, event completion at a buffer boundary).
        self.advance_idle(consumer);

        Ok(())
    }

    fn fingerprint(&self, pos: usize) -> (usize, Option<usize>, usize, u8, u32, u16, u16, u16, u64) {
        (
            pos,
            self.event_index,
            self.module_index,
            self.phase as u8,
            self.phase_words_left,
            self.cur_stack_frame.map_or(u16::MAX, |f| f.words_left),
            self.cur_block_frame.map_or(u16::MAX, |f| f.words_left),
            self.cur_system_frame.map_or(u16::MAX, |f| f.words_left),
            self.counters.events_dispatched,
        )
    }

    fn parse_step(
        &mut self,
        consumer: &mut dyn ReadoutConsumer,
        words: &[u32],
        pos: &mut usize,
    ) -> Result<(), ParseError> {
        // An open system event takes precedence: copy its payload.
        if let Some(mut frame) = self.cur_system_frame {
            if frame.words_left > 0 {
                let n = (words.len() - *pos).min(frame.words_left as usize);
                self.system_event_buf.extend_from_slice(&words[*pos..*pos + n]);
                *pos += n;
                frame.words_left -= n as u16;
            }

            if frame.words_left == 0 {
                self.cur_system_frame = None;

                if !system_event::is_continuation(frame.header) {
                    self.deliver_system_event(consumer);
                }
            } else {
                self.cur_system_frame = Some(frame);
            }

            return Ok(());
        }

        // A continuation chain expects its next system event part.
        if self.system_subtype.is_some() {
            let header = words[*pos];

            if get_frame_type(header) != FrameType::SystemEvent as u8 {
                return Err(ParseError::NoHeaderPresent);
            }

            *pos += 1;
            self.open_system_frame(header, consumer);
            return Ok(());
        }

        match self.cur_stack_frame {
            None => {
                let header = words[*pos];

                match get_frame_type(header) {
                    t if t == FrameType::SystemEvent as u8 => {
                        *pos += 1;
                        self.open_system_frame(header, consumer);
                        Ok(())
                    }
                    t if t == FrameType::StackFrame as u8 => {
                        *pos += 1;
                        self.open_event(header)?;
                        self.advance_idle(consumer);
                        Ok(())
                    }
                    _ => Err(ParseError::NotAStackFrame),
                }
            }

            Some(frame) if frame.words_left == 0 => {
                if self.event_index.is_none() {
                    // Trailing frame fully drained; close it.
                    self.cur_stack_frame = None;
                    return Ok(());
                }

                // Event still incomplete: the next word must continue it.
                let header = words[*pos];

                if get_frame_type(header) != FrameType::StackContinuation as u8 {
                    // A different frame starting here while a block frame
                    // is still open means the dynamic part was cut off
                    // mid-way.
                    if self.cur_block_frame.is_some() {
                        return Err(ParseError::UnexpectedOpenBlockFrame);
                    }
                    return Err(ParseError::NotAStackContinuation);
                }

                let info = extract_frame_info(header);

                if info.stack != frame.stack() {
                    return Err(ParseError::StackIndexChanged);
                }

                *pos += 1;
                self.cur_stack_frame = Some(FrameParseState::new(header));
                Ok(())
            }

            Some(_) => self.parse_event_words(consumer, words, pos),
        }
    }

    fn open_system_frame(&mut self, header: u32, consumer: &mut dyn ReadoutConsumer) {
        let sub = system_event::extract_subtype(header);

        if self.system_subtype.is_none() {
            self.system_subtype = Some(sub);
            self.system_event_buf.clear();
        }

        self.cur_system_frame = Some(FrameParseState {
            header,
            words_left: system_event::extract_length(header),
        });

        // Zero-length parts complete immediately.
        if system_event::extract_length(header) == 0 {
            self.cur_system_frame = None;

            if !system_event::is_continuation(header) {
                self.deliver_system_event(consumer);
            }
        }
    }

    fn deliver_system_event(&mut self, consumer: &mut dyn ReadoutConsumer) {
        if let Some(sub) = self.system_subtype.take() {
            self.counters.system_events[(sub & 0x7f) as usize] += 1;
            consumer.system_event(sub, &self.system_event_buf);
            self.system_event_buf.clear();
        }
    }

    fn open_event(&mut self, header: u32) -> Result<(), ParseError> {
        let info = extract_frame_info(header);

        // Stack 0 is the immediate stack; readout stack N serves event N-1.
        let ei = (info.stack as usize)
            .checked_sub(FIRST_READOUT_STACK_ID as usize)
            .ok_or(ParseError::EventIndexOutOfRange)?;

        if ei >= self.structure.len() {
            return Err(ParseError::EventIndexOutOfRange);
        }

        let expects_words = self.structure[ei].iter().any(|m| !m.is_empty());

        if info.len == 0 && !info.flags.contains(FrameFlags::CONTINUE) && expects_words {
            return Err(ParseError::EmptyStackFrame);
        }

        trace!(target: "readout.parser", event = ei, len = info.len, "stack frame");

        self.event_index = Some(ei);
        self.module_index = 0;
        self.work_buffer.clear();
        self.spans.clear();
        self.spans
            .resize(self.structure[ei].len(), ModuleSpans::default());
        self.cur_stack_frame = Some(FrameParseState::new(header));
        self.cur_block_frame = None;
        self.enter_prefix(ei);

        Ok(())
    }

    fn module_parts(&self, ei: usize) -> ModuleReadoutParts {
        self.structure[ei][self.module_index]
    }

    fn enter_prefix(&mut self, ei: usize) {
        if self.module_index >= self.structure[ei].len() {
            return;
        }

        self.phase = ModulePhase::Prefix;
        self.phase_words_left = self.module_parts(ei).prefix_len as u32;
        self.spans[self.module_index].prefix.offset = self.work_buffer.len() as u32;
    }

    fn enter_dynamic(&mut self) {
        self.phase = ModulePhase::Dynamic;
        self.phase_words_left = 0;
        self.cur_block_frame = None;
        self.spans[self.module_index].dynamic.offset = self.work_buffer.len() as u32;
    }

    fn enter_suffix(&mut self, ei: usize) {
        self.phase = ModulePhase::Suffix;
        self.phase_words_left = self.module_parts(ei).suffix_len as u32;
        self.spans[self.module_index].suffix.offset = self.work_buffer.len() as u32;
    }

    /// Runs all phase transitions that consume no input: skipping absent
    /// parts, closing finished dynamic parts, advancing modules and
    /// dispatching the event when its last module completes.
    fn advance_idle(&mut self, consumer: &mut dyn ReadoutConsumer) {
        loop {
            let Some(ei) = self.event_index else { return };

            if self.module_index >= self.structure[ei].len() {
                self.dispatch_event(consumer, ei);

                // A cleanly exhausted frame closes with the event.
                if let Some(frame) = self.cur_stack_frame {
                    if frame.words_left == 0 {
                        self.cur_stack_frame = None;
                    }
                }
                return;
            }

            match self.phase {
                ModulePhase::Prefix if self.phase_words_left == 0 => {
                    if self.module_parts(ei).has_dynamic {
                        self.enter_dynamic();
                    } else {
                        self.enter_suffix(ei);
                    }
                }
                ModulePhase::Dynamic => {
                    match self.cur_block_frame {
                        // A finished block frame without the continue flag
                        // ends the dynamic part.
                        Some(block)
                            if block.words_left == 0
                                && !block.flags().contains(FrameFlags::CONTINUE) =>
                        {
                            self.cur_block_frame = None;
                            self.enter_suffix(ei);
                        }
                        _ => return,
                    }
                }
                ModulePhase::Suffix if self.phase_words_left == 0 => {
                    self.module_index += 1;
                    self.enter_prefix(ei);
                }
                _ => return,
            }
        }
    }

    fn parse_event_words(
        &mut self,
        consumer: &mut dyn ReadoutConsumer,
        words: &[u32],
        pos: &mut usize,
    ) -> Result<(), ParseError> {
        self.advance_idle(consumer);

        if self.event_index.is_none() {
            // Event dispatched; drain any trailing words of the frame.
            if let Some(frame) = self.cur_stack_frame.as_mut() {
                let n = (words.len() - *pos).min(frame.words_left as usize);
                *pos += n;
                frame.words_left -= n as u16;
                self.counters.unused_bytes += (n * 4) as u64;
            }
            return Ok(());
        }

        let mut frame = match self.cur_stack_frame {
            Some(f) if f.words_left > 0 => f,
            // Needs a continuation first; handled by the caller arm.
            _ => return Ok(()),
        };

        match self.phase {
            ModulePhase::Prefix | ModulePhase::Suffix => {
                let n = (words.len() - *pos)
                    .min(frame.words_left as usize)
                    .min(self.phase_words_left as usize);

                self.work_buffer.extend_from_slice(&words[*pos..*pos + n]);
                *pos += n;
                frame.words_left -= n as u16;
                self.phase_words_left -= n as u32;

                let span = &mut self.spans[self.module_index];
                match self.phase {
                    ModulePhase::Prefix => span.prefix.size += n as u32,
                    ModulePhase::Suffix => span.suffix.size += n as u32,
                    ModulePhase::Dynamic => unreachable!(),
                }
            }

            ModulePhase::Dynamic => match self.cur_block_frame {
                // No block frame open, or the open one is exhausted with
                // its continue flag set (finished frames without the flag
                // are closed in advance_idle): the next word must be a
                // block frame header.
                None | Some(FrameParseState { words_left: 0, .. }) => {
                    let header = words[*pos];

                    if get_frame_type(header) != FrameType::BlockRead as u8 {
                        return Err(ParseError::NotABlockFrame);
                    }

                    *pos += 1;
                    frame.words_left -= 1;
                    self.cur_block_frame = Some(FrameParseState::new(header));
                }

                Some(mut block) => {
                    let n = (words.len() - *pos)
                        .min(frame.words_left as usize)
                        .min(block.words_left as usize);

                    self.work_buffer.extend_from_slice(&words[*pos..*pos + n]);
                    *pos += n;
                    frame.words_left -= n as u16;
                    block.words_left -= n as u16;
                    self.spans[self.module_index].dynamic.size += n as u32;
                    self.cur_block_frame = Some(block);
                }
            },
        }

        self.cur_stack_frame = Some(frame);
        self.advance_idle(consumer);

        Ok(())
    }

    fn dispatch_event(&mut self, consumer: &mut dyn ReadoutConsumer, ei: usize) {
        consumer.begin_event(ei);

        for (mi, parts) in self.structure[ei].iter().enumerate() {
            let spans = &self.spans[mi];

            if parts.prefix_len > 0 {
                let s = spans.prefix;
                consumer.module_prefix(
                    ei,
                    mi,
                    &self.work_buffer[s.offset as usize..(s.offset + s.size) as usize],
                );
            }

            if parts.has_dynamic {
                let s = spans.dynamic;
                consumer.module_dynamic(
                    ei,
                    mi,
                    &self.work_buffer[s.offset as usize..(s.offset + s.size) as usize],
                );
            }

            if parts.suffix_len > 0 {
                let s = spans.suffix;
                consumer.module_suffix(
                    ei,
                    mi,
                    &self.work_buffer[s.offset as usize..(s.offset + s.size) as usize],
                );
            }
        }

        consumer.end_event(ei);

        self.counters.events_dispatched += 1;
        self.event_index = None;
        self.work_buffer.clear();
    }
}

/// Packet loss between consecutive packet numbers with 12-bit wrap.
/// Mirrors the transport-side calculation; the parser keeps its own counter
/// because it may also consume recorded streams.
fn calc_packet_loss(last: i32, current: u16) -> u32 {
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
