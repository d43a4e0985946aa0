//! Readout stream parsing: reassembles framed events from a possibly lossy
//! sequence of readout buffers and hands linearized per-module data to a
//! consumer.
//!
//! The readout of each module consists of up to three parts: a fixed-size
//! prefix, one dynamic block transfer and a fixed-size suffix, each
//! optional. The parser follows the stack/block/continuation framing across
//! buffer and packet boundaries, copies the words of the current event into
//! a work buffer and dispatches the event once every module completed all
//! of its parts.

mod parser;

pub use parser::{ReadoutParser, MAX_MODULES_PER_EVENT};

use thiserror::Error;

/// Static readout shape of one module: word counts of the fixed parts and
/// whether a dynamic block part is present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleReadoutParts {
    pub prefix_len: u8,
    pub suffix_len: u8,
    pub has_dynamic: bool,
}

impl ModuleReadoutParts {
    pub fn is_empty(&self) -> bool {
        self.prefix_len == 0 && self.suffix_len == 0 && !self.has_dynamic
    }
}

/// Per-event, per-module readout shapes. Outer index: event, inner: module.
pub type ReadoutStructure = Vec<Vec<ModuleReadoutParts>>;

/// Sink for reassembled events.
///
/// For each completed event the parser calls `begin_event`, then the
/// per-module part callbacks in module order, then `end_event`. Callbacks
/// for parts a module does not declare are skipped; a declared dynamic part
/// may still deliver an empty slice.
pub trait ReadoutConsumer {
    fn begin_event(&mut self, _event_index: usize) {}
    fn module_prefix(&mut self, _event_index: usize, _module_index: usize, _data: &[u32]) {}
    fn module_dynamic(&mut self, _event_index: usize, _module_index: usize, _data: &[u32]) {}
    fn module_suffix(&mut self, _event_index: usize, _module_index: usize, _data: &[u32]) {}
    fn end_event(&mut self, _event_index: usize) {}

    /// One callback per system event; continuation parts are rejoined into
    /// `data` before delivery.
    fn system_event(&mut self, _subtype: u8, _data: &[u32]) {}
}

/// Parse failure taxonomy. Errors are counted and recover at buffer (USB)
/// or packet (Ethernet) granularity; they never abort the run by
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no frame header present at the current position")]
    NoHeaderPresent,
    #[error("expected a stack frame header")]
    NotAStackFrame,
    #[error("expected a block read frame header")]
    NotABlockFrame,
    #[error("expected a stack continuation frame header")]
    NotAStackContinuation,
    #[error("stack index changed between a frame and its continuation")]
    StackIndexChanged,
    #[error("stack frame maps to an event index outside the readout structure")]
    EventIndexOutOfRange,
    #[error("module index outside the readout structure")]
    ModuleIndexOutOfRange,
    #[error("empty stack frame for an event that expects data")]
    EmptyStackFrame,
    #[error("block frame still open at a point where none may be")]
    UnexpectedOpenBlockFrame,
    #[error("readout contents parsing is not advancing")]
    ContentsNotAdvancing,
    #[error("ethernet buffer parsing is not advancing")]
    EthBufferNotAdvancing,
    #[error("ethernet packet parsing is not advancing")]
    EthPacketNotAdvancing,
}

pub const PARSE_ERROR_COUNT: usize = 12;

impl ParseError {
    pub(crate) fn index(self) -> usize {
        match self {
            ParseError::NoHeaderPresent => 0,
            ParseError::NotAStackFrame => 1,
            ParseError::NotABlockFrame => 2,
            ParseError::NotAStackContinuation => 3,
            ParseError::StackIndexChanged => 4,
            ParseError::EventIndexOutOfRange => 5,
            ParseError::ModuleIndexOutOfRange => 6,
            ParseError::EmptyStackFrame => 7,
            ParseError::UnexpectedOpenBlockFrame => 8,
            ParseError::ContentsNotAdvancing => 9,
            ParseError::EthBufferNotAdvancing => 10,
            ParseError::EthPacketNotAdvancing => 11,
        }
    }
}

/// Parser statistics. Errors increment their slot in `parse_errors`; the
/// run keeps going regardless.
#[derive(Debug, Clone)]
pub struct ReadoutParserCounters {
    pub buffers_processed: u64,
    pub internal_buffer_loss: u64,
    pub unused_bytes: u64,
    pub eth_packets_processed: u64,
    pub eth_packet_loss: u64,
    pub events_dispatched: u64,
    pub system_events: [u64; 0x80],
    pub parse_errors: [u64; PARSE_ERROR_COUNT],
}

impl Default for ReadoutParserCounters {
    fn default() -> Self {
        Self {
            buffers_processed: 0,
            internal_buffer_loss: 0,
            unused_bytes: 0,
            eth_packets_processed: 0,
            eth_packet_loss: 0,
            events_dispatched: 0,
            system_events: [0; 0x80],
            parse_errors: [0; PARSE_ERROR_COUNT],
        }
    }
}

impl ReadoutParserCounters {
    pub fn total_parse_errors(&self) -> u64 {
        self.parse_errors.iter().sum()
    }

    pub fn error_count(&self, e: ParseError) -> u64 {
        self.parse_errors[e.index()]
    }
}
