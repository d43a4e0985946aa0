//! Framing header codec.
//!
//! Every frame in the command and data streams is headed by one 32-bit word:
//!
//! `Type[31:24] | FrameFlags[23:20] | StackNum[19:16] | CtrlId[15:13] | Length[12:0]`
//!
//! The length counts payload words following the header. The `Continue` flag
//! links a frame to a follow-up frame carrying more payload of the same
//! logical unit.

use bitflags::bitflags;

pub const TYPE_SHIFT: u32 = 24;
pub const TYPE_MASK: u32 = 0xff;

pub const FRAME_FLAGS_SHIFT: u32 = 20;
pub const FRAME_FLAGS_MASK: u32 = 0xf;

pub const STACK_NUM_SHIFT: u32 = 16;
pub const STACK_NUM_MASK: u32 = 0xf;

pub const CTRL_ID_SHIFT: u32 = 13;
pub const CTRL_ID_MASK: u32 = 0b111;

pub const LENGTH_SHIFT: u32 = 0;
pub const LENGTH_MASK: u32 = 0x1fff;

/// Frame types appearing in the data streams. The value is the high byte of
/// the header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Mirror response to a super command buffer.
    SuperFrame = 0xF1,
    /// Output of a stack execution.
    StackFrame = 0xF3,
    /// Dynamic part of a VME block read, nested in a stack frame.
    BlockRead = 0xF5,
    /// Asynchronous notification about a failed stack execution.
    StackError = 0xF7,
    /// Continuation of a stack frame that had the Continue flag set.
    StackContinuation = 0xF9,
    /// Software-generated event (timestamps, pause/resume, end of file).
    SystemEvent = 0xFA,
}

impl FrameType {
    pub fn from_raw(raw: u8) -> Option<FrameType> {
        match raw {
            0xF1 => Some(FrameType::SuperFrame),
            0xF3 => Some(FrameType::StackFrame),
            0xF5 => Some(FrameType::BlockRead),
            0xF7 => Some(FrameType::StackError),
            0xF9 => Some(FrameType::StackContinuation),
            0xFA => Some(FrameType::SystemEvent),
            _ => None,
        }
    }
}

bitflags! {
    /// Flag bits of a frame header. Any of `TIMEOUT`, `BUS_ERROR` or
    /// `SYNTAX_ERROR` is fatal for the transaction the frame belongs to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const TIMEOUT = 1 << 0;
        const BUS_ERROR = 1 << 1;
        const SYNTAX_ERROR = 1 << 2;
        const CONTINUE = 1 << 3;
    }
}

impl FrameFlags {
    pub const ALL_ERROR_FLAGS: FrameFlags = FrameFlags::TIMEOUT
        .union(FrameFlags::BUS_ERROR)
        .union(FrameFlags::SYNTAX_ERROR);

    #[inline]
    pub fn has_error(self) -> bool {
        self.intersects(Self::ALL_ERROR_FLAGS)
    }
}

/// Decoded view of a frame header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameInfo {
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stack: u8,
    pub ctrl: u8,
    pub len: u16,
}

impl FrameInfo {
    #[inline]
    pub fn typed(&self) -> Option<FrameType> {
        FrameType::from_raw(self.frame_type)
    }
}

#[inline]
pub fn get_frame_type(header: u32) -> u8 {
    ((header >> TYPE_SHIFT) & TYPE_MASK) as u8
}

/// Decodes a header word into its fields. Any word decodes; callers check
/// `frame_type` against the expected type.
#[inline]
pub fn extract_frame_info(header: u32) -> FrameInfo {
    FrameInfo {
        frame_type: get_frame_type(header),
        flags: FrameFlags::from_bits_truncate(((header >> FRAME_FLAGS_SHIFT) & FRAME_FLAGS_MASK) as u8),
        stack: ((header >> STACK_NUM_SHIFT) & STACK_NUM_MASK) as u8,
        ctrl: ((header >> CTRL_ID_SHIFT) & CTRL_ID_MASK) as u8,
        len: ((header >> LENGTH_SHIFT) & LENGTH_MASK) as u16,
    }
}

#[inline]
pub fn make_frame_header(
    frame_type: FrameType,
    flags: FrameFlags,
    stack: u8,
    ctrl: u8,
    len: u16,
) -> u32 {
    ((frame_type as u32) << TYPE_SHIFT)
        | ((flags.bits() as u32 & FRAME_FLAGS_MASK) << FRAME_FLAGS_SHIFT)
        | ((stack as u32 & STACK_NUM_MASK) << STACK_NUM_SHIFT)
        | ((ctrl as u32 & CTRL_ID_MASK) << CTRL_ID_SHIFT)
        | (len as u32 & LENGTH_MASK)
}
