//! Wire-level constants and codecs for the MVLC controller.
//!
//! Communication with the controller uses 32-bit binary data words in
//! little-endian byte order. Command results and stack execution output are
//! 32-bit aligned. This crate holds the word layouts shared by the transport,
//! dialog, readout and listfile layers: frame headers, super and stack
//! command words, system events, the internal register map and the listfile
//! container format.

pub mod frame;
pub mod listfile;
pub mod system_event;

pub use frame::{extract_frame_info, make_frame_header, FrameFlags, FrameInfo, FrameType};

/// Increment between consecutive internal register addresses.
pub const ADDRESS_INCREMENT: u16 = 4;

/// Word limit of a single `ReadLocalBlock` response.
pub const READ_LOCAL_BLOCK_MAX_WORDS: u32 = 768;

/// A logical bidirectional channel to the controller.
///
/// Super command output always arrives on the command pipe; stack execution
/// output goes to the pipe encoded in the `StackStart` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pipe {
    Command = 0,
    Data = 1,
}

pub const PIPE_COUNT: usize = 2;

impl Pipe {
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Eth,
}

/// Super commands are interpreted and executed directly by the controller.
///
/// The enum values are the two high bytes of the command word; the 16-bit
/// command argument occupies the low half. Further 32-bit operand words
/// follow as required by the individual command.
pub mod super_commands {
    pub const CMD_BUFFER_START: u16 = 0xF100;
    pub const CMD_BUFFER_END: u16 = 0xF200;
    pub const REFERENCE_WORD: u16 = 0x0101;
    pub const READ_LOCAL: u16 = 0x0102;
    pub const READ_LOCAL_BLOCK: u16 = 0x0103;
    pub const WRITE_LOCAL: u16 = 0x0204;
    pub const WRITE_RESET: u16 = 0x0206;

    pub const SUPER_CMD_SHIFT: u32 = 16;
    pub const SUPER_CMD_MASK: u32 = 0xFFFF;
    pub const SUPER_CMD_ARG_MASK: u32 = 0xFFFF;

    /// Packs a super command and its 16-bit argument into one word.
    #[inline]
    pub const fn super_command_word(cmd: u16, arg: u16) -> u32 {
        ((cmd as u32) << SUPER_CMD_SHIFT) | arg as u32
    }

    #[inline]
    pub const fn get_super_command(word: u32) -> u16 {
        ((word >> SUPER_CMD_SHIFT) & SUPER_CMD_MASK) as u16
    }
}

/// Stack-only commands, written into stack memory via `WriteLocal`.
pub mod stack_commands {
    pub const STACK_START: u8 = 0xF3;
    pub const STACK_END: u8 = 0xF4;
    pub const VME_READ: u8 = 0x12;
    pub const VME_WRITE: u8 = 0x23;
    pub const WRITE_MARKER: u8 = 0xC2;
    pub const WRITE_SPECIAL: u8 = 0xC1;

    pub const CMD_SHIFT: u32 = 24;
    pub const CMD_ARG0_SHIFT: u32 = 16;
    pub const CMD_ARG0_MASK: u32 = 0x00FF;
    pub const CMD_ARG1_MASK: u32 = 0x0000FFFF;

    #[inline]
    pub const fn stack_command_word(cmd: u8, arg0: u8, arg1: u16) -> u32 {
        ((cmd as u32) << CMD_SHIFT) | ((arg0 as u32) << CMD_ARG0_SHIFT) | arg1 as u32
    }
}

/// VME data width of a single-word access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmeDataWidth {
    D16 = 0x1,
    D32 = 0x2,
}

/// VME address modifiers used by the stack commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressMode {
    A16 = 0x2D,
    A24 = 0x39,
    A32 = 0x09,
    Blt32 = 0x0B,
    Mblt64 = 0x08,
    Blk2eSst64 = 0x20,
}

impl AddressMode {
    /// Block transfer modes produce framed dynamic output.
    pub fn is_block_mode(self) -> bool {
        matches!(
            self,
            AddressMode::Blt32 | AddressMode::Mblt64 | AddressMode::Blk2eSst64
        )
    }
}

/// Transfer rate selection for 2eSST block reads, shifted relative to the
/// address mode argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Blk2eSstRate {
    Rate160MB = 0,
    Rate276MB = 1,
    Rate300MB = 2,
}

pub const BLK_2E_SST_RATE_SHIFT: u32 = 6;

/// Internal register map. 16-bit register offsets.
pub mod registers {
    pub const INTERNAL_REGISTER_MIN: u16 = 0x0001;
    pub const INTERNAL_REGISTER_MAX: u16 = 0x5FFF;

    /// Bit 0 enables autonomous stack execution in reaction to triggers.
    /// Effectively always active: the controller processes triggers as soon
    /// as an individual stack trigger register is written, so writing this
    /// register is a no-op switch.
    pub const DAQ_MODE_ENABLE: u16 = 0x1300;
}

/// Command stack layout: trigger and offset registers plus the stack memory
/// area.
pub mod stacks {
    use super::ADDRESS_INCREMENT;

    pub const STACK_COUNT: u8 = 8;
    pub const STACK0_TRIGGER_REGISTER: u16 = 0x1100;

    // The offset registers take byte offsets from STACK_MEMORY_BEGIN, not
    // absolute addresses.
    pub const STACK0_OFFSET_REGISTER: u16 = 0x1200;

    pub const STACK_MEMORY_BEGIN: u16 = 0x2000;
    pub const STACK_MEMORY_WORDS: u16 = 1024;
    pub const STACK_MEMORY_BYTES: u16 = STACK_MEMORY_WORDS * 4;
    pub const STACK_MEMORY_END: u16 = STACK_MEMORY_BEGIN + STACK_MEMORY_BYTES;

    pub const STACK_OFFSET_BIT_MASK_WORDS: u16 = 0x03FF;
    pub const STACK_OFFSET_BIT_MASK_BYTES: u16 = STACK_OFFSET_BIT_MASK_WORDS * 4;

    /// Stack 0 is reserved by software convention for immediate execution,
    /// e.g. directly accessing a VME device register.
    pub const IMMEDIATE_STACK_ID: u8 = 0;
    pub const IMMEDIATE_STACK_RESERVED_WORDS: u16 = 128;
    pub const FIRST_READOUT_STACK_ID: u8 = 1;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum TriggerType {
        NoTrigger = 0,
        IrqWithIack = 1,
        IrqNoIack = 2,
        External = 3,
        TimerUnderrun = 4,
    }

    // For IRQ triggers the trigger bits hold (IRQ - 1), e.g. 0 for IRQ1.
    pub const TRIGGER_BITS_MASK: u16 = 0b11111;
    pub const TRIGGER_BITS_SHIFT: u16 = 0;
    pub const TRIGGER_TYPE_MASK: u16 = 0b111;
    pub const TRIGGER_TYPE_SHIFT: u16 = 5;
    pub const IMMEDIATE_MASK: u16 = 0b1;
    pub const IMMEDIATE_SHIFT: u16 = 8;

    #[inline]
    pub fn trigger_register(stack_id: u8) -> u16 {
        STACK0_TRIGGER_REGISTER + stack_id as u16 * ADDRESS_INCREMENT
    }

    #[inline]
    pub fn offset_register(stack_id: u8) -> u16 {
        STACK0_OFFSET_REGISTER + stack_id as u16 * ADDRESS_INCREMENT
    }

    #[inline]
    pub fn trigger_value(trigger_type: TriggerType, trigger_bits: u8, immediate: bool) -> u16 {
        ((trigger_type as u16 & TRIGGER_TYPE_MASK) << TRIGGER_TYPE_SHIFT)
            | ((trigger_bits as u16 & TRIGGER_BITS_MASK) << TRIGGER_BITS_SHIFT)
            | ((immediate as u16 & IMMEDIATE_MASK) << IMMEDIATE_SHIFT)
    }
}

/// USB transport limits imposed by the bulk endpoint driver.
pub mod usb {
    pub const SINGLE_TRANSFER_MAX_BYTES: usize = 1024 * 1024;
    pub const SINGLE_TRANSFER_MAX_WORDS: usize = SINGLE_TRANSFER_MAX_BYTES / 4;
}

/// Ethernet transport: remote ports and the per-datagram two-word header.
pub mod eth {
    pub const COMMAND_PORT: u16 = 0x8000; // 32768
    pub const DATA_PORT: u16 = COMMAND_PORT + 1;
    pub const HEADER_WORDS: usize = 2;
    pub const HEADER_BYTES: usize = HEADER_WORDS * 4;

    /// First header word: packet channel, packet number, payload word count.
    pub mod header0 {
        pub const PACKET_CHANNEL_MASK: u32 = 0b11;
        pub const PACKET_CHANNEL_SHIFT: u32 = 28;

        // Packet channel specific incrementing packet number.
        pub const PACKET_NUMBER_MASK: u32 = 0xfff;
        pub const PACKET_NUMBER_SHIFT: u32 = 16;

        // Number of data words following the two header words.
        pub const NUM_DATA_WORDS_MASK: u32 = 0x1fff;
        pub const NUM_DATA_WORDS_SHIFT: u32 = 0;
    }

    /// Second header word: timestamp and next-header pointer.
    pub mod header1 {
        // Increments in 1 ms steps, wraps after 17.5 minutes.
        pub const TIMESTAMP_MASK: u32 = 0xfffff;
        pub const TIMESTAMP_SHIFT: u32 = 12;

        // Word offset of the next frame header inside the packet payload.
        // The position directly after the header words is 0. The maximum
        // value means no frame header is present: the packet carries only
        // continuation data of a previously opened frame. This pointer is
        // what allows resuming after packet loss.
        pub const HEADER_POINTER_MASK: u32 = 0xfff;
        pub const HEADER_POINTER_SHIFT: u32 = 0;
        pub const NO_HEADER_POINTER_PRESENT: u32 = HEADER_POINTER_MASK;
    }

    pub const JUMBO_FRAME_MAX_SIZE: usize = 9000;

    /// Multiplexed data streams, each with its own packet number counter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum PacketChannel {
        /// Command and mirror responses.
        Command = 0,
        /// Stack execution output routed to the command pipe.
        Stack = 1,
        /// Readout data produced by stacks routed to the data pipe.
        Data = 2,
    }

    pub const NUM_PACKET_CHANNELS: usize = 3;
}

/// Loopback address on the VME bus referring to the controller itself.
pub const SELF_VME_ADDRESS: u32 = 0xFFFF_0000;

pub const DEFAULT_WRITE_TIMEOUT_MS: u32 = 10;
pub const DEFAULT_READ_TIMEOUT_MS: u32 = 10;

/// Response-buffer classification helpers used by the command dialog.
pub mod validators {
    use crate::frame::{get_frame_type, FrameType};

    #[inline]
    pub fn is_super_buffer(header: u32) -> bool {
        get_frame_type(header) == FrameType::SuperFrame as u8
    }

    #[inline]
    pub fn is_stack_buffer(header: u32) -> bool {
        get_frame_type(header) == FrameType::StackFrame as u8
    }

    #[inline]
    pub fn is_blockread_buffer(header: u32) -> bool {
        get_frame_type(header) == FrameType::BlockRead as u8
    }

    #[inline]
    pub fn is_stackerror_notification(header: u32) -> bool {
        get_frame_type(header) == FrameType::StackError as u8
    }

    #[inline]
    pub fn is_known_buffer(header: u32) -> bool {
        is_super_buffer(header)
            || is_stack_buffer(header)
            || is_blockread_buffer(header)
            || is_stackerror_notification(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn super_command_word_packing() {
        let w = super_commands::super_command_word(super_commands::READ_LOCAL, 0x1100);
        assert_eq!(w, 0x0102_1100);
        assert_eq!(super_commands::get_super_command(w), 0x0102);
    }

    #[test]
    fn stack_command_word_packing() {
        let w = stack_commands::stack_command_word(
            stack_commands::VME_READ,
            AddressMode::A32 as u8,
            VmeDataWidth::D16 as u16,
        );
        assert_eq!(w >> 24, 0x12);
        assert_eq!((w >> 16) & 0xFF, 0x09);
        assert_eq!(w & 0xFFFF, 0x1);
    }

    #[test]
    fn stack_register_addresses() {
        assert_eq!(stacks::trigger_register(0), 0x1100);
        assert_eq!(stacks::trigger_register(3), 0x110C);
        assert_eq!(stacks::offset_register(7), 0x121C);
    }

    #[test]
    fn trigger_value_irq1() {
        // IRQ1 encodes trigger bits 0.
        let v = stacks::trigger_value(stacks::TriggerType::IrqWithIack, 0, false);
        assert_eq!(v, 1 << stacks::TRIGGER_TYPE_SHIFT);
    }

    #[test]
    fn buffer_validators() {
        assert!(validators::is_super_buffer(0xF100_0002));
        assert!(validators::is_stack_buffer(0xF301_0010));
        assert!(validators::is_blockread_buffer(0xF500_0000));
        assert!(validators::is_stackerror_notification(0xF700_0001));
        assert!(!validators::is_known_buffer(0xFA00_0001));
    }
}
