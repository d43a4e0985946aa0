//! Synchronous request/response protocol on the command pipe.
//!
//! Every transaction writes one super-command buffer and reads the mirror
//! response back, verifying the echo. Register access wraps a single
//! `ReadLocal`/`WriteLocal`; VME access uploads a one-command stack to stack
//! slot 0 at offset 0 and executes it immediately, reading back the
//! 0xF3-framed result.
//!
//! Stack-error notifications (0xF7 frames) can arrive interleaved with
//! responses; they are moved to a side queue for the caller to drain and
//! never fail a transaction.

use std::collections::VecDeque;

use core_proto::frame::{extract_frame_info, FrameFlags, FrameInfo};
use core_proto::validators::{
    is_known_buffer, is_stack_buffer, is_stackerror_notification, is_super_buffer,
};
use core_proto::{stacks, AddressMode, Pipe, VmeDataWidth};
use tracing::{debug, trace, warn};

use crate::error::MvlcError;
use crate::stack::{build_stack, build_upload_commands, StackCommand};
use crate::superbuf::{check_mirror, SuperCommandBuilder};
use crate::{read_words, write_words, Transport};

/// A decoded 0xF7 stack-error notification.
#[derive(Debug, Clone)]
pub struct StackErrorNotification {
    pub info: FrameInfo,
    pub words: Vec<u32>,
}

/// Bounds the number of consecutive notification frames absorbed while
/// waiting for an actual response.
const MAX_NOTIFICATION_DRAIN: usize = 100;

pub struct CommandDialog {
    reference_word: u16,
    stack_error_notifications: VecDeque<StackErrorNotification>,
}

impl Default for CommandDialog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDialog {
    pub fn new() -> Self {
        Self {
            reference_word: 1,
            stack_error_notifications: VecDeque::new(),
        }
    }

    fn next_reference(&mut self) -> u16 {
        let r = self.reference_word;
        self.reference_word = self.reference_word.wrapping_add(1).max(1);
        r
    }

    /// Takes the queued stack-error notifications.
    pub fn drain_stack_error_notifications(&mut self) -> Vec<StackErrorNotification> {
        self.stack_error_notifications.drain(..).collect()
    }

    /// Reads one complete frame: a header word classified by
    /// `is_known_buffer`, then exactly `len` payload words.
    fn read_known_buffer(&mut self, t: &mut dyn Transport) -> Result<Vec<u32>, MvlcError> {
        let mut header = Vec::with_capacity(1);
        read_words(t, Pipe::Command, &mut header, 1)?;
        let header = header[0];

        if !is_known_buffer(header) {
            return Err(MvlcError::InvalidBufferHeader(header));
        }

        let info = extract_frame_info(header);

        let mut buffer = Vec::with_capacity(info.len as usize + 1);
        buffer.push(header);
        read_words(t, Pipe::Command, &mut buffer, info.len as usize)?;

        trace!(target: "dialog", header = format_args!("0x{header:08x}"), len = info.len, "frame");

        Ok(buffer)
    }

    /// Reads response frames until one passes `validator`, diverting
    /// stack-error notifications to the side queue.
    pub fn read_response(
        &mut self,
        t: &mut dyn Transport,
        validator: impl Fn(u32) -> bool,
    ) -> Result<Vec<u32>, MvlcError> {
        for _ in 0..MAX_NOTIFICATION_DRAIN {
            let buffer = self.read_known_buffer(t)?;
            let header = buffer[0];

            if is_stackerror_notification(header) {
                let info = extract_frame_info(header);
                warn!(target: "dialog", stack = info.stack, flags = ?info.flags,
                      "stack error notification");
                self.stack_error_notifications.push_back(StackErrorNotification {
                    info,
                    words: buffer[1..].to_vec(),
                });
                continue;
            }

            if !validator(header) {
                return Err(MvlcError::InvalidBufferHeader(header));
            }

            return Ok(buffer);
        }

        Err(MvlcError::NoResponseReceived)
    }

    /// Writes `request` and verifies the mirror response. Returns the full
    /// response including its frame header.
    pub fn mirror_transaction(
        &mut self,
        t: &mut dyn Transport,
        request: &[u32],
    ) -> Result<Vec<u32>, MvlcError> {
        write_words(t, Pipe::Command, request)?;
        let response = self.read_response(t, is_super_buffer)?;
        check_mirror(request, &response)?;
        Ok(response)
    }

    pub fn read_register(&mut self, t: &mut dyn Transport, address: u16) -> Result<u32, MvlcError> {
        let reference = self.next_reference();

        let mut builder = SuperCommandBuilder::new();
        builder.add_reference_word(reference).add_read_local(address);
        let request = builder.finish();

        let response = self.mirror_transaction(t, &request)?;

        // [header, mirrored reference, mirrored ReadLocal, value]
        if response.len() != 4 {
            return Err(MvlcError::UnexpectedResponseSize {
                wanted: 4,
                got: response.len(),
            });
        }

        Ok(response[3])
    }

    pub fn write_register(
        &mut self,
        t: &mut dyn Transport,
        address: u16,
        value: u32,
    ) -> Result<(), MvlcError> {
        let reference = self.next_reference();

        let mut builder = SuperCommandBuilder::new();
        builder
            .add_reference_word(reference)
            .add_write_local(address, value);
        let request = builder.finish();

        self.mirror_transaction(t, &request)?;
        Ok(())
    }

    /// Uploads `stack_words` to stack slot 0 at offset 0, executes it and
    /// reads back the 0xF3-framed response.
    pub fn stack_transaction(
        &mut self,
        t: &mut dyn Transport,
        stack_words: &[u32],
    ) -> Result<Vec<u32>, MvlcError> {
        let reference = self.next_reference();

        let mut builder = build_upload_commands(stack_words, 0)?;
        builder.add_reference_word(reference);
        let request = builder.finish();

        self.mirror_transaction(t, &request)?;

        self.write_register(t, stacks::offset_register(stacks::IMMEDIATE_STACK_ID), 0)?;
        self.write_register(
            t,
            stacks::trigger_register(stacks::IMMEDIATE_STACK_ID),
            (stacks::IMMEDIATE_MASK << stacks::IMMEDIATE_SHIFT) as u32,
        )?;

        self.read_response(t, is_stack_buffer)
    }

    fn check_stack_frame_flags(info: FrameInfo) -> Result<(), MvlcError> {
        if info.flags.contains(FrameFlags::TIMEOUT) {
            return Err(MvlcError::NoVmeResponse);
        }

        if info.flags.has_error() {
            return Err(MvlcError::StackFrameError { flags: info.flags });
        }

        Ok(())
    }

    pub fn vme_single_read(
        &mut self,
        t: &mut dyn Transport,
        address: u32,
        amod: AddressMode,
        width: VmeDataWidth,
    ) -> Result<u32, MvlcError> {
        let stack = build_stack(
            &[StackCommand::VmeRead { address, amod, width }],
            Pipe::Command,
        );

        let response = self.stack_transaction(t, &stack)?;
        let info = extract_frame_info(response[0]);
        Self::check_stack_frame_flags(info)?;

        if response.len() != 2 {
            return Err(MvlcError::UnexpectedResponseSize {
                wanted: 2,
                got: response.len(),
            });
        }

        let mut value = response[1];

        if width == VmeDataWidth::D16 {
            value &= 0xFFFF;
        }

        debug!(target: "dialog", address = format_args!("0x{address:08x}"), value, "vme read");

        Ok(value)
    }

    pub fn vme_single_write(
        &mut self,
        t: &mut dyn Transport,
        address: u32,
        value: u32,
        amod: AddressMode,
        width: VmeDataWidth,
    ) -> Result<(), MvlcError> {
        let stack = build_stack(
            &[StackCommand::VmeWrite { address, value, amod, width }],
            Pipe::Command,
        );

        let response = self.stack_transaction(t, &stack)?;
        let info = extract_frame_info(response[0]);
        Self::check_stack_frame_flags(info)?;

        Ok(())
    }

    /// Block read via BLT32, MBLT64 or 2eSST64. The response may span
    /// multiple continuation-linked stack frames, each containing nested
    /// 0xF5 block frames whose length fields bound the payload.
    pub fn vme_block_read(
        &mut self,
        t: &mut dyn Transport,
        address: u32,
        amod: AddressMode,
        max_transfers: u16,
    ) -> Result<Vec<u32>, MvlcError> {
        if !amod.is_block_mode() {
            return Err(MvlcError::CommandArgOutOfRange);
        }

        let stack = build_stack(
            &[StackCommand::VmeBlockRead { address, amod, max_transfers }],
            Pipe::Command,
        );

        let mut response = self.stack_transaction(t, &stack)?;
        let mut dest = Vec::new();

        loop {
            let stack_info = extract_frame_info(response[0]);
            Self::check_stack_frame_flags(stack_info)?;

            // Walk the nested block frames inside this stack frame.
            let payload = &response[1..];
            let mut i = 0usize;

            while i < payload.len() {
                let block_info = extract_frame_info(payload[i]);

                if !core_proto::validators::is_blockread_buffer(payload[i]) {
                    return Err(MvlcError::InvalidBufferHeader(payload[i]));
                }

                let begin = i + 1;
                let end = begin + block_info.len as usize;

                if end > payload.len() {
                    return Err(MvlcError::ShortRead {
                        transferred: payload.len() - begin,
                        expected: block_info.len as usize,
                    });
                }

                dest.extend_from_slice(&payload[begin..end]);
                i = end;
            }

            if !stack_info.flags.contains(FrameFlags::CONTINUE) {
                break;
            }

            // Continuation frames carry the 0xF9 type.
            response = self.read_response(t, |h| {
                core_proto::frame::get_frame_type(h)
                    == core_proto::frame::FrameType::StackContinuation as u8
            })?;
        }

        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_proto::frame::{make_frame_header, FrameType};
    use core_proto::super_commands;
    use core_proto::ConnectionType;
    use std::collections::HashMap;

    /// Scripted stand-in for the controller: parses written super buffers,
    /// produces mirror responses, keeps a register file and serves queued
    /// stack responses after an immediate-trigger write.
    struct FakeController {
        registers: HashMap<u16, u32>,
        rx: VecDeque<u8>,
        stack_responses: VecDeque<Vec<u32>>,
        /// Frames injected before the next response, e.g. notifications.
        injected: VecDeque<Vec<u32>>,
        uploaded_stack_words: Vec<(u16, u32)>,
        corrupt_mirror: bool,
    }

    impl FakeController {
        fn new() -> Self {
            Self {
                registers: HashMap::new(),
                rx: VecDeque::new(),
                stack_responses: VecDeque::new(),
                injected: VecDeque::new(),
                uploaded_stack_words: Vec::new(),
                corrupt_mirror: false,
            }
        }

        fn queue_frame(&mut self, words: &[u32]) {
            for w in words {
                self.rx.extend(w.to_le_bytes());
            }
        }

        fn handle_super_buffer(&mut self, request: &[u32]) {
            while let Some(frame) = self.injected.pop_front() {
                self.queue_frame(&frame);
            }

            let payload = &request[1..request.len() - 1];

            // Echo every payload word; insert read results after ReadLocal
            // commands; apply WriteLocal side effects.
            let mut response = Vec::new();
            let mut i = 0usize;
            let mut immediate_exec = false;

            while i < payload.len() {
                let word = payload[i];
                response.push(word);

                match super_commands::get_super_command(word) {
                    super_commands::READ_LOCAL => {
                        let addr = (word & 0xFFFF) as u16;
                        response.push(*self.registers.get(&addr).unwrap_or(&0));
                    }
                    super_commands::WRITE_LOCAL => {
                        let addr = (word & 0xFFFF) as u16;
                        let value = payload[i + 1];
                        response.push(value);
                        i += 1;

                        if (stacks::STACK_MEMORY_BEGIN..stacks::STACK_MEMORY_END).contains(&addr) {
                            self.uploaded_stack_words.push((addr, value));
                        } else {
                            self.registers.insert(addr, value);
                        }

                        if addr == stacks::trigger_register(0)
                            && value & ((stacks::IMMEDIATE_MASK as u32) << stacks::IMMEDIATE_SHIFT)
                                != 0
                        {
                            immediate_exec = true;
                        }
                    }
                    _ => {}
                }

                i += 1;
            }

            if self.corrupt_mirror && !response.is_empty() {
                response[0] ^= 1;
            }

            let header = make_frame_header(
                FrameType::SuperFrame,
                FrameFlags::empty(),
                0,
                0,
                response.len() as u16,
            );

            self.queue_frame(&[header]);
            self.queue_frame(&response);

            if immediate_exec {
                if let Some(frame) = self.stack_responses.pop_front() {
                    self.queue_frame(&frame);
                }
            }
        }
    }

    impl Transport for FakeController {
        fn connect(&mut self) -> Result<(), MvlcError> {
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), MvlcError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn connection_type(&self) -> ConnectionType {
            ConnectionType::Eth
        }

        fn write(&mut self, _pipe: Pipe, data: &[u8]) -> Result<usize, MvlcError> {
            let words: Vec<u32> = data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            self.handle_super_buffer(&words);
            Ok(data.len())
        }

        fn read(&mut self, _pipe: Pipe, dest: &mut [u8]) -> Result<usize, MvlcError> {
            if self.rx.is_empty() {
                return Err(MvlcError::ReadTimeout);
            }

            let mut n = 0;
            while n < dest.len() {
                match self.rx.pop_front() {
                    Some(b) => {
                        dest[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }

            Ok(n)
        }

        fn set_read_timeout(&mut self, _pipe: Pipe, _ms: u32) -> Result<(), MvlcError> {
            Ok(())
        }

        fn set_write_timeout(&mut self, _pipe: Pipe, _ms: u32) -> Result<(), MvlcError> {
            Ok(())
        }

        fn read_timeout(&self, _pipe: Pipe) -> u32 {
            0
        }

        fn write_timeout(&self, _pipe: Pipe) -> u32 {
            0
        }
    }

    #[test]
    fn register_write_then_read_round_trips() {
        let mut fake = FakeController::new();
        let mut dialog = CommandDialog::new();

        dialog.write_register(&mut fake, 0x1204, 0x0000_0040).unwrap();
        let value = dialog.read_register(&mut fake, 0x1204).unwrap();
        assert_eq!(value, 0x40);
    }

    #[test]
    fn corrupted_mirror_fails_with_mirror_not_equal() {
        let mut fake = FakeController::new();
        fake.corrupt_mirror = true;
        let mut dialog = CommandDialog::new();

        let err = dialog.write_register(&mut fake, 0x1100, 0).unwrap_err();
        assert!(matches!(err, MvlcError::MirrorNotEqual { .. }));
    }

    #[test]
    fn vme_single_read_returns_framed_value() {
        let mut fake = FakeController::new();
        fake.stack_responses.push_back(vec![
            make_frame_header(FrameType::StackFrame, FrameFlags::empty(), 0, 0, 1),
            0x0000_BEEF,
        ]);

        let mut dialog = CommandDialog::new();
        let value = dialog
            .vme_single_read(&mut fake, 0x0100_0000, AddressMode::A32, VmeDataWidth::D16)
            .unwrap();

        assert_eq!(value, 0xBEEF);
        // The one-command stack was uploaded to stack memory start.
        assert_eq!(fake.uploaded_stack_words[0].0, stacks::STACK_MEMORY_BEGIN);
    }

    #[test]
    fn vme_read_timeout_flag_maps_to_no_vme_response() {
        let mut fake = FakeController::new();
        fake.stack_responses.push_back(vec![make_frame_header(
            FrameType::StackFrame,
            FrameFlags::TIMEOUT,
            0,
            0,
            0,
        )]);

        let mut dialog = CommandDialog::new();
        let err = dialog
            .vme_single_read(&mut fake, 0x0100_0000, AddressMode::A32, VmeDataWidth::D32)
            .unwrap_err();

        assert!(matches!(err, MvlcError::NoVmeResponse));
    }

    #[test]
    fn vme_bus_error_flag_is_fatal() {
        let mut fake = FakeController::new();
        fake.stack_responses.push_back(vec![make_frame_header(
            FrameType::StackFrame,
            FrameFlags::BUS_ERROR,
            0,
            0,
            0,
        )]);

        let mut dialog = CommandDialog::new();
        let err = dialog
            .vme_single_write(
                &mut fake,
                0x0100_0000,
                1,
                AddressMode::A32,
                VmeDataWidth::D32,
            )
            .unwrap_err();

        assert!(matches!(err, MvlcError::StackFrameError { .. }));
    }

    #[test]
    fn block_read_assembles_nested_block_frames() {
        let mut fake = FakeController::new();

        // First stack frame: Continue set, one block frame of 2 words.
        fake.stack_responses.push_back(vec![
            make_frame_header(FrameType::StackFrame, FrameFlags::CONTINUE, 0, 0, 3),
            make_frame_header(FrameType::BlockRead, FrameFlags::CONTINUE, 0, 0, 2),
            0x11,
            0x22,
        ]);

        let mut dialog = CommandDialog::new();

        let continuation = vec![
            make_frame_header(FrameType::StackContinuation, FrameFlags::empty(), 0, 0, 3),
            make_frame_header(FrameType::BlockRead, FrameFlags::empty(), 0, 0, 2),
            0x33,
            0x44,
        ];

        // The continuation frame follows the first stack response directly.
        if let Some(first) = fake.stack_responses.front_mut() {
            first.extend_from_slice(&continuation);
        }

        let data = dialog
            .vme_block_read(&mut fake, 0x0200_0000, AddressMode::Blt32, 4)
            .unwrap();

        assert_eq!(data, vec![0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn non_block_amod_is_rejected() {
        let mut fake = FakeController::new();
        let mut dialog = CommandDialog::new();
        let err = dialog
            .vme_block_read(&mut fake, 0, AddressMode::A32, 1)
            .unwrap_err();
        assert!(matches!(err, MvlcError::CommandArgOutOfRange));
    }

    #[test]
    fn stack_error_notifications_are_diverted() {
        let mut fake = FakeController::new();
        fake.injected.push_back(vec![
            make_frame_header(FrameType::StackError, FrameFlags::BUS_ERROR, 2, 0, 1),
            0x0000_1234,
        ]);

        let mut dialog = CommandDialog::new();
        dialog.write_register(&mut fake, 0x1204, 7).unwrap();

        let notifications = dialog.drain_stack_error_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].info.stack, 2);
        assert_eq!(notifications[0].words, vec![0x1234]);
        assert!(notifications[0].info.flags.contains(FrameFlags::BUS_ERROR));
    }
}
