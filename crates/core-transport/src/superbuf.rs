//! Super-command buffer construction and mirror checking.
//!
//! A super-command buffer opens with `CmdBufferStart` (0xF1..), carries any
//! sequence of super commands and closes with `CmdBufferEnd` (0xF2..). The
//! controller answers with a mirror frame echoing the request payload
//! verbatim; `check_mirror` verifies the echo.

use core_proto::super_commands::{self, super_command_word};

use crate::error::MvlcError;

/// Builder for one super-command buffer.
#[derive(Debug, Default)]
pub struct SuperCommandBuilder {
    words: Vec<u32>,
}

impl SuperCommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reference_word(&mut self, reference: u16) -> &mut Self {
        self.words
            .push(super_command_word(super_commands::REFERENCE_WORD, reference));
        self
    }

    pub fn add_read_local(&mut self, address: u16) -> &mut Self {
        self.words
            .push(super_command_word(super_commands::READ_LOCAL, address));
        self
    }

    pub fn add_read_local_block(&mut self, address: u16, words: u16) -> &mut Self {
        self.words
            .push(super_command_word(super_commands::READ_LOCAL_BLOCK, address));
        self.words.push(words as u32);
        self
    }

    pub fn add_write_local(&mut self, address: u16, value: u32) -> &mut Self {
        self.words
            .push(super_command_word(super_commands::WRITE_LOCAL, address));
        self.words.push(value);
        self
    }

    pub fn add_write_reset(&mut self) -> &mut Self {
        self.words
            .push(super_command_word(super_commands::WRITE_RESET, 0));
        self
    }

    /// Appends raw words, used for stack upload sequences built elsewhere.
    pub fn add_words(&mut self, words: &[u32]) -> &mut Self {
        self.words.extend_from_slice(words);
        self
    }

    /// Wraps the accumulated commands in start/end words.
    pub fn finish(self) -> Vec<u32> {
        let mut result = Vec::with_capacity(self.words.len() + 2);
        result.push(super_command_word(super_commands::CMD_BUFFER_START, 0));
        result.extend_from_slice(&self.words);
        result.push(super_command_word(super_commands::CMD_BUFFER_END, 0));
        result
    }
}

/// Verifies that the mirror response echoes the request payload.
///
/// The words between the open/close frame of the request must reappear
/// verbatim in the response after its frame header.
pub fn check_mirror(request: &[u32], response: &[u32]) -> Result<(), MvlcError> {
    if request.len() < 2 {
        return Err(MvlcError::MirrorEmptyRequest);
    }

    if response.is_empty() {
        return Err(MvlcError::MirrorEmptyResponse);
    }

    // Request payload: everything between CmdBufferStart and CmdBufferEnd.
    let payload = &request[1..request.len() - 1];

    if response.len() < payload.len() + 1 {
        return Err(MvlcError::MirrorShortResponse);
    }

    for (i, (&req, &resp)) in payload.iter().zip(&response[1..]).enumerate() {
        if req != resp {
            return Err(MvlcError::MirrorNotEqual { index: i + 1 });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_proto::frame::{make_frame_header, FrameFlags, FrameType};

    fn mirror_response_for(request: &[u32]) -> Vec<u32> {
        let payload = &request[1..request.len() - 1];
        let mut response = Vec::with_capacity(payload.len() + 1);
        response.push(make_frame_header(
            FrameType::SuperFrame,
            FrameFlags::empty(),
            0,
            0,
            payload.len() as u16,
        ));
        response.extend_from_slice(payload);
        response
    }

    #[test]
    fn builder_wraps_with_start_and_end() {
        let mut b = SuperCommandBuilder::new();
        b.add_reference_word(1).add_read_local(0x1100);
        let words = b.finish();

        assert_eq!(words[0] >> 16, super_commands::CMD_BUFFER_START as u32);
        assert_eq!(*words.last().unwrap() >> 16, super_commands::CMD_BUFFER_END as u32);
        assert_eq!(words[1], 0x0101_0001);
        assert_eq!(words[2], 0x0102_1100);
    }

    #[test]
    fn write_local_carries_value_word() {
        let mut b = SuperCommandBuilder::new();
        b.add_write_local(0x1200, 0xDEAD_BEEF);
        let words = b.finish();
        assert_eq!(words[1], 0x0204_1200);
        assert_eq!(words[2], 0xDEAD_BEEF);
    }

    #[test]
    fn mirror_round_trip() {
        let mut b = SuperCommandBuilder::new();
        b.add_reference_word(7).add_write_local(0x1100, 42);
        let request = b.finish();
        let response = mirror_response_for(&request);
        assert!(check_mirror(&request, &response).is_ok());
    }

    #[test]
    fn mirror_mismatch_is_detected() {
        let mut b = SuperCommandBuilder::new();
        b.add_reference_word(7).add_read_local(0x1100);
        let request = b.finish();

        let mut response = mirror_response_for(&request);
        response[2] ^= 1;

        assert!(matches!(
            check_mirror(&request, &response),
            Err(MvlcError::MirrorNotEqual { index: 2 })
        ));
    }

    #[test]
    fn short_response_is_detected() {
        let mut b = SuperCommandBuilder::new();
        b.add_reference_word(7).add_read_local(0x1100);
        let request = b.finish();

        let mut response = mirror_response_for(&request);
        response.pop();

        assert!(matches!(
            check_mirror(&request, &response),
            Err(MvlcError::MirrorShortResponse)
        ));
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(matches!(
            check_mirror(&[], &[0xF100_0000]),
            Err(MvlcError::MirrorEmptyRequest)
        ));
    }
}
