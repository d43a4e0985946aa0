//! Command stack construction, upload and trigger management.
//!
//! Stacks are sequences of stack-only commands stored in the controller's
//! stack memory area and executed in reaction to triggers. Uploading a stack
//! means writing its words to stack memory via `WriteLocal` super commands;
//! execution output streams back as 0xF3-framed data on the pipe encoded in
//! the `StackStart` word.

use core_proto::stack_commands::{self, stack_command_word};
use core_proto::{stacks, AddressMode, Pipe, VmeDataWidth};

use crate::dialog::CommandDialog;
use crate::error::MvlcError;
use crate::superbuf::SuperCommandBuilder;
use crate::Transport;

/// Commands that may appear inside a stack.
///
/// Output contributions per command: `WriteMarker` and `VmeRead` produce one
/// word; `VmeBlockRead` produces a 0xF5-framed dynamic part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StackCommand {
    VmeRead {
        address: u32,
        amod: AddressMode,
        width: VmeDataWidth,
    },
    VmeBlockRead {
        address: u32,
        amod: AddressMode,
        max_transfers: u16,
    },
    VmeWrite {
        address: u32,
        value: u32,
        amod: AddressMode,
        width: VmeDataWidth,
    },
    WriteMarker {
        value: u32,
    },
}

impl StackCommand {
    fn encode(&self, out: &mut Vec<u32>) {
        match *self {
            StackCommand::VmeRead { address, amod, width } => {
                out.push(stack_command_word(
                    stack_commands::VME_READ,
                    amod as u8,
                    width as u16,
                ));
                out.push(address);
            }
            StackCommand::VmeBlockRead { address, amod, max_transfers } => {
                out.push(stack_command_word(
                    stack_commands::VME_READ,
                    amod as u8,
                    max_transfers,
                ));
                out.push(address);
            }
            StackCommand::VmeWrite { address, value, amod, width } => {
                out.push(stack_command_word(
                    stack_commands::VME_WRITE,
                    amod as u8,
                    width as u16,
                ));
                out.push(address);
                out.push(value);
            }
            StackCommand::WriteMarker { value } => {
                out.push(stack_command_word(stack_commands::WRITE_MARKER, 0, 0));
                out.push(value);
            }
        }
    }
}

/// Builds the raw stack words, bracketed by `StackStart`/`StackEnd`. The
/// execution output is routed to `out_pipe`.
pub fn build_stack(commands: &[StackCommand], out_pipe: Pipe) -> Vec<u32> {
    let mut words = Vec::new();

    words.push(stack_command_word(
        stack_commands::STACK_START,
        out_pipe as u8,
        0,
    ));

    for cmd in commands {
        cmd.encode(&mut words);
    }

    words.push(stack_command_word(stack_commands::STACK_END, 0, 0));

    words
}

/// Builds the super-command sequence that uploads `stack` to stack memory
/// starting at the given word offset.
pub fn build_upload_commands(
    stack: &[u32],
    start_offset_words: u16,
) -> Result<SuperCommandBuilder, MvlcError> {
    let end_words = start_offset_words as usize + stack.len();

    if end_words > stacks::STACK_MEMORY_WORDS as usize {
        return Err(MvlcError::StackMemoryExceeded { words: end_words });
    }

    let mut builder = SuperCommandBuilder::new();
    let mut address = stacks::STACK_MEMORY_BEGIN + start_offset_words * 4;

    for &word in stack {
        builder.add_write_local(address, word);
        address += 4;
    }

    Ok(builder)
}

/// Writes the DAQ mode enable register. The register is effectively
/// always active: triggers fire as soon as the individual trigger
/// registers are written, so this write is kept for protocol completeness
/// and does not gate anything.
pub fn write_daq_mode(
    dialog: &mut CommandDialog,
    transport: &mut dyn Transport,
    enable: bool,
) -> Result<(), MvlcError> {
    dialog.write_register(
        transport,
        core_proto::registers::DAQ_MODE_ENABLE,
        enable as u32,
    )
}

/// Writes `NoTrigger` to every stack trigger register.
pub fn disable_all_triggers(
    dialog: &mut CommandDialog,
    transport: &mut dyn Transport,
) -> Result<(), MvlcError> {
    for stack_id in 0..stacks::STACK_COUNT {
        dialog.write_register(
            transport,
            stacks::trigger_register(stack_id),
            stacks::TriggerType::NoTrigger as u32,
        )?;
    }

    Ok(())
}

/// Configures the trigger and offset registers for a readout stack that has
/// already been uploaded at `offset_words`.
pub fn setup_stack_trigger(
    dialog: &mut CommandDialog,
    transport: &mut dyn Transport,
    stack_id: u8,
    offset_words: u16,
    trigger_type: stacks::TriggerType,
    trigger_bits: u8,
) -> Result<(), MvlcError> {
    if stack_id >= stacks::STACK_COUNT {
        return Err(MvlcError::CommandArgOutOfRange);
    }

    dialog.write_register(
        transport,
        stacks::offset_register(stack_id),
        (offset_words * 4 & stacks::STACK_OFFSET_BIT_MASK_BYTES) as u32,
    )?;

    dialog.write_register(
        transport,
        stacks::trigger_register(stack_id),
        stacks::trigger_value(trigger_type, trigger_bits, false) as u32,
    )?;

    Ok(())
}
