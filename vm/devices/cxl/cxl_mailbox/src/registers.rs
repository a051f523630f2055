// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed access to the mailbox register block.

use cxl_device::DeviceRegisterIo;
use cxl_spec::mailbox::BackgroundCommandStatus;
use cxl_spec::mailbox::MailboxCapabilities;
use cxl_spec::mailbox::MailboxCommand;
use cxl_spec::mailbox::MailboxControl;
use cxl_spec::mailbox::MailboxStatus;
use cxl_spec::mailbox::offsets;

pub(crate) struct MailboxRegisters<T> {
    regs: T,
}

impl<T: DeviceRegisterIo> MailboxRegisters<T> {
    pub fn new(regs: T) -> Self {
        Self { regs }
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn capabilities(&self) -> MailboxCapabilities {
        MailboxCapabilities::from_bits(self.regs.read_u32(offsets::CAPABILITIES))
    }

    pub fn control(&self) -> MailboxControl {
        MailboxControl::from_bits(self.regs.read_u32(offsets::CONTROL))
    }

    pub fn set_control(&self, control: MailboxControl) {
        self.regs.write_u32(offsets::CONTROL, control.into_bits())
    }

    pub fn command(&self) -> MailboxCommand {
        MailboxCommand::from_bits(self.regs.read_u64(offsets::COMMAND))
    }

    pub fn set_command(&self, command: MailboxCommand) {
        self.regs.write_u64(offsets::COMMAND, command.into_bits())
    }

    pub fn status(&self) -> MailboxStatus {
        MailboxStatus::from_bits(self.regs.read_u64(offsets::STATUS))
    }

    pub fn background_status(&self) -> BackgroundCommandStatus {
        BackgroundCommandStatus::from_bits(self.regs.read_u64(offsets::BACKGROUND_STATUS))
    }

    /// Writes `data` to the start of the payload window as dwords. The last
    /// dword is zero padded.
    pub fn write_payload(&self, data: &[u8]) {
        for (i, chunk) in data.chunks(4).enumerate() {
            let mut n = [0; 4];
            n[..chunk.len()].copy_from_slice(chunk);
            self.regs
                .write_u32(offsets::PAYLOAD + i * 4, u32::from_le_bytes(n));
        }
    }

    /// Reads `data.len()` bytes from the start of the payload window as
    /// dwords.
    pub fn read_payload(&self, data: &mut [u8]) {
        for (i, chunk) in data.chunks_mut(4).enumerate() {
            let n = self.regs.read_u32(offsets::PAYLOAD + i * 4).to_le_bytes();
            chunk.copy_from_slice(&n[..chunk.len()]);
        }
    }

    pub fn into_inner(self) -> T {
        self.regs
    }
}
