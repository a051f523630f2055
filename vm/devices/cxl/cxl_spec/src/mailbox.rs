// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CXL mailbox registers, opcodes and return codes.
//!
//! Sources: CXL 3.1 Spec - 8.2.8.4
//!
//! | Offset | Register                          |
//! |--------|-----------------------------------|
//! | 0x00   | Mailbox Capabilities (u32)        |
//! | 0x04   | Mailbox Control (u32)             |
//! | 0x08   | Command (u64)                     |
//! | 0x10   | Mailbox Status (u64)              |
//! | 0x18   | Background Command Status (u64)   |
//! | 0x20   | Commands Payload                  |

use bitfield_struct::bitfield;
use std::fmt;

/// Register offsets relative to the mailbox capability base.
#[expect(missing_docs)] // self explanatory offsets
pub mod offsets {
    pub const CAPABILITIES: usize = 0x00;
    pub const CONTROL: usize = 0x04;
    pub const COMMAND: usize = 0x08;
    pub const STATUS: usize = 0x10;
    pub const BACKGROUND_STATUS: usize = 0x18;
    pub const PAYLOAD: usize = 0x20;
}

/// Size of the register header preceding the payload window.
pub const HEADER_SIZE: usize = offsets::PAYLOAD;

/// The smallest payload size exponent a mailbox may advertise (256 bytes).
pub const MIN_PAYLOAD_SIZE_EXPONENT: u8 = 8;

/// The largest payload size exponent a mailbox may advertise (1 MiB).
pub const MAX_PAYLOAD_SIZE_EXPONENT: u8 = 20;

/// The size of the smallest payload window, and of a minimal mailbox mapping
/// beyond the register header.
pub const MIN_PAYLOAD_SIZE: usize = 1 << MIN_PAYLOAD_SIZE_EXPONENT;

/// Mailbox Capabilities Register
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MailboxCapabilities {
    /// Payload window size, as a power of two.
    #[bits(5)]
    pub payload_size: u8,
    /// The device can raise an interrupt when the doorbell clears.
    pub doorbell_interrupt_capable: bool,
    /// The device can raise an interrupt when a background command completes.
    pub background_interrupt_capable: bool,
    /// MSI/MSI-X vector used for mailbox interrupts.
    #[bits(4)]
    pub interrupt_message_number: u8,
    /// Seconds the mailbox may take to become ready after a reset.
    #[bits(8)]
    pub mailbox_ready_time: u8,
    /// Mailbox type. Zero is a CXL-defined mailbox.
    #[bits(4)]
    pub mailbox_type: u8,
    #[bits(9)]
    _reserved: u16,
}

impl MailboxCapabilities {
    /// The payload window size in bytes, or `None` if the advertised
    /// exponent is outside the architected range.
    pub fn payload_bytes(&self) -> Option<usize> {
        let exponent = self.payload_size();
        (MIN_PAYLOAD_SIZE_EXPONENT..=MAX_PAYLOAD_SIZE_EXPONENT)
            .contains(&exponent)
            .then(|| 1usize << exponent)
    }
}

/// Mailbox Control Register
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MailboxControl {
    /// Set by the host to hand the command to the device; cleared by the
    /// device once the command completes or moves to the background.
    pub doorbell: bool,
    /// Raise an interrupt when the doorbell clears.
    pub doorbell_interrupt: bool,
    /// Raise an interrupt when a background command completes.
    pub background_interrupt: bool,
    #[bits(29)]
    _reserved: u32,
}

/// Command Register
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MailboxCommand {
    /// The command opcode.
    #[bits(16)]
    pub opcode: u16,
    /// Payload length in bytes. Written by the host for input and by the
    /// device for output.
    #[bits(21)]
    pub payload_length: u32,
    #[bits(27)]
    _reserved: u32,
}

/// Mailbox Status Register
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MailboxStatus {
    /// A background command is running.
    pub background_operation: bool,
    #[bits(31)]
    _reserved: u32,
    /// Return code of the last completed command.
    #[bits(16)]
    pub return_code: ReturnCode,
    /// Vendor-specific extended status.
    #[bits(16)]
    pub vendor_status: u16,
}

/// Background Command Status Register
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct BackgroundCommandStatus {
    /// Opcode of the last background command.
    #[bits(16)]
    pub opcode: u16,
    /// Percentage of the background command completed, 0-100.
    #[bits(7)]
    pub percent_complete: u8,
    #[bits(9)]
    _reserved: u16,
    /// Return code of the background command, valid once complete.
    #[bits(16)]
    pub return_code: ReturnCode,
    /// Vendor-specific extended status.
    #[bits(16)]
    pub vendor_status: u16,
}

/// Command opcodes used by the driver itself.
///
/// The rest of the command catalog is opaque to this layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Opcode(pub u16);

impl Opcode {
    /// Identify (generic component command).
    pub const IDENTIFY: Self = Self(0x0001);
    /// Background Operation Status.
    pub const BACKGROUND_OPERATION_STATUS: Self = Self(0x0002);
    /// Get Response Message Limit.
    pub const GET_RESPONSE_MESSAGE_LIMIT: Self = Self(0x0003);
    /// Request Abort Background Operation.
    pub const REQUEST_ABORT_BACKGROUND_OPERATION: Self = Self(0x0005);
    /// Tunnel Management Command.
    pub const TUNNEL_MANAGEMENT: Self = Self(0x5300);

    /// The command set (high byte).
    pub const fn command_set(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The command within the set (low byte).
    pub const fn command(self) -> u8 {
        self.0 as u8
    }

    /// Builds an opcode from a command set and command.
    pub const fn from_parts(command_set: u8, command: u8) -> Self {
        Self(((command_set as u16) << 8) | command as u16)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// A mailbox command return code.
///
/// Unknown values are preserved as-is.
///
/// Sources: CXL 3.1 Spec - Table 8-34
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ReturnCode(pub u16);

macro_rules! return_codes {
    ($($name:ident = $value:literal, $description:literal;)*) => {
        impl ReturnCode {
            $(
                #[doc = $description]
                pub const $name: Self = Self($value);
            )*

            /// The symbolic name of the return code, if known.
            pub fn name(&self) -> Option<&'static str> {
                match self.0 {
                    $($value => Some(stringify!($name)),)*
                    _ => None,
                }
            }

            /// A human readable description of the return code.
            pub fn description(&self) -> &'static str {
                match self.0 {
                    $($value => $description,)*
                    _ => "unknown return code",
                }
            }
        }
    };
}

return_codes! {
    SUCCESS = 0x0000, "success";
    BACKGROUND_COMMAND_STARTED = 0x0001, "background command started";
    INVALID_INPUT = 0x0002, "invalid input";
    UNSUPPORTED = 0x0003, "unsupported";
    INTERNAL_ERROR = 0x0004, "internal error";
    RETRY_REQUIRED = 0x0005, "retry required";
    BUSY = 0x0006, "busy";
    MEDIA_DISABLED = 0x0007, "media disabled";
    FW_TRANSFER_IN_PROGRESS = 0x0008, "FW transfer in progress";
    FW_TRANSFER_OUT_OF_ORDER = 0x0009, "FW transfer out of order";
    FW_AUTHENTICATION_FAILED = 0x000A, "FW authentication failed";
    INVALID_SLOT = 0x000B, "invalid slot";
    ACTIVATION_FAILED_ROLLBACK = 0x000C, "activation failed, FW rolled back";
    ACTIVATION_FAILED_RESET = 0x000D, "activation failed, cold reset required";
    INVALID_HANDLE = 0x000E, "invalid handle";
    INVALID_PHYSICAL_ADDRESS = 0x000F, "invalid physical address";
    INJECT_POISON_LIMIT_REACHED = 0x0010, "inject poison limit reached";
    PERMANENT_MEDIA_FAILURE = 0x0011, "permanent media failure";
    ABORTED = 0x0012, "aborted";
    INVALID_SECURITY_STATE = 0x0013, "invalid security state";
    INCORRECT_PASSPHRASE = 0x0014, "incorrect passphrase";
    UNSUPPORTED_MAILBOX = 0x0015, "unsupported mailbox or CCI";
    INVALID_PAYLOAD_LENGTH = 0x0016, "invalid payload length";
}

impl ReturnCode {
    /// Converts from the raw field value.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Converts to the raw field value.
    pub const fn into_bits(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ReturnCode({:#06x})", self.0),
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#06x})", self.description(), self.0)
    }
}
