// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Component Command Interface (CCI) message formats.
//!
//! These are the byte layouts used when a command travels as a message
//! rather than through mailbox registers: over MCTP, over a host ioctl
//! channel, or wrapped in a Tunnel Management Command.
//!
//! Sources: CXL 3.1 Spec - 7.6.3 (CCI message format), 8.2.9.1.2
//! (Background Operation Status), 7.6.7.3.1 (Tunnel Management Command)

use crate::ReturnCode;
use crate::mailbox::BackgroundCommandStatus;
use crate::mailbox::Opcode;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::LE;
use zerocopy::U16;

/// Message category of a CCI message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MessageCategory(pub u8);

impl MessageCategory {
    /// A request.
    pub const REQUEST: Self = Self(0);
    /// A response.
    pub const RESPONSE: Self = Self(1);
}

/// The largest payload length the 3-byte length field can carry.
pub const MAX_MESSAGE_PAYLOAD: usize = (1 << 21) - 1;

/// CCI message header.
///
/// | Byte | Field                                   |
/// |------|-----------------------------------------|
/// | 0    | Message category (bits 3:0)             |
/// | 1    | Message tag                             |
/// | 2    | Reserved                                |
/// | 3    | Command                                 |
/// | 4    | Command set                             |
/// | 5-7  | Payload length (bits 20:0), LE          |
/// | 8-9  | Return code, LE                         |
/// | 10-11| Vendor specific extended status, LE     |
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CciMessageHeader {
    /// Message category.
    pub category: u8,
    /// Tag echoed by the responder.
    pub tag: u8,
    /// Reserved.
    pub reserved: u8,
    /// Command within the set.
    pub command: u8,
    /// Command set.
    pub command_set: u8,
    /// Payload length, little endian, 21 significant bits.
    pub payload_length: [u8; 3],
    /// Return code (responses only).
    pub return_code: U16<LE>,
    /// Vendor specific extended status (responses only).
    pub vendor_status: U16<LE>,
}

const_assert_eq!(size_of::<CciMessageHeader>(), 12);

impl CciMessageHeader {
    /// Builds a request header.
    pub fn request(tag: u8, opcode: Opcode, payload_length: usize) -> Self {
        let mut header = Self::new_zeroed();
        header.category = MessageCategory::REQUEST.0;
        header.tag = tag;
        header.command = opcode.command();
        header.command_set = opcode.command_set();
        header.set_payload_length(payload_length);
        header
    }

    /// Builds a response header.
    pub fn response(tag: u8, opcode: Opcode, return_code: ReturnCode, payload_length: usize) -> Self {
        let mut header = Self::request(tag, opcode, payload_length);
        header.category = MessageCategory::RESPONSE.0;
        header.return_code = return_code.0.into();
        header
    }

    /// The message category.
    pub fn category(&self) -> MessageCategory {
        MessageCategory(self.category & 0xf)
    }

    /// The opcode formed by the command set and command bytes.
    pub fn opcode(&self) -> Opcode {
        Opcode::from_parts(self.command_set, self.command)
    }

    /// The payload length in bytes.
    pub fn payload_length(&self) -> usize {
        let [a, b, c] = self.payload_length;
        (u32::from_le_bytes([a, b, c & 0x1f, 0])) as usize
    }

    /// Sets the payload length. Bits above bit 20 are dropped.
    pub fn set_payload_length(&mut self, len: usize) {
        let [a, b, c, _] = ((len & MAX_MESSAGE_PAYLOAD) as u32).to_le_bytes();
        self.payload_length = [a, b, c];
    }

    /// The return code.
    pub fn return_code(&self) -> ReturnCode {
        ReturnCode(self.return_code.get())
    }
}

/// Target type field of a tunnel management request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TunnelTargetType(pub u8);

impl TunnelTargetType {
    /// The target is the port or LD identified by the request.
    pub const PORT_OR_LD: Self = Self(0);
}

/// Tunnel Management Command request header. The inner CCI message follows.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TunnelRequestHeader {
    /// Switch port ID or LD ID that receives the inner message.
    pub port_or_ld_id: u8,
    /// Target type.
    pub target_type: u8,
    /// Size in bytes of the inner message.
    pub command_size: U16<LE>,
}

const_assert_eq!(size_of::<TunnelRequestHeader>(), 4);

/// Tunnel Management Command response header. The inner CCI response follows.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TunnelResponseHeader {
    /// Size in bytes of the inner response.
    pub response_length: U16<LE>,
    /// Reserved.
    pub reserved: U16<LE>,
}

const_assert_eq!(size_of::<TunnelResponseHeader>(), 4);

/// Background Operation Status output payload.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct BackgroundOperationStatus {
    /// Bit 0: operation in progress. Bits 7:1: percent complete.
    pub status: u8,
    /// Reserved.
    pub reserved: u8,
    /// Opcode of the last background command.
    pub opcode: U16<LE>,
    /// Return code of the last background command.
    pub return_code: U16<LE>,
    /// Vendor specific extended status.
    pub vendor_status: U16<LE>,
}

const_assert_eq!(size_of::<BackgroundOperationStatus>(), 8);

impl BackgroundOperationStatus {
    /// Builds the payload from the background command status register and
    /// the status register's background operation flag.
    pub fn from_register(in_progress: bool, register: BackgroundCommandStatus) -> Self {
        Self {
            status: (register.percent_complete() << 1) | in_progress as u8,
            reserved: 0,
            opcode: register.opcode().into(),
            return_code: register.return_code().0.into(),
            vendor_status: register.vendor_status().into(),
        }
    }

    /// A background operation is in progress.
    pub fn in_progress(&self) -> bool {
        self.status & 1 != 0
    }

    /// Percent complete, 0-100.
    pub fn percent_complete(&self) -> u8 {
        self.status >> 1
    }

    /// The background command's return code.
    pub fn return_code(&self) -> ReturnCode {
        ReturnCode(self.return_code.get())
    }
}
