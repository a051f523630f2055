// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A scripted emulation of the CXL mailbox register interface.

use cxl_device::DeviceRegisterIo;
use cxl_spec::ReturnCode;
use cxl_spec::cci::BackgroundOperationStatus;
use cxl_spec::cci::CciMessageHeader;
use cxl_spec::cci::TunnelRequestHeader;
use cxl_spec::cci::TunnelResponseHeader;
use cxl_spec::mailbox::BackgroundCommandStatus;
use cxl_spec::mailbox::MailboxCapabilities;
use cxl_spec::mailbox::MailboxCommand;
use cxl_spec::mailbox::MailboxControl;
use cxl_spec::mailbox::MailboxStatus;
use cxl_spec::mailbox::Opcode;
use cxl_spec::mailbox::offsets;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// How the emulated device reacts to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxReply {
    /// Complete immediately.
    Complete {
        /// The return code to report.
        return_code: ReturnCode,
        /// The output payload.
        payload: Vec<u8>,
    },
    /// Keep the doorbell set for `polls` reads of the control register, then
    /// complete.
    Delayed {
        /// Control register reads before completion.
        polls: u32,
        /// The return code to report.
        return_code: ReturnCode,
        /// The output payload.
        payload: Vec<u8>,
    },
    /// Start a background operation that advances by `step` percent each
    /// time the background command status register is read.
    Background {
        /// Percent complete added per read.
        step: u8,
        /// The return code reported once the operation completes.
        return_code: ReturnCode,
    },
    /// Never clear the doorbell.
    Stuck,
    /// Complete, but report `length` in the command register regardless of
    /// the payload actually written.
    BadLength {
        /// The output length to report.
        length: u32,
    },
}

impl MailboxReply {
    /// A successful completion with `payload`.
    pub fn success(payload: impl Into<Vec<u8>>) -> Self {
        Self::Complete {
            return_code: ReturnCode::SUCCESS,
            payload: payload.into(),
        }
    }

    /// A completion with an error return code and no payload.
    pub fn error(return_code: ReturnCode) -> Self {
        Self::Complete {
            return_code,
            payload: Vec::new(),
        }
    }

    /// The return code and payload as seen by a caller that cannot wait,
    /// such as a tunneling component.
    fn into_immediate(self) -> (ReturnCode, Vec<u8>) {
        match self {
            Self::Complete {
                return_code,
                payload,
            }
            | Self::Delayed {
                return_code,
                payload,
                ..
            } => (return_code, payload),
            Self::Background { .. } => (ReturnCode::BACKGROUND_COMMAND_STARTED, Vec::new()),
            Self::Stuck | Self::BadLength { .. } => (ReturnCode::BUSY, Vec::new()),
        }
    }
}

/// A command handler: receives an opcode and input payload.
pub type CommandHandler = Box<dyn FnMut(u16, &[u8]) -> MailboxReply + Send>;

/// An emulated CXL component. Commands addressed to it are handled by its
/// handler; Tunnel Management Commands are unwrapped and forwarded to the
/// component attached at the requested port.
pub struct Component {
    handler: CommandHandler,
    tunnels: BTreeMap<u8, Component>,
}

impl Component {
    /// Creates a component with a handler.
    pub fn new(handler: impl 'static + FnMut(u16, &[u8]) -> MailboxReply + Send) -> Self {
        Self {
            handler: Box::new(handler),
            tunnels: BTreeMap::new(),
        }
    }

    /// A component that completes every command successfully, echoing the
    /// input payload.
    pub fn echo() -> Self {
        Self::new(|_, input| MailboxReply::success(input))
    }

    /// Attaches `target` behind port or LD `port`.
    pub fn with_tunnel(mut self, port: u8, target: Component) -> Self {
        self.tunnels.insert(port, target);
        self
    }

    fn handle(&mut self, opcode: u16, input: &[u8]) -> MailboxReply {
        if Opcode(opcode) == Opcode::TUNNEL_MANAGEMENT {
            return self.handle_tunnel(input);
        }
        (self.handler)(opcode, input)
    }

    fn handle_tunnel(&mut self, input: &[u8]) -> MailboxReply {
        let Ok((request, rest)) = TunnelRequestHeader::read_from_prefix(input) else {
            return MailboxReply::error(ReturnCode::INVALID_INPUT);
        };
        let Some(inner) = rest.get(..request.command_size.get() as usize) else {
            return MailboxReply::error(ReturnCode::INVALID_PAYLOAD_LENGTH);
        };
        let Ok((header, body)) = CciMessageHeader::read_from_prefix(inner) else {
            return MailboxReply::error(ReturnCode::INVALID_INPUT);
        };
        let Some(body) = body.get(..header.payload_length()) else {
            return MailboxReply::error(ReturnCode::INVALID_PAYLOAD_LENGTH);
        };
        let Some(target) = self.tunnels.get_mut(&request.port_or_ld_id) else {
            tracing::debug!(port = request.port_or_ld_id, "no component behind port");
            return MailboxReply::error(ReturnCode::INVALID_INPUT);
        };

        let (return_code, payload) = target.handle(header.opcode().0, body).into_immediate();
        let inner_response =
            CciMessageHeader::response(header.tag, header.opcode(), return_code, payload.len());
        let response_length = size_of::<CciMessageHeader>() + payload.len();
        let outer = TunnelResponseHeader {
            response_length: (response_length as u16).into(),
            reserved: 0u16.into(),
        };

        let mut out = Vec::with_capacity(size_of::<TunnelResponseHeader>() + response_length);
        out.extend_from_slice(outer.as_bytes());
        out.extend_from_slice(inner_response.as_bytes());
        out.extend_from_slice(&payload);
        MailboxReply::success(out)
    }
}

/// A register access observed by the emulated mailbox.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Access {
    /// True for writes.
    pub write: bool,
    /// Offset from the mailbox base.
    pub offset: usize,
}

struct Pending {
    polls: u32,
    return_code: ReturnCode,
    payload: Vec<u8>,
}

struct MailboxState {
    caps: MailboxCapabilities,
    control: MailboxControl,
    command: MailboxCommand,
    status: MailboxStatus,
    background: BackgroundCommandStatus,
    background_step: u8,
    background_result: ReturnCode,
    payload: Vec<u8>,
    root: Component,
    pending: Option<Pending>,
    accesses: Vec<Access>,
    executed: Vec<(u16, Vec<u8>)>,
}

/// An emulated mailbox. Clones share the same device state.
#[derive(Clone)]
pub struct EmulatedMailbox {
    state: Arc<Mutex<MailboxState>>,
    len: usize,
}

impl EmulatedMailbox {
    /// Creates a mailbox with a `1 << payload_exponent` byte payload window
    /// whose commands are handled by `root`.
    ///
    /// The exponent is reported as-is, so out-of-range values can be used to
    /// exercise validation; the emulated window is at least 256 bytes.
    pub fn new(payload_exponent: u8, root: Component) -> Self {
        let window = 1usize << payload_exponent.clamp(8, 20);
        let state = MailboxState {
            caps: MailboxCapabilities::new().with_payload_size(payload_exponent),
            control: MailboxControl::new(),
            command: MailboxCommand::new(),
            status: MailboxStatus::new(),
            background: BackgroundCommandStatus::new(),
            background_step: 0,
            background_result: ReturnCode::SUCCESS,
            payload: vec![0; window],
            root,
            pending: None,
            accesses: Vec::new(),
            executed: Vec::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            len: offsets::PAYLOAD + window,
        }
    }

    /// Sets the mailbox ready time reported in the capabilities register.
    pub fn with_ready_time(self, secs: u8) -> Self {
        {
            let mut state = self.state.lock();
            state.caps.set_mailbox_ready_time(secs);
        }
        self
    }

    /// The length of the register space, header included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns a register handle covering the first `len` bytes of the
    /// mailbox.
    pub fn registers(&self, len: usize) -> MailboxRegisterWindow {
        MailboxRegisterWindow {
            state: self.state.clone(),
            len: len.min(self.len),
        }
    }

    /// Returns all register accesses observed so far.
    pub fn accesses(&self) -> Vec<Access> {
        self.state.lock().accesses.clone()
    }

    /// Forgets the recorded register accesses.
    pub fn clear_accesses(&self) {
        self.state.lock().accesses.clear();
    }

    /// Returns the (opcode, input) of every command the device has started.
    pub fn executed(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().executed.clone()
    }

    /// Returns the current doorbell state.
    pub fn doorbell(&self) -> bool {
        self.state.lock().control.doorbell()
    }

    /// Returns a copy of the first `len` bytes of the payload window.
    pub fn payload(&self, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        state.payload[..len.min(state.payload.len())].to_vec()
    }

    /// Returns true while a background operation is running.
    pub fn background_running(&self) -> bool {
        self.state.lock().status.background_operation()
    }
}

impl MailboxState {
    fn read_u32(&mut self, offset: usize) -> u32 {
        match offset {
            offsets::CAPABILITIES => self.caps.into_bits(),
            offsets::CONTROL => {
                self.tick_pending();
                self.control.into_bits()
            }
            _ => {
                let v = self.read_u64(offset & !7);
                (v >> ((offset & 4) * 8)) as u32
            }
        }
    }

    fn read_u64(&mut self, offset: usize) -> u64 {
        match offset {
            offsets::CAPABILITIES => {
                self.tick_pending();
                self.caps.into_bits() as u64 | (self.control.into_bits() as u64) << 32
            }
            offsets::COMMAND => self.command.into_bits(),
            offsets::STATUS => self.status.into_bits(),
            offsets::BACKGROUND_STATUS => {
                self.advance_background();
                self.background.into_bits()
            }
            _ if offset >= offsets::PAYLOAD => {
                let start = offset - offsets::PAYLOAD;
                let mut n = [0; 8];
                if let Some(src) = self.payload.get(start..start + 8) {
                    n.copy_from_slice(src);
                }
                u64::from_le_bytes(n)
            }
            _ => 0,
        }
    }

    fn write_u32(&mut self, offset: usize, data: u32) {
        match offset {
            offsets::CONTROL => {
                let new = MailboxControl::from_bits(data);
                let ring = new.doorbell() && !self.control.doorbell();
                // The host cannot clear the doorbell.
                self.control = new.with_doorbell(new.doorbell() || self.control.doorbell());
                if ring {
                    self.execute();
                }
            }
            _ if offset >= offsets::PAYLOAD => {
                let start = offset - offsets::PAYLOAD;
                if let Some(dst) = self.payload.get_mut(start..start + 4) {
                    dst.copy_from_slice(&data.to_le_bytes());
                }
            }
            _ => {
                let v = self.read_u64(offset & !7);
                let shift = (offset & 4) * 8;
                let v = (v & !(0xffff_ffffu64 << shift)) | (data as u64) << shift;
                self.write_u64(offset & !7, v);
            }
        }
    }

    fn write_u64(&mut self, offset: usize, data: u64) {
        match offset {
            offsets::CAPABILITIES => self.write_u32(offsets::CONTROL, (data >> 32) as u32),
            offsets::COMMAND => self.command = MailboxCommand::from_bits(data),
            _ if offset >= offsets::PAYLOAD => {
                self.write_u32(offset, data as u32);
                self.write_u32(offset + 4, (data >> 32) as u32);
            }
            // Status registers are read only.
            _ => {}
        }
    }

    fn tick_pending(&mut self) {
        let Some(pending) = &mut self.pending else {
            return;
        };
        if pending.polls > 0 {
            pending.polls -= 1;
            return;
        }
        if let Some(pending) = self.pending.take() {
            self.complete(pending.return_code, &pending.payload);
        }
    }

    fn advance_background(&mut self) {
        if !self.status.background_operation() {
            return;
        }
        let percent = self
            .background
            .percent_complete()
            .saturating_add(self.background_step)
            .min(100);
        self.background.set_percent_complete(percent);
        if percent == 100 {
            self.background.set_return_code(self.background_result);
            self.status.set_background_operation(false);
        }
    }

    fn execute(&mut self) {
        let opcode = self.command.opcode();
        let len = (self.command.payload_length() as usize).min(self.payload.len());
        let input = self.payload[..len].to_vec();
        tracing::trace!(opcode, len, "emulated mailbox command");
        self.executed.push((opcode, input.clone()));

        let reply = match Opcode(opcode) {
            Opcode::BACKGROUND_OPERATION_STATUS => {
                let status = BackgroundOperationStatus::from_register(
                    self.status.background_operation(),
                    self.background,
                );
                MailboxReply::success(status.as_bytes())
            }
            Opcode::REQUEST_ABORT_BACKGROUND_OPERATION => {
                if self.status.background_operation() {
                    self.status.set_background_operation(false);
                    self.background.set_return_code(ReturnCode::ABORTED);
                }
                MailboxReply::success(Vec::new())
            }
            _ => self.root.handle(opcode, &input),
        };

        match reply {
            MailboxReply::Complete {
                return_code,
                payload,
            } => self.complete(return_code, &payload),
            MailboxReply::Delayed {
                polls,
                return_code,
                payload,
            } => {
                self.pending = Some(Pending {
                    polls,
                    return_code,
                    payload,
                })
            }
            MailboxReply::Background { step, return_code } => {
                self.background = BackgroundCommandStatus::new().with_opcode(opcode);
                self.background_step = step;
                self.background_result = return_code;
                self.status = MailboxStatus::new()
                    .with_background_operation(true)
                    .with_return_code(ReturnCode::BACKGROUND_COMMAND_STARTED);
                self.command.set_payload_length(0);
                self.control.set_doorbell(false);
            }
            MailboxReply::Stuck => {}
            MailboxReply::BadLength { length } => {
                self.status.set_return_code(ReturnCode::SUCCESS);
                self.command.set_payload_length(length);
                self.control.set_doorbell(false);
            }
        }
    }

    fn complete(&mut self, return_code: ReturnCode, payload: &[u8]) {
        let len = payload.len().min(self.payload.len());
        self.payload[..len].copy_from_slice(&payload[..len]);
        self.command.set_payload_length(len as u32);
        self.status.set_return_code(return_code);
        self.control.set_doorbell(false);
    }
}

/// A [`DeviceRegisterIo`] view of an [`EmulatedMailbox`].
pub struct MailboxRegisterWindow {
    state: Arc<Mutex<MailboxState>>,
    len: usize,
}

impl MailboxRegisterWindow {
    fn check(&self, offset: usize, width: usize) {
        assert!(
            offset % width == 0 && offset + width <= self.len,
            "bad mailbox access at {offset:#x}"
        );
    }
}

impl DeviceRegisterIo for MailboxRegisterWindow {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        self.check(offset, 4);
        let mut state = self.state.lock();
        state.accesses.push(Access {
            write: false,
            offset,
        });
        state.read_u32(offset)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        self.check(offset, 8);
        let mut state = self.state.lock();
        state.accesses.push(Access {
            write: false,
            offset,
        });
        state.read_u64(offset)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.check(offset, 4);
        let mut state = self.state.lock();
        state.accesses.push(Access {
            write: true,
            offset,
        });
        state.write_u32(offset, data)
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.check(offset, 8);
        let mut state = self.state.lock();
        state.accesses.push(Access {
            write: true,
            offset,
        });
        state.write_u64(offset, data)
    }
}
