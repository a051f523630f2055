// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The CXL mailbox protocol engine.
//!
//! A [`Mailbox`] owns the mapped mailbox registers of one device and runs
//! one command at a time through them: payload in, command register,
//! doorbell, poll, status, payload out. Commands that the device moves to
//! the background complete immediately with
//! [`ReturnCode::BACKGROUND_COMMAND_STARTED`] and are tracked through the
//! background command status register.

#![forbid(unsafe_code)]

mod config;
mod registers;

pub use config::MailboxConfig;
pub use cxl_spec::ReturnCode;

use crate::registers::MailboxRegisters;
use cxl_device::DeviceRegisterIo;
use cxl_spec::mailbox;
use cxl_spec::mailbox::BackgroundCommandStatus;
use cxl_spec::mailbox::MailboxCapabilities;
use cxl_spec::mailbox::MailboxCommand;
use cxl_spec::mailbox::MailboxStatus;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// How a return code should be treated by a caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The command succeeded.
    Success,
    /// The command continues in the background.
    BackgroundStarted,
    /// The command may succeed if issued again later.
    Transient,
    /// The command failed.
    Failure,
}

impl Outcome {
    /// Classifies a return code. Unknown codes are failures.
    pub fn of(return_code: ReturnCode) -> Self {
        match return_code {
            ReturnCode::SUCCESS => Self::Success,
            ReturnCode::BACKGROUND_COMMAND_STARTED => Self::BackgroundStarted,
            ReturnCode::RETRY_REQUIRED | ReturnCode::BUSY | ReturnCode::FW_TRANSFER_IN_PROGRESS => {
                Self::Transient
            }
            _ => Self::Failure,
        }
    }
}

impl From<ReturnCode> for Outcome {
    fn from(return_code: ReturnCode) -> Self {
        Self::of(return_code)
    }
}

/// An error from the mailbox protocol itself, as opposed to a device return
/// code.
#[derive(Debug, Error)]
pub enum MailboxError {
    /// The doorbell was already set when a command was submitted.
    #[error("mailbox busy")]
    Busy,
    /// The doorbell did not clear in time.
    #[error("timed out after {elapsed:?} waiting for opcode {opcode:#06x}")]
    Timeout {
        /// The opcode in flight.
        opcode: u16,
        /// How long the engine waited.
        elapsed: Duration,
    },
    /// The input payload does not fit the payload window.
    #[error("payload of {len} bytes exceeds mailbox maximum of {max}")]
    PayloadTooLarge {
        /// The requested length.
        len: usize,
        /// The payload window size.
        max: usize,
    },
    /// The device reported an output length larger than the payload window.
    #[error("device reported output length {len} exceeding mailbox maximum of {max}")]
    InvalidOutputLength {
        /// The reported length.
        len: usize,
        /// The payload window size.
        max: usize,
    },
    /// The capabilities register advertises a payload size outside 2^8..=2^20.
    #[error("invalid payload size exponent {0}")]
    InvalidPayloadSize(u8),
    /// The register mapping is too small for the advertised payload window.
    #[error("mailbox mapping of {len:#x} bytes is smaller than the required {required:#x}")]
    MappingTooSmall {
        /// The mapping length.
        len: usize,
        /// The required length.
        required: usize,
    },
}

/// A device return code other than success.
#[derive(Debug, Error)]
#[error("opcode {opcode:#06x} failed: {return_code}")]
pub struct DeviceError {
    /// The opcode of the failed command.
    pub opcode: u16,
    /// The device return code.
    pub return_code: ReturnCode,
    /// The vendor specific extended status.
    pub vendor_status: u16,
}

/// The completion of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The opcode of the command.
    pub opcode: u16,
    /// The device return code.
    pub return_code: ReturnCode,
    /// The vendor specific extended status.
    pub vendor_status: u16,
    /// The output payload. Present for failed commands if the device
    /// reported one.
    pub payload: Vec<u8>,
    /// The command continues as a background operation.
    pub background: bool,
}

impl Response {
    /// Classifies the return code.
    pub fn outcome(&self) -> Outcome {
        Outcome::of(self.return_code)
    }

    /// Converts any return code other than success or background started
    /// into an error.
    pub fn into_result(self) -> Result<Self, DeviceError> {
        match self.outcome() {
            Outcome::Success | Outcome::BackgroundStarted => Ok(self),
            Outcome::Transient | Outcome::Failure => Err(DeviceError {
                opcode: self.opcode,
                return_code: self.return_code,
                vendor_status: self.vendor_status,
            }),
        }
    }
}

/// The result of waiting for a background operation, carrying the last
/// status read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BackgroundPoll<S = BackgroundCommandStatus> {
    /// The operation finished; its return code is in the status.
    Complete(S),
    /// The observer stopped waiting while the operation was still running.
    Abandoned(S),
}

/// Sleeps between polls, doubling the interval up to a maximum.
#[derive(Debug)]
pub struct Backoff {
    interval: Duration,
    max: Duration,
}

impl Backoff {
    /// Starts at `config.poll_interval`.
    pub fn new(config: &MailboxConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max: config.max_poll_interval.max(config.poll_interval),
        }
    }

    /// Sleeps until the next poll, never past `deadline`.
    pub fn wait(&mut self, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        std::thread::sleep(self.interval.min(remaining));
        self.interval = (self.interval * 2).min(self.max);
    }
}

/// The mailbox protocol engine for one device.
pub struct Mailbox<T> {
    regs: MailboxRegisters<T>,
    caps: MailboxCapabilities,
    max_payload: usize,
    config: MailboxConfig,
}

impl<T: DeviceRegisterIo> Mailbox<T> {
    /// Creates an engine over the mapped mailbox registers `regs`.
    ///
    /// Fails if the advertised payload size is out of range or not covered
    /// by the mapping.
    pub fn new(regs: T, config: MailboxConfig) -> Result<Self, MailboxError> {
        let regs = MailboxRegisters::new(regs);
        let caps = regs.capabilities();
        let max_payload = caps
            .payload_bytes()
            .ok_or(MailboxError::InvalidPayloadSize(caps.payload_size()))?;
        let required = mailbox::HEADER_SIZE + max_payload;
        if regs.len() < required {
            return Err(MailboxError::MappingTooSmall {
                len: regs.len(),
                required,
            });
        }
        tracing::debug!(
            max_payload,
            ready_time = caps.mailbox_ready_time(),
            mailbox_type = caps.mailbox_type(),
            "mailbox ready"
        );
        Ok(Self {
            regs,
            caps,
            max_payload,
            config,
        })
    }

    /// The capabilities register as read at creation.
    pub fn capabilities(&self) -> MailboxCapabilities {
        self.caps
    }

    /// The payload window size in bytes.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// The polling configuration.
    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Reads the status register.
    pub fn status(&self) -> MailboxStatus {
        self.regs.status()
    }

    /// Reads the background command status register.
    pub fn background_status(&self) -> BackgroundCommandStatus {
        self.regs.background_status()
    }

    /// Writes `data` to the start of the payload window.
    pub fn write_payload(&mut self, data: &[u8]) -> Result<(), MailboxError> {
        self.check_len(data.len())?;
        self.regs.write_payload(data);
        Ok(())
    }

    /// Reads `data.len()` bytes from the start of the payload window.
    pub fn read_payload(&self, data: &mut [u8]) -> Result<(), MailboxError> {
        self.check_len(data.len())?;
        self.regs.read_payload(data);
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<(), MailboxError> {
        if len > self.max_payload {
            return Err(MailboxError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        Ok(())
    }

    /// Submits a command and waits for the doorbell to clear.
    ///
    /// A device return code other than success is not an error; it is
    /// reported in the [`Response`].
    pub fn submit(&mut self, opcode: u16, input: &[u8]) -> Result<Response, MailboxError> {
        self.check_len(input.len())?;
        if self.regs.control().doorbell() {
            return Err(MailboxError::Busy);
        }

        tracing::debug!(opcode, len = input.len(), "mailbox submit");
        self.regs.write_payload(input);
        self.regs.set_command(
            MailboxCommand::new()
                .with_opcode(opcode)
                .with_payload_length(input.len() as u32),
        );
        let control = self.regs.control();
        self.regs.set_control(control.with_doorbell(true));

        self.wait_doorbell(opcode)?;

        // With the background flag set the doorbell only means the command
        // was accepted. Its outcome comes from the background status
        // register.
        let status = self.regs.status();
        if status.background_operation() {
            tracing::debug!(
                opcode,
                return_code = %status.return_code(),
                "background command started"
            );
            return Ok(Response {
                opcode,
                return_code: ReturnCode::BACKGROUND_COMMAND_STARTED,
                vendor_status: status.vendor_status(),
                payload: Vec::new(),
                background: true,
            });
        }

        let len = self.regs.command().payload_length() as usize;
        if len > self.max_payload {
            tracing::warn!(opcode, len, max = self.max_payload, "bad output length");
            return Err(MailboxError::InvalidOutputLength {
                len,
                max: self.max_payload,
            });
        }
        let mut payload = vec![0; len];
        self.regs.read_payload(&mut payload);

        let return_code = status.return_code();
        tracing::debug!(opcode, %return_code, len, "mailbox complete");
        Ok(Response {
            opcode,
            return_code,
            vendor_status: status.vendor_status(),
            payload,
            background: false,
        })
    }

    fn wait_doorbell(&self, opcode: u16) -> Result<(), MailboxError> {
        let start = Instant::now();
        let timeout = self
            .config
            .doorbell_timeout(self.caps.mailbox_ready_time());
        let deadline = start + timeout;
        let mut backoff = Backoff::new(&self.config);
        loop {
            if !self.regs.control().doorbell() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let elapsed = start.elapsed();
                tracing::warn!(opcode, ?elapsed, "mailbox doorbell timeout");
                return Err(MailboxError::Timeout { opcode, elapsed });
            }
            backoff.wait(deadline);
        }
    }

    /// Polls the background command status until the operation completes,
    /// `observer` returns false, or `deadline` passes.
    ///
    /// The operation is complete when it reports 100 percent or the status
    /// register no longer shows a background operation.
    pub fn poll_background(
        &self,
        deadline: Instant,
        mut observer: impl FnMut(&BackgroundCommandStatus) -> bool,
    ) -> Result<BackgroundPoll, MailboxError> {
        let start = Instant::now();
        let mut backoff = Backoff::new(&self.config);
        loop {
            let background = self.regs.background_status();
            if background.percent_complete() >= 100 || !self.regs.status().background_operation()
            {
                tracing::debug!(
                    opcode = background.opcode(),
                    return_code = %background.return_code(),
                    "background operation complete"
                );
                return Ok(BackgroundPoll::Complete(background));
            }
            tracing::trace!(
                opcode = background.opcode(),
                percent = background.percent_complete(),
                "background operation in progress"
            );
            if !observer(&background) {
                return Ok(BackgroundPoll::Abandoned(background));
            }
            if Instant::now() >= deadline {
                return Err(MailboxError::Timeout {
                    opcode: background.opcode(),
                    elapsed: start.elapsed(),
                });
            }
            backoff.wait(deadline);
        }
    }

    /// Returns the underlying registers.
    pub fn into_inner(self) -> T {
        self.regs.into_inner()
    }
}
