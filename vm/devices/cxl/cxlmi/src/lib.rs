// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A client library for the CXL Management Interface.
//!
//! A [`Context`] holds open [`Endpoint`]s. An endpoint is either the
//! register mailbox of a local CXL PCI function, discovered through its
//! configuration space, or a component reached over an external MCTP or
//! ioctl [`Transport`]. Commands are generic: an opcode and a payload, with
//! optional routing through one or two tunneling components
//! ([`TunnelInfo`]).
//!
//! ```no_run
//! # fn main() -> Result<(), cxlmi::Error> {
//! let mut ctx = cxlmi::Context::new(cxlmi::ContextConfig::default());
//! let handle = ctx.open_config_space("0000:35:00.0".parse().unwrap())?;
//! let ep = ctx.endpoint(handle).unwrap();
//! let response = ep.lock().submit(cxlmi::Command::new(0x0001))?;
//! println!("{:?}", response.into_result()?.payload);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod context;
mod dispatch;
mod endpoint;
mod mailbox_cci;
mod transport;

pub use context::Context;
pub use context::ContextConfig;
pub use context::EndpointHandle;
pub use cxl_device::PciAddress;
pub use cxl_mailbox::BackgroundPoll;
pub use cxl_mailbox::DeviceError;
pub use cxl_mailbox::Outcome;
pub use cxl_mailbox::Response;
pub use cxl_spec::ReturnCode;
pub use cxl_spec::cci::BackgroundOperationStatus;
pub use endpoint::Command;
pub use endpoint::Endpoint;
pub use endpoint::EndpointIdentity;
pub use endpoint::SharedEndpoint;
pub use mailbox_cci::LocalMailbox;
pub use mailbox_cci::MailboxCci;
pub use transport::CciTransport;
pub use transport::InvalidTunnelInfo;
pub use transport::Route;
pub use transport::Transport;
pub use transport::TransportError;
pub use transport::TunnelInfo;

use cxl_device::DiscoveryError;
use cxl_mailbox::MailboxError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// An error from the management interface.
#[derive(Debug, Error)]
pub enum Error {
    /// The device could not be opened.
    #[error("failed to open {identity}")]
    Open {
        /// The device being opened.
        identity: EndpointIdentity,
        /// The underlying error.
        #[source]
        err: io::Error,
    },
    /// Discovering or mapping the register mailbox failed.
    #[error("mailbox discovery failed")]
    Discovery(#[from] DiscoveryError),
    /// The mailbox protocol failed.
    #[error("mailbox protocol error")]
    Mailbox(#[from] MailboxError),
    /// The transport failed to carry the command.
    #[error("transport error")]
    Transport(#[from] TransportError),
    /// The tunnel descriptor is invalid. Nothing was sent.
    #[error(transparent)]
    InvalidTunnelInfo(#[from] InvalidTunnelInfo),
    /// The payload exceeds what a CCI message can carry.
    #[error("payload of {len} bytes exceeds message maximum of {max}")]
    PayloadTooLarge {
        /// The payload length.
        len: usize,
        /// The largest payload a message carries.
        max: usize,
    },
    /// The response does not match the request or is truncated.
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
    /// The device completed the command with a failing return code.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A background operation did not complete before the deadline.
    #[error("background operation {opcode:#06x} still running after {elapsed:?}")]
    BackgroundTimeout {
        /// The opcode of the background operation.
        opcode: u16,
        /// How long the poll ran.
        elapsed: Duration,
    },
    /// The endpoint was closed.
    #[error("endpoint closed")]
    Closed,
    /// No endpoint has this handle.
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointHandle),
}

#[cfg(test)]
mod tests;
