// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::Error;
use crate::dispatch::Dispatcher;
use crate::transport::TunnelInfo;
use cxl_device::PciAddress;
use cxl_mailbox::BackgroundPoll;
use cxl_mailbox::Backoff;
use cxl_mailbox::MailboxConfig;
use cxl_mailbox::MailboxError;
use cxl_mailbox::Response;
use cxl_spec::cci::BackgroundOperationStatus;
use cxl_spec::mailbox::Opcode;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use zerocopy::FromBytes;

/// An endpoint shared between threads. The lock is held for a whole
/// command.
pub type SharedEndpoint = Arc<Mutex<Endpoint>>;

/// What an endpoint is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointIdentity {
    /// A PCI function accessed through its register mailbox.
    Pci(PciAddress),
    /// A component reached over an external transport.
    Transport(String),
}

impl fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointIdentity::Pci(address) => write!(f, "pci {address}"),
            EndpointIdentity::Transport(name) => write!(f, "transport {name}"),
        }
    }
}

/// A command to send to an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The command opcode.
    pub opcode: u16,
    /// The input payload.
    pub payload: Vec<u8>,
    /// Routing through tunneling components, if any.
    pub tunnel: Option<TunnelInfo>,
}

impl Command {
    /// A command with no payload, sent directly.
    pub fn new(opcode: u16) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
            tunnel: None,
        }
    }

    /// Sets the input payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Routes the command through tunneling components.
    pub fn with_tunnel(mut self, tunnel: TunnelInfo) -> Self {
        self.tunnel = Some(tunnel);
        self
    }
}

/// One open connection to a CXL component.
///
/// Commands are issued one at a time. Closing the endpoint, explicitly or
/// by dropping it, releases the transport and any register mapping it owns.
pub struct Endpoint {
    identity: EndpointIdentity,
    dispatcher: Option<Dispatcher>,
    poll: MailboxConfig,
}

impl Endpoint {
    /// `poll` paces [`Endpoint::poll_background`].
    pub(crate) fn new(
        identity: EndpointIdentity,
        dispatcher: Dispatcher,
        poll: MailboxConfig,
    ) -> Self {
        Self {
            identity,
            dispatcher: Some(dispatcher),
            poll,
        }
    }

    /// What the endpoint is connected to.
    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    /// The kind of transport, or `None` once closed.
    pub fn transport_kind(&self) -> Option<&'static str> {
        self.dispatcher.as_ref().map(|d| d.transport().kind())
    }

    /// Returns true once the endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_none()
    }

    /// Sends `command`.
    ///
    /// A device return code other than success is reported in the
    /// [`Response`], not as an error.
    pub fn submit(&mut self, command: Command) -> Result<Response, Error> {
        self.dispatch(command.tunnel.as_ref(), command.opcode, &command.payload)
    }

    /// Sends command `opcode` with `payload` along the route named by
    /// `tunnel`.
    pub fn dispatch(
        &mut self,
        tunnel: Option<&TunnelInfo>,
        opcode: u16,
        payload: &[u8],
    ) -> Result<Response, Error> {
        let dispatcher = self.dispatcher.as_mut().ok_or(Error::Closed)?;
        dispatcher.send(tunnel, opcode, payload)
    }

    /// Queries the progress of the component's background operation.
    ///
    /// A local register mailbox addressed directly is read through its
    /// background status registers. Everything else is sent the Background
    /// Operation Status command.
    pub fn background_status(
        &mut self,
        tunnel: Option<&TunnelInfo>,
    ) -> Result<BackgroundOperationStatus, Error> {
        let dispatcher = self.dispatcher.as_ref().ok_or(Error::Closed)?;
        if tunnel.is_none()
            && let Some(mailbox) = dispatcher.transport().local_mailbox()
        {
            return Ok(mailbox.background_status());
        }

        let response = self
            .dispatch(tunnel, Opcode::BACKGROUND_OPERATION_STATUS.0, &[])?
            .into_result()?;
        let (status, _) = BackgroundOperationStatus::read_from_prefix(&response.payload)
            .map_err(|_| Error::MalformedResponse("short background operation status"))?;
        Ok(status)
    }

    /// Polls the component's background operation with a bounded backoff
    /// until it completes, `observer` returns false, or `deadline` passes.
    ///
    /// `observer` sees every status read while the operation is still
    /// running. Abandoning the poll leaves the operation running on the
    /// device.
    pub fn poll_background(
        &mut self,
        tunnel: Option<&TunnelInfo>,
        deadline: Instant,
        mut observer: impl FnMut(&BackgroundOperationStatus) -> bool,
    ) -> Result<BackgroundPoll<BackgroundOperationStatus>, Error> {
        let dispatcher = self.dispatcher.as_ref().ok_or(Error::Closed)?;
        if tunnel.is_none()
            && let Some(mailbox) = dispatcher.transport().local_mailbox()
        {
            return mailbox
                .poll_background(deadline, &mut observer)
                .map_err(|err| match err {
                    MailboxError::Timeout { opcode, elapsed } => {
                        Error::BackgroundTimeout { opcode, elapsed }
                    }
                    err => err.into(),
                });
        }

        let start = Instant::now();
        let mut backoff = Backoff::new(&self.poll);
        loop {
            let status = self.background_status(tunnel)?;
            if !status.in_progress() || status.percent_complete() >= 100 {
                tracing::debug!(
                    identity = %self.identity,
                    opcode = status.opcode.get(),
                    return_code = %status.return_code(),
                    "background operation complete"
                );
                return Ok(BackgroundPoll::Complete(status));
            }
            if !observer(&status) {
                return Ok(BackgroundPoll::Abandoned(status));
            }
            if Instant::now() >= deadline {
                return Err(Error::BackgroundTimeout {
                    opcode: status.opcode.get(),
                    elapsed: start.elapsed(),
                });
            }
            backoff.wait(deadline);
        }
    }

    /// Asks the component to abort its background operation.
    ///
    /// The request is advisory: the operation may still complete, and the
    /// component may not support aborting it.
    pub fn request_background_abort(&mut self, tunnel: Option<&TunnelInfo>) -> Result<(), Error> {
        self.dispatch(tunnel, Opcode::REQUEST_ABORT_BACKGROUND_OPERATION.0, &[])?
            .into_result()?;
        Ok(())
    }

    /// Closes the endpoint. Further commands fail with [`Error::Closed`].
    pub fn close(&mut self) {
        if self.dispatcher.take().is_some() {
            tracing::debug!(identity = %self.identity, "endpoint closed");
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("identity", &self.identity)
            .field("transport", &self.transport_kind())
            .finish()
    }
}
