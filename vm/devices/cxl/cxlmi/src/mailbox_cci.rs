// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! CCI messages over the device's own register mailbox.

use crate::transport::CciTransport;
use crate::transport::TransportError;
use cxl_device::DeviceRegisterIo;
use cxl_mailbox::BackgroundPoll;
use cxl_mailbox::Mailbox;
use cxl_mailbox::MailboxError;
use cxl_spec::ReturnCode;
use cxl_spec::cci::BackgroundOperationStatus;
use cxl_spec::cci::CciMessageHeader;
use cxl_spec::cci::TunnelRequestHeader;
use cxl_spec::cci::TunnelResponseHeader;
use cxl_spec::cci::TunnelTargetType;
use cxl_spec::mailbox::Opcode;
use std::time::Duration;
use std::time::Instant;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Register-level access to the background operation state of a local
/// mailbox.
///
/// While a background operation runs every command completes as a
/// background completion, so its progress is read from the registers
/// rather than with a Background Operation Status command.
pub trait LocalMailbox {
    /// Reads the current background operation status.
    fn background_status(&self) -> BackgroundOperationStatus;

    /// Polls the background operation until it completes, `observer`
    /// returns false, or `deadline` passes.
    fn poll_background(
        &self,
        deadline: Instant,
        observer: &mut dyn FnMut(&BackgroundOperationStatus) -> bool,
    ) -> Result<BackgroundPoll<BackgroundOperationStatus>, MailboxError>;
}

impl<T: DeviceRegisterIo> LocalMailbox for Mailbox<T> {
    fn background_status(&self) -> BackgroundOperationStatus {
        let running = self.status().background_operation();
        BackgroundOperationStatus::from_register(running, Mailbox::background_status(self))
    }

    fn poll_background(
        &self,
        deadline: Instant,
        observer: &mut dyn FnMut(&BackgroundOperationStatus) -> bool,
    ) -> Result<BackgroundPoll<BackgroundOperationStatus>, MailboxError> {
        let poll = Mailbox::poll_background(self, deadline, |register| {
            observer(&BackgroundOperationStatus::from_register(true, *register))
        })?;
        Ok(match poll {
            BackgroundPoll::Complete(register) => BackgroundPoll::Complete(
                BackgroundOperationStatus::from_register(false, register),
            ),
            BackgroundPoll::Abandoned(register) => BackgroundPoll::Abandoned(
                BackgroundOperationStatus::from_register(true, register),
            ),
        })
    }
}

/// A [`CciTransport`] that runs each message through a [`Mailbox`].
///
/// Tunneled messages are wrapped in Tunnel Management Commands, nested once
/// per hop. The register mailbox bounds its own wait for the doorbell, so
/// the per-call timeout is not used.
pub struct MailboxCci<T> {
    mailbox: Mailbox<T>,
}

impl<T: DeviceRegisterIo> MailboxCci<T> {
    /// Wraps `mailbox`.
    pub fn new(mailbox: Mailbox<T>) -> Self {
        Self { mailbox }
    }

    /// The wrapped mailbox.
    pub fn mailbox(&self) -> &Mailbox<T> {
        &self.mailbox
    }

    /// Sends `request` through `hops`, outermost first.
    fn send(
        &mut self,
        hops: &[u8],
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, TransportError> {
        let (header, body) = CciMessageHeader::read_from_prefix(request)
            .map_err(|_| TransportError::InvalidRequest("short message header"))?;
        let payload = body
            .get(..header.payload_length())
            .ok_or(TransportError::InvalidRequest("payload length exceeds message"))?;

        let Some((&first, rest)) = hops.split_first() else {
            let out = self.mailbox.submit(header.opcode().0, payload)?;
            return reply(
                &header,
                out.return_code,
                out.vendor_status,
                &out.payload,
                response,
            );
        };

        // Wrap for the inner hops first, so the outermost wrapper is last.
        let mut message = request.to_vec();
        for &hop in rest.iter().rev() {
            let body = tunnel_request(hop, &message)?;
            let inner =
                CciMessageHeader::request(header.tag, Opcode::TUNNEL_MANAGEMENT, body.len());
            message = [inner.as_bytes(), &body[..]].concat();
        }
        let input = tunnel_request(first, &message)?;
        tracing::trace!(port = first, depth = hops.len(), "tunneling through mailbox");

        let out = self.mailbox.submit(Opcode::TUNNEL_MANAGEMENT.0, &input)?;
        if out.return_code != ReturnCode::SUCCESS {
            return reply(&header, out.return_code, out.vendor_status, &[], response);
        }

        let mut message = tunnel_response(&out.payload)?;
        for _ in rest {
            let (inner, body) = CciMessageHeader::read_from_prefix(message)
                .map_err(|_| TransportError::BadTunnelResponse("short inner header"))?;
            if inner.return_code() != ReturnCode::SUCCESS {
                return reply(
                    &header,
                    inner.return_code(),
                    inner.vendor_status.get(),
                    &[],
                    response,
                );
            }
            let body = body
                .get(..inner.payload_length())
                .ok_or(TransportError::BadTunnelResponse("inner payload truncated"))?;
            message = tunnel_response(body)?;
        }

        let capacity = response.len();
        let dest = response
            .get_mut(..message.len())
            .ok_or(TransportError::Truncated {
                len: message.len(),
                capacity,
            })?;
        dest.copy_from_slice(message);
        Ok(message.len())
    }
}

/// Builds a Tunnel Management Command payload carrying `message` to `hop`.
fn tunnel_request(hop: u8, message: &[u8]) -> Result<Vec<u8>, TransportError> {
    let command_size = u16::try_from(message.len())
        .map_err(|_| TransportError::InvalidRequest("message too large to tunnel"))?;
    let header = TunnelRequestHeader {
        port_or_ld_id: hop,
        target_type: TunnelTargetType::PORT_OR_LD.0,
        command_size: command_size.into(),
    };
    Ok([header.as_bytes(), message].concat())
}

/// Extracts the response message from a Tunnel Management Command payload.
fn tunnel_response(payload: &[u8]) -> Result<&[u8], TransportError> {
    let (header, rest) = TunnelResponseHeader::read_from_prefix(payload)
        .map_err(|_| TransportError::BadTunnelResponse("short tunnel header"))?;
    rest.get(..header.response_length.get() as usize)
        .ok_or(TransportError::BadTunnelResponse("response length exceeds payload"))
}

/// Writes a response message for `request` into `response`.
fn reply(
    request: &CciMessageHeader,
    return_code: ReturnCode,
    vendor_status: u16,
    payload: &[u8],
    response: &mut [u8],
) -> Result<usize, TransportError> {
    let mut header =
        CciMessageHeader::response(request.tag, request.opcode(), return_code, payload.len());
    header.vendor_status = vendor_status.into();
    let len = size_of::<CciMessageHeader>() + payload.len();
    let capacity = response.len();
    let dest = response
        .get_mut(..len)
        .ok_or(TransportError::Truncated { len, capacity })?;
    let (head, tail) = dest.split_at_mut(size_of::<CciMessageHeader>());
    head.copy_from_slice(header.as_bytes());
    tail.copy_from_slice(payload);
    Ok(len)
}

impl<T: DeviceRegisterIo> CciTransport for MailboxCci<T> {
    fn local_mailbox(&self) -> Option<&dyn LocalMailbox> {
        Some(&self.mailbox)
    }

    fn send_direct(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.send(&[], request, response)
    }

    fn send_tunnel1(
        &mut self,
        hop: u8,
        request: &[u8],
        response: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.send(&[hop], request, response)
    }

    fn send_tunnel2(
        &mut self,
        outer: u8,
        inner: u8,
        request: &[u8],
        response: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.send(&[outer, inner], request, response)
    }
}
