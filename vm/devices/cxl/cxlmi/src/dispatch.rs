// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Routes a command to exactly one send path of an endpoint's transport and
//! frames it as a CCI message.

use crate::Error;
use crate::transport::Route;
use crate::transport::Transport;
use crate::transport::TunnelInfo;
use cxl_mailbox::Response;
use cxl_spec::ReturnCode;
use cxl_spec::cci::CciMessageHeader;
use cxl_spec::cci::MAX_MESSAGE_PAYLOAD;
use cxl_spec::cci::MessageCategory;
use cxl_spec::mailbox::Opcode;
use std::fmt;
use std::time::Duration;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const HEADER_LEN: usize = size_of::<CciMessageHeader>();

/// Formats bytes as space-separated hex.
pub(crate) struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

pub(crate) struct Dispatcher {
    transport: Transport,
    next_tag: u8,
    timeout: Duration,
    max_response_payload: usize,
    debug_payloads: bool,
}

impl Dispatcher {
    pub fn new(
        transport: Transport,
        timeout: Duration,
        max_response_payload: usize,
        debug_payloads: bool,
    ) -> Self {
        Self {
            transport,
            next_tag: 0,
            timeout,
            max_response_payload: max_response_payload.min(MAX_MESSAGE_PAYLOAD),
            debug_payloads,
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Sends `payload` as command `opcode` along the route named by
    /// `tunnel`.
    pub fn send(
        &mut self,
        tunnel: Option<&TunnelInfo>,
        opcode: u16,
        payload: &[u8],
    ) -> Result<Response, Error> {
        // Validate before anything reaches the transport.
        let route = Route::resolve(tunnel)?;
        if payload.len() > MAX_MESSAGE_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: MAX_MESSAGE_PAYLOAD,
            });
        }

        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        let header = CciMessageHeader::request(tag, Opcode(opcode), payload.len());
        let request = [header.as_bytes(), payload].concat();
        let mut response = vec![0; HEADER_LEN + self.max_response_payload];

        tracing::debug!(
            transport = self.transport.kind(),
            ?route,
            opcode,
            tag,
            len = payload.len(),
            "sending command"
        );
        if self.debug_payloads {
            tracing::debug!(opcode, payload = %HexDump(payload), "request payload");
        }

        let timeout = self.timeout;
        let (request, response_buf) = (&request[..], &mut response[..]);
        let n = match (&mut self.transport, route) {
            (Transport::Mctp(t), Route::Direct) => t.send_direct(request, response_buf, timeout),
            (Transport::Mctp(t), Route::Tunnel1(hop)) => {
                t.send_tunnel1(hop, request, response_buf, timeout)
            }
            (Transport::Mctp(t), Route::Tunnel2(outer, inner)) => {
                t.send_tunnel2(outer, inner, request, response_buf, timeout)
            }
            (Transport::Ioctl(t), Route::Direct) => t.send_direct(request, response_buf, timeout),
            (Transport::Ioctl(t), Route::Tunnel1(hop)) => {
                t.send_tunnel1(hop, request, response_buf, timeout)
            }
            (Transport::Ioctl(t), Route::Tunnel2(outer, inner)) => {
                t.send_tunnel2(outer, inner, request, response_buf, timeout)
            }
        }?;

        let message = response
            .get(..n)
            .ok_or(Error::MalformedResponse("length exceeds response buffer"))?;
        let response = decode_response(&header, message)?;

        tracing::debug!(
            opcode,
            tag,
            return_code = %response.return_code,
            len = response.payload.len(),
            "command complete"
        );
        if self.debug_payloads {
            tracing::debug!(opcode, payload = %HexDump(&response.payload), "response payload");
        }
        Ok(response)
    }
}

/// Validates a response message against the request header that produced
/// it.
fn decode_response(request: &CciMessageHeader, message: &[u8]) -> Result<Response, Error> {
    let (header, body) = CciMessageHeader::read_from_prefix(message)
        .map_err(|_| Error::MalformedResponse("short message header"))?;
    if header.category() != MessageCategory::RESPONSE {
        return Err(Error::MalformedResponse("not a response"));
    }
    if header.tag != request.tag {
        tracing::warn!(expected = request.tag, tag = header.tag, "response tag mismatch");
        return Err(Error::MalformedResponse("tag mismatch"));
    }
    if header.opcode() != request.opcode() {
        return Err(Error::MalformedResponse("opcode mismatch"));
    }
    let payload = body
        .get(..header.payload_length())
        .ok_or(Error::MalformedResponse("payload length exceeds message"))?;

    let return_code = header.return_code();
    Ok(Response {
        opcode: header.opcode().0,
        return_code,
        vendor_status: header.vendor_status.get(),
        payload: payload.to_vec(),
        background: return_code == ReturnCode::BACKGROUND_COMMAND_STARTED,
    })
}
