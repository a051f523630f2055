// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command transports and tunnel routing.

use crate::mailbox_cci::LocalMailbox;
use cxl_mailbox::MailboxError;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// An error sending a CCI message.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying channel failed.
    #[error("transport i/o error")]
    Io(#[from] io::Error),
    /// No response arrived in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The response does not fit the response buffer.
    #[error("response of {len} bytes exceeds buffer of {capacity}")]
    Truncated {
        /// The response length.
        len: usize,
        /// The buffer length.
        capacity: usize,
    },
    /// The request message cannot be carried by this transport.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    /// A tunneling component returned a malformed tunnel response.
    #[error("bad tunnel response: {0}")]
    BadTunnelResponse(&'static str),
    /// The local register mailbox failed.
    #[error("mailbox error")]
    Mailbox(#[from] MailboxError),
}

/// A channel that carries raw CCI messages to a component.
///
/// Each method sends the request message in `request` and writes the
/// complete response message, header included, to `response`, returning its
/// length.
pub trait CciTransport: Send {
    /// Sends to the component at the end of the channel.
    fn send_direct(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Sends through one tunneling component to port or LD `hop`.
    fn send_tunnel1(
        &mut self,
        hop: u8,
        request: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Sends through two tunneling components: first to `outer`, then from
    /// there to `inner`.
    fn send_tunnel2(
        &mut self,
        outer: u8,
        inner: u8,
        request: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// The register mailbox behind this channel, if the channel is a local
    /// device's own mailbox.
    fn local_mailbox(&self) -> Option<&dyn LocalMailbox> {
        None
    }
}

/// The channel an endpoint was opened over.
pub enum Transport {
    /// An MCTP binding, out of band.
    Mctp(Box<dyn CciTransport>),
    /// A host-local channel: an OS ioctl interface or the device's own
    /// register mailbox.
    Ioctl(Box<dyn CciTransport>),
}

impl Transport {
    /// A short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Mctp(_) => "mctp",
            Transport::Ioctl(_) => "ioctl",
        }
    }

    /// The register mailbox behind the channel, if any.
    pub fn local_mailbox(&self) -> Option<&dyn LocalMailbox> {
        match self {
            Transport::Mctp(t) | Transport::Ioctl(t) => t.local_mailbox(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transport").field(&self.kind()).finish()
    }
}

/// Routing through up to two tunneling components.
///
/// `depth` is the declared number of hops; the first `depth` entries of
/// `hops` must be set.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct TunnelInfo {
    /// Number of tunneling levels, 1 or 2.
    pub depth: u8,
    /// Port or LD id at each level, outermost first.
    pub hops: [Option<u8>; 2],
}

impl TunnelInfo {
    /// Tunnels through one component to port or LD `hop`.
    pub fn one(hop: u8) -> Self {
        Self {
            depth: 1,
            hops: [Some(hop), None],
        }
    }

    /// Tunnels through a component to port or LD `outer`, and from there to
    /// port or LD `inner`.
    pub fn two(outer: u8, inner: u8) -> Self {
        Self {
            depth: 2,
            hops: [Some(outer), Some(inner)],
        }
    }
}

/// The resolved path of one command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Route {
    /// Straight to the endpoint.
    Direct,
    /// Through one tunneling component.
    Tunnel1(u8),
    /// Through two tunneling components.
    Tunnel2(u8, u8),
}

/// The tunnel descriptor names an unsupported depth or leaves a hop unset.
#[derive(Debug, Error)]
#[error("invalid tunnel info {0:?}")]
pub struct InvalidTunnelInfo(pub TunnelInfo);

impl Route {
    /// Resolves an optional tunnel descriptor. No descriptor is direct.
    pub fn resolve(tunnel: Option<&TunnelInfo>) -> Result<Self, InvalidTunnelInfo> {
        let Some(info) = tunnel else {
            return Ok(Route::Direct);
        };
        match (info.depth, info.hops) {
            (1, [Some(hop), _]) => Ok(Route::Tunnel1(hop)),
            (2, [Some(outer), Some(inner)]) => Ok(Route::Tunnel2(outer, inner)),
            _ => Err(InvalidTunnelInfo(*info)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_routes() {
        assert_eq!(Route::resolve(None).unwrap(), Route::Direct);
        assert_eq!(
            Route::resolve(Some(&TunnelInfo::one(4))).unwrap(),
            Route::Tunnel1(4)
        );
        assert_eq!(
            Route::resolve(Some(&TunnelInfo::two(1, 2))).unwrap(),
            Route::Tunnel2(1, 2)
        );
        // Only the declared depth matters.
        let info = TunnelInfo {
            depth: 1,
            hops: [Some(3), Some(9)],
        };
        assert_eq!(Route::resolve(Some(&info)).unwrap(), Route::Tunnel1(3));
    }

    #[test]
    fn reject_bad_tunnel_info() {
        for info in [
            TunnelInfo::default(),
            TunnelInfo {
                depth: 3,
                hops: [Some(1), Some(2)],
            },
            TunnelInfo {
                depth: 1,
                hops: [None, Some(2)],
            },
            TunnelInfo {
                depth: 2,
                hops: [None, Some(2)],
            },
            TunnelInfo {
                depth: 2,
                hops: [Some(1), None],
            },
        ] {
            assert!(Route::resolve(Some(&info)).is_err(), "{info:?}");
        }
    }
}
