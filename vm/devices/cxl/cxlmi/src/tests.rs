// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::*;
use cxl_emulated_mock::Component;
use cxl_emulated_mock::ConfigSpaceBuilder;
use cxl_emulated_mock::EmulatedCxlDevice;
use cxl_emulated_mock::EmulatedMailbox;
use cxl_emulated_mock::MailboxReply;
use cxl_emulated_mock::init_tracing;
use cxl_mailbox::MailboxConfig;
use cxl_spec::cci::CciMessageHeader;
use cxl_spec::mailbox::BackgroundCommandStatus;
use cxl_spec::mailbox::Opcode;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Call {
    Direct,
    Tunnel1(u8),
    Tunnel2(u8, u8),
}

/// How a [`RecordingTransport`] answers.
#[derive(Clone, Copy)]
enum Answer {
    /// A well-formed response echoing the request payload.
    Echo,
    /// A response with the wrong tag.
    WrongTag,
    /// A transport failure.
    Fail,
}

/// A transport that records which entry point was called.
#[derive(Clone)]
struct RecordingTransport {
    calls: Arc<Mutex<Vec<(Call, Duration)>>>,
    answer: Answer,
}

impl RecordingTransport {
    fn new(answer: Answer) -> Self {
        Self {
            calls: Default::default(),
            answer,
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().iter().map(|(call, _)| *call).collect()
    }

    fn answer(
        &self,
        call: Call,
        request: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.calls.lock().push((call, timeout));
        let (header, payload) = CciMessageHeader::read_from_prefix(request).unwrap();
        let tag = match self.answer {
            Answer::Echo => header.tag,
            Answer::WrongTag => header.tag.wrapping_add(1),
            Answer::Fail => return Err(TransportError::Timeout(timeout)),
        };
        let reply = CciMessageHeader::response(
            tag,
            header.opcode(),
            ReturnCode::SUCCESS,
            payload.len(),
        );
        let message = [reply.as_bytes(), payload].concat();
        response[..message.len()].copy_from_slice(&message);
        Ok(message.len())
    }
}

impl CciTransport for RecordingTransport {
    fn send_direct(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.answer(Call::Direct, request, response, timeout)
    }

    fn send_tunnel1(
        &mut self,
        hop: u8,
        request: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.answer(Call::Tunnel1(hop), request, response, timeout)
    }

    fn send_tunnel2(
        &mut self,
        outer: u8,
        inner: u8,
        request: &[u8],
        response: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.answer(Call::Tunnel2(outer, inner), request, response, timeout)
    }
}

fn context() -> Context {
    init_tracing();
    Context::new(
        ContextConfig::default()
            .with_mailbox(MailboxConfig::default().with_min_timeout(Duration::from_millis(10)))
            .with_transport_timeout(Duration::from_millis(250))
            .with_max_response_payload(0x1000)
            .with_debug_payloads(true),
    )
}

const ADDRESS: PciAddress = PciAddress::new(0, 0x35, 0, 0);

fn open_emulated(ctx: &mut Context, device: &EmulatedCxlDevice) -> SharedEndpoint {
    let handle = ctx
        .open_device(ADDRESS, &device.config_space(), &mut device.mapper())
        .unwrap();
    ctx.endpoint(handle).unwrap()
}

#[test]
fn six_way_dispatch() {
    let routes = [
        (None, Call::Direct),
        (Some(TunnelInfo::one(3)), Call::Tunnel1(3)),
        (Some(TunnelInfo::two(1, 7)), Call::Tunnel2(1, 7)),
    ];
    for mctp in [true, false] {
        for (tunnel, expected) in routes {
            let mut ctx = context();
            let recorder = RecordingTransport::new(Answer::Echo);
            let transport = if mctp {
                Transport::Mctp(Box::new(recorder.clone()))
            } else {
                Transport::Ioctl(Box::new(recorder.clone()))
            };
            let handle = ctx.open_transport("switch", transport);
            let ep = ctx.endpoint(handle).unwrap();
            let kind = if mctp { "mctp" } else { "ioctl" };
            assert_eq!(ep.lock().transport_kind(), Some(kind));

            let response = ep.lock().dispatch(tunnel.as_ref(), 0x5100, &[9, 8]).unwrap();
            assert_eq!(response.opcode, 0x5100);
            assert_eq!(response.payload, [9, 8]);
            assert_eq!(recorder.calls(), [expected]);
            assert_eq!(recorder.calls.lock()[0].1, Duration::from_millis(250));
        }
    }
}

#[test]
fn invalid_tunnel_sends_nothing() {
    let mut ctx = context();
    let recorder = RecordingTransport::new(Answer::Echo);
    let handle = ctx.open_transport("switch", Transport::Mctp(Box::new(recorder.clone())));
    let ep = ctx.endpoint(handle).unwrap();

    let unset_first_hop = TunnelInfo {
        depth: 2,
        hops: [None, Some(4)],
    };
    for info in [unset_first_hop, TunnelInfo::default()] {
        let err = ep
            .lock()
            .submit(Command::new(0x0001).with_tunnel(info))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTunnelInfo(_)), "{err:?}");
    }
    assert!(recorder.calls().is_empty());
}

#[test]
fn response_validation() {
    let mut ctx = context();
    let recorder = RecordingTransport::new(Answer::WrongTag);
    let handle = ctx.open_transport("bad", Transport::Mctp(Box::new(recorder)));
    let ep = ctx.endpoint(handle).unwrap();
    assert!(matches!(
        ep.lock().dispatch(None, 0x0001, &[]),
        Err(Error::MalformedResponse(_))
    ));

    let recorder = RecordingTransport::new(Answer::Fail);
    let handle = ctx.open_transport("down", Transport::Ioctl(Box::new(recorder)));
    let ep = ctx.endpoint(handle).unwrap();
    assert!(matches!(
        ep.lock().dispatch(None, 0x0001, &[]),
        Err(Error::Transport(TransportError::Timeout(_)))
    ));
}

#[test]
fn tags_advance() {
    let mut ctx = context();
    let recorder = RecordingTransport::new(Answer::Echo);
    let handle = ctx.open_transport("switch", Transport::Mctp(Box::new(recorder.clone())));
    let ep = ctx.endpoint(handle).unwrap();
    // Every response echoes its own tag, across the u8 wrap.
    for _ in 0..300 {
        ep.lock().dispatch(None, 0x0001, &[]).unwrap();
    }
    assert_eq!(recorder.calls().len(), 300);
}

#[test]
fn end_to_end_register_mailbox() {
    let output: Vec<u8> = (0..=255).collect();
    let reply = output.clone();
    let mailbox = EmulatedMailbox::new(
        8,
        Component::new(move |_, _| MailboxReply::success(reply.clone())),
    );
    let device = EmulatedCxlDevice::new(mailbox).unwrap();
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);
    assert_eq!(ep.lock().identity(), &EndpointIdentity::Pci(ADDRESS));

    let response = ep.lock().submit(Command::new(0x0400)).unwrap();
    assert_eq!(
        response,
        Response {
            opcode: 0x0400,
            return_code: ReturnCode::SUCCESS,
            vendor_status: 0,
            payload: output,
            background: false,
        }
    );
    assert_eq!(device.mailbox().executed(), [(0x0400, Vec::new())]);
}

#[test]
fn device_errors() {
    let mailbox = EmulatedMailbox::new(
        8,
        Component::new(|_, _| MailboxReply::error(ReturnCode::UNSUPPORTED)),
    );
    let device = EmulatedCxlDevice::new(mailbox).unwrap();
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);

    let response = ep.lock().submit(Command::new(0x4d00)).unwrap();
    assert_eq!(response.outcome(), Outcome::Failure);
    let err = response.into_result().unwrap_err();
    assert_eq!(err.return_code, ReturnCode::UNSUPPORTED);

    // Larger than the 256 byte window.
    assert!(matches!(
        ep.lock().submit(Command::new(0x4d00).with_payload(vec![0; 300])),
        Err(Error::Transport(TransportError::Mailbox(
            MailboxError::PayloadTooLarge { len: 300, max: 256 }
        )))
    ));
}

#[test]
fn tunnels_through_register_mailbox() {
    let leaf = Component::new(|opcode, input| {
        let mut out = opcode.to_le_bytes().to_vec();
        out.extend_from_slice(input);
        MailboxReply::success(out)
    });
    let root = Component::echo().with_tunnel(2, Component::echo().with_tunnel(6, leaf));
    let device = EmulatedCxlDevice::new(EmulatedMailbox::new(9, root)).unwrap();
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);

    let response = ep
        .lock()
        .submit(
            Command::new(0x4000)
                .with_payload([1, 2])
                .with_tunnel(TunnelInfo::two(2, 6)),
        )
        .unwrap();
    assert_eq!(response.opcode, 0x4000);
    assert_eq!(response.payload, [0x00, 0x40, 1, 2]);

    let response = ep
        .lock()
        .submit(Command::new(0x4000).with_tunnel(TunnelInfo::one(2)))
        .unwrap();
    assert!(response.payload.is_empty());

    let executed = device.mailbox().executed();
    assert_eq!(executed.len(), 2);
    assert!(executed.iter().all(|(op, _)| *op == Opcode::TUNNEL_MANAGEMENT.0));

    // Depth 2 with the first hop unset never reaches the mailbox.
    let info = TunnelInfo {
        depth: 2,
        hops: [None, Some(6)],
    };
    assert!(ep.lock().dispatch(Some(&info), 0x4000, &[]).is_err());
    assert_eq!(device.mailbox().executed().len(), 2);
}

#[test]
fn background_status_and_abort() {
    let mailbox = EmulatedMailbox::new(
        8,
        Component::new(|opcode, _| match opcode {
            0x4400 => MailboxReply::Background {
                step: 10,
                return_code: ReturnCode::SUCCESS,
            },
            _ => MailboxReply::success(Vec::new()),
        }),
    );
    let device = EmulatedCxlDevice::new(mailbox).unwrap();
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);
    let mut ep = ep.lock();

    let response = ep.submit(Command::new(0x4400)).unwrap();
    assert!(response.background);
    assert_eq!(response.outcome(), Outcome::BackgroundStarted);

    // Read from the registers; each read advances the emulated operation.
    let status = ep.background_status(None).unwrap();
    assert!(status.in_progress());
    assert_eq!(status.opcode.get(), 0x4400);
    assert_eq!(status.percent_complete(), 10);
    assert_eq!(device.mailbox().executed().len(), 1);

    ep.request_background_abort(None).unwrap();
    let status = ep.background_status(None).unwrap();
    assert!(!status.in_progress());
    assert_eq!(status.return_code(), ReturnCode::ABORTED);
    assert!(!device.mailbox().background_running());
}

#[test]
fn discovery_failure() {
    let mut ctx = context();
    let cfg = ConfigSpaceBuilder::new().build().unwrap();
    let device = EmulatedCxlDevice::new(EmulatedMailbox::new(8, Component::echo())).unwrap();
    let err = ctx
        .open_device(ADDRESS, &cfg, &mut device.mapper())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Discovery(cxl_device::DiscoveryError::CapabilityNotFound)
    ));
    assert_eq!(ctx.endpoints().count(), 0);

    // An out-of-range payload size is rejected when the mailbox is opened.
    let device = EmulatedCxlDevice::new(EmulatedMailbox::new(21, Component::echo())).unwrap();
    assert!(matches!(
        ctx.open_device(ADDRESS, &device.config_space(), &mut device.mapper()),
        Err(Error::Mailbox(MailboxError::InvalidPayloadSize(21)))
    ));
}

#[test]
fn close_endpoints() {
    let device = EmulatedCxlDevice::new(EmulatedMailbox::new(8, Component::echo())).unwrap();
    let mut ctx = context();
    let first = ctx
        .open_device(ADDRESS, &device.config_space(), &mut device.mapper())
        .unwrap();
    let recorder = RecordingTransport::new(Answer::Echo);
    let second = ctx.open_transport("switch", Transport::Mctp(Box::new(recorder)));
    assert_eq!(
        ctx.endpoints().map(|(h, _)| h).collect::<Vec<_>>(),
        [first, second]
    );

    let ep = ctx.endpoint(first).unwrap();
    ctx.close(first).unwrap();
    assert!(ep.lock().is_closed());
    assert!(matches!(
        ep.lock().submit(Command::new(0x0001)),
        Err(Error::Closed)
    ));
    assert!(matches!(ctx.close(first), Err(Error::UnknownEndpoint(h)) if h == first));
    assert!(ctx.endpoint(first).is_none());

    let ep = ctx.endpoint(second).unwrap();
    drop(ctx);
    assert!(ep.lock().is_closed());
}

#[test]
fn shared_endpoint_serializes_commands() {
    let device = EmulatedCxlDevice::new(EmulatedMailbox::new(8, Component::echo())).unwrap();
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);

    let threads = (0..4u8)
        .map(|i| {
            let ep = ep.clone();
            std::thread::spawn(move || {
                for j in 0..10u8 {
                    let response = ep
                        .lock()
                        .submit(Command::new(0x4300).with_payload([i, j]))
                        .unwrap();
                    assert_eq!(response.payload, [i, j]);
                }
            })
        })
        .collect::<Vec<_>>();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(device.mailbox().executed().len(), 40);
}

fn background_device(step: u8) -> EmulatedCxlDevice {
    let mailbox = EmulatedMailbox::new(
        8,
        Component::new(move |opcode, _| match opcode {
            0x4400 => MailboxReply::Background {
                step,
                return_code: ReturnCode::SUCCESS,
            },
            _ => MailboxReply::success([0x5a; 4]),
        }),
    );
    EmulatedCxlDevice::new(mailbox).unwrap()
}

#[test]
fn commands_during_background_operation_are_background_completions() {
    let device = background_device(1);
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);
    let mut ep = ep.lock();

    assert!(ep.submit(Command::new(0x4400)).unwrap().background);
    let response = ep.submit(Command::new(0x0001)).unwrap();
    assert!(response.background);
    assert_eq!(response.return_code, ReturnCode::BACKGROUND_COMMAND_STARTED);
    assert!(response.payload.is_empty());
    assert!(device.mailbox().background_running());
}

#[test]
fn poll_background_on_register_mailbox() {
    let device = background_device(25);
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);
    let mut ep = ep.lock();

    assert!(ep.submit(Command::new(0x4400)).unwrap().background);
    let mut seen = Vec::new();
    let result = ep
        .poll_background(None, Instant::now() + Duration::from_secs(5), |status| {
            assert!(status.in_progress());
            seen.push(status.percent_complete());
            true
        })
        .unwrap();
    let BackgroundPoll::Complete(status) = result else {
        panic!("{result:?}");
    };
    assert!(!status.in_progress());
    assert_eq!(status.percent_complete(), 100);
    assert_eq!(status.opcode.get(), 0x4400);
    assert_eq!(status.return_code(), ReturnCode::SUCCESS);
    assert_eq!(seen, [25, 50, 75]);
    // Polling reads registers only.
    assert_eq!(device.mailbox().executed().len(), 1);
    assert!(!device.mailbox().background_running());
}

#[test]
fn poll_background_abandon_and_deadline() {
    let device = background_device(10);
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);
    let mut ep = ep.lock();

    ep.submit(Command::new(0x4400)).unwrap();
    let result = ep
        .poll_background(None, Instant::now() + Duration::from_secs(5), |_| false)
        .unwrap();
    assert!(
        matches!(result, BackgroundPoll::Abandoned(s) if s.in_progress() && s.percent_complete() == 10)
    );
    assert!(device.mailbox().background_running());
    ep.request_background_abort(None).unwrap();

    let stalled = background_device(0);
    let ep = open_emulated(&mut ctx, &stalled);
    let mut ep = ep.lock();
    ep.submit(Command::new(0x4400)).unwrap();
    assert!(matches!(
        ep.poll_background(None, Instant::now() + Duration::from_millis(5), |_| true),
        Err(Error::BackgroundTimeout { opcode: 0x4400, .. })
    ));

    ep.close();
    assert!(matches!(
        ep.poll_background(None, Instant::now(), |_| true),
        Err(Error::Closed)
    ));
}

#[test]
fn poll_background_through_tunnel() {
    // The operation runs on the component behind the tunnel, so progress
    // comes from Background Operation Status commands.
    let mut percent = 0;
    let leaf = Component::new(move |opcode, _| {
        assert_eq!(opcode, Opcode::BACKGROUND_OPERATION_STATUS.0);
        percent = (percent + 25).min(100);
        let register = BackgroundCommandStatus::new()
            .with_opcode(0x4400)
            .with_percent_complete(percent)
            .with_return_code(ReturnCode::SUCCESS);
        let status = BackgroundOperationStatus::from_register(percent < 100, register);
        MailboxReply::success(status.as_bytes())
    });
    let root = Component::echo().with_tunnel(4, leaf);
    let device = EmulatedCxlDevice::new(EmulatedMailbox::new(8, root)).unwrap();
    let mut ctx = context();
    let ep = open_emulated(&mut ctx, &device);

    let mut seen = Vec::new();
    let result = ep
        .lock()
        .poll_background(
            Some(&TunnelInfo::one(4)),
            Instant::now() + Duration::from_secs(5),
            |status| {
                seen.push(status.percent_complete());
                true
            },
        )
        .unwrap();
    assert!(
        matches!(result, BackgroundPoll::Complete(s) if !s.in_progress() && s.opcode.get() == 0x4400)
    );
    assert_eq!(seen, [25, 50, 75]);
    assert_eq!(device.mailbox().executed().len(), 4);
}
