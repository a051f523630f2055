// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::Error;
use crate::dispatch::Dispatcher;
use crate::endpoint::Endpoint;
use crate::endpoint::EndpointIdentity;
use crate::endpoint::SharedEndpoint;
use crate::mailbox_cci::MailboxCci;
use crate::transport::Transport;
use cxl_device::ConfigSpace;
use cxl_device::PciAddress;
use cxl_device::RegisterMapper;
use cxl_device::config_space::ConfigHeader;
use cxl_device::mapper;
use cxl_device::walker;
use cxl_mailbox::Mailbox;
use cxl_mailbox::MailboxConfig;
use cxl_spec::cci::MAX_MESSAGE_PAYLOAD;
use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by every endpoint of a [`Context`].
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Polling parameters for register mailboxes and for background
    /// operation polls on every endpoint.
    pub mailbox: MailboxConfig,
    /// Per-command timeout handed to external transports.
    pub transport_timeout: Duration,
    /// The largest response payload accepted from external transports.
    pub max_response_payload: usize,
    /// Log request and response payloads at debug level.
    pub debug_payloads: bool,
    /// Directory holding PCI device directories.
    pub sysfs_root: PathBuf,
    /// Device used to map physical register ranges.
    pub mem_device: PathBuf,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxConfig::default(),
            transport_timeout: Duration::from_secs(5),
            max_response_payload: MAX_MESSAGE_PAYLOAD,
            debug_payloads: false,
            sysfs_root: PathBuf::from("/sys/bus/pci/devices"),
            mem_device: PathBuf::from("/dev/mem"),
        }
    }
}

impl ContextConfig {
    /// Sets the mailbox polling parameters.
    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = mailbox;
        self
    }

    /// Sets the external transport timeout.
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    /// Sets the largest accepted external response payload.
    pub fn with_max_response_payload(mut self, len: usize) -> Self {
        self.max_response_payload = len;
        self
    }

    /// Enables payload logging.
    pub fn with_debug_payloads(mut self, enable: bool) -> Self {
        self.debug_payloads = enable;
        self
    }

    /// Sets the sysfs PCI device directory.
    pub fn with_sysfs_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs_root = path.into();
        self
    }

    /// Sets the physical memory device.
    pub fn with_mem_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.mem_device = path.into();
        self
    }
}

/// Identifies an endpoint within its [`Context`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointHandle(u64);

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// The set of open endpoints and the configuration they were opened with.
#[derive(Debug)]
pub struct Context {
    config: ContextConfig,
    endpoints: Vec<(EndpointHandle, SharedEndpoint)>,
    next_handle: u64,
}

impl Context {
    /// Creates an empty context.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            endpoints: Vec::new(),
            next_handle: 0,
        }
    }

    /// The context configuration.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Opens the register mailbox of the PCI function at `address`, reading
    /// its configuration space through sysfs and mapping registers through
    /// the physical memory device.
    #[cfg(target_os = "linux")]
    pub fn open_config_space(&mut self, address: PciAddress) -> Result<EndpointHandle, Error> {
        use cxl_device::config_space::SysfsConfigSpace;

        let cfg = SysfsConfigSpace::open(&self.config.sysfs_root, address).map_err(|err| {
            Error::Open {
                identity: EndpointIdentity::Pci(address),
                err,
            }
        })?;
        let mut mapper = mapper::PhysicalMemoryMapper::new(&self.config.mem_device);
        self.open_device(address, &cfg, &mut mapper)
    }

    /// Opens the register mailbox of the PCI function at `address`, using
    /// `cfg` to read its configuration space and `mapper` to map its
    /// registers.
    pub fn open_device<M: RegisterMapper>(
        &mut self,
        address: PciAddress,
        cfg: &dyn ConfigSpace,
        mapper: &mut M,
    ) -> Result<EndpointHandle, Error> {
        let header = ConfigHeader::read(cfg)?;
        tracing::debug!(
            %address,
            vendor_id = header.vendor_id,
            device_id = header.device_id,
            memory_device = header.is_cxl_memory_device(),
            "opening device"
        );

        let entry = walker::find_mailbox_block(cfg)?;
        let regs = mapper::map_mailbox(mapper, cfg, &entry)?;
        let mailbox = Mailbox::new(regs, self.config.mailbox.clone())?;
        let max_payload = mailbox.max_payload();
        let dispatcher = Dispatcher::new(
            Transport::Ioctl(Box::new(MailboxCci::new(mailbox))),
            self.config.transport_timeout,
            max_payload,
            self.config.debug_payloads,
        );
        Ok(self.insert(Endpoint::new(
            EndpointIdentity::Pci(address),
            dispatcher,
            self.config.mailbox.clone(),
        )))
    }

    /// Opens an endpoint over an external transport. `name` identifies the
    /// component in logs.
    pub fn open_transport(
        &mut self,
        name: impl Into<String>,
        transport: Transport,
    ) -> EndpointHandle {
        let identity = EndpointIdentity::Transport(name.into());
        tracing::debug!(%identity, transport = transport.kind(), "opening transport endpoint");
        let dispatcher = Dispatcher::new(
            transport,
            self.config.transport_timeout,
            self.config.max_response_payload,
            self.config.debug_payloads,
        );
        self.insert(Endpoint::new(
            identity,
            dispatcher,
            self.config.mailbox.clone(),
        ))
    }

    fn insert(&mut self, endpoint: Endpoint) -> EndpointHandle {
        let handle = EndpointHandle(self.next_handle);
        self.next_handle += 1;
        tracing::debug!(%handle, identity = %endpoint.identity(), "endpoint open");
        self.endpoints.push((handle, Arc::new(Mutex::new(endpoint))));
        handle
    }

    /// Returns the endpoint for `handle`.
    pub fn endpoint(&self, handle: EndpointHandle) -> Option<SharedEndpoint> {
        self.endpoints
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, ep)| ep.clone())
    }

    /// Iterates over the open endpoints in the order they were opened.
    pub fn endpoints(&self) -> impl Iterator<Item = (EndpointHandle, &SharedEndpoint)> {
        self.endpoints.iter().map(|(h, ep)| (*h, ep))
    }

    /// Closes the endpoint for `handle` and removes it from the context.
    ///
    /// Waits for any command in flight on the endpoint to finish.
    pub fn close(&mut self, handle: EndpointHandle) -> Result<(), Error> {
        let index = self
            .endpoints
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or(Error::UnknownEndpoint(handle))?;
        let (_, endpoint) = self.endpoints.remove(index);
        endpoint.lock().close();
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        for (_, endpoint) in self.endpoints.drain(..) {
            endpoint.lock().close();
        }
    }
}
