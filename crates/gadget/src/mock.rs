//! In-memory backend for tests
//!
//! Every kernel channel is a `UnixDatagram` socket pair, so one record or
//! one bulk packet is exactly one datagram. [`MockHost`] plays the kernel
//! and the USB host: it injects control notifications, inspects control
//! replies and talks to the far side of each enabled endpoint.
//!
//! # Example
//!
//! ```
//! use gadget::mock;
//! use gadget::{Device, DescriptorBlock, Session};
//! # use gadget::{ConfigDescriptor, InterfaceDescriptor, EndpointDescriptor, DeviceDescriptor, Strings};
//! # let device = Device {
//! #     device: DeviceDescriptor::default(),
//! #     full_speed: vec![
//! #         DescriptorBlock::Config(ConfigDescriptor { num_interfaces: 1, configuration_value: 1, configuration: 0, attributes: 0xc0, max_power: 1 }),
//! #         DescriptorBlock::Interface(InterfaceDescriptor { interface_number: 0, alternate_setting: 0, num_endpoints: 1, interface_class: 0xff, interface_subclass: 0, interface_protocol: 0, interface: 0 }),
//! #         DescriptorBlock::Endpoint(EndpointDescriptor::bulk_in(1, 64)),
//! #         DescriptorBlock::End,
//! #     ],
//! #     high_speed: None,
//! #     strings: Strings::default(),
//! # };
//!
//! let (backend, host) = mock::pair();
//! let session = Session::open_with(&device, backend).unwrap();
//! assert!(host.is_registered());
//! session.close();
//! assert!(!host.is_registered());
//! ```

use crate::backend::{Backend, ControlEndpoint};
use crate::descriptor::{DescriptorImage, EndpointConfig};
use crate::event::{Notification, SetupPacket, Speed};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// What the session sent back on endpoint 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    Data(Vec<u8>),
    Ack,
    Stall(SetupPacket),
}

#[derive(Default)]
struct MockState {
    /// Kernel side of the control channel
    kernel: Mutex<Option<UnixDatagram>>,
    registration: Mutex<Option<Vec<u8>>>,
    replies: Mutex<Vec<ControlReply>>,
    /// Host side of every endpoint opened so far, by number
    endpoints: Mutex<HashMap<u8, UnixDatagram>>,
    endpoint_opens: Mutex<Vec<u8>>,
    refuse_control: AtomicBool,
    refused_endpoints: Mutex<HashSet<u8>>,
    /// Endpoints behave like gadgetfs files: no poll, reads block in the kernel
    unpollable: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a connected backend / host pair
pub fn pair() -> (MockBackend, MockHost) {
    let state = Arc::new(MockState::default());
    (
        MockBackend {
            state: state.clone(),
        },
        MockHost { state },
    )
}

/// [`Backend`] handed to the session under test
pub struct MockBackend {
    state: Arc<MockState>,
}

impl Backend for MockBackend {
    fn open_control(&self, image: &DescriptorImage) -> io::Result<Box<dyn ControlEndpoint>> {
        if self.state.refuse_control.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(nix::libc::EBUSY));
        }
        let (device, kernel) = UnixDatagram::pair()?;
        *lock(&self.state.kernel) = Some(kernel);
        *lock(&self.state.registration) = Some(image.gadgetfs_bytes());
        Ok(Box::new(MockControl {
            socket: device,
            state: self.state.clone(),
        }))
    }

    fn open_endpoint(&self, config: &EndpointConfig) -> io::Result<(File, String)> {
        let number = config.number();
        if lock(&self.state.refused_endpoints).contains(&number) {
            return Err(io::Error::from_raw_os_error(nix::libc::ENODEV));
        }
        let (device, host) = UnixDatagram::pair()?;
        lock(&self.state.endpoints).insert(number, host);
        lock(&self.state.endpoint_opens).push(number);
        let name = format!("ep{}{}", number, if config.is_in() { "in" } else { "out" });
        Ok((File::from(OwnedFd::from(device)), name))
    }

    fn endpoints_pollable(&self) -> bool {
        !self.state.unpollable.load(Ordering::SeqCst)
    }
}

struct MockControl {
    socket: UnixDatagram,
    state: Arc<MockState>,
}

impl Drop for MockControl {
    fn drop(&mut self) {
        *lock(&self.state.registration) = None;
    }
}

impl AsFd for MockControl {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

impl ControlEndpoint for MockControl {
    fn read_event(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn reply(&mut self, data: &[u8]) -> io::Result<()> {
        lock(&self.state.replies).push(ControlReply::Data(data.to_vec()));
        Ok(())
    }

    fn ack(&mut self) -> io::Result<()> {
        lock(&self.state.replies).push(ControlReply::Ack);
        Ok(())
    }

    fn stall(&mut self, setup: &SetupPacket) -> io::Result<()> {
        lock(&self.state.replies).push(ControlReply::Stall(*setup));
        Ok(())
    }

    fn name(&self) -> &str {
        "mock-udc"
    }
}

/// Kernel and USB host side of a [`MockBackend`]
#[derive(Clone)]
pub struct MockHost {
    state: Arc<MockState>,
}

impl MockHost {
    /// Queue one raw control record
    pub fn send_raw(&self, record: &[u8]) -> io::Result<()> {
        let kernel = lock(&self.state.kernel);
        let socket = kernel.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no device registered")
        })?;
        socket.send(record).map(|_| ())
    }

    pub fn send(&self, notification: Notification) -> io::Result<()> {
        self.send_raw(&notification.encode())
    }

    pub fn connect(&self, speed: Speed) -> io::Result<()> {
        self.send(Notification::Connect(speed))
    }

    pub fn disconnect(&self) -> io::Result<()> {
        self.send(Notification::Disconnect)
    }

    pub fn suspend(&self) -> io::Result<()> {
        self.send(Notification::Suspend)
    }

    pub fn setup(&self, setup: SetupPacket) -> io::Result<()> {
        self.send(Notification::Setup(setup))
    }

    pub fn set_configuration(&self, value: u8) -> io::Result<()> {
        self.setup(SetupPacket::set_configuration(value))
    }

    /// Whether descriptors are currently registered
    pub fn is_registered(&self) -> bool {
        lock(&self.state.registration).is_some()
    }

    /// The bytes written at registration, while registered
    pub fn registration(&self) -> Option<Vec<u8>> {
        lock(&self.state.registration).clone()
    }

    /// Drain the control replies seen so far
    pub fn take_replies(&self) -> Vec<ControlReply> {
        std::mem::take(&mut *lock(&self.state.replies))
    }

    /// Endpoint numbers in the order they were opened
    pub fn endpoint_opens(&self) -> Vec<u8> {
        lock(&self.state.endpoint_opens).clone()
    }

    /// Make the next registrations fail with EBUSY
    pub fn refuse_control(&self, refuse: bool) {
        self.state.refuse_control.store(refuse, Ordering::SeqCst);
    }

    /// Make opening endpoint `number` fail
    pub fn refuse_endpoint(&self, number: u8) {
        lock(&self.state.refused_endpoints).insert(number);
    }

    /// Open endpoints the way gadgetfs does, without poll support
    pub fn unpollable_endpoints(&self, unpollable: bool) {
        self.state.unpollable.store(unpollable, Ordering::SeqCst);
    }

    /// Host side of the most recently opened endpoint `number`
    pub fn endpoint(&self, number: u8) -> io::Result<HostEndpoint> {
        let endpoints = lock(&self.state.endpoints);
        let socket = endpoints.get(&number).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("endpoint {} was never opened", number),
            )
        })?;
        Ok(HostEndpoint {
            socket: socket.try_clone()?,
        })
    }
}

/// Host end of a data endpoint
pub struct HostEndpoint {
    socket: UnixDatagram,
}

impl HostEndpoint {
    /// Host-to-device packet (what the device reads on an OUT endpoint)
    pub fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send(packet)
    }

    /// Device-to-host packet (what the device wrote on an IN endpoint)
    pub fn recv(&self, timeout: Duration) -> io::Result<Vec<u8>> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; 4096];
        let n = self.socket.recv(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}
