//! Device session and event dispatcher
//!
//! A [`Session`] owns the control channel of one registered gadget and the
//! handles of its currently enabled endpoints. The caller drives it from its
//! own readiness loop:
//!
//! 1. wait until [`Session::control_fd`] is readable
//! 2. call [`Session::handle_control_event`]
//! 3. repeat
//!
//! Each call consumes one unit of work and delivers at most one [`Event`] to
//! the callback. SETUP requests are answered internally. A
//! SET_CONFIGURATION expands into a queue of endpoint transitions that the
//! following calls deliver one at a time, and the readiness handle stays
//! readable until that queue is drained.

use crate::backend::{Backend, ControlEndpoint, GadgetFs};
use crate::descriptor::{DT_STRING, DescriptorImage, Device};
use crate::endpoint::{Direction, Endpoint, IoMode};
use crate::error::{GadgetError, Result};
use crate::event::{Event, Notification, SetupPacket, Speed, request};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Callback receiving every dispatched event
pub type EventCallback = Box<dyn FnMut(&Session, &Event) + Send>;

/// Outcome of one [`Session::handle_control_event`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    /// An event was handed to the callback
    Delivered(Event),
    /// Work was done without an application-visible event (SETUP, NOP)
    Handled,
    /// The notification was dropped (undecodable, or the endpoint could not be opened)
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Enable(u8),
    Disable(u8),
}

#[derive(Debug, Default)]
struct DispatchState {
    pending: VecDeque<Transition>,
    speed: Speed,
    configuration: u8,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An open gadget device
pub struct Session {
    backend: Arc<dyn Backend>,
    image: DescriptorImage,
    control: Mutex<Option<Box<dyn ControlEndpoint>>>,
    /// Endpoint 0 as an I/O handle
    control_handle: Endpoint,
    /// Readable while the control channel or the transition queue has work
    readiness: Epoll,
    /// Counts queued transitions
    queued: EventFd,
    dispatch: Mutex<DispatchState>,
    endpoints: Mutex<HashMap<u8, Endpoint>>,
    callback: Mutex<Option<EventCallback>>,
    /// Thread currently inside the callback
    dispatching: Mutex<Option<ThreadId>>,
    debug_level: AtomicU32,
    open: AtomicBool,
}

impl Session {
    /// Register `device` with gadgetfs at its default mount point
    pub fn open(device: &Device) -> Result<Self> {
        Self::open_with(device, GadgetFs::default())
    }

    /// Register `device` through `backend`
    ///
    /// Descriptors are validated before the backend is touched, so a
    /// validation failure leaves nothing registered.
    pub fn open_with(device: &Device, backend: impl Backend + 'static) -> Result<Self> {
        let image = device.marshal()?;
        let backend: Arc<dyn Backend> = Arc::new(backend);

        let control = backend
            .open_control(&image)
            .map_err(|e| GadgetError::open("descriptor registration rejected", e))?;

        let control_fd = control
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| GadgetError::open("cannot duplicate control channel", e))?;
        let control_handle = Endpoint::new(
            0,
            Direction::Control,
            control.name().to_string(),
            File::from(control_fd),
            IoMode::Poll,
        )
        .map_err(|e| GadgetError::open("cannot create control handle", into_io(e)))?;

        let queued = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE,
        )
        .map_err(|e| GadgetError::open("cannot create event queue", e.into()))?;
        let readiness = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| GadgetError::open("cannot create readiness handle", e.into()))?;
        readiness
            .add(control.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 0))
            .and_then(|()| readiness.add(&queued, EpollEvent::new(EpollFlags::EPOLLIN, 1)))
            .map_err(|e| GadgetError::open("cannot watch control channel", e.into()))?;

        info!(
            "Gadget {:04x}:{:04x} registered on {}",
            device.device.vendor_id,
            device.device.product_id,
            control.name()
        );

        Ok(Self {
            backend,
            image,
            control: Mutex::new(Some(control)),
            control_handle,
            readiness,
            queued,
            dispatch: Mutex::new(DispatchState::default()),
            endpoints: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            dispatching: Mutex::new(None),
            debug_level: AtomicU32::new(0),
            open: AtomicBool::new(true),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Tear down every enabled endpoint, then release the control channel
    ///
    /// Idempotent and infallible: endpoint close failures are logged. Calling
    /// it from inside the event callback is ignored.
    pub fn close(&self) {
        if *lock(&self.dispatching) == Some(thread::current().id()) {
            warn!("Session close requested from the event callback; ignoring");
            return;
        }
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut endpoints: Vec<(u8, Endpoint)> = lock(&self.endpoints).drain().collect();
        endpoints.sort_by_key(|(n, _)| *n);
        let mut failures = Vec::new();
        for (n, endpoint) in endpoints {
            if let Err(e) = endpoint.close() {
                failures.push((n, e));
            }
        }
        if let Err(e) = self.control_handle.close() {
            failures.push((0, e));
        }
        for (n, e) in &failures {
            warn!("Failed to close endpoint {}: {}", n, e);
        }

        // dropping the control channel unregisters the device
        let control = lock(&self.control).take();
        drop(control);
        let callback = lock(&self.callback).take();
        drop(callback);
        lock(&self.dispatch).pending.clear();

        info!("Session closed");
    }

    /// Handle for endpoint `number`; 0 is the control endpoint
    pub fn endpoint(&self, number: u8) -> Result<Endpoint> {
        if !self.is_open() {
            return Err(GadgetError::SessionClosed);
        }
        if number == 0 {
            return Ok(self.control_handle.clone());
        }
        // a handle closed through a clone stays mapped until its disable
        lock(&self.endpoints)
            .get(&number)
            .filter(|endpoint| !endpoint.is_closed())
            .cloned()
            .ok_or(GadgetError::EndpointNotEnabled(number))
    }

    /// Read from endpoint `number`; see [`Endpoint::read`]
    pub fn read(&self, number: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.endpoint(number)?.read(buf, timeout)
    }

    /// Write to endpoint `number`; see [`Endpoint::write`]
    pub fn write(&self, number: u8, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.endpoint(number)?.write(buf, timeout)
    }

    /// Install the event callback, replacing any previous one
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: FnMut(&Session, &Event) + Send + 'static,
    {
        *lock(&self.callback) = Some(Box::new(callback));
    }

    pub fn set_debug_level(&self, level: u32) {
        self.debug_level.store(level, Ordering::Relaxed);
    }

    pub fn debug_level(&self) -> u32 {
        self.debug_level.load(Ordering::Relaxed)
    }

    /// Readiness handle for the caller's poll loop
    pub fn control_fd(&self) -> BorrowedFd<'_> {
        self.readiness.0.as_fd()
    }

    /// Speed reported by the last CONNECT
    pub fn speed(&self) -> Speed {
        lock(&self.dispatch).speed
    }

    /// Active configuration value, 0 while unconfigured
    pub fn configuration(&self) -> u8 {
        lock(&self.dispatch).configuration
    }

    /// Numbers of the currently enabled endpoints, sorted
    ///
    /// A handle closed through [`Endpoint::close`] no longer counts.
    pub fn enabled_endpoints(&self) -> Vec<u8> {
        let mut numbers: Vec<u8> = lock(&self.endpoints)
            .iter()
            .filter(|(_, endpoint)| !endpoint.is_closed())
            .map(|(n, _)| *n)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn descriptors(&self) -> &DescriptorImage {
        &self.image
    }

    /// Process one unit of pending control work
    ///
    /// Call only when [`control_fd`](Self::control_fd) is readable. Queued
    /// endpoint transitions are delivered first, one per call; otherwise
    /// exactly one kernel notification is read. Undecodable notifications are
    /// logged and reported as [`ControlStatus::Ignored`]; an `Err` means the
    /// control channel itself failed.
    pub fn handle_control_event(&self) -> Result<ControlStatus> {
        if !self.is_open() {
            return Err(GadgetError::SessionClosed);
        }

        let next = lock(&self.dispatch).pending.pop_front();
        if let Some(transition) = next {
            // semaphore read takes exactly one token
            if let Err(e) = self.queued.read() {
                debug!("Event queue counter out of step: {}", e);
            }
            return self.apply(transition);
        }

        let mut record = [0u8; Notification::SIZE];
        let n = {
            let mut control = lock(&self.control);
            let channel = control.as_mut().ok_or(GadgetError::SessionClosed)?;
            match channel.read_event(&mut record) {
                Ok(0) => {
                    return Err(GadgetError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "control channel closed",
                    )));
                }
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    return Ok(ControlStatus::Ignored);
                }
                Err(e) => return Err(e.into()),
            }
        };
        if self.debug_level() >= 2 {
            trace!("Control record: {:02x?}", &record[..n]);
        }

        let notification = match Notification::decode(&record[..n]) {
            Ok(notification) => notification,
            Err(e) => {
                warn!("Dropping control notification: {}", e);
                return Ok(ControlStatus::Ignored);
            }
        };

        match notification {
            Notification::Nop => Ok(ControlStatus::Handled),
            Notification::Connect(speed) => {
                lock(&self.dispatch).speed = speed;
                info!("Host connected at {:?} speed", speed);
                Ok(self.deliver(Event::Connect))
            }
            Notification::Disconnect => {
                self.disable_all();
                lock(&self.dispatch).configuration = 0;
                info!("Host disconnected");
                Ok(self.deliver(Event::Disconnect))
            }
            Notification::Suspend => Ok(self.deliver(Event::Suspend)),
            Notification::Setup(setup) => {
                self.respond(&setup);
                Ok(ControlStatus::Handled)
            }
        }
    }

    fn apply(&self, transition: Transition) -> Result<ControlStatus> {
        match transition {
            Transition::Enable(n) => {
                let Some(config) = self.image.endpoint(n) else {
                    warn!("No descriptor for endpoint {}", n);
                    return Ok(ControlStatus::Ignored);
                };
                let (file, name) = match self.backend.open_endpoint(&config) {
                    Ok(opened) => opened,
                    Err(e) => {
                        error!("Failed to enable endpoint {}: {}", n, e);
                        return Ok(ControlStatus::Ignored);
                    }
                };
                let direction = if config.is_in() {
                    Direction::In
                } else {
                    Direction::Out
                };
                let mode = if self.backend.endpoints_pollable() {
                    IoMode::Poll
                } else {
                    IoMode::Blocking
                };
                let endpoint = match Endpoint::new(n, direction, name, file, mode) {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        error!("Failed to enable endpoint {}: {}", n, e);
                        return Ok(ControlStatus::Ignored);
                    }
                };
                debug!(
                    "Endpoint {} enabled as {} ({} byte packets)",
                    n,
                    endpoint.name(),
                    config.for_speed(self.speed()).max_packet_size
                );
                let stale = lock(&self.endpoints).insert(n, endpoint);
                if let Some(stale) = stale {
                    let _ = stale.close();
                }
                Ok(self.deliver(Event::EndpointEnable(n)))
            }
            Transition::Disable(n) => {
                let removed = lock(&self.endpoints).remove(&n);
                if let Some(endpoint) = removed
                    && let Err(e) = endpoint.close()
                {
                    warn!("Failed to close endpoint {}: {}", n, e);
                }
                debug!("Endpoint {} disabled", n);
                Ok(self.deliver(Event::EndpointDisable(n)))
            }
        }
    }

    /// Close every enabled endpoint without per-endpoint events
    fn disable_all(&self) {
        let endpoints: Vec<(u8, Endpoint)> = lock(&self.endpoints).drain().collect();
        for (n, endpoint) in endpoints {
            if let Err(e) = endpoint.close() {
                warn!("Failed to close endpoint {}: {}", n, e);
            }
        }
    }

    fn deliver(&self, event: Event) -> ControlStatus {
        if self.debug_level() >= 1 {
            debug!("Dispatching {:?}", event);
        }
        let taken = lock(&self.callback).take();
        if let Some(mut callback) = taken {
            *lock(&self.dispatching) = Some(thread::current().id());
            callback(self, &event);
            *lock(&self.dispatching) = None;

            let mut slot = lock(&self.callback);
            // a callback installed from inside the callback wins
            if slot.is_none() && self.is_open() {
                *slot = Some(callback);
            }
        }
        ControlStatus::Delivered(event)
    }

    fn queue(&self, transitions: impl IntoIterator<Item = Transition>) {
        let mut state = lock(&self.dispatch);
        let before = state.pending.len();
        state.pending.extend(transitions);
        let added = state.pending.len() - before;
        if added > 0
            && let Err(e) = self.queued.write(added as u64)
        {
            warn!("Failed to signal queued endpoint events: {}", e);
        }
    }

    fn respond(&self, setup: &SetupPacket) {
        if self.debug_level() >= 1 {
            debug!(
                "SETUP type {:#04x} request {:#04x} value {:#06x} index {:#06x} length {}",
                setup.request_type, setup.request, setup.value, setup.index, setup.length
            );
        }

        let reply = if setup.is_standard() {
            self.standard_reply(setup)
        } else {
            Reply::Stall
        };

        let mut control = lock(&self.control);
        let Some(channel) = control.as_mut() else {
            return;
        };
        let result = match &reply {
            Reply::Data(data) => {
                let len = data.len().min(usize::from(setup.length));
                if self.debug_level() >= 2 {
                    trace!("Control reply: {:02x?}", &data[..len]);
                }
                channel.reply(&data[..len])
            }
            Reply::Ack => channel.ack(),
            Reply::Stall => {
                debug!("Stalling request {:#04x}", setup.request);
                channel.stall(setup)
            }
        };
        if let Err(e) = result {
            warn!("Failed to answer request {:#04x}: {}", setup.request, e);
        }
    }

    fn standard_reply(&self, setup: &SetupPacket) -> Reply {
        match (setup.request, setup.is_in()) {
            (request::GET_DESCRIPTOR, true) if (setup.value >> 8) as u8 == DT_STRING => {
                match self.image.strings.lookup(setup.value as u8, setup.index) {
                    Some(descriptor) => Reply::Data(descriptor),
                    None => Reply::Stall,
                }
            }
            (request::SET_CONFIGURATION, false) => self.set_configuration(setup.value),
            (request::GET_CONFIGURATION, true) => Reply::Data(vec![self.configuration()]),
            (request::SET_INTERFACE, false) => {
                let interfaces = u16::from(self.image.full_speed.config.num_interfaces);
                if self.configuration() != 0 && setup.value == 0 && setup.index < interfaces {
                    Reply::Ack
                } else {
                    Reply::Stall
                }
            }
            (request::GET_INTERFACE, true) => Reply::Data(vec![0]),
            (request::GET_STATUS, true) => Reply::Data(vec![0, 0]),
            _ => Reply::Stall,
        }
    }

    fn set_configuration(&self, value: u16) -> Reply {
        let target = self.image.configuration_value();
        if value != 0 && value != u16::from(target) {
            debug!("Host selected unknown configuration {}", value);
            return Reply::Stall;
        }
        let value = value as u8;

        // every mapped endpoint, closed or not, gets its disable
        let mut mapped: Vec<u8> = lock(&self.endpoints).keys().copied().collect();
        mapped.sort_unstable();
        let mut transitions: Vec<Transition> = mapped.into_iter().map(Transition::Disable).collect();
        if value != 0 {
            transitions.extend(
                self.image
                    .endpoint_numbers()
                    .into_iter()
                    .map(Transition::Enable),
            );
        }
        lock(&self.dispatch).configuration = value;
        info!("Configuration {} selected", value);
        self.queue(transitions);
        Reply::Ack
    }
}

enum Reply {
    Data(Vec<u8>),
    Ack,
    Stall,
}

fn into_io(err: GadgetError) -> io::Error {
    match err {
        GadgetError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

impl AsFd for Session {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.control_fd()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("open", &self.is_open())
            .field("configuration", &self.configuration())
            .field("endpoints", &self.enabled_endpoints())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{
        ConfigDescriptor, DescriptorBlock, DeviceDescriptor, EndpointDescriptor,
        InterfaceDescriptor, LANG_EN_US, Strings,
    };
    use crate::mock::{self, ControlReply, MockHost};

    fn device() -> Device {
        Device {
            device: DeviceDescriptor {
                vendor_id: 0x1d6b,
                product_id: 0x0104,
                ..Default::default()
            },
            full_speed: vec![
                DescriptorBlock::Config(ConfigDescriptor {
                    num_interfaces: 1,
                    configuration_value: 2,
                    configuration: 0,
                    attributes: 0xc0,
                    max_power: 1,
                }),
                DescriptorBlock::Interface(InterfaceDescriptor {
                    interface_number: 0,
                    alternate_setting: 0,
                    num_endpoints: 2,
                    interface_class: 0xff,
                    interface_subclass: 0,
                    interface_protocol: 0,
                    interface: 0,
                }),
                DescriptorBlock::Endpoint(EndpointDescriptor::bulk_in(7, 64)),
                DescriptorBlock::Endpoint(EndpointDescriptor::bulk_out(3, 64)),
                DescriptorBlock::End,
            ],
            high_speed: None,
            strings: Strings::new(LANG_EN_US).with(1, "Maker"),
        }
    }

    fn open() -> (Session, MockHost) {
        let (backend, host) = mock::pair();
        (Session::open_with(&device(), backend).unwrap(), host)
    }

    #[test]
    fn test_set_configuration_queues_enables() {
        let (session, host) = open();
        host.set_configuration(2).unwrap();

        assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Handled);
        assert_eq!(host.take_replies(), vec![ControlReply::Ack]);
        assert_eq!(session.configuration(), 2);
        assert!(session.enabled_endpoints().is_empty());

        assert_eq!(
            session.handle_control_event().unwrap(),
            ControlStatus::Delivered(Event::EndpointEnable(7))
        );
        assert_eq!(
            session.handle_control_event().unwrap(),
            ControlStatus::Delivered(Event::EndpointEnable(3))
        );
        assert_eq!(session.enabled_endpoints(), vec![3, 7]);
        assert_eq!(host.endpoint_opens(), vec![7, 3]);
    }

    #[test]
    fn test_unconfigure_disables() {
        let (session, host) = open();
        host.set_configuration(2).unwrap();
        for _ in 0..3 {
            session.handle_control_event().unwrap();
        }

        host.set_configuration(0).unwrap();
        assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Handled);
        assert_eq!(
            session.handle_control_event().unwrap(),
            ControlStatus::Delivered(Event::EndpointDisable(3))
        );
        assert_eq!(
            session.handle_control_event().unwrap(),
            ControlStatus::Delivered(Event::EndpointDisable(7))
        );
        assert_eq!(session.configuration(), 0);
        assert!(session.enabled_endpoints().is_empty());
    }

    #[test]
    fn test_unknown_configuration_stalls() {
        let (session, host) = open();
        host.set_configuration(9).unwrap();
        assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Handled);
        assert!(matches!(
            host.take_replies().as_slice(),
            [ControlReply::Stall(_)]
        ));
        assert_eq!(session.configuration(), 0);
    }

    #[test]
    fn test_get_configuration_and_status() {
        let (session, host) = open();
        host.setup(SetupPacket {
            request_type: 0x80,
            request: request::GET_CONFIGURATION,
            value: 0,
            index: 0,
            length: 1,
        })
        .unwrap();
        host.setup(SetupPacket {
            request_type: 0x80,
            request: request::GET_STATUS,
            value: 0,
            index: 0,
            length: 2,
        })
        .unwrap();
        session.handle_control_event().unwrap();
        session.handle_control_event().unwrap();
        assert_eq!(
            host.take_replies(),
            vec![ControlReply::Data(vec![0]), ControlReply::Data(vec![0, 0])]
        );
    }

    #[test]
    fn test_vendor_request_stalls() {
        let (session, host) = open();
        host.setup(SetupPacket {
            request_type: 0xc0,
            request: 0x01,
            value: 0,
            index: 0,
            length: 4,
        })
        .unwrap();
        session.handle_control_event().unwrap();
        assert!(matches!(
            host.take_replies().as_slice(),
            [ControlReply::Stall(_)]
        ));
    }

    #[test]
    fn test_connect_records_speed() {
        let (session, host) = open();
        host.connect(Speed::High).unwrap();
        assert_eq!(
            session.handle_control_event().unwrap(),
            ControlStatus::Delivered(Event::Connect)
        );
        assert_eq!(session.speed(), Speed::High);
    }

    #[test]
    fn test_callback_replaced_from_inside_callback() {
        let (session, host) = open();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        session.set_event_callback(move |session, event| {
            log.lock().unwrap().push(("first", *event));
            let log = log.clone();
            session.set_event_callback(move |_, event| {
                log.lock().unwrap().push(("second", *event));
            });
        });

        host.connect(Speed::Full).unwrap();
        host.suspend().unwrap();
        session.handle_control_event().unwrap();
        session.handle_control_event().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", Event::Connect), ("second", Event::Suspend)]
        );
    }

    #[test]
    fn test_close_from_callback_is_ignored() {
        let (session, host) = open();
        session.set_event_callback(|session, _| session.close());
        host.suspend().unwrap();
        session.handle_control_event().unwrap();
        assert!(session.is_open());
        session.close();
        assert!(!session.is_open());
    }

    #[test]
    fn test_closed_handle_is_not_enabled() {
        let (session, host) = open();
        host.set_configuration(2).unwrap();
        for _ in 0..3 {
            session.handle_control_event().unwrap();
        }

        session.endpoint(3).unwrap().close().unwrap();
        assert_eq!(session.enabled_endpoints(), vec![7]);
        assert!(matches!(
            session.endpoint(3),
            Err(GadgetError::EndpointNotEnabled(3))
        ));
        let mut buf = [0u8; 8];
        assert!(matches!(
            session.read(3, &mut buf, Duration::from_millis(10)),
            Err(GadgetError::EndpointNotEnabled(3))
        ));
        assert!(session.endpoint(7).is_ok());
    }

    #[test]
    fn test_closed_handle_still_disabled_on_unconfigure() {
        let (session, host) = open();
        host.set_configuration(2).unwrap();
        for _ in 0..3 {
            session.handle_control_event().unwrap();
        }
        session.endpoint(7).unwrap().close().unwrap();

        host.set_configuration(0).unwrap();
        session.handle_control_event().unwrap();
        assert_eq!(
            session.handle_control_event().unwrap(),
            ControlStatus::Delivered(Event::EndpointDisable(3))
        );
        assert_eq!(
            session.handle_control_event().unwrap(),
            ControlStatus::Delivered(Event::EndpointDisable(7))
        );
        assert!(session.enabled_endpoints().is_empty());
    }

    #[test]
    fn test_closed_session_rejects_work() {
        let (session, _host) = open();
        session.close();
        assert!(matches!(
            session.handle_control_event(),
            Err(GadgetError::SessionClosed)
        ));
        assert!(matches!(
            session.endpoint(0),
            Err(GadgetError::SessionClosed)
        ));
    }
}
