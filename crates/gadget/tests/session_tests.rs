//! Session Integration Tests
//!
//! Drives a `Session` through the mock backend the way a kernel and a USB
//! host would.
//!
//! # Test Scenarios
//! - Descriptor validation at open
//! - Endpoint state machine (enable, disable, disconnect)
//! - Event ordering and readiness of the control handle
//! - Control request replies (strings, configuration)
//! - Malformed notifications
//! - Session teardown
//! - Loopback echo through enabled endpoints
//!
//! Run with: `cargo test -p gadget --test session_tests`

use gadget::descriptor::{CLASS_VENDOR_SPEC, LANG_EN_US};
use gadget::event::{Notification, SetupPacket, raw_record};
use gadget::mock::{self, ControlReply, MockHost};
use gadget::{
    ConfigDescriptor, ControlStatus, DescriptorBlock, Device, DeviceDescriptor,
    EndpointDescriptor, Event, GadgetError, InterfaceDescriptor, Session, Speed, Strings,
};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_millis(500);

fn config_set(packet_size: u16) -> Vec<DescriptorBlock> {
    vec![
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
            interface_class: CLASS_VENDOR_SPEC,
            interface_subclass: 0,
            interface_protocol: 0,
            interface: 250,
        }),
        DescriptorBlock::Endpoint(EndpointDescriptor::bulk_in(7, packet_size)),
        DescriptorBlock::Endpoint(EndpointDescriptor::bulk_out(3, packet_size)),
        DescriptorBlock::End,
    ]
}

fn loopback_device() -> Device {
    Device {
        device: DeviceDescriptor {
            device_class: CLASS_VENDOR_SPEC,
            vendor_id: 0x0525,
            product_id: 0xa4a0,
            manufacturer: 25,
            product: 45,
            serial_number: 101,
            ..Default::default()
        },
        full_speed: config_set(64),
        high_speed: Some(config_set(512)),
        strings: Strings::new(LANG_EN_US)
            .with(25, "Manufacturer")
            .with(45, "Product")
            .with(101, "Serial")
            .with(250, "Loopback"),
    }
}

fn open_session() -> (Session, MockHost) {
    let (backend, host) = mock::pair();
    let session = Session::open_with(&loopback_device(), backend).expect("open failed");
    (session, host)
}

fn record_events(session: &Session) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.set_event_callback(move |_, event| sink.lock().unwrap().push(*event));
    events
}

fn is_readable(session: &Session) -> bool {
    let mut fds = [PollFd::new(session.control_fd(), PollFlags::POLLIN)];
    poll(&mut fds, PollTimeout::ZERO).unwrap() > 0
}

/// Connect at high speed and select configuration 2, draining the queue
fn configure(session: &Session, host: &MockHost) {
    host.connect(Speed::High).unwrap();
    host.set_configuration(2).unwrap();
    while is_readable(session) {
        session.handle_control_event().unwrap();
    }
}

// ============================================================================
// Open / Validation Tests
// ============================================================================

#[test]
fn test_open_registers_descriptors() {
    let (session, host) = open_session();
    let registration = host.registration().expect("not registered");

    assert_eq!(&registration[..4], &0u32.to_ne_bytes());
    // fs config (9 + 9 + 7 + 7), hs config (same), device descriptor
    assert_eq!(registration.len(), 4 + 32 + 32 + 18);
    assert_eq!(registration[registration.len() - 18], 18);
    assert!(session.is_open());
}

#[test]
fn test_missing_terminator_leaves_nothing_registered() {
    let mut device = loopback_device();
    device.full_speed.pop();

    let (backend, host) = mock::pair();
    let result = Session::open_with(&device, backend);
    assert!(matches!(result, Err(GadgetError::Validation(_))));
    assert!(!host.is_registered());
}

#[test]
fn test_endpoint_count_mismatch_rejected() {
    let mut device = loopback_device();
    device.full_speed.remove(3);

    let (backend, host) = mock::pair();
    let result = Session::open_with(&device, backend);
    assert!(matches!(result, Err(GadgetError::Validation(_))));
    assert!(!host.is_registered());
}

#[test]
fn test_shared_endpoint_number_rejected() {
    let mut device = loopback_device();
    device.full_speed[2] = DescriptorBlock::Endpoint(EndpointDescriptor::bulk_in(1, 64));
    device.full_speed[3] = DescriptorBlock::Endpoint(EndpointDescriptor::bulk_out(1, 64));
    device.high_speed = None;

    let (backend, host) = mock::pair();
    let result = Session::open_with(&device, backend);
    assert!(matches!(result, Err(GadgetError::Validation(_))));
    assert!(!host.is_registered());
    assert!(host.endpoint_opens().is_empty());
}

#[test]
fn test_busy_device_is_open_error() {
    let (backend, host) = mock::pair();
    host.refuse_control(true);
    let err = Session::open_with(&loopback_device(), backend).unwrap_err();
    assert!(matches!(err, GadgetError::Open { .. }));
    assert!(std::error::Error::source(&err).is_some());
}

// ============================================================================
// Endpoint State Machine Tests
// ============================================================================

#[test]
fn test_endpoints_disabled_before_enable() {
    let (session, _host) = open_session();
    let mut buf = [0u8; 16];

    for n in 1..=15 {
        assert!(matches!(
            session.endpoint(n),
            Err(GadgetError::EndpointNotEnabled(m)) if m == n
        ));
    }
    assert!(matches!(
        session.read(3, &mut buf, TIMEOUT),
        Err(GadgetError::EndpointNotEnabled(3))
    ));
    assert!(matches!(
        session.write(7, b"x", TIMEOUT),
        Err(GadgetError::EndpointNotEnabled(7))
    ));
}

#[test]
fn test_control_endpoint_always_available() {
    let (session, _host) = open_session();
    let ep0 = session.endpoint(0).unwrap();
    assert!(ep0.is_control());
    assert_eq!(ep0.number(), 0);
    assert_eq!(ep0.name(), "mock-udc");
}

#[test]
fn test_enable_then_disconnect() {
    let (session, host) = open_session();
    configure(&session, &host);

    assert_eq!(session.enabled_endpoints(), vec![3, 7]);
    let ep7 = session.endpoint(7).unwrap();
    assert_eq!(ep7.address(), 0x87);
    assert_eq!(ep7.name(), "ep7in");
    assert_eq!(session.write(7, b"ping", TIMEOUT).unwrap(), 4);

    host.disconnect().unwrap();
    assert_eq!(
        session.handle_control_event().unwrap(),
        ControlStatus::Delivered(Event::Disconnect)
    );
    assert!(session.enabled_endpoints().is_empty());
    assert_eq!(session.configuration(), 0);
    assert!(ep7.is_closed());
    assert!(matches!(
        session.write(7, b"ping", TIMEOUT),
        Err(GadgetError::EndpointNotEnabled(7))
    ));
    assert!(matches!(
        ep7.write(b"ping", TIMEOUT),
        Err(GadgetError::EndpointNotEnabled(7))
    ));
}

#[test]
fn test_closed_handle_leaves_enabled_set() {
    let (session, host) = open_session();
    configure(&session, &host);

    session.endpoint(3).unwrap().close().unwrap();
    assert_eq!(session.enabled_endpoints(), vec![7]);
    assert!(matches!(
        session.endpoint(3),
        Err(GadgetError::EndpointNotEnabled(3))
    ));
    let mut buf = [0u8; 16];
    assert!(matches!(
        session.read(3, &mut buf, TIMEOUT),
        Err(GadgetError::EndpointNotEnabled(3))
    ));

    // a fresh configuration opens it again
    host.set_configuration(2).unwrap();
    while is_readable(&session) {
        session.handle_control_event().unwrap();
    }
    assert_eq!(session.enabled_endpoints(), vec![3, 7]);
    host.endpoint(3).unwrap().send(b"back").unwrap();
    let n = session.read(3, &mut buf, TIMEOUT).unwrap();
    assert_eq!(&buf[..n], b"back");
}

#[test]
fn test_failed_endpoint_open_is_ignored() {
    let (session, host) = open_session();
    let events = record_events(&session);
    host.refuse_endpoint(7);
    host.set_configuration(2).unwrap();

    assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Handled);
    assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Ignored);
    assert_eq!(
        session.handle_control_event().unwrap(),
        ControlStatus::Delivered(Event::EndpointEnable(3))
    );
    assert_eq!(*events.lock().unwrap(), vec![Event::EndpointEnable(3)]);
    assert_eq!(session.enabled_endpoints(), vec![3]);
}

// ============================================================================
// Event Ordering Tests
// ============================================================================

#[test]
fn test_enable_enable_disconnect_order() {
    let (session, host) = open_session();
    let events = record_events(&session);

    host.set_configuration(2).unwrap();
    assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Handled);

    assert!(session.handle_control_event().is_ok());
    assert_eq!(session.enabled_endpoints(), vec![7]);
    assert!(session.handle_control_event().is_ok());
    assert_eq!(session.enabled_endpoints(), vec![3, 7]);

    host.disconnect().unwrap();
    session.handle_control_event().unwrap();
    assert!(session.enabled_endpoints().is_empty());

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            Event::EndpointEnable(7),
            Event::EndpointEnable(3),
            Event::Disconnect
        ]
    );
}

#[test]
fn test_readiness_tracks_queued_transitions() {
    let (session, host) = open_session();
    assert!(!is_readable(&session));

    host.set_configuration(2).unwrap();
    assert!(is_readable(&session));
    session.handle_control_event().unwrap();

    // two enables queued
    assert!(is_readable(&session));
    session.handle_control_event().unwrap();
    assert!(is_readable(&session));
    session.handle_control_event().unwrap();
    assert!(!is_readable(&session));
}

#[test]
fn test_kernel_records_wait_behind_queue() {
    let (session, host) = open_session();
    let events = record_events(&session);

    host.set_configuration(2).unwrap();
    host.suspend().unwrap();
    while is_readable(&session) {
        session.handle_control_event().unwrap();
    }

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            Event::EndpointEnable(7),
            Event::EndpointEnable(3),
            Event::Suspend
        ]
    );
}

#[test]
fn test_reconfigure_disables_before_enabling() {
    let (session, host) = open_session();
    configure(&session, &host);
    let events = record_events(&session);

    host.set_configuration(2).unwrap();
    while is_readable(&session) {
        session.handle_control_event().unwrap();
    }
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            Event::EndpointDisable(3),
            Event::EndpointDisable(7),
            Event::EndpointEnable(7),
            Event::EndpointEnable(3)
        ]
    );
    assert_eq!(session.enabled_endpoints(), vec![3, 7]);
}

// ============================================================================
// Control Request Tests
// ============================================================================

#[test]
fn test_string_descriptor_reply() {
    let (session, host) = open_session();
    host.setup(SetupPacket::get_string(250, LANG_EN_US, 255)).unwrap();
    session.handle_control_event().unwrap();

    let mut expected = vec![18, 3];
    for unit in "Loopback".encode_utf16() {
        expected.extend_from_slice(&unit.to_le_bytes());
    }
    assert_eq!(host.take_replies(), vec![ControlReply::Data(expected)]);
}

#[test]
fn test_string_reply_truncated_to_length() {
    let (session, host) = open_session();
    host.setup(SetupPacket::get_string(45, LANG_EN_US, 2)).unwrap();
    session.handle_control_event().unwrap();
    assert_eq!(host.take_replies(), vec![ControlReply::Data(vec![16, 3])]);
}

#[test]
fn test_language_table_reply() {
    let (session, host) = open_session();
    host.setup(SetupPacket::get_string(0, 0, 255)).unwrap();
    session.handle_control_event().unwrap();
    assert_eq!(
        host.take_replies(),
        vec![ControlReply::Data(vec![4, 3, 0x09, 0x04])]
    );
}

#[test]
fn test_unknown_string_stalls() {
    let (session, host) = open_session();
    host.setup(SetupPacket::get_string(99, LANG_EN_US, 255)).unwrap();
    host.setup(SetupPacket::get_string(25, 0x0407, 255)).unwrap();
    session.handle_control_event().unwrap();
    session.handle_control_event().unwrap();

    let replies = host.take_replies();
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| matches!(r, ControlReply::Stall(_))));
}

// ============================================================================
// Malformed Notification Tests
// ============================================================================

#[test]
fn test_decode_error_keeps_session_alive() {
    let (session, host) = open_session();
    let events = record_events(&session);

    host.send_raw(&raw_record(42, [0; 8])).unwrap();
    host.send_raw(&[1, 2, 3, 4, 5]).unwrap();
    host.send(Notification::Nop).unwrap();
    host.suspend().unwrap();

    assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Ignored);
    assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Ignored);
    assert_eq!(session.handle_control_event().unwrap(), ControlStatus::Handled);
    assert_eq!(
        session.handle_control_event().unwrap(),
        ControlStatus::Delivered(Event::Suspend)
    );
    assert!(session.is_open());
    assert_eq!(*events.lock().unwrap(), vec![Event::Suspend]);
}

// ============================================================================
// Teardown Tests
// ============================================================================

#[test]
fn test_close_tears_down_endpoints_and_control() {
    let (session, host) = open_session();
    configure(&session, &host);
    let ep3 = session.endpoint(3).unwrap();
    let ep0 = session.endpoint(0).unwrap();

    session.close();
    assert!(!session.is_open());
    assert!(ep3.is_closed());
    assert!(ep0.is_closed());
    assert!(!host.is_registered());

    // repeated close and handle close are harmless
    session.close();
    ep3.close().unwrap();
    assert!(matches!(
        session.endpoint(3),
        Err(GadgetError::SessionClosed)
    ));
}

#[test]
fn test_drop_unregisters() {
    let (session, host) = open_session();
    drop(session);
    assert!(!host.is_registered());
}

#[test]
fn test_sessions_are_independent() {
    let (first, first_host) = open_session();
    let (second, second_host) = open_session();
    configure(&first, &first_host);

    assert_eq!(first.enabled_endpoints(), vec![3, 7]);
    assert!(second.enabled_endpoints().is_empty());
    first.close();
    assert!(second_host.is_registered());
    second.close();
}

#[test]
fn test_debug_level_accepted() {
    let (session, host) = open_session();
    for level in [0, 1, 2, 7] {
        session.set_debug_level(level);
        assert_eq!(session.debug_level(), level);
    }
    host.setup(SetupPacket::get_string(25, LANG_EN_US, 255)).unwrap();
    session.handle_control_event().unwrap();
    assert_eq!(host.take_replies().len(), 1);
}

// ============================================================================
// Loopback Tests
// ============================================================================

#[test]
fn test_loopback_echo_reversed() {
    let (session, host) = open_session();
    configure(&session, &host);
    let session = Arc::new(session);

    let worker_session = session.clone();
    let worker = thread::spawn(move || {
        let mut buf = [0u8; 512];
        let n = worker_session.read(3, &mut buf, TIMEOUT)?;
        buf[..n].reverse();
        worker_session.write(7, &buf[..n], TIMEOUT)
    });

    host.endpoint(3).unwrap().send(b"HELLO").unwrap();
    let echoed = host.endpoint(7).unwrap().recv(TIMEOUT).unwrap();
    assert_eq!(echoed, b"OLLEH");
    assert_eq!(worker.join().unwrap().unwrap(), 5);
}

#[test]
fn test_disconnect_cancels_blocked_worker() {
    let (session, host) = open_session();
    configure(&session, &host);
    let ep3 = session.endpoint(3).unwrap();

    let worker = thread::spawn(move || {
        let mut buf = [0u8; 64];
        ep3.read(&mut buf, Duration::from_secs(10))
    });
    thread::sleep(Duration::from_millis(50));

    host.disconnect().unwrap();
    session.handle_control_event().unwrap();
    assert!(matches!(
        worker.join().unwrap(),
        Err(GadgetError::Cancelled)
    ));
}

#[test]
fn test_close_releases_worker_blocked_in_kernel() {
    let (session, host) = open_session();
    host.unpollable_endpoints(true);
    configure(&session, &host);
    let ep3 = session.endpoint(3).unwrap();

    let worker = thread::spawn(move || {
        let mut buf = [0u8; 64];
        ep3.read(&mut buf, Duration::from_secs(30))
    });
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    session.close();
    assert!(start.elapsed() < Duration::from_secs(2), "close took {:?}", start.elapsed());
    assert!(matches!(
        worker.join().unwrap(),
        Err(GadgetError::Cancelled)
    ));
    assert!(!host.is_registered());
}

#[test]
fn test_echo_through_unpollable_endpoints() {
    let (session, host) = open_session();
    host.unpollable_endpoints(true);
    configure(&session, &host);
    let session = Arc::new(session);

    let worker_session = session.clone();
    let worker = thread::spawn(move || {
        let mut buf = [0u8; 512];
        let n = worker_session.read(3, &mut buf, Duration::from_secs(5))?;
        buf[..n].reverse();
        worker_session.write(7, &buf[..n], TIMEOUT)
    });

    thread::sleep(Duration::from_millis(60));
    host.endpoint(3).unwrap().send(b"HELLO").unwrap();
    assert_eq!(host.endpoint(7).unwrap().recv(TIMEOUT).unwrap(), b"OLLEH");
    assert_eq!(worker.join().unwrap().unwrap(), 5);
}
