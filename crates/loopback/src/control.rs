//! Control loop thread
//!
//! Waits on the session's readiness handle and dispatches one control event
//! per wake-up. The poll timeout bounds how long a shutdown request can go
//! unnoticed.

use async_channel::Sender;
use gadget::{ControlStatus, Session};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{error, info, trace};

const POLL_INTERVAL_MS: u16 = 100;

/// Spawn the control loop; a failure message is sent on `exit` if it dies
pub fn spawn_control_loop(
    session: Arc<Session>,
    shutdown: Arc<AtomicBool>,
    exit: Sender<String>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("usg-control".to_string())
        .spawn(move || {
            info!("Control loop started");
            match run(&session, &shutdown) {
                Ok(()) => info!("Control loop stopped"),
                Err(e) => {
                    error!("Control loop failed: {}", e);
                    let _ = exit.try_send(e.to_string());
                }
            }
        })
}

fn run(session: &Session, shutdown: &AtomicBool) -> gadget::Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        if !session.is_open() {
            return Err(gadget::GadgetError::SessionClosed);
        }
        let mut fds = [PollFd::new(session.control_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        let readable = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        if !readable {
            continue;
        }
        match session.handle_control_event()? {
            ControlStatus::Delivered(event) => trace!("Delivered {:?}", event),
            ControlStatus::Handled | ControlStatus::Ignored => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use crate::device::loopback_device;
    use gadget::mock;
    use std::time::{Duration, Instant};

    #[test]
    fn test_loop_dispatches_and_stops() {
        let (backend, host) = mock::pair();
        let device = loopback_device(&DeviceSettings::default(), 1, 2);
        let session = Arc::new(Session::open_with(&device, backend).unwrap());
        let shutdown = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = async_channel::bounded(1);

        let handle = spawn_control_loop(session.clone(), shutdown.clone(), exit_tx).unwrap();
        host.set_configuration(2).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.enabled_endpoints() != vec![3, 7] {
            assert!(Instant::now() < deadline, "endpoints never enabled");
            std::thread::sleep(Duration::from_millis(10));
        }

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert!(exit_rx.try_recv().is_err());
        session.close();
    }

    #[test]
    fn test_closed_session_reports_failure() {
        let (backend, _host) = mock::pair();
        let device = loopback_device(&DeviceSettings::default(), 1, 2);
        let session = Arc::new(Session::open_with(&device, backend).unwrap());
        let (exit_tx, exit_rx) = async_channel::bounded(1);

        session.close();
        let handle =
            spawn_control_loop(session, Arc::new(AtomicBool::new(false)), exit_tx).unwrap();
        handle.join().unwrap();
        assert!(exit_rx.try_recv().is_ok());
    }
}
