//! Loopback echo worker
//!
//! [`Loopback`] is the session's event callback state. Once both bulk
//! endpoints are enabled it starts a worker thread that reads from OUT,
//! reverses the bytes and writes them back on IN. Disabling either endpoint
//! or a disconnect cancels the worker and joins it; the worker closes both
//! endpoints on its way out.

use crate::config::{DeviceSettings, TransferSettings};
use gadget::{Endpoint, Event, GadgetError, Session};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct Worker {
    handle: JoinHandle<u64>,
    ep_in: Endpoint,
    ep_out: Endpoint,
}

impl Worker {
    /// Cancel blocked transfers and wait for the thread
    fn stop(self) {
        self.ep_in.cancel();
        self.ep_out.cancel();
        match self.handle.join() {
            Ok(bytes) => debug!("Loopback worker joined after {} bytes", bytes),
            Err(e) => error!("Loopback worker panicked: {:?}", e),
        }
    }
}

pub struct Loopback {
    in_endpoint: u8,
    out_endpoint: u8,
    buffer_size: usize,
    timeout: Duration,
    ep_in: Option<Endpoint>,
    ep_out: Option<Endpoint>,
    worker: Option<Worker>,
}

impl Loopback {
    pub fn new(device: &DeviceSettings, transfer: &TransferSettings) -> Self {
        Self {
            in_endpoint: device.in_endpoint,
            out_endpoint: device.out_endpoint,
            buffer_size: transfer.buffer_size,
            timeout: transfer.timeout(),
            ep_in: None,
            ep_out: None,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Session event callback
    pub fn handle_event(&mut self, session: &Session, event: &Event) {
        match *event {
            Event::EndpointEnable(n) if n == self.in_endpoint || n == self.out_endpoint => {
                let endpoint = match session.endpoint(n) {
                    Ok(endpoint) => endpoint,
                    Err(e) => {
                        warn!("Endpoint {} enabled but unavailable: {}", n, e);
                        return;
                    }
                };
                if n == self.in_endpoint {
                    self.ep_in = Some(endpoint);
                } else {
                    self.ep_out = Some(endpoint);
                }
                self.start();
            }
            Event::EndpointEnable(n) => debug!("Ignoring endpoint {}", n),
            Event::EndpointDisable(n) => {
                if n == self.in_endpoint {
                    self.ep_in = None;
                } else if n == self.out_endpoint {
                    self.ep_out = None;
                }
                self.stop();
            }
            Event::Disconnect => {
                self.ep_in = None;
                self.ep_out = None;
                self.stop();
            }
            Event::Connect => info!("Host connected"),
            Event::Suspend => info!("Bus suspended"),
        }
    }

    fn start(&mut self) {
        let (Some(ep_in), Some(ep_out)) = (&self.ep_in, &self.ep_out) else {
            return;
        };
        if self.is_running() {
            return;
        }
        // reap a worker that already ended on an I/O error
        if let Some(finished) = self.worker.take() {
            finished.stop();
        }

        let (ep_in, ep_out) = (ep_in.clone(), ep_out.clone());
        let (reader, writer) = (ep_out.clone(), ep_in.clone());
        let buffer_size = self.buffer_size;
        let timeout = self.timeout;
        let spawned = std::thread::Builder::new()
            .name("usg-loopback".to_string())
            .spawn(move || echo(&reader, &writer, buffer_size, timeout));

        match spawned {
            Ok(handle) => {
                info!(
                    "Loopback running: {} -> {}",
                    ep_out.name(),
                    ep_in.name()
                );
                self.worker = Some(Worker {
                    handle,
                    ep_in,
                    ep_out,
                });
            }
            Err(e) => error!("Failed to spawn loopback worker: {}", e),
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
            info!("Loopback stopped");
        }
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Echo reversed transfers until an error; returns the bytes echoed
fn echo(ep_out: &Endpoint, ep_in: &Endpoint, buffer_size: usize, timeout: Duration) -> u64 {
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;

    loop {
        let n = match ep_out.read(&mut buf, timeout) {
            Ok(n) => n,
            Err(GadgetError::Cancelled) => break,
            Err(e) => {
                warn!("{}: read failed: {}", ep_out.name(), e);
                break;
            }
        };
        buf[..n].reverse();
        match ep_in.write(&buf[..n], timeout) {
            Ok(_) => total += n as u64,
            Err(GadgetError::Cancelled) => break,
            Err(e) => {
                warn!("{}: write failed: {}", ep_in.name(), e);
                break;
            }
        }
    }

    for endpoint in [ep_in, ep_out] {
        if let Err(e) = endpoint.close() {
            warn!("Failed to close {}: {}", endpoint.name(), e);
        }
    }
    total
}
