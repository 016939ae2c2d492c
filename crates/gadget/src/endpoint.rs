//! Endpoint handles
//!
//! An [`Endpoint`] owns one open channel: endpoint 0 or an enabled bulk
//! endpoint. Clones share the channel, so a worker thread can block in
//! [`read`](Endpoint::read) while the control loop keeps a clone to
//! [`cancel`](Endpoint::cancel) or [`close`](Endpoint::close) it.
//!
//! On channels that support it, blocking calls wait with `poll(2)` on the
//! channel and on a per-handle eventfd; cancelling writes the eventfd,
//! which wakes every blocked call with [`GadgetError::Cancelled`]. Channels
//! without poll support (gadgetfs data endpoints) go straight into the
//! kernel call under a [`Ticker`], which interrupts it periodically so the
//! cancel flag and the deadline are still honoured. Closing cancels first
//! and only then releases the descriptor, so a close racing a read cannot
//! free the file descriptor under it.

use crate::error::{GadgetError, Result};
use crate::interrupt::Ticker;
use crate::session::Session;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

/// Data direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Endpoint 0
    Control,
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// How a blocking call waits for its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoMode {
    /// `poll(2)` reports readiness
    Poll,
    /// Readiness is unknown; the kernel call itself blocks
    Blocking,
}

struct Inner {
    number: u8,
    direction: Direction,
    name: String,
    mode: IoMode,
    channel: RwLock<Option<File>>,
    /// Readable once cancelled; never drained
    cancel: EventFd,
    cancelled: AtomicBool,
    closed: AtomicBool,
}

/// Handle to an open endpoint channel
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("number", &self.inner.number)
            .field("direction", &self.inner.direction)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(
        number: u8,
        direction: Direction,
        name: String,
        file: File,
        mode: IoMode,
    ) -> Result<Self> {
        let cancel = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self {
            inner: Arc::new(Inner {
                number,
                direction,
                name,
                mode,
                channel: RwLock::new(Some(file)),
                cancel,
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Handle for endpoint `number` of an open session
    ///
    /// Same as [`Session::endpoint`]: fails with
    /// [`GadgetError::EndpointNotEnabled`] unless the endpoint is enabled.
    pub fn open(session: &Session, number: u8) -> Result<Self> {
        session.endpoint(number)
    }

    pub fn number(&self) -> u8 {
        self.inner.number
    }

    /// Endpoint address as the host sees it (number plus direction bit)
    pub fn address(&self) -> u8 {
        match self.inner.direction {
            Direction::In => self.inner.number | crate::descriptor::USB_DIR_IN,
            _ => self.inner.number,
        }
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn is_control(&self) -> bool {
        self.inner.direction == Direction::Control
    }

    /// Kernel name of the channel (`ep7in`, controller name for endpoint 0)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True once [`close`](Self::close) has started on any clone
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Read one transfer into `buf`
    ///
    /// Blocks until data arrives, `timeout` elapses
    /// ([`GadgetError::Timeout`]) or the handle is cancelled
    /// ([`GadgetError::Cancelled`]). Returns 0 only for a zero-length packet.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let guard = self.inner.channel.read().unwrap_or_else(PoisonError::into_inner);
        let file = guard
            .as_ref()
            .ok_or(GadgetError::EndpointNotEnabled(self.inner.number))?;

        let n = self.transfer(file, PollFlags::POLLIN, timeout, |mut file| file.read(buf))?;
        trace!("{}: read {} bytes", self.inner.name, n);
        Ok(n)
    }

    /// Write `buf` as one transfer
    ///
    /// Same blocking rules as [`read`](Self::read). A partial write is
    /// reported as [`GadgetError::ShortWrite`].
    pub fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let guard = self.inner.channel.read().unwrap_or_else(PoisonError::into_inner);
        let file = guard
            .as_ref()
            .ok_or(GadgetError::EndpointNotEnabled(self.inner.number))?;

        let written = self.transfer(file, PollFlags::POLLOUT, timeout, |mut file| file.write(buf))?;
        if written != buf.len() {
            return Err(GadgetError::ShortWrite {
                written,
                requested: buf.len(),
            });
        }
        trace!("{}: wrote {} bytes", self.inner.name, written);
        Ok(written)
    }

    /// Interrupt blocked and future I/O on every clone of this handle
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        // EAGAIN only if the counter is saturated, which still wakes pollers
        let _ = self.inner.cancel.write(1);
    }

    fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Release the channel
    ///
    /// Idempotent: closing an already-closed handle succeeds. Blocked calls
    /// on other clones are cancelled first; a call blocked inside the kernel
    /// lets go of the channel within one [`TICK`](crate::interrupt::TICK).
    pub fn close(&self) -> Result<()> {
        self.cancel();
        self.inner.closed.store(true, Ordering::SeqCst);
        let file = self
            .inner
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match file {
            Some(file) => {
                trace!("{}: closing", self.inner.name);
                nix::unistd::close(OwnedFd::from(file).into_raw_fd())?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Run one kernel transfer, retrying it after interruptions until it
    /// completes, the handle is cancelled or `timeout` runs out
    fn transfer<T>(
        &self,
        file: &File,
        interest: PollFlags,
        timeout: Duration,
        mut op: impl FnMut(&File) -> io::Result<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let ticker = match self.inner.mode {
            IoMode::Poll => {
                self.wait(file, interest, deadline, timeout)?;
                None
            }
            IoMode::Blocking => {
                if self.is_cancelled() {
                    return Err(GadgetError::Cancelled);
                }
                Some(Ticker::arm(deadline)?)
            }
        };

        loop {
            match op(file) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if self.is_cancelled() {
                        return Err(GadgetError::Cancelled);
                    }
                    if ticker.is_some() && Instant::now() >= deadline {
                        return Err(GadgetError::Timeout(timeout));
                    }
                }
                other => return Ok(other?),
            }
        }
    }

    fn wait(&self, file: &File, interest: PollFlags, deadline: Instant, timeout: Duration) -> Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // round up so a wake-up never lands before the deadline; longer
            // waits take several rounds
            let millis = remaining.as_micros().div_ceil(1000).min(u128::from(u16::MAX)) as u16;
            let poll_timeout = PollTimeout::from(millis);

            let mut fds = [
                PollFd::new(file.as_fd(), interest),
                PollFd::new(self.inner.cancel.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, poll_timeout) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            if fds[1]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN))
            {
                return Err(GadgetError::Cancelled);
            }
            if let Some(revents) = fds[0].revents() {
                if revents.intersects(interest) {
                    return Ok(());
                }
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                    return Err(GadgetError::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        format!("{}: channel reported {:?}", self.inner.name, revents),
                    )));
                }
            }
            if Instant::now() >= deadline {
                return Err(GadgetError::Timeout(timeout));
            }
        }
    }
}
