//! Interrupting blocked kernel transfers
//!
//! gadgetfs endpoint files have no poll support, so a transfer on them
//! blocks inside `read(2)`/`write(2)` until the host moves data. While such
//! a call is in flight the calling thread holds a [`Ticker`]: a timer that
//! sends [`INTERRUPT_SIGNAL`] to that thread every [`TICK`]. The handler is
//! installed without `SA_RESTART`, so each tick fails the call with `EINTR`
//! and the caller gets to look at its cancel flag and deadline before
//! retrying.
//!
//! The signal is process-wide state: applications embedding this crate must
//! not install their own handler for it.

use crate::error::Result;
use nix::libc;
use nix::sys::signal::{
    SaFlags, SigAction, SigEvent, SigHandler, SigSet, SigevNotify, Signal, sigaction,
};
use nix::sys::time::TimeSpec;
use nix::sys::timer::{Expiration, Timer, TimerSetTimeFlags};
use nix::time::ClockId;
use nix::unistd::gettid;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Signal used to knock a thread out of a blocking transfer
pub const INTERRUPT_SIGNAL: Signal = Signal::SIGUSR2;

/// Longest a blocked transfer goes without re-checking cancel and deadline
pub const TICK: Duration = Duration::from_millis(20);

extern "C" fn wake(_: libc::c_int) {}

fn install() -> nix::Result<()> {
    static INSTALLED: OnceLock<nix::Result<()>> = OnceLock::new();
    *INSTALLED.get_or_init(|| {
        let action = SigAction::new(SigHandler::Handler(wake), SaFlags::empty(), SigSet::empty());
        // SAFETY: the handler is empty and therefore async-signal-safe
        let installed = unsafe { sigaction(INTERRUPT_SIGNAL, &action) }.map(drop);
        if installed.is_ok() {
            debug!("Installed {:?} handler for transfer interruption", INTERRUPT_SIGNAL);
        }
        installed
    })
}

/// Periodic interruption of the current thread; disarmed on drop
pub(crate) struct Ticker {
    _timer: Timer,
}

impl Ticker {
    /// Start ticking; the first tick lands at `deadline` or after [`TICK`],
    /// whichever comes first
    pub(crate) fn arm(deadline: Instant) -> Result<Self> {
        install()?;
        let event = SigEvent::new(SigevNotify::SigevThreadId {
            signal: INTERRUPT_SIGNAL,
            thread_id: gettid().as_raw(),
            si_value: 0,
        });
        let mut timer = Timer::new(ClockId::CLOCK_MONOTONIC, event)?;

        // a zero first expiry would disarm the timer
        let first = deadline
            .saturating_duration_since(Instant::now())
            .clamp(Duration::from_micros(1), TICK);
        timer.set(
            Expiration::IntervalDelayed(TimeSpec::from_duration(first), TimeSpec::from_duration(TICK)),
            TimerSetTimeFlags::empty(),
        )?;
        Ok(Self { _timer: timer })
    }
}
