//! Signal delivery through a self-pipe.
//!
//! Signals are turned into single bytes written to a pipe the reactor polls,
//! so all real work happens on the reactor thread. A `SIGALRM` byte means
//! "run the timer sweep", a `SIGTERM` byte means "stop".

use parking_lot::{Condvar, Mutex};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::syscalls;

pub const TICK: u8 = libc::SIGALRM as u8;
pub const STOP: u8 = libc::SIGTERM as u8;

/// Write end of the signal pipe used by the `SIGALRM` handler.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

/// Posts tick and stop bytes to the reactor from any thread.
#[derive(Debug, Clone)]
pub struct Notifier {
    fd: Arc<OwnedFd>,
}

impl Notifier {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self { fd: Arc::new(fd) }
    }

    pub fn tick(&self) -> bool {
        syscalls::write_byte(self.fd.as_raw_fd(), TICK)
    }

    pub fn stop(&self) -> bool {
        syscalls::write_byte(self.fd.as_raw_fd(), STOP)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

extern "C" fn on_alarm(sig: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        syscalls::write_byte(fd, sig as u8);
    }
}

/// Route process signals to `notifier`: `SIGALRM` becomes a tick,
/// `SIGINT`/`SIGTERM` become a stop, `SIGPIPE` is ignored.
///
/// The termination handler can only be installed once per process.
pub fn install(notifier: &Notifier) -> io::Result<()> {
    SIGNAL_FD.store(notifier.as_raw_fd(), Ordering::Relaxed);

    unsafe {
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_alarm as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGALRM, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let stopper = notifier.clone();
    ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        stopper.stop();
    })
    .map_err(io::Error::other)?;

    tracing::debug!("signal handlers installed");
    Ok(())
}

/// Schedule the next `SIGALRM`. `alarm(2)` works in whole seconds; anything
/// shorter rounds up to one.
pub fn rearm_alarm(timeslot: Duration) {
    let secs = timeslot.as_secs() + u64::from(timeslot.subsec_nanos() > 0);
    let secs = secs.clamp(1, u64::from(u32::MAX)) as libc::c_uint;
    unsafe {
        libc::alarm(secs);
    }
}

/// Posts a tick every `interval` from a background thread. Stops on drop.
pub struct Ticker {
    state: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(notifier: Notifier, interval: Duration) -> io::Result<Self> {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = state.clone();
        let handle = thread::Builder::new()
            .name("etude-ticker".to_string())
            .spawn(move || {
                let (stopped, cond) = &*shared;
                let mut stopped = stopped.lock();
                while !*stopped {
                    let timed_out = cond.wait_for(&mut stopped, interval).timed_out();
                    if timed_out && !*stopped {
                        notifier.tick();
                    }
                }
            })?;
        Ok(Self {
            state,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        {
            let (stopped, cond) = &*self.state;
            *stopped.lock() = true;
            cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
