//! Signal driven reports.
//!
//! Signal handlers do nothing but write one byte into a pipe. A reporter
//! thread reads the pipe and runs the report on the tracker, outside of
//! signal context:
//!
//! * `SIGUSR1` dumps the live objects,
//! * `SIGUSR2` dumps the checkpoint delta and starts a new checkpoint,
//! * `SIGINT`, `SIGTERM`, `SIGABRT` and `SIGSEGV` dump the final report, then
//!   the signal is re-raised with its default disposition.
//!
//! Normal process exit runs the final report from an `atexit` hook.

use std::{
    ffi::c_void,
    io,
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        OnceLock,
    },
    thread,
};

use crate::{Error, Result, Tracker, Trigger};

pub const LIVE_SIGNAL: i32 = libc::SIGUSR1;
pub const CHECKPOINT_SIGNAL: i32 = libc::SIGUSR2;
pub const FATAL_SIGNALS: [i32; 4] = [libc::SIGINT, libc::SIGTERM, libc::SIGABRT, libc::SIGSEGV];
/// Signals the reporter thread keeps blocked, so a process-directed one is
/// always handled by a thread that can wait for the report.
const DEFERRED_SIGNALS: [i32; 4] = [LIVE_SIGNAL, CHECKPOINT_SIGNAL, libc::SIGINT, libc::SIGTERM];

/// How long a fatal handler waits for the final report before letting the
/// signal through anyway.
const FATAL_WAIT_MS: i32 = 2000;

const LIVE: u8 = 1;
const CHECKPOINT: u8 = 2;
const FINAL: u8 = 3;
/// Or'ed with the signal number; the handler waits for an acknowledgement.
const FATAL: u8 = 0x80;

static TRACKER: OnceLock<&'static Tracker> = OnceLock::new();
/// write end of the request pipe
static REQUEST_FD: AtomicI32 = AtomicI32::new(-1);
/// read end of the acknowledgement pipe
static ACK_FD: AtomicI32 = AtomicI32::new(-1);
static REPORTER_THREAD: AtomicUsize = AtomicUsize::new(0);

fn encode(trigger: Trigger) -> u8 {
    match trigger {
        Trigger::Live => LIVE,
        Trigger::Checkpoint => CHECKPOINT,
        Trigger::Final => FINAL,
    }
}

/// Returns the requested report and whether a signal handler waits for it.
fn decode(byte: u8) -> Option<(Trigger, bool)> {
    match byte {
        LIVE => Some((Trigger::Live, false)),
        CHECKPOINT => Some((Trigger::Checkpoint, false)),
        FINAL => Some((Trigger::Final, false)),
        x if x & FATAL != 0 => Some((Trigger::Final, true)),
        _ => None,
    }
}

fn signal_byte(signal: i32) -> u8 {
    match signal {
        LIVE_SIGNAL => LIVE,
        CHECKPOINT_SIGNAL => CHECKPOINT,
        x => FATAL | (x as u8 & !FATAL),
    }
}

fn current_thread() -> usize {
    unsafe { libc::pthread_self() as usize }
}

fn write_byte(fd: i32, byte: u8) -> bool {
    fd >= 0 && unsafe { libc::write(fd, &byte as *const u8 as *const c_void, 1) } == 1
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn errno_location() -> *mut libc::c_int {
    std::ptr::null_mut()
}

/// Puts `errno` back when dropped, so an interrupted thread doesn't see the
/// handler's failed `write`.
struct SavedErrno(libc::c_int);

impl SavedErrno {
    fn save() -> Self {
        let location = errno_location();
        Self(if location.is_null() { 0 } else { unsafe { *location } })
    }
}

impl Drop for SavedErrno {
    fn drop(&mut self) {
        let location = errno_location();
        if !location.is_null() {
            unsafe { *location = self.0 };
        }
    }
}

/// Only async-signal-safe calls in here.
extern "C" fn on_signal(signal: libc::c_int) {
    let _errno = SavedErrno::save();
    let sent = write_byte(REQUEST_FD.load(Ordering::Acquire), signal_byte(signal));
    if !FATAL_SIGNALS.contains(&signal) {
        return;
    }
    // the reporter can't report while it is the one being killed
    if sent && current_thread() != REPORTER_THREAD.load(Ordering::Acquire) {
        wait_for_ack();
    }
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

fn wait_for_ack() {
    let fd = ACK_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let mut poll = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    if unsafe { libc::poll(&mut poll, 1, FATAL_WAIT_MS) } > 0 {
        let mut byte = 0u8;
        unsafe { libc::read(fd, &mut byte as *mut u8 as *mut c_void, 1) };
    }
}

extern "C" fn on_exit() {
    if let Some(tracker) = TRACKER.get() {
        tracker.dump_final();
    }
}

/// Returns (read end, write end); the write end doesn't block.
fn pipe() -> Result<(i32, i32)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::Pipe(io::Error::last_os_error()));
    }
    unsafe {
        for fd in fds {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
    }
    Ok((fds[0], fds[1]))
}

fn set_handler(signal: i32) -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(Error::SignalInstall {
                signal,
                source: io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

fn block_deferred_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        for signal in DEFERRED_SIGNALS {
            libc::sigaddset(&mut set, signal);
        }
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

fn run_reporter(tracker: &'static Tracker, request_fd: i32, ack_fd: i32) {
    block_deferred_signals();
    REPORTER_THREAD.store(current_thread(), Ordering::Release);
    log::debug!("object-track reporter started");
    loop {
        let mut byte = 0u8;
        let read = unsafe { libc::read(request_fd, &mut byte as *mut u8 as *mut c_void, 1) };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("object-track reporter stopped: {err}");
            return;
        }
        if read == 0 {
            log::debug!("object-track reporter stopped: request pipe closed");
            return;
        }
        match decode(byte) {
            Some((trigger, ack)) => {
                tracker.handle(trigger);
                if ack {
                    write_byte(ack_fd, 1);
                }
            }
            None => log::warn!("object-track: unknown report request {byte:#x}"),
        }
    }
}

/// Queues a report on the reporter thread, like the matching signal would.
/// Returns false if triggers are not installed.
pub fn request(trigger: Trigger) -> bool {
    write_byte(REQUEST_FD.load(Ordering::Acquire), encode(trigger))
}

/// Installs the signal handlers, the reporter thread and the exit hook for
/// `tracker`. Only the first call in a process does anything.
pub fn install(tracker: &'static Tracker) -> Result<()> {
    if TRACKER.set(tracker).is_err() {
        return Ok(());
    }
    let (request_read, request_write) = pipe()?;
    let (ack_read, ack_write) = pipe()?;
    ACK_FD.store(ack_read, Ordering::Release);

    thread::Builder::new()
        .name("object-track-reporter".to_string())
        .spawn(move || run_reporter(tracker, request_read, ack_write))
        .map_err(Error::Spawn)?;
    REQUEST_FD.store(request_write, Ordering::Release);

    for signal in [LIVE_SIGNAL, CHECKPOINT_SIGNAL].into_iter().chain(FATAL_SIGNALS) {
        set_handler(signal)?;
    }
    if unsafe { libc::atexit(on_exit) } != 0 {
        return Err(Error::ExitHook);
    }
    Ok(())
}
