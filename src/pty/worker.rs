//! PTY worker (§4.2): forks a child under a PTY, loops reading its output
//! into a terminal emulator on a dedicated OS thread, and exposes the
//! primitives the main thread needs to write input, resize, and shut down.
//!
//! Spawn/fork/exec machinery is carried over from the teacher's
//! `Pty::spawn` in `src/pty.rs` (raw `nix` openpty/fork/setsid/TIOCSCTTY/
//! dup2/execvp), generalized to take a `cwd` and per-spawn rows/cols instead
//! of being fixed for the process's one child. The read loop is rewritten:
//! the teacher polls a non-blocking fd with a `10ms` sleep; `blocks on
//! master fd read` (§4.2) is honored here with `nix::poll` instead (the same
//! crate feature the shpool-derived pager example in the example pack uses
//! for its PTY wait loop), which blocks the thread until data is actually
//! available rather than busy-waiting.

use crate::error::PtyError;
use crate::pty::emulator::Emulator;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, dup2, execvp, fork, pipe, read, setsid, write, ForkResult, Pid};
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// State shared between the worker thread and the main thread, guarded by
/// one mutex per PTY (§3, §5): emulator state, title, and the input ring.
pub struct PtyShared {
    pub emulator: Emulator,
    pub title: String,
    pub input_ring: VecDeque<u8>,
}

pub struct PtyHandle {
    pub id: u64,
    pub cwd: String,
    pub rows: u16,
    pub cols: u16,
    pub attached_clients: std::collections::HashSet<u64>,
    master_fd: OwnedFd,
    child_pid: Pid,
    running: Arc<AtomicBool>,
    pub shared: Arc<Mutex<PtyShared>>,
    /// Read end of the notify pipe; registered with the event loop.
    pub notify_read: OwnedFd,
    reader_thread: Option<std::thread::JoinHandle<()>>,
}

fn set_nonblocking(fd: RawFd) -> Result<(), PtyError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyError::OpenFailed)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(PtyError::OpenFailed)?;
    Ok(())
}

impl PtyHandle {
    pub fn spawn(id: u64, command: &[String], cwd: &str, rows: u16, cols: u16) -> Result<Self, PtyError> {
        if command.is_empty() {
            return Err(PtyError::ExecFailed(nix::Error::EINVAL));
        }

        let winsize = Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };
        let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenFailed)?;
        let (notify_read, notify_write) = pipe().map_err(PtyError::OpenFailed)?;
        set_nonblocking(notify_read.as_raw_fd())?;
        set_nonblocking(notify_write.as_raw_fd())?;

        match unsafe { fork() }.map_err(PtyError::ForkFailed)? {
            ForkResult::Parent { child } => {
                drop(slave);
                drop(notify_write);
                set_nonblocking(master.as_raw_fd())?;

                let running = Arc::new(AtomicBool::new(true));
                let shared = Arc::new(Mutex::new(PtyShared {
                    emulator: Emulator::new(rows, cols, 10_000),
                    title: String::new(),
                    input_ring: VecDeque::new(),
                }));

                let reader_thread = spawn_reader_thread(
                    master.as_raw_fd(),
                    Arc::clone(&shared),
                    Arc::clone(&running),
                    notify_write,
                );

                Ok(PtyHandle {
                    id,
                    cwd: cwd.to_string(),
                    rows,
                    cols,
                    attached_clients: std::collections::HashSet::new(),
                    master_fd: master,
                    child_pid: child,
                    running,
                    shared,
                    notify_read,
                    reader_thread: Some(reader_thread),
                })
            }
            ForkResult::Child => {
                drop(master);
                drop(notify_read);

                setsid().ok();
                unsafe {
                    libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY as libc::c_ulong, 0);
                }
                let slave_raw = slave.as_raw_fd();
                dup2(slave_raw, libc::STDIN_FILENO).ok();
                dup2(slave_raw, libc::STDOUT_FILENO).ok();
                dup2(slave_raw, libc::STDERR_FILENO).ok();
                if slave_raw > 2 {
                    drop(slave);
                }

                if !cwd.is_empty() {
                    let _ = chdir(cwd);
                }
                // §6: TERM propagates to the child as xterm-256color unless
                // the server's own environment already overrides it.
                if std::env::var_os("TERM").is_none() {
                    std::env::set_var("TERM", "xterm-256color");
                }

                let cmd = CString::new(command[0].as_str()).expect("argv0 has no interior NUL");
                let args: Vec<CString> = command
                    .iter()
                    .map(|s| CString::new(s.as_str()).expect("argv has no interior NUL"))
                    .collect();
                let _ = execvp(&cmd, &args);
                unreachable!("execvp should never return")
            }
        }
    }

    pub fn master_raw_fd(&self) -> RawFd {
        self.master_fd.as_raw_fd()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn notify_read_fd(&self) -> RawFd {
        self.notify_read.as_raw_fd()
    }

    /// Drain all pending bytes from the notify pipe (§4.4 step 1: "edge
    /// triggered friendliness; many pokes collapse to one wake").
    pub fn drain_notify_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            match read(self.notify_read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }

    /// Write bytes directly to the master fd; anything that would block is
    /// appended to the input ring for a later opportunistic flush (§4.2's
    /// input path, simplified for a single-threaded event loop that does not
    /// maintain its own EPOLLOUT watcher: the ring is drained on every main
    /// loop tick instead of precisely on writability).
    pub fn write_input(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut guard = self.shared.lock().unwrap();
        guard.input_ring.extend(data.iter().copied());
        drop(guard);
        self.flush_ring()
    }

    pub fn flush_ring(&self) -> Result<(), PtyError> {
        let mut guard = self.shared.lock().unwrap();
        while let Some(&byte) = guard.input_ring.front() {
            let buf = [byte];
            match write(&self.master_fd, &buf) {
                Ok(1) => {
                    guard.input_ring.pop_front();
                }
                Ok(_) => break,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(e) => return Err(PtyError::Io(std::io::Error::from(e))),
            }
        }
        Ok(())
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let winsize = Winsize { ws_row: rows, ws_col: cols, ws_xpixel: 0, ws_ypixel: 0 };
        unsafe {
            if libc::ioctl(self.master_fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) < 0 {
                return Err(PtyError::ResizeFailed(nix::Error::last()));
            }
        }
        {
            let mut guard = self.shared.lock().unwrap();
            guard.emulator.set_size(rows, cols);
        }
        self.rows = rows;
        self.cols = cols;
        let _ = signal::killpg(self.child_pid, Signal::SIGWINCH);
        Ok(())
    }

    pub fn signal_pgrp(&self, sig: Signal) -> Result<(), PtyError> {
        signal::killpg(self.child_pid, sig).map_err(|e| PtyError::Io(std::io::Error::from(e)))
    }

    pub fn check_child(&self) -> Option<i32> {
        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.running.store(false, Ordering::SeqCst);
                Some(code)
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.running.store(false, Ordering::SeqCst);
                Some(128 + sig as i32)
            }
            Ok(WaitStatus::StillAlive) => None,
            Ok(_) => None,
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                Some(-1)
            }
        }
    }

    /// §4.2/§5 shutdown: SIGHUP the pgrp, wait for the reader thread to
    /// observe EOF/error and exit, bounded by a timeout after which the
    /// thread is abandoned and the fds force-closed.
    pub fn shutdown(&mut self, join_timeout: Duration) {
        let _ = self.signal_pgrp(Signal::SIGHUP);
        let start = Instant::now();
        while self.running.load(Ordering::SeqCst) && start.elapsed() < join_timeout {
            if self.check_child().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if self.running.load(Ordering::SeqCst) {
            let _ = self.signal_pgrp(Signal::SIGKILL);
            let _ = waitpid(self.child_pid, None);
        }
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the reader thread for a handle, given the notify pipe's write end
/// (which the caller keeps outside `PtyHandle` until the thread owns it).
pub fn spawn_reader_thread(
    master_fd: RawFd,
    shared: Arc<Mutex<PtyShared>>,
    running: Arc<AtomicBool>,
    notify_write: OwnedFd,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || reader_loop(master_fd, shared, running, notify_write))
}

fn reader_loop(master_fd: RawFd, shared: Arc<Mutex<PtyShared>>, running: Arc<AtomicBool>, notify_write: OwnedFd) {
    let mut buf = [0u8; 65536];
    let borrowed = unsafe { BorrowedFd::borrow_raw(master_fd) };

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(1000u16)) {
            Ok(0) => continue, // timed out; re-check running flag
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                break;
            }
        }

        let mut drained_any = false;
        loop {
            match read(master_fd, &mut buf) {
                Ok(0) => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => {
                    drained_any = true;
                    let mut guard = shared.lock().unwrap();
                    guard.emulator.process(&buf[..n]);
                    let responses = guard.emulator.auto_responses(&buf[..n]);
                    guard.title = guard.emulator.title().to_string();
                    drop(guard);

                    for resp in responses {
                        let _ = write(borrowed, &resp);
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EIO) => {
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    error!("pty read error: {e}");
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        if drained_any || !running.load(Ordering::SeqCst) {
            let poke = [0u8; 1];
            match write(&notify_write, &poke) {
                Ok(_) | Err(nix::errno::Errno::EAGAIN) => {}
                Err(e) => warn!("notify pipe write failed: {e}"),
            }
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!("pty reader thread exiting");
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.signal_pgrp(Signal::SIGHUP);
        }
    }
}
