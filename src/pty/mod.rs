//! PTY wrapper module - spawns the agent with terminal emulation
//!
//! Components:
//! - Proxy: main PTY loop with I/O forwarding and prompt interception
//! - Terminal: raw mode and signal handling
//! - Resize: host-UI geometry records on the fd-3 side channel
//!
//! The proxy is the only place the detector, coordinator and decision
//! server meet: agent output flows through the detector, ordinary
//! bytes go straight to stdout, a completed prompt block is forwarded
//! whole and its parsed request resolved either from policy or via the
//! out-of-band decision server, and the answer is written back to the
//! agent's stdin as a single byte.

mod terminal;
pub mod resize;

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::pty::openpty;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, read, write};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use terminal::TerminalGuard;

use crate::approval::{ApprovalCoordinator, ApprovalDecision, DecisionReply};
use crate::config::Config;
use crate::decision::DecisionServer;
use crate::detect::{DetectorEvent, PromptDetector};
use crate::log::{log_debug, log_error, log_info, log_warn};
use crate::parse::ToolUseRequest;
use resize::{RESIZE_FD, RESIZE_RECORD_LEN, ResizeMessage};

// Signal flags (set by signal handlers, checked in main loop)
static SIGWINCH_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGTERM_RECEIVED: AtomicBool = AtomicBool::new(false);
static SIGHUP_RECEIVED: AtomicBool = AtomicBool::new(false);

pub extern "C" fn handle_sigwinch(_: libc::c_int) {
    SIGWINCH_RECEIVED.store(true, Ordering::Release);
}

pub extern "C" fn handle_sigint(_: libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::Release);
}

pub extern "C" fn handle_sigterm(_: libc::c_int) {
    SIGTERM_RECEIVED.store(true, Ordering::Release);
}

extern "C" fn handle_sighup(_: libc::c_int) {
    SIGHUP_RECEIVED.store(true, Ordering::Release);
}

/// A decision awaited from the out-of-band surface. At most one per
/// session: the agent blocks on its own stdin read until the previous
/// answer arrives, so it cannot produce a second prompt meanwhile.
struct PendingDecision {
    request: ToolUseRequest,
    rx: mpsc::Receiver<ApprovalDecision>,
}

/// PTY proxy that manages the agent process and I/O forwarding
pub struct Proxy {
    pty_master: OwnedFd,
    child: Child,
    _terminal_guard: TerminalGuard,
    detector: PromptDetector,
    coordinator: ApprovalCoordinator,
    decision_server: DecisionServer,
    pending: Option<PendingDecision>,
    /// fd-3 resize side channel, present when the host UI supplies one
    control_fd: Option<i32>,
}

impl Proxy {
    /// Spawn the agent inside a new PTY
    pub fn spawn(command: &str, args: &[&str]) -> Result<Self> {
        let winsize = terminal::get_terminal_size()?;
        let pty = openpty(&winsize, None).context("openpty failed")?;

        let terminal_guard = TerminalGuard::new()?;
        terminal::install_signal_handlers()?;

        let slave_fd = pty.slave.as_raw_fd();
        let master_fd = pty.master.as_raw_fd();

        // SAFETY: the closure runs between fork() and exec() and makes only
        // async-signal-safe calls; the raw fds are Copy and captured by
        // value before the OwnedFds move.
        let child = unsafe {
            Command::new(command)
                .args(args)
                // Interactive agents expect a color-capable terminal
                .env("TERM", "xterm-256color")
                .env("FORCE_COLOR", "1")
                .pre_exec(move || {
                    // New session with the slave as controlling terminal,
                    // stdio rebound onto it
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    for fd in 0..=2 {
                        if libc::dup2(slave_fd, fd) == -1 {
                            return Err(io::Error::last_os_error());
                        }
                    }
                    if slave_fd > 2 {
                        libc::close(slave_fd);
                    }
                    // The child must not hold the master open, or PTY
                    // hangup never reaches it
                    libc::close(master_fd);
                    Ok(())
                })
                .spawn()
                .context("spawn failed")?
        };

        // Close slave in parent
        drop(pty.slave);

        // Set master to non-blocking
        set_nonblocking(&pty.master)?;

        let decision_server = DecisionServer::new()?;

        // Emit decision port to stderr ONLY when stderr is captured by the
        // host UI. When running directly in a terminal, stderr is a TTY —
        // skip printing to avoid polluting the display.
        let stderr_is_tty = unsafe { libc::isatty(libc::STDERR_FILENO) == 1 };
        if !stderr_is_tty {
            eprintln!("DECISION_PORT={}", decision_server.port());
        }

        // fd 3 carries resize records when the host UI opened one for us
        let control_fd = if fd_is_open(RESIZE_FD) {
            Some(RESIZE_FD)
        } else {
            None
        };

        let coordinator = ApprovalCoordinator::new(Config::get().auto_approve_readonly);

        log_info(
            "pty",
            "spawn",
            &format!("spawned {} (pid {})", command, child.id()),
        );

        Ok(Self {
            pty_master: pty.master,
            child,
            _terminal_guard: terminal_guard,
            detector: PromptDetector::new(),
            coordinator,
            decision_server,
            pending: None,
            control_fd,
        })
    }

    /// Run the PTY proxy main loop
    pub fn run(&mut self) -> Result<i32> {
        let stdin_fd = io::stdin();
        let stdout_fd = io::stdout();

        let mut buf = [0u8; 65536];

        loop {
            // Handle signals
            if SIGWINCH_RECEIVED.swap(false, Ordering::AcqRel) {
                self.forward_winsize();
            }
            if SIGINT_RECEIVED.swap(false, Ordering::AcqRel) {
                self.forward_signal(Signal::SIGINT);
            }
            if SIGTERM_RECEIVED.swap(false, Ordering::AcqRel) {
                self.forward_signal(Signal::SIGTERM);
                break;
            }
            if SIGHUP_RECEIVED.swap(false, Ordering::AcqRel) {
                // Terminal closed - break to trigger cleanup
                // Don't forward SIGHUP to child - it will get its own when terminal closes
                break;
            }

            // Collect raw fds for polling (avoid holding borrows)
            let master_raw = self.pty_master.as_raw_fd();
            let stdin_raw = stdin_fd.as_raw_fd();
            let listener_raw = self.decision_server.listener_raw_fd();

            // Build poll fds from raw values. Fixed slots first, then the
            // optional control fd, then decision clients.
            let master_borrowed = unsafe { BorrowedFd::borrow_raw(master_raw) };
            let stdin_borrowed = unsafe { BorrowedFd::borrow_raw(stdin_raw) };
            let listener_borrowed = unsafe { BorrowedFd::borrow_raw(listener_raw) };

            let mut poll_fds = vec![
                PollFd::new(master_borrowed, PollFlags::POLLIN),
                PollFd::new(stdin_borrowed, PollFlags::POLLIN),
                PollFd::new(listener_borrowed, PollFlags::POLLIN),
            ];

            let control_idx = self.control_fd.map(|fd| {
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                poll_fds.push(PollFd::new(borrowed, PollFlags::POLLIN));
                poll_fds.len() - 1
            });

            let client_raw_fds: Vec<i32> = self.decision_server.client_raw_fds().collect();
            let clients_base = poll_fds.len();
            for raw_fd in &client_raw_fds {
                let fd = unsafe { BorrowedFd::borrow_raw(*raw_fd) };
                poll_fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }

            match poll(&mut poll_fds, PollTimeout::from(10000u16)) {
                Ok(0) => {
                    // Timeout — detect lost terminal (window closed, stdin
                    // redirected to /dev/null)
                    // SAFETY: stdin_raw is a valid fd obtained from stdin().as_raw_fd() at function start
                    if !nix::unistd::isatty(unsafe { BorrowedFd::borrow_raw(stdin_raw) })
                        .unwrap_or(false)
                    {
                        break;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => bail!("poll failed: {}", e),
            }

            // Handle PTY output
            if let Some(revents) = poll_fds[0].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    match nix_read(&self.pty_master, &mut buf) {
                        Ok(0) => break, // EOF
                        Ok(n) => {
                            let events = self.detector.push(&buf[..n]);
                            for event in events {
                                match event {
                                    DetectorEvent::Forward(bytes) => {
                                        write_all(&stdout_fd, &bytes)?;
                                    }
                                    DetectorEvent::Prompt { request, raw } => {
                                        // The human sees the untruncated
                                        // prompt as one contiguous write
                                        write_all(&stdout_fd, &raw)?;
                                        self.handle_request(request)?;
                                    }
                                }
                            }
                        }
                        Err(Errno::EAGAIN) => {}
                        Err(Errno::EIO) => break,
                        Err(e) => bail!("read from pty failed: {}", e),
                    }
                }
                if revents.contains(PollFlags::POLLHUP) {
                    break;
                }
            }

            // Handle stdin (human keystrokes pass straight through)
            if let Some(revents) = poll_fds[1].revents() {
                if revents.contains(PollFlags::POLLHUP) {
                    // Terminal disconnected - exit cleanly
                    break;
                }
                if revents.contains(PollFlags::POLLIN) {
                    match nix_read(&stdin_fd, &mut buf) {
                        Ok(0) => break, // stdin EOF = terminal gone, exit cleanly
                        Ok(n) => {
                            write_all(&self.pty_master, &buf[..n])?;
                        }
                        Err(Errno::EAGAIN) => {}
                        Err(e) => bail!("read from stdin failed: {}", e),
                    }
                }
            }

            // Handle decision server accept
            if let Some(revents) = poll_fds[2].revents() {
                if revents.contains(PollFlags::POLLIN) {
                    self.decision_server.accept()?;
                }
            }

            // Handle resize records on the control channel
            if let Some(idx) = control_idx {
                if let Some(revents) = poll_fds[idx].revents() {
                    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                        self.read_control_channel();
                    }
                }
            }

            // Handle decision client data (reverse order to survive removals)
            for i in (0..client_raw_fds.len()).rev() {
                let poll_idx = clients_base + i;
                if let Some(revents) = poll_fds[poll_idx].revents() {
                    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                        if let Some(decision) = self.decision_server.read_client(i) {
                            self.complete_pending(decision)?;
                        }
                    }
                }
            }

            // A resolved reply may also land through the one-shot channel
            // (e.g. the server denied an unanswerable request itself)
            self.poll_pending()?;
        }

        self.shutdown_cleanup()?;

        // Kill child process group (child is session leader via setsid(), so PID = PGID)
        // This ensures the agent and all its children are killed, not just a launch script
        let pgid = Pid::from_raw(-(self.child.id() as i32));
        let _ = kill(pgid, Signal::SIGTERM);

        self.drain_and_wait_child()
    }

    /// Resolve a completed prompt block: policy first, else publish to
    /// the out-of-band decision surface and keep the one-shot receiver.
    fn handle_request(&mut self, request: ToolUseRequest) -> Result<()> {
        if let Some(decision) = self.coordinator.policy_decision(&request) {
            log_info(
                "approval",
                "policy.auto",
                &format!("auto-approved: {}", request.summary),
            );
            return self.inject_decision(decision);
        }

        if self.pending.is_some() {
            // The agent cannot prompt again before reading our previous
            // answer; a second in-flight request means the stream lied.
            // Deny the stale one rather than stall.
            log_warn("approval", "pending.displaced", &request.summary);
            self.decision_server.abandon_pending();
            self.complete_pending(ApprovalDecision::denied())?;
        }

        let (reply, rx) = DecisionReply::channel();
        self.decision_server.publish(&request, reply);
        self.pending = Some(PendingDecision { request, rx });
        Ok(())
    }

    /// Write the single decision byte to the agent's stdin.
    fn inject_decision(&mut self, decision: ApprovalDecision) -> Result<()> {
        log_info(
            "approval",
            "inject",
            if decision.approved { "y" } else { "n" },
        );
        write_all(&self.pty_master, &[decision.reply_byte()])
    }

    /// Finish the outstanding decision with the given answer.
    fn complete_pending(&mut self, decision: ApprovalDecision) -> Result<()> {
        if let Some(pending) = self.pending.take() {
            self.coordinator.record(&pending.request, &decision);
            self.inject_decision(decision)?;
        }
        Ok(())
    }

    /// Check the one-shot channel of the outstanding decision.
    fn poll_pending(&mut self) -> Result<()> {
        let Some(pending) = &self.pending else {
            return Ok(());
        };
        match pending.rx.try_recv() {
            Ok(decision) => self.complete_pending(decision),
            Err(mpsc::TryRecvError::Empty) => Ok(()),
            Err(mpsc::TryRecvError::Disconnected) => {
                // Reply dropped without an answer: denial by default
                log_warn("approval", "reply.dropped", "resolving as denial");
                self.complete_pending(ApprovalDecision::denied())
            }
        }
    }

    /// Drain resize records from the fd-3 side channel.
    fn read_control_channel(&mut self) {
        let Some(fd) = self.control_fd else { return };
        let mut record = [0u8; RESIZE_RECORD_LEN];
        // SAFETY: fd was verified open at spawn and is only closed by the host
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match read(borrowed, &mut record) {
            Ok(0) => {
                // Host closed the channel; stop polling it
                self.control_fd = None;
            }
            Ok(RESIZE_RECORD_LEN) => {
                if let Some(msg) = ResizeMessage::decode(&record) {
                    log_debug(
                        "pty",
                        "resize.apply",
                        &format!("{}x{}", msg.rows, msg.cols),
                    );
                    msg.apply(&self.pty_master);
                }
            }
            Ok(n) => {
                log_warn(
                    "pty",
                    "resize.short_record",
                    &format!("expected {} bytes, got {}", RESIZE_RECORD_LEN, n),
                );
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(_) => {
                self.control_fd = None;
            }
        }
    }

    /// Mandatory teardown: flush any held prompt block to the terminal
    /// (never silently dropped) and resolve any outstanding decision as
    /// denial without writing back to the agent.
    fn shutdown_cleanup(&mut self) -> Result<()> {
        if let Some(held) = self.detector.flush() {
            log_info(
                "pty",
                "teardown.flush",
                &format!("flushing {} held bytes", held.len()),
            );
            write_all(&io::stdout(), &held)?;
        }

        if self.pending.take().is_some() {
            log_warn(
                "approval",
                "teardown.deny",
                "outstanding decision resolved as denial",
            );
            self.decision_server.abandon_pending();
        }
        Ok(())
    }

    /// SIGWINCH from a real terminal: propagate our new geometry.
    fn forward_winsize(&mut self) {
        if let Ok(ws) = terminal::get_terminal_size() {
            let msg = ResizeMessage {
                rows: ws.ws_row,
                cols: ws.ws_col,
            };
            msg.apply(&self.pty_master);
        }
    }

    fn forward_signal(&self, signal: Signal) {
        // Kill process group (negative PID) since child is session leader via setsid()
        let pgid = Pid::from_raw(-(self.child.id() as i32));
        let _ = kill(pgid, signal);
    }

    /// Reap the child while draining the PTY master.
    ///
    /// The agent may keep writing during shutdown; with nobody reading
    /// the master, the kernel buffer fills and its write() blocks
    /// against our waitpid(). So the master is drained and discarded
    /// until the child exits, with SIGKILL after a grace period.
    fn drain_and_wait_child(&mut self) -> Result<i32> {
        const TERM_GRACE: Duration = Duration::from_secs(5);
        const KILL_GRACE: Duration = Duration::from_secs(2);

        let mut buf = [0u8; 65536];
        let deadline = Instant::now() + TERM_GRACE;

        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return Ok(exit_code_from_status(status)),
                Ok(None) => {}
                Err(e) => bail!("wait failed: {}", e),
            }

            if Instant::now() > deadline {
                let pgid = Pid::from_raw(-(self.child.id() as i32));
                let _ = kill(pgid, Signal::SIGKILL);
                let kill_deadline = Instant::now() + KILL_GRACE;
                while Instant::now() < kill_deadline {
                    match self.child.try_wait() {
                        Ok(Some(status)) => return Ok(exit_code_from_status(status)),
                        Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                        Err(e) => bail!("wait after SIGKILL failed: {}", e),
                    }
                }
                // Unkillable (uninterruptible sleep); report failure
                // rather than hang
                return Ok(1);
            }

            match nix_read(&self.pty_master, &mut buf) {
                // EOF or EIO: the slave side is fully closed, the child
                // is done writing and a blocking wait is now safe
                Ok(0) | Err(Errno::EIO) => {
                    let status = self.child.wait().context("wait failed")?;
                    return Ok(exit_code_from_status(status));
                }
                Ok(_) => {}
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        // The decision server (and any unresolved reply) is dropped with
        // us; an attached UI reads the closed socket as denial.
        if self.pending.is_some() {
            log_error("pty", "drop.pending", "proxy dropped with decision outstanding");
        }
    }
}

/// Check whether a file descriptor is open (F_GETFD succeeds).
fn fd_is_open(fd: i32) -> bool {
    // SAFETY: fcntl F_GETFD on an arbitrary fd is safe; it fails with
    // EBADF when the descriptor is not open.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

fn exit_code_from_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        1
    }
}

fn set_nonblocking<Fd: AsFd>(fd: &Fd) -> Result<()> {
    let flags = fcntl(fd.as_fd(), FcntlArg::F_GETFL).context("fcntl F_GETFL failed")?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))
        .context("fcntl F_SETFL failed")?;
    Ok(())
}

fn write_all<F: AsFd>(fd: &F, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        match write(fd, &data[written..]) {
            Ok(n) => written += n,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(e) => bail!("write failed: {}", e),
        }
    }
    Ok(())
}

fn nix_read<F: AsFd>(fd: &F, buf: &mut [u8]) -> Result<usize, Errno> {
    read(fd.as_fd(), buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- exit code mapping ----

    #[test]
    fn exit_code_plain() {
        use std::os::unix::process::ExitStatusExt;
        let status = ExitStatus::from_raw(0);
        assert_eq!(exit_code_from_status(status), 0);
    }

    #[test]
    fn exit_code_nonzero() {
        use std::os::unix::process::ExitStatusExt;
        // Wait status encoding: exit code in the high byte
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code_from_status(status), 3);
    }

    #[test]
    fn exit_code_signal_offset() {
        use std::os::unix::process::ExitStatusExt;
        // Killed by SIGKILL (9): conventional 128 + signal
        let status = ExitStatus::from_raw(9);
        assert_eq!(exit_code_from_status(status), 128 + 9);
    }

    // ---- fd probing ----

    #[test]
    fn stdin_fd_is_open() {
        assert!(fd_is_open(0));
    }

    #[test]
    fn wild_fd_is_not_open() {
        assert!(!fd_is_open(987));
    }
}
