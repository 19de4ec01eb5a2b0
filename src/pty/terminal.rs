//! Raw mode and signal wiring for the hosting terminal.
//!
//! The wrapper sits between a real (or captured) terminal and the
//! agent's PTY, so the hosting side must stop interpreting input:
//! TerminalGuard switches stdin to raw mode for its lifetime. Signal
//! handlers only flip atomic flags; the poll loop in `pty` reads them.

use anyhow::{Context, Result};
use nix::pty::Winsize;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::termios::{SetArg, Termios, cfmakeraw, tcgetattr, tcsetattr};
use nix::unistd::isatty;
use std::io;
use std::os::fd::AsRawFd;

use super::{handle_sighup, handle_sigint, handle_sigterm, handle_sigwinch};

/// Raw-mode stdin for the guard's lifetime; the saved settings come
/// back on drop. When stdin is not a TTY (captured by a host UI, or a
/// headless run) there is nothing to switch and the guard is inert.
pub struct TerminalGuard {
    saved: Option<Termios>,
}

impl TerminalGuard {
    pub fn new() -> Result<Self> {
        let stdin = io::stdin();
        if !isatty(&stdin).unwrap_or(false) {
            return Ok(Self { saved: None });
        }

        let saved = tcgetattr(&stdin).context("tcgetattr failed")?;
        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("tcsetattr failed")?;
        Ok(Self { saved: Some(saved) })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Some(ref termios) = self.saved {
            let _ = tcsetattr(io::stdin(), SetArg::TCSANOW, termios);
        }
    }
}

/// Geometry of the hosting terminal, 80x24 when stdout is not a TTY or
/// the query fails.
pub fn get_terminal_size() -> Result<Winsize> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: fd 1 stays open for the life of the process; TIOCGWINSZ
    // only writes into ws. Failure is handled by the fallback below.
    let ret = unsafe {
        libc::ioctl(
            io::stdout().as_raw_fd(),
            libc::TIOCGWINSZ as libc::c_ulong,
            &mut ws,
        )
    };
    if ret == -1 || ws.ws_row == 0 || ws.ws_col == 0 {
        ws.ws_row = 24;
        ws.ws_col = 80;
    }
    Ok(ws)
}

/// Install the wrapper's signal handlers.
///
/// SIGPIPE is ignored outright: a write to a revoked terminal or a
/// closed decision socket must come back as EPIPE, not kill the process
/// before cleanup. SIGTERM and SIGHUP leave SA_RESTART off so a blocked
/// poll() returns EINTR and the loop sees the flag; SIGWINCH and SIGINT
/// only update state and may restart.
pub fn install_signal_handlers() -> Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGPIPE, &ignore) }.context("sigaction SIGPIPE failed")?;

    let handlers: [(Signal, extern "C" fn(libc::c_int), SaFlags); 4] = [
        (Signal::SIGWINCH, handle_sigwinch, SaFlags::SA_RESTART),
        (Signal::SIGINT, handle_sigint, SaFlags::SA_RESTART),
        (Signal::SIGTERM, handle_sigterm, SaFlags::empty()),
        (Signal::SIGHUP, handle_sighup, SaFlags::empty()),
    ];
    for (signal, handler, flags) in handlers {
        let action = SigAction::new(SigHandler::Handler(handler), flags, SigSet::empty());
        unsafe { sigaction(signal, &action) }.context(format!("sigaction {:?} failed", signal))?;
    }
    Ok(())
}
