//! One SSH channel's state: its PTY, its spawned app, pending environment
//! and terminal info, and the flags that decide when it's fully closed
//! (`spec.md` §3/§4.5).
//!
//! Grounded on `assh-connect/src/channel/mod.rs`'s `Channel` struct shape
//! (local/remote channel numbers, window bookkeeping), generalized to own
//! a [`Pty`] and a spawned child instead of the teacher's generic
//! request/data stream multiplexer — `spec.md` §1's Non-goals call a
//! single interactive session per connection the expected shape, so there
//! is no generic multi-stream mux to carry over.

use std::process::Stdio;

use async_std::os::unix::process::CommandExt;
use async_std::process::Command;
use futures::channel::oneshot;

use crate::pty::{Pty, TerminalMode, WindowSize};
use crate::{Error, Result};

/// Only `session` channels are ever opened (`spec.md` §3).
pub const CHANNEL_TYPE: &str = "session";

/// A `pty-req`'s terminal name plus its window dimensions, set once a PTY
/// has been allocated.
#[derive(Debug, Clone, Default)]
pub struct TerminalInfo {
    pub term: Option<String>,
    pub window: WindowSize,
}

/// `pty-req` mode opcode 36: whether the allocated terminal rewrites a lone
/// carriage return to a newline on input (`spec.md` §4.7's ICRNL note).
const ICRNL_OPCODE: u8 = 36;

/// One SSH channel. `spec.md` §3: "closed" only when both `input_closed`
/// and `output_closed` are set; environment accumulates only until command
/// start; stopping a command releases the PTY and sends `CHANNEL_CLOSE`
/// exactly once.
pub struct Channel {
    pub local_id: u32,
    pub remote_id: u32,
    pub remote_window: u32,
    pub max_packet_size: u32,

    pub pty: Option<Pty>,
    pub terminal: TerminalInfo,
    pub icrnl: bool,
    pub pending_env: Vec<(String, String)>,

    pub app: Option<String>,

    pid: Option<i32>,
    exit_rx: Option<oneshot::Receiver<i32>>,

    pub input_closed: bool,
    pub output_closed: bool,
    pub close_sent: bool,
}

impl Channel {
    pub fn new(local_id: u32, remote_id: u32, remote_window: u32, max_packet_size: u32) -> Self {
        Self {
            local_id,
            remote_id,
            remote_window,
            max_packet_size,
            pty: None,
            terminal: TerminalInfo::default(),
            icrnl: true,
            pending_env: Vec::new(),
            app: None,
            pid: None,
            exit_rx: None,
            input_closed: false,
            output_closed: false,
            close_sent: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.input_closed && self.output_closed
    }

    /// Allocate a PTY for this channel from a `pty-req`'s parsed fields.
    pub fn allocate_pty(
        &mut self,
        term: String,
        window: WindowSize,
        modes: &[TerminalMode],
    ) -> Result<()> {
        let pty = Pty::open(modes, window)?;

        self.icrnl = modes
            .iter()
            .find(|&&(opcode, _)| opcode == ICRNL_OPCODE)
            .map(|&(_, value)| value != 0)
            .unwrap_or(true);

        self.terminal = TerminalInfo {
            term: Some(term),
            window,
        };
        self.pty = Some(pty);

        Ok(())
    }

    pub fn resize(&mut self, window: WindowSize) -> Result<()> {
        self.terminal.window = window;

        match &mut self.pty {
            Some(pty) => pty.resize(window),
            None => Ok(()),
        }
    }

    /// Spawn `command_line` (already shell-quoted by the registry) on this
    /// channel's PTY, making it the child's session leader and controlling
    /// terminal before `exec` (`spec.md` §4.7).
    pub fn spawn(&mut self, command_line: &str, env: Vec<(String, String)>) -> Result<()> {
        let pty = self
            .pty
            .as_ref()
            .ok_or_else(|| Error::Spawn("no pty allocated for this channel".into()))?;

        let mut parts = shlex::split(command_line)
            .filter(|parts| !parts.is_empty())
            .ok_or_else(|| Error::Spawn(format!("invalid command line `{command_line}`")))?;
        let program = parts.remove(0);

        let slave_in = pty.open_slave()?;
        let slave_out = slave_in
            .try_clone()
            .map_err(|err| Error::Spawn(err.to_string()))?;
        let slave_err = slave_in
            .try_clone()
            .map_err(|err| Error::Spawn(err.to_string()))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .envs(env)
            .stdin(Stdio::from(slave_in))
            .stdout(Stdio::from(slave_out))
            .stderr(Stdio::from(slave_err));

        // SAFETY: `setsid`/`ioctl(TIOCSCTTY)` are async-signal-safe and run
        // in the forked child between `fork` and `exec`, per `spec.md`
        // §4.7: "made a session leader and have the slave PTY set as its
        // controlling terminal before `exec`".
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;

                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|err| Error::Spawn(err.to_string()))?;

        self.pid = Some(child.id() as i32);

        let (tx, rx) = oneshot::channel();
        async_std::task::spawn(async move {
            let code = match child.status().await {
                Ok(status) => status.code().unwrap_or(1),
                Err(_) => 1,
            };

            let _ = tx.send(code);
        });

        self.exit_rx = Some(rx);

        Ok(())
    }

    /// Send `signal` to the spawned app, if any is still running. Used at
    /// connection teardown (`spec.md` §5: "SIGTERM, then SIGKILL after a
    /// small grace window").
    pub fn signal(&self, signal: nix::sys::signal::Signal) {
        if let Some(pid) = self.pid {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal);
        }
    }

    /// Poll (non-blocking) for the spawned child's exit status.
    pub fn poll_exit(&mut self) -> Option<i32> {
        match self.exit_rx.as_mut() {
            Some(rx) => match rx.try_recv() {
                Ok(Some(code)) => {
                    self.exit_rx = None;
                    Some(code)
                }
                _ => None,
            },
            None => None,
        }
    }

    pub fn has_child(&self) -> bool {
        self.exit_rx.is_some()
    }
}
