//! PTY allocation and termios application from SSH terminal modes
//! (`spec.md` §4.7).
//!
//! No teacher file owns a PTY — `assh`'s sessions never allocate one. This
//! is built directly against `nix`, the crate the wider retrieval pack
//! reaches for around `openpty`/`termios`/`ioctl` (corpus precedent:
//! `wez-wezterm`'s PTY layer, `other_examples/...pty-src-ssh.rs.rs`, albeit
//! over a different transport).

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::{self, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd;

use crate::{Error, Result};

// TIOCSWINSZ isn't exposed as a typed nix wrapper; define it the way
// terminal-emulator crates in the corpus do, over the raw ioctl number.
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, Winsize);

/// One `pty-req`'s window dimensions, both character cells and pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

/// A single `opcode, uint32` SSH terminal mode pair, as received in a
/// `pty-req`'s (or `window-change`'s unrelated, but similarly encoded)
/// mode-list payload.
pub type TerminalMode = (u8, u32);

const TTY_OP_END: u8 = 0;
const TTY_OP_ISPEED: u8 = 128;
const TTY_OP_OSPEED: u8 = 129;

/// Parse a `pty-req` mode-list byte string into `(opcode, uint32)` pairs,
/// stopping at `TTY_OP_END` (opcode 0) and ignoring anything after it, per
/// `spec.md` §4.7 / §8's boundary behavior.
pub fn parse_modes(raw: &[u8]) -> Vec<TerminalMode> {
    let mut modes = Vec::new();
    let mut chunks = raw.chunks_exact(5);

    for chunk in &mut chunks {
        let opcode = chunk[0];
        if opcode == TTY_OP_END {
            return modes;
        }

        let value = u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
        modes.push((opcode, value));
    }

    modes
}

/// An allocated master/slave PTY pair with the master kept open for the
/// lifetime of the owning `Channel`.
pub struct Pty {
    master: std::fs::File,
    slave_path: String,
    window: WindowSize,
}

impl Pty {
    /// Open a fresh PTY pair, apply the fixed termios baseline plus every
    /// mode opcode the client sent, and set the initial window size.
    pub fn open(modes: &[TerminalMode], window: WindowSize) -> Result<Self> {
        let OpenptyResult { master, slave } =
            openpty(None, None).map_err(|errno| Error::PtyFailure(errno.to_string()))?;

        let slave_path = unsafe {
            // `ptsname` is not thread-safe on some platforms; the slave fd
            // we already hold from `openpty` is what we actually use, this
            // is only for WHISP_TTY.
            ptsname_from_fd(slave.as_raw_fd())?
        };

        let mut termios = termios::tcgetattr(&slave).map_err(|errno| Error::PtyFailure(errno.to_string()))?;
        apply_baseline(&mut termios);
        apply_modes(&mut termios, modes);
        termios::tcsetattr(&slave, SetArg::TCSANOW, &termios)
            .map_err(|errno| Error::PtyFailure(errno.to_string()))?;

        drop(slave);

        // `spec.md` §4.7: "Reading the master is non-blocking."
        fcntl(&master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
            .map_err(|errno| Error::PtyFailure(errno.to_string()))?;

        let mut pty = Self {
            master: std::fs::File::from(master),
            slave_path,
            window: WindowSize::default(),
        };
        pty.resize(window)?;

        Ok(pty)
    }

    /// Read up to `buf.len()` bytes from the master without blocking.
    /// `Ok(None)` means no bytes are currently available.
    pub fn read_nonblocking(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        match self.master.read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(Error::PtyFailure(err.to_string())),
        }
    }

    /// Write bytes to the master, e.g. forwarding `CHANNEL_DATA` to the
    /// child's stdin, or injecting EOT on `CHANNEL_EOF`.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.master
            .write_all(buf)
            .map_err(|err| Error::PtyFailure(err.to_string()))
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    pub fn window(&self) -> WindowSize {
        self.window
    }

    /// Apply a new window size via `TIOCSWINSZ` on the master.
    pub fn resize(&mut self, window: WindowSize) -> Result<()> {
        let winsize = Winsize {
            ws_row: window.rows as u16,
            ws_col: window.cols as u16,
            ws_xpixel: window.width_px as u16,
            ws_ypixel: window.height_px as u16,
        };

        unsafe { tiocswinsz(self.master.as_raw_fd(), &winsize) }
            .map_err(|errno| Error::PtyFailure(errno.to_string()))?;

        self.window = window;
        Ok(())
    }

    /// Re-open the slave side for handing to a spawned child as its
    /// stdin/stdout/stderr and controlling terminal.
    pub fn open_slave(&self) -> Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.slave_path)
            .map_err(|err| Error::PtyFailure(err.to_string()))
    }
}

/// Resolve the slave device path for an open slave fd, since `nix::pty`
/// hands back fds rather than the grantpt/unlockpt/ptsname path triple
/// directly once `openpty` has already done that dance internally.
unsafe fn ptsname_from_fd(fd: RawFd) -> Result<String> {
    let path = unistd::ttyname(std::os::fd::BorrowedFd::borrow_raw(fd))
        .map_err(|errno| Error::PtyFailure(errno.to_string()))?;

    path.into_os_string()
        .into_string()
        .map_err(|_| Error::PtyFailure("slave path is not valid UTF-8".into()))
}

fn apply_baseline(termios: &mut Termios) {
    use termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags};

    termios.local_flags.insert(
        LocalFlags::ISIG
            | LocalFlags::ICANON
            | LocalFlags::ECHO
            | LocalFlags::ECHOE
            | LocalFlags::ECHOK
            | LocalFlags::ECHONL
            | LocalFlags::IEXTEN,
    );
    termios.input_flags.insert(InputFlags::ICRNL);
    termios.output_flags.remove(OutputFlags::OPOST);

    let _ = ControlFlags::empty();
}

/// Set or clear a single bit in one of `nix`'s termios flag bitflags
/// (`InputFlags`/`OutputFlags`/`ControlFlags`/`LocalFlags`) — each is its
/// own concrete type, so this is a macro rather than a generic function.
macro_rules! toggle {
    ($flags:expr, $bit:expr, $on:expr) => {
        if $on {
            $flags.insert($bit);
        } else {
            $flags.remove($bit);
        }
    };
}

/// Apply each SSH terminal mode opcode to `termios`, per the full mapping
/// table in `spec.md` §4.7. Unknown opcodes are silently skipped.
fn apply_modes(termios: &mut Termios, modes: &[TerminalMode]) {
    use termios::{ControlFlags, InputFlags, LocalFlags, OutputFlags};

    for &(opcode, value) in modes {
        let on = value != 0;

        match opcode {
            1 => set_cc(termios, SpecialCharacterIndices::VINTR, value),
            2 => set_cc(termios, SpecialCharacterIndices::VQUIT, value),
            3 => set_cc(termios, SpecialCharacterIndices::VERASE, value),
            4 => set_cc(termios, SpecialCharacterIndices::VKILL, value),
            5 => set_cc(termios, SpecialCharacterIndices::VEOF, value),
            6 => set_cc(termios, SpecialCharacterIndices::VEOL, value),
            7 => set_cc(termios, SpecialCharacterIndices::VEOL2, value),
            8 => set_cc(termios, SpecialCharacterIndices::VSTART, value),
            9 => set_cc(termios, SpecialCharacterIndices::VSTOP, value),
            10 => set_cc(termios, SpecialCharacterIndices::VSUSP, value),
            12 => set_cc(termios, SpecialCharacterIndices::VREPRINT, value),
            13 => set_cc(termios, SpecialCharacterIndices::VWERASE, value),
            14 => set_cc(termios, SpecialCharacterIndices::VLNEXT, value),
            #[cfg(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            11 => set_cc(termios, SpecialCharacterIndices::VDSUSP, value),

            30 => toggle!(termios.input_flags, InputFlags::IGNPAR, on),
            31 => toggle!(termios.input_flags, InputFlags::PARMRK, on),
            32 => toggle!(termios.input_flags, InputFlags::INPCK, on),
            33 => toggle!(termios.input_flags, InputFlags::ISTRIP, on),
            34 => toggle!(termios.input_flags, InputFlags::INLCR, on),
            35 => toggle!(termios.input_flags, InputFlags::IGNCR, on),
            36 => toggle!(termios.input_flags, InputFlags::ICRNL, on),
            #[cfg(target_os = "linux")]
            37 => toggle!(termios.input_flags, InputFlags::IUCLC, on),
            38 => toggle!(termios.input_flags, InputFlags::IXON, on),
            39 => toggle!(termios.input_flags, InputFlags::IXANY, on),
            40 => toggle!(termios.input_flags, InputFlags::IXOFF, on),
            41 => toggle!(termios.input_flags, InputFlags::IMAXBEL, on),

            50 => toggle!(termios.local_flags, LocalFlags::ISIG, on),
            51 => toggle!(termios.local_flags, LocalFlags::ICANON, on),
            #[cfg(target_os = "linux")]
            52 => toggle!(termios.local_flags, LocalFlags::XCASE, on),
            53 => toggle!(termios.local_flags, LocalFlags::ECHO, on),
            54 => toggle!(termios.local_flags, LocalFlags::ECHOE, on),
            55 => toggle!(termios.local_flags, LocalFlags::ECHOK, on),
            56 => toggle!(termios.local_flags, LocalFlags::ECHONL, on),
            57 => toggle!(termios.local_flags, LocalFlags::NOFLSH, on),
            58 => toggle!(termios.local_flags, LocalFlags::TOSTOP, on),
            59 => toggle!(termios.local_flags, LocalFlags::IEXTEN, on),
            60 => toggle!(termios.local_flags, LocalFlags::ECHOCTL, on),
            61 => toggle!(termios.local_flags, LocalFlags::ECHOKE, on),
            62 => toggle!(termios.local_flags, LocalFlags::PENDIN, on),

            70 => toggle!(termios.output_flags, OutputFlags::OPOST, false),
            #[cfg(target_os = "linux")]
            71 => toggle!(termios.output_flags, OutputFlags::OLCUC, on),
            72 => toggle!(termios.output_flags, OutputFlags::ONLCR, on),
            73 => toggle!(termios.output_flags, OutputFlags::OCRNL, on),
            74 => toggle!(termios.output_flags, OutputFlags::ONOCR, on),
            75 => toggle!(termios.output_flags, OutputFlags::ONLRET, on),

            90 => toggle!(termios.control_flags, ControlFlags::CS7, on),
            91 => toggle!(termios.control_flags, ControlFlags::CS8, on),
            92 => toggle!(termios.control_flags, ControlFlags::PARENB, on),
            93 => toggle!(termios.control_flags, ControlFlags::PARODD, on),

            TTY_OP_ISPEED | TTY_OP_OSPEED => {
                // Baud rate: not meaningful over a pseudo-terminal, and
                // nix's typed speed setters need a `BaudRate` enum value
                // rather than an arbitrary integer. Silently accepted.
            }

            _ => tracing::trace!(opcode, "skipping unknown pty-req mode opcode"),
        }
    }
}

fn set_cc(termios: &mut Termios, index: SpecialCharacterIndices, value: u32) {
    termios.control_chars[index as usize] = value as u8;
}
