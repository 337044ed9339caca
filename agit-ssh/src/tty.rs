//! Terminal prompts for passphrases and host-key questions.
//!
//! Prompts go to the controlling terminal (`/dev/tty`), not stdout, so they
//! still reach the user when a Git command's output is piped.
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use agit_core::UserInfo;
use tracing::warn;
use zeroize::Zeroizing;

/// Restores the original `termios` settings on the given fd when dropped.
struct TermiosGuard {
    fd: RawFd,
    orig: libc::termios,
}

impl Drop for TermiosGuard {
    fn drop(&mut self) {
        // Best effort: a dead terminal has no state left to restore.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
        }
    }
}

/// Read one line from `tty` with echo disabled.
///
/// The buffer is zeroized on drop; the trailing newline is stripped.
fn read_hidden(tty: &File) -> io::Result<Zeroizing<String>> {
    let fd = tty.as_raw_fd();

    // SAFETY: fd belongs to an open File and `term` is initialised by tcgetattr.
    let guard = unsafe {
        let mut term = std::mem::MaybeUninit::<libc::termios>::uninit();
        if libc::tcgetattr(fd, term.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        TermiosGuard {
            fd,
            orig: term.assume_init(),
        }
    };

    let mut noecho = guard.orig;
    noecho.c_lflag &= !(libc::ECHO as libc::tcflag_t);
    noecho.c_lflag &= !(libc::ECHONL as libc::tcflag_t);

    // TCSAFLUSH also discards keystrokes typed before the prompt appeared.
    unsafe {
        if libc::tcsetattr(fd, libc::TCSAFLUSH, &noecho) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let mut buf = Zeroizing::new(Vec::<u8>::new());
    let result = BufReader::new(tty).read_until(b'\n', &mut buf);

    drop(guard);
    // Enter was not echoed.
    let _ = (&*tty).write_all(b"\n");
    result?;

    strip_line(&buf)
}

fn strip_line(raw: &[u8]) -> io::Result<Zeroizing<String>> {
    let mut end = raw.len();
    while end > 0 && (raw[end - 1] == b'\n' || raw[end - 1] == b'\r') {
        end -= 1;
    }
    let s = std::str::from_utf8(&raw[..end])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Zeroizing::new(s.to_string()))
}

/// [`UserInfo`] that talks to the controlling terminal.
#[derive(Debug, Clone)]
pub struct TtyUserInfo {
    device: PathBuf,
}

impl Default for TtyUserInfo {
    fn default() -> Self {
        Self::new("/dev/tty")
    }
}

impl TtyUserInfo {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(&self.device)
    }

    fn prompt_hidden(&self, message: &str) -> io::Result<Zeroizing<String>> {
        let tty = self.open()?;
        (&tty).write_all(format!("{message}: ").as_bytes())?;
        (&tty).flush()?;
        read_hidden(&tty)
    }

    fn prompt_line(&self, message: &str) -> io::Result<Zeroizing<String>> {
        let tty = self.open()?;
        (&tty).write_all(format!("{message} ").as_bytes())?;
        (&tty).flush()?;
        let mut line = Zeroizing::new(Vec::new());
        BufReader::new(&tty).read_until(b'\n', &mut line)?;
        strip_line(&line)
    }

    fn secret(&self, message: &str) -> Option<Zeroizing<String>> {
        match self.prompt_hidden(message) {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!(device = %self.device.display(), "terminal prompt failed: {e}");
                None
            }
        }
    }
}

/// `yes`/`y` in any case; everything else is a no.
fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "yes" | "y")
}

impl UserInfo for TtyUserInfo {
    fn prompt_passphrase(&self, message: &str) -> Option<Zeroizing<String>> {
        self.secret(message)
    }

    fn prompt_password(&self, message: &str) -> Option<Zeroizing<String>> {
        self.secret(message)
    }

    fn prompt_yes_no(&self, message: &str) -> bool {
        match self.prompt_line(&format!("{message} (yes/no)")) {
            Ok(answer) => is_yes(&answer),
            Err(e) => {
                warn!(device = %self.device.display(), "terminal prompt failed: {e}");
                false
            }
        }
    }

    fn show_message(&self, message: &str) {
        let written = self.open().and_then(|tty| {
            (&tty).write_all(message.as_bytes())?;
            (&tty).write_all(b"\n")
        });
        if let Err(e) = written {
            warn!("{message}");
            warn!(device = %self.device.display(), "terminal unavailable: {e}");
        }
    }
}
