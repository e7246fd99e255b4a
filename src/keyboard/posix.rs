use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{read_utf8_char, CharSource, KeyboardError};

/// Upper bound on how long a wait for input goes without checking `stop`.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Keyboard source for terminals with a POSIX line discipline.
///
/// Opening it turns off canonical mode and echo. `ISIG` stays on, so Ctrl+C
/// still raises SIGINT for the interrupt bridge. The descriptor stays in
/// blocking mode: its file status flags are shared with stdout on a
/// terminal, so waiting is done with `poll(2)` instead. The saved attributes
/// are put back when the source is dropped.
pub struct PosixCharSource {
    fd: RawFd,
    saved_termios: libc::termios,
}

impl PosixCharSource {
    /// Take over standard input.
    pub fn open() -> Result<Self, KeyboardError> {
        Self::from_fd(libc::STDIN_FILENO)
    }

    /// Take over an arbitrary terminal descriptor. The caller keeps
    /// ownership of `fd` and must keep it open while the source lives.
    pub fn from_fd(fd: RawFd) -> Result<Self, KeyboardError> {
        let mut termios = MaybeUninit::<libc::termios>::uninit();
        // SAFETY: tcgetattr fully initializes the struct when it returns 0.
        if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
            return Err(KeyboardError::TerminalMode(io::Error::last_os_error()));
        }
        // SAFETY: checked above.
        let saved_termios = unsafe { termios.assume_init() };

        let mut raw = saved_termios;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        raw.c_cc[libc::VMIN] = 1;
        raw.c_cc[libc::VTIME] = 0;
        // SAFETY: `raw` is a valid termios copied from the terminal.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
            return Err(KeyboardError::TerminalMode(io::Error::last_os_error()));
        }

        Ok(Self { fd, saved_termios })
    }

    /// Wait up to [`POLL_INTERVAL`] for input. `Ok(false)` means nothing
    /// arrived yet; `Ok(true)` means a read will not block.
    fn wait_readable(&self) -> Result<bool, KeyboardError> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: one valid pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL.as_millis() as libc::c_int) };
        match ready {
            0 => Ok(false),
            n if n > 0 => Ok(pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(KeyboardError::Read(err))
                }
            }
        }
    }

    /// Read a single byte once one is available.
    /// Gives up with `Ok(None)` once `stop` is cancelled or on end of input.
    fn read_byte(&mut self, stop: &CancellationToken) -> Result<Option<u8>, KeyboardError> {
        loop {
            if stop.is_cancelled() {
                return Ok(None);
            }
            if !self.wait_readable()? {
                continue;
            }

            let mut byte = 0u8;
            // SAFETY: reading at most one byte into a valid one-byte buffer.
            let n = unsafe { libc::read(self.fd, (&mut byte as *mut u8).cast(), 1) };
            match n {
                1 => return Ok(Some(byte)),
                0 => return Ok(None),
                _ => {
                    let err = io::Error::last_os_error();
                    match err.kind() {
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
                        _ => return Err(KeyboardError::Read(err)),
                    }
                }
            }
        }
    }
}

impl CharSource for PosixCharSource {
    fn next_char(&mut self, stop: &CancellationToken) -> Result<Option<char>, KeyboardError> {
        read_utf8_char(|| self.read_byte(stop))
    }
}

impl Drop for PosixCharSource {
    fn drop(&mut self) {
        // SAFETY: restoring attributes captured in `from_fd` on the same descriptor.
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.saved_termios);
        }
    }
}
