//! Stdout capture for task and fork bodies.
//!
//! Swaps a temp file over file descriptor 1 for the duration of a body run,
//! then restores the original descriptor and reads the captured text back.
//! Capturing at the fd level picks up everything the body prints, including
//! writes that bypass Rust's `std::io::stdout` handle.

use nix::libc;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

fn check_fd(res: libc::c_int) -> io::Result<RawFd> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

/// Guard that redirects stdout into a temp file until finished or dropped.
#[derive(Debug)]
pub struct StdoutCapture {
    saved: Option<OwnedFd>,
    file: File,
}

impl StdoutCapture {
    /// Begin capturing. Only one capture may be active per process.
    pub fn begin() -> io::Result<Self> {
        io::stdout().flush()?;
        let file = tempfile::tempfile()?;

        let saved_raw = check_fd(unsafe { libc::dup(libc::STDOUT_FILENO) })?;
        let saved = unsafe { OwnedFd::from_raw_fd(saved_raw) };
        check_fd(unsafe { libc::dup2(file.as_raw_fd(), libc::STDOUT_FILENO) })?;

        Ok(Self {
            saved: Some(saved),
            file,
        })
    }

    /// Restore stdout and return everything written while captured.
    pub fn finish(mut self) -> io::Result<String> {
        self.restore()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut output = String::new();
        self.file.read_to_string(&mut output)?;
        Ok(output)
    }

    fn restore(&mut self) -> io::Result<()> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        io::stdout().flush()?;
        check_fd(unsafe { libc::dup2(saved.as_raw_fd(), libc::STDOUT_FILENO) })?;
        Ok(())
    }
}

impl Drop for StdoutCapture {
    fn drop(&mut self) {
        // Restore on unwind so a panicking body does not leave stdout
        // pointing at the temp file.
        let _ = self.restore();
    }
}
