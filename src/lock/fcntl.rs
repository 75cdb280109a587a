//! POSIX advisory byte-range lock primitive.
//!
//! On Linux the open-file-description variants (`F_OFD_SETLK*`) are used so
//! that locks belong to the file handle rather than the process: two handles
//! in one process contend exactly like two processes, and closing one handle
//! never drops the other's locks. Other Unix systems fall back to classic
//! process-scoped `fcntl` locks.

use std::fs::File;
use std::os::fd::AsRawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};

use super::{LockMode, LockWait};
use crate::error::Result;

fn flock(kind: libc::c_int, start: u64, len: u64) -> libc::flock {
    // SAFETY: `flock` is a plain C struct for which all-zero is valid; on
    // Linux OFD locks additionally require `l_pid == 0`.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_lock(file: &File, fl: &libc::flock, wait: LockWait) -> nix::Result<libc::c_int> {
    let arg = match wait {
        LockWait::Block => FcntlArg::F_OFD_SETLKW(fl),
        LockWait::NoWait => FcntlArg::F_OFD_SETLK(fl),
    };
    fcntl(file.as_raw_fd(), arg)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_lock(file: &File, fl: &libc::flock, wait: LockWait) -> nix::Result<libc::c_int> {
    let arg = match wait {
        LockWait::Block => FcntlArg::F_SETLKW(fl),
        LockWait::NoWait => FcntlArg::F_SETLK(fl),
    };
    fcntl(file.as_raw_fd(), arg)
}

/// Take (or convert) a lock on `[start, start + len)`.
///
/// Returns `Ok(false)` if a non-blocking request found the range busy.
pub(crate) fn lock_range(
    file: &File,
    start: u64,
    len: u64,
    mode: LockMode,
    wait: LockWait,
) -> Result<bool> {
    let kind = match mode {
        LockMode::Shared => libc::F_RDLCK,
        LockMode::Exclusive => libc::F_WRLCK,
    };
    let fl = flock(kind as libc::c_int, start, len);
    loop {
        match set_lock(file, &fl, wait) {
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN | Errno::EACCES) if wait == LockWait::NoWait => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Release any lock on `[start, start + len)`
pub(crate) fn unlock_range(file: &File, start: u64, len: u64) -> Result<()> {
    let fl = flock(libc::F_UNLCK as libc::c_int, start, len);
    loop {
        match set_lock(file, &fl, LockWait::NoWait) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
