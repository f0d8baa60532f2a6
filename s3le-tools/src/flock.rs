//! Advisory file locking with bounded retry.
//!
//! Several append-only record files are shared between concurrent worker
//! processes. Writers take an exclusive `flock` on the file before
//! appending and release it immediately after, retrying on contention
//! instead of blocking indefinitely so that a wedged peer cannot hang an
//! entire run.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Error};
use nix::fcntl::{flock, FlockArg};

/// Number of attempts `with_exclusive_lock` makes before giving up.
pub const DEFAULT_LOCK_RETRIES: u32 = 240;
/// Delay between retry attempts.
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Run `action` while holding an exclusive, non-blocking `flock` on `file`.
///
/// Retries up to `retries` times with `delay` between attempts if the lock
/// is currently held by another process. The lock is released as soon as
/// `action` returns, whether it succeeds or fails.
pub fn with_exclusive_lock<T>(
    file: &File,
    retries: u32,
    delay: Duration,
    action: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    let fd = file.as_raw_fd();
    let mut last_err = None;

    for attempt in 0..=retries {
        match flock(fd, FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                let result = action();
                let _ = flock(fd, FlockArg::Unlock);
                return result;
            }
            Err(err) => {
                last_err = Some(err);
                if attempt < retries {
                    sleep(delay);
                }
            }
        }
    }

    bail!(
        "failed to acquire exclusive lock after {} attempts: {}",
        retries + 1,
        last_err.expect("retries >= 0 guarantees at least one flock attempt")
    )
}
