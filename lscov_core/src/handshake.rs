//! Two-semaphore handshake over the execution channel.
//!
//! `targetReady` (target -> daemon, "buffer filled") and `slotFree`
//! (daemon -> target, "slot available") run the single slot in lock-step:
//!
//! `Ready` -> target claims, `Recording` -> target finishes, posts
//! `targetReady`, `Finished` -> daemon consumes, clears, posts `slotFree`
//! -> `Ready`.
//!
//! A target that dies mid-recording never posts, so the next target to
//! start finishes on the dead one's behalf before claiming (costing at most
//! that one observation). The daemon checks the lock-step invariant at
//! every wait: a `slotFree` count above 1 means the contract is corrupted
//! and the session must abort rather than keep estimating from garbage.

use crate::channel::{ChannelError, ExecutionChannel, LifecycleStatus};
use std::ffi::CString;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Well-known semaphore names; targets discover them by convention.
pub const DEFAULT_TARGET_READY_SEM: &str = "/lscov-target-ready";
pub const DEFAULT_SLOT_FREE_SEM: &str = "/lscov-slot-free";

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("sem_open for {name} failed: {source}")]
    Open { name: String, source: io::Error },
    #[error("wait on semaphore {name} failed: {source}")]
    Wait { name: String, source: io::Error },
    #[error("post on semaphore {name} failed: {source}")]
    Post { name: String, source: io::Error },
    #[error("reading value of semaphore {name} failed: {source}")]
    Value { name: String, source: io::Error },
    /// The lock-step invariant broke: continuing would silently corrupt
    /// the cardinality estimate.
    #[error("handshake corrupted: slot-free count is {count}, expected at most 1")]
    Corrupted { count: i32 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Names of the two handshake semaphores.
#[derive(Debug, Clone)]
pub struct HandshakeNames {
    pub target_ready: String,
    pub slot_free: String,
}

impl Default for HandshakeNames {
    fn default() -> Self {
        Self {
            target_ready: DEFAULT_TARGET_READY_SEM.to_string(),
            slot_free: DEFAULT_SLOT_FREE_SEM.to_string(),
        }
    }
}

/// Thin owner of one POSIX named semaphore.
#[derive(Debug)]
struct Semaphore {
    raw: *mut libc::sem_t,
    name: String,
    cname: CString,
    unlink_on_drop: bool,
}

unsafe impl Send for Semaphore {}

impl Semaphore {
    fn create(name: &str, initial: u32) -> Result<Self, HandshakeError> {
        let cname = Self::cname(name)?;
        // Clear any stale instance left by a crashed daemon before creating
        // exclusively; a *live* daemon is detected through the shm segment.
        unsafe { libc::sem_unlink(cname.as_ptr()) };
        let raw = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o644 as libc::mode_t,
                initial as libc::c_uint,
            )
        };
        if raw == libc::SEM_FAILED {
            return Err(HandshakeError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            raw,
            name: name.to_string(),
            cname,
            unlink_on_drop: true,
        })
    }

    fn open(name: &str) -> Result<Self, HandshakeError> {
        let cname = Self::cname(name)?;
        let raw = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if raw == libc::SEM_FAILED {
            return Err(HandshakeError::Open {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self {
            raw,
            name: name.to_string(),
            cname,
            unlink_on_drop: false,
        })
    }

    fn cname(name: &str) -> Result<CString, HandshakeError> {
        CString::new(name).map_err(|_| HandshakeError::Open {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "name contains NUL"),
        })
    }

    fn post(&self) -> Result<(), HandshakeError> {
        if unsafe { libc::sem_post(self.raw) } != 0 {
            return Err(HandshakeError::Post {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn wait(&self) -> Result<(), HandshakeError> {
        loop {
            if unsafe { libc::sem_wait(self.raw) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(HandshakeError::Wait {
                    name: self.name.clone(),
                    source: err,
                });
            }
        }
    }

    /// Bounded wait. `Ok(true)` on acquisition, `Ok(false)` on timeout or
    /// signal interruption, so the caller can revisit deadlines and the
    /// stop flag.
    fn wait_timeout(&self, timeout: Duration) -> Result<bool, HandshakeError> {
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline) };
        deadline.tv_sec += timeout.as_secs() as libc::time_t;
        deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }

        if unsafe { libc::sem_timedwait(self.raw, &deadline) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) | Some(libc::EINTR) => Ok(false),
            _ => Err(HandshakeError::Wait {
                name: self.name.clone(),
                source: err,
            }),
        }
    }

    fn value(&self) -> Result<i32, HandshakeError> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.raw, &mut value) } != 0 {
            return Err(HandshakeError::Value {
                name: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(value)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.raw);
            if self.unlink_on_drop {
                libc::sem_unlink(self.cname.as_ptr());
            }
        }
    }
}

/// Daemon half of the handshake. Creates both semaphores and owns their
/// system-wide names for the life of the session.
#[derive(Debug)]
pub struct DaemonEndpoint {
    target_ready: Semaphore,
    slot_free: Semaphore,
}

impl DaemonEndpoint {
    pub fn host(names: &HandshakeNames) -> Result<Self, HandshakeError> {
        Ok(Self {
            target_ready: Semaphore::create(&names.target_ready, 0)?,
            slot_free: Semaphore::create(&names.slot_free, 1)?,
        })
    }

    /// Bounded wait for a filled slot, after enforcing the lock-step sanity
    /// invariant. `Ok(true)` means a buffer is ready to consume.
    pub fn await_filled(&self, timeout: Duration) -> Result<bool, HandshakeError> {
        let count = self.slot_free.value()?;
        if count > 1 {
            return Err(HandshakeError::Corrupted { count });
        }
        self.target_ready.wait_timeout(timeout)
    }

    /// Hand the (cleared) slot back to the target side. Posting only from
    /// zero keeps the count at most 1 regardless of consume ordering.
    pub fn release_slot(&self) -> Result<(), HandshakeError> {
        if self.slot_free.value()? == 0 {
            self.slot_free.post()?;
        }
        Ok(())
    }
}

/// Target half of the handshake: claim the slot before an execution, mark
/// it finished after. One instance per target process.
#[derive(Debug)]
pub struct TargetEndpoint {
    target_ready: Semaphore,
    slot_free: Semaphore,
}

impl TargetEndpoint {
    pub fn join(names: &HandshakeNames) -> Result<Self, HandshakeError> {
        Ok(Self {
            target_ready: Semaphore::open(&names.target_ready)?,
            slot_free: Semaphore::open(&names.slot_free)?,
        })
    }

    /// Claims the slot for a new execution.
    ///
    /// A slot still marked `Recording` means the previous occupant died
    /// before finishing: mark it finished and post `targetReady` once on
    /// its behalf, so the daemon never blocks on a dead process. The
    /// crashed run costs one observation, nothing more.
    pub fn claim_slot(&self, channel: &ExecutionChannel) -> Result<(), HandshakeError> {
        if channel.status()? == LifecycleStatus::Recording {
            channel.set_status(LifecycleStatus::Finished);
            self.target_ready.post()?;
        }

        // Lock-step sanity, mirroring the daemon-side check.
        let count = self.slot_free.value()?;
        if count > 1 {
            return Err(HandshakeError::Corrupted { count });
        }

        self.slot_free.wait()?;
        channel.set_status(LifecycleStatus::Recording);
        Ok(())
    }

    /// Marks the recorded buffer complete and wakes the daemon.
    pub fn finish(&self, channel: &ExecutionChannel) -> Result<(), HandshakeError> {
        channel.set_status(LifecycleStatus::Finished);
        self.target_ready.post()
    }
}

#[cfg(test)]
impl TargetEndpoint {
    /// Posts `slotFree` outside the protocol, to simulate a corrupted
    /// contract in tests.
    pub(crate) fn post_slot_free_for_test(&self) {
        self.slot_free.post().unwrap();
    }
}
