//! Shared-memory execution channel between the daemon and the instrumented
//! target process.
//!
//! The segment layout is one lifecycle-status byte followed by `STATE_SIZE`
//! hit-count bytes. Keeping the status structurally separate from the data
//! area means instrumentation writes can never be mistaken for protocol
//! signaling. Both sides must agree on this layout and on the key.

use std::io;
use std::ptr;
use std::slice;
use thiserror::Error;

/// Fixed size of the per-execution hit-count area, in bytes. Index = edge
/// identifier, value = saturating visit count. Must match the
/// instrumentation side exactly.
pub const STATE_SIZE: usize = 1 << 16;

/// Well-known SysV IPC key ("LSCV"). Targets discover the segment by this
/// key; there is no dynamic negotiation.
pub const DEFAULT_SHM_KEY: i32 = 0x4c53_4356;

const SEGMENT_SIZE: usize = STATE_SIZE + 1;

/// Per-slot lifecycle signal, stored in the segment's leading byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleStatus {
    /// Cleared and available for a target to claim.
    Ready = 0,
    /// A target claimed the slot and may still be writing.
    Recording = 1,
    /// The target signaled completion; the daemon may consume.
    Finished = 2,
}

impl LifecycleStatus {
    fn from_raw(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Ready),
            1 => Some(Self::Recording),
            2 => Some(Self::Finished),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ChannelError {
    /// The segment already exists. A previous daemon may still be running
    /// (or died without cleanup); retrying silently would mask that.
    #[error("shared memory segment for key {key:#x} already exists (another daemon running?)")]
    AlreadyExists { key: i32 },
    #[error("shmget for key {key:#x} failed: {source}")]
    Create { key: i32, source: io::Error },
    #[error("no shared memory segment for key {key:#x} (daemon not started?): {source}")]
    NotFound { key: i32, source: io::Error },
    #[error("shmat failed: {0}")]
    Map(io::Error),
    #[error("unrecognized lifecycle status byte {0:#04x} in shared segment")]
    CorruptStatus(u8),
}

/// One mapped execution slot: the daemon creates and owns it, targets attach
/// to it. Exactly one writer (the current target) and one reader (the
/// daemon) at a time, enforced by the handshake semaphores rather than any
/// in-memory lock.
#[derive(Debug)]
pub struct ExecutionChannel {
    shm_id: i32,
    base: *mut u8,
    owner: bool,
}

// The raw mapping is only touched through the handshake discipline; the
// struct itself moves freely between threads.
unsafe impl Send for ExecutionChannel {}

impl ExecutionChannel {
    /// Daemon side: create the segment, refusing to reuse an existing one.
    pub fn create(key: i32) -> Result<Self, ChannelError> {
        let shm_id = unsafe {
            libc::shmget(
                key,
                SEGMENT_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if shm_id < 0 {
            let source = io::Error::last_os_error();
            return Err(if source.raw_os_error() == Some(libc::EEXIST) {
                ChannelError::AlreadyExists { key }
            } else {
                ChannelError::Create { key, source }
            });
        }

        let channel = Self::map(shm_id, true).inspect_err(|_| unsafe {
            libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut());
        })?;

        // Fresh SysV segments are zeroed by the kernel, which is exactly
        // Ready + all-zero counts, but make it explicit.
        channel.clear();
        Ok(channel)
    }

    /// Target side: attach to the daemon's existing segment.
    pub fn attach(key: i32) -> Result<Self, ChannelError> {
        let shm_id = unsafe { libc::shmget(key, SEGMENT_SIZE, 0o600) };
        if shm_id < 0 {
            return Err(ChannelError::NotFound {
                key,
                source: io::Error::last_os_error(),
            });
        }
        Self::map(shm_id, false)
    }

    fn map(shm_id: i32, owner: bool) -> Result<Self, ChannelError> {
        let base = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        if base == usize::MAX as *mut libc::c_void {
            return Err(ChannelError::Map(io::Error::last_os_error()));
        }
        Ok(Self {
            shm_id,
            base: base.cast::<u8>(),
            owner,
        })
    }

    pub fn status(&self) -> Result<LifecycleStatus, ChannelError> {
        let byte = unsafe { ptr::read_volatile(self.base) };
        LifecycleStatus::from_raw(byte).ok_or(ChannelError::CorruptStatus(byte))
    }

    pub fn set_status(&self, status: LifecycleStatus) {
        unsafe { ptr::write_volatile(self.base, status as u8) }
    }

    /// Read view of the hit counts. Only valid to consume while the slot is
    /// `Finished` and before it is released back to the target.
    pub fn hit_counts(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base.add(1), STATE_SIZE) }
    }

    /// Write view of the hit counts, for the side currently holding the
    /// slot.
    pub fn hit_counts_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.base.add(1), STATE_SIZE) }
    }

    /// Zero the data area and mark the slot `Ready` for the next claimant.
    pub fn clear(&self) {
        unsafe { ptr::write_bytes(self.base.add(1), 0, STATE_SIZE) };
        self.set_status(LifecycleStatus::Ready);
    }
}

impl Drop for ExecutionChannel {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.base.cast::<libc::c_void>());
            if self.owner {
                libc::shmctl(self.shm_id, libc::IPC_RMID, ptr::null_mut());
            }
        }
    }
}
