//! Recovery from stalled USB transfers. A timed-out transfer is never retried
//! in place: the device session is cycled first, once without and once with a
//! full rescan, and only then does the failure surface to the caller.

use std::sync::atomic::{AtomicBool, Ordering};

/// Floor for every transfer deadline, in seconds.
const MIN_TRANSFER_TIMEOUT: u64 = 10;

/// Deadline for downloading an object of `len` bytes.
pub fn read_timeout(per_byte: u64, len: u64) -> u32 {
    scale_timeout(per_byte, len)
}

/// Deadline for uploading an object of `len` bytes.
pub fn write_timeout(per_byte: u64, len: u64) -> u32 {
    scale_timeout(per_byte, len)
}

fn scale_timeout(per_byte: u64, len: u64) -> u32 {
    per_byte
        .saturating_mul(len)
        .max(MIN_TRANSFER_TIMEOUT)
        .min(u32::MAX as u64) as u32
}

/// The escalation ladder. Each failed attempt moves one rung down; there is no
/// way back up within one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryLevel {
    /// Close and reopen the device, keeping the in-memory trees.
    Reopen,
    /// Close and reopen with a full storage rescan.
    Reconnect,
}

/// Tracks how many times one operation has cycled the device. Two levels, then
/// give up.
#[derive(Debug, Default)]
pub struct Recovery {
    attempts: u8,
}

impl Recovery {
    pub fn new() -> Self {
        Recovery::default()
    }

    /// The next level to try, or `None` once both levels are exhausted.
    pub fn escalate(&mut self) -> Option<RecoveryLevel> {
        let level = match self.attempts {
            0 => Some(RecoveryLevel::Reopen),
            1 => Some(RecoveryLevel::Reconnect),
            _ => None,
        };
        if level.is_some() {
            self.attempts += 1;
        }
        level
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }
}

static TRANSFER_TIMED_OUT: AtomicBool = AtomicBool::new(false);

extern "C" fn alarm_handler(_signal: libc::c_int) {
    TRANSFER_TIMED_OUT.store(true, Ordering::SeqCst);
}

/// A process-level SIGALRM deadline around one bulk transfer. The handler only
/// sets a flag; the interrupted syscall makes the native call return early.
/// Disarmed and restored on drop.
pub struct TransferAlarm {
    previous: libc::sigaction,
}

impl TransferAlarm {
    pub fn arm(seconds: u32) -> Self {
        TRANSFER_TIMED_OUT.store(false, Ordering::SeqCst);

        let previous = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = alarm_handler as usize;
            // No SA_RESTART: the blocked USB read must come back with EINTR.
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);

            let mut previous: libc::sigaction = std::mem::zeroed();
            libc::sigaction(libc::SIGALRM, &action, &mut previous);
            libc::alarm(seconds);
            previous
        };

        TransferAlarm { previous }
    }

    /// Whether the deadline fired while this alarm was armed.
    pub fn fired(&self) -> bool {
        TRANSFER_TIMED_OUT.load(Ordering::SeqCst)
    }
}

impl Drop for TransferAlarm {
    fn drop(&mut self) {
        unsafe {
            libc::alarm(0);
            libc::sigaction(libc::SIGALRM, &self.previous, std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_runs_reopen_then_reconnect_then_stops() {
        let mut recovery = Recovery::new();
        assert_eq!(recovery.escalate(), Some(RecoveryLevel::Reopen));
        assert_eq!(recovery.escalate(), Some(RecoveryLevel::Reconnect));
        assert_eq!(recovery.escalate(), None);
        assert_eq!(recovery.escalate(), None);
        assert_eq!(recovery.attempts(), 2);
    }

    #[test]
    fn timeouts_never_drop_below_the_floor() {
        assert_eq!(read_timeout(2, 0), 10);
        assert_eq!(read_timeout(2, 3), 10);
        assert_eq!(write_timeout(2, 4), 10);
    }

    #[test]
    fn timeouts_scale_with_object_size() {
        assert_eq!(read_timeout(2, 100), 200);
        assert_eq!(write_timeout(1, 1 << 20), 1 << 20);
    }

    #[test]
    fn oversized_timeouts_saturate() {
        assert_eq!(read_timeout(u64::MAX, u64::MAX), u32::MAX);
    }
}
