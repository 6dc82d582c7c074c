// SPDX-License-Identifier: MIT
//! Shared-memory submission channel.
//!
//! A POSIX shm object under a well-known name carries job submissions from
//! the interactive shell to the scheduler daemon. The region holds a bounded
//! single-producer/single-consumer ring of fixed-layout records with atomic
//! read/write cursors, so many submissions can be outstanding at once and a
//! full ring blocks the submitter instead of dropping data. The shell is the
//! only producer and the daemon's dispatcher the only consumer.

use std::num::NonZeroUsize;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::ftruncate;
use thiserror::Error;

/// Well-known shm name shared by every participant.
pub const CHANNEL_NAME: &str = "/psched-submissions";

/// Ring slots. One slot stays empty to distinguish full from empty, so the
/// channel holds up to `CHANNEL_CAPACITY - 1` undrained submissions.
pub const CHANNEL_CAPACITY: u32 = 256;

/// Size of the executable-name field, including the trailing NUL.
pub const NAME_MAX: usize = 256;

const MAGIC: u32 = 0x5053_4a51; // "PSJQ"

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to create shared-memory channel: {0}")]
    Create(#[source] nix::Error),
    #[error("failed to open shared-memory channel: {0}")]
    Open(#[source] nix::Error),
    #[error("failed to map shared-memory channel: {0}")]
    Map(#[source] nix::Error),
    #[error("channel exists but is not initialized yet")]
    Uninitialized,
    #[error("submission ring is full")]
    Full,
    #[error("executable name of {0} bytes does not fit the submission record")]
    NameTooLong(usize),
}

/// One submission as handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub name: String,
    pub priority: i32,
}

/// Fixed-layout record stored in a ring slot.
///
/// Only `name` and `priority` are meaningful at submission time; the runtime
/// fields exist so the record mirrors the scheduler's per-job bookkeeping and
/// are assigned on the scheduler side only.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct JobRecord {
    pub name: [u8; NAME_MAX],
    pub priority: i32,
    pub pid: i32,
    pub running: bool,
    pub start_ms: i64,
    pub end_ms: i64,
    pub wait_ms: i64,
}

impl JobRecord {
    fn new(name: &str, priority: i32) -> Result<Self, ChannelError> {
        let bytes = name.as_bytes();
        if bytes.len() >= NAME_MAX {
            return Err(ChannelError::NameTooLong(bytes.len()));
        }
        let mut rec = JobRecord {
            name: [0u8; NAME_MAX],
            priority,
            pid: -1,
            running: false,
            start_ms: 0,
            end_ms: 0,
            wait_ms: 0,
        };
        rec.name[..bytes.len()].copy_from_slice(bytes);
        Ok(rec)
    }

    fn name_string(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// Cursor block at the start of the mapping. `magic` is written last during
/// initialization so an attaching process never observes a half-built ring.
#[repr(C)]
struct ChannelHeader {
    magic: AtomicU32,
    capacity: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
}

const REGION_LEN: usize =
    std::mem::size_of::<ChannelHeader>() + CHANNEL_CAPACITY as usize * std::mem::size_of::<JobRecord>();

#[derive(Debug)]
pub struct SubmissionChannel {
    base: NonNull<libc::c_void>,
}

// The mapping is shared memory; cross-thread moves are safe because all
// cursor traffic goes through the header atomics.
unsafe impl Send for SubmissionChannel {}

impl SubmissionChannel {
    /// Create (or re-initialize) the channel. The scheduler side calls this;
    /// leftovers from a crashed run are reset rather than trusted.
    pub fn create(name: &str) -> Result<Self, ChannelError> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(ChannelError::Create)?;
        ftruncate(&fd, REGION_LEN as libc::off_t).map_err(ChannelError::Create)?;
        let chan = Self::map(&fd)?;

        let hdr = chan.header();
        hdr.head.store(0, Ordering::Relaxed);
        hdr.tail.store(0, Ordering::Relaxed);
        hdr.capacity.store(CHANNEL_CAPACITY, Ordering::Relaxed);
        hdr.magic.store(MAGIC, Ordering::Release);
        Ok(chan)
    }

    /// Attach to an existing channel. Fails if the object is missing or the
    /// creator has not finished initializing it.
    pub fn open(name: &str) -> Result<Self, ChannelError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(ChannelError::Open)?;
        let stat = fstat(&fd).map_err(ChannelError::Open)?;
        if (stat.st_size as usize) < REGION_LEN {
            return Err(ChannelError::Uninitialized);
        }
        let chan = Self::map(&fd)?;
        if chan.header().magic.load(Ordering::Acquire) != MAGIC {
            return Err(ChannelError::Uninitialized);
        }
        Ok(chan)
    }

    fn map(fd: &std::os::fd::OwnedFd) -> Result<Self, ChannelError> {
        let len = NonZeroUsize::new(REGION_LEN).expect("region length is non-zero");
        let base = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(ChannelError::Map)?;
        Ok(Self { base })
    }

    /// Remove the shm name. Existing mappings stay valid until unmapped.
    pub fn unlink(name: &str) -> Result<(), ChannelError> {
        shm_unlink(name).map_err(ChannelError::Open)
    }

    fn header(&self) -> &ChannelHeader {
        unsafe { &*(self.base.as_ptr() as *const ChannelHeader) }
    }

    fn slot(&self, idx: u32) -> *mut JobRecord {
        unsafe {
            (self.base.as_ptr() as *mut u8)
                .add(std::mem::size_of::<ChannelHeader>())
                .cast::<JobRecord>()
                .add(idx as usize)
        }
    }

    /// Append one submission; `ChannelError::Full` when no slot is free.
    pub fn try_submit(&self, name: &str, priority: i32) -> Result<(), ChannelError> {
        let rec = JobRecord::new(name, priority)?;
        let hdr = self.header();
        let cap = hdr.capacity.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Relaxed);
        let head = hdr.head.load(Ordering::Acquire);
        if (tail + 1) % cap == head {
            return Err(ChannelError::Full);
        }
        unsafe { ptr::write(self.slot(tail), rec) };
        hdr.tail.store((tail + 1) % cap, Ordering::Release);
        Ok(())
    }

    /// Append one submission, blocking while the ring is full. A stalled
    /// consumer therefore stalls the submitter rather than losing records.
    pub fn submit(&self, name: &str, priority: i32) -> Result<(), ChannelError> {
        loop {
            match self.try_submit(name, priority) {
                Err(ChannelError::Full) => thread::sleep(Duration::from_millis(1)),
                other => return other,
            }
        }
    }

    /// Remove and return every queued submission, in submission order.
    pub fn drain(&self) -> Vec<Submission> {
        let hdr = self.header();
        let cap = hdr.capacity.load(Ordering::Relaxed);
        let mut head = hdr.head.load(Ordering::Relaxed);
        let tail = hdr.tail.load(Ordering::Acquire);
        let mut out = Vec::new();
        while head != tail {
            let rec = unsafe { ptr::read(self.slot(head)) };
            out.push(Submission {
                name: rec.name_string(),
                priority: rec.priority,
            });
            head = (head + 1) % cap;
            hdr.head.store(head, Ordering::Release);
        }
        out
    }

    /// Number of undrained submissions.
    pub fn len(&self) -> usize {
        let hdr = self.header();
        let cap = hdr.capacity.load(Ordering::Relaxed);
        let head = hdr.head.load(Ordering::Acquire);
        let tail = hdr.tail.load(Ordering::Acquire);
        ((tail + cap - head) % cap) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SubmissionChannel {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base, REGION_LEN) } {
            log::warn!("failed to unmap submission channel: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static TEST_ID: AtomicU64 = AtomicU64::new(0);

    fn test_name() -> String {
        format!(
            "/psched-test-{}-{}",
            std::process::id(),
            TEST_ID.fetch_add(1, Ordering::Relaxed)
        )
    }

    struct Unlinker(String);
    impl Drop for Unlinker {
        fn drop(&mut self) {
            let _ = SubmissionChannel::unlink(&self.0);
        }
    }

    #[test]
    fn submissions_drain_in_order() {
        let name = test_name();
        let _cleanup = Unlinker(name.clone());
        let chan = SubmissionChannel::create(&name).unwrap();

        chan.submit("alpha", 5).unwrap();
        chan.submit("beta", 1).unwrap();
        chan.submit("gamma", 9).unwrap();

        let drained = chan.drain();
        assert_eq!(
            drained,
            vec![
                Submission { name: "alpha".into(), priority: 5 },
                Submission { name: "beta".into(), priority: 1 },
                Submission { name: "gamma".into(), priority: 9 },
            ]
        );
        assert!(chan.is_empty());
    }

    #[test]
    fn open_attaches_to_created_channel() {
        let name = test_name();
        let _cleanup = Unlinker(name.clone());
        let producer = SubmissionChannel::create(&name).unwrap();
        let consumer = SubmissionChannel::open(&name).unwrap();

        producer.submit("job", 2).unwrap();
        let drained = consumer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "job");
        assert_eq!(drained[0].priority, 2);
    }

    #[test]
    fn open_missing_channel_fails() {
        let err = SubmissionChannel::open("/psched-test-does-not-exist").unwrap_err();
        assert!(matches!(err, ChannelError::Open(_)));
    }

    #[test]
    fn full_ring_rejects_and_recovers() {
        let name = test_name();
        let _cleanup = Unlinker(name.clone());
        let chan = SubmissionChannel::create(&name).unwrap();

        let mut accepted = 0u32;
        loop {
            match chan.try_submit(&format!("job-{accepted}"), 0) {
                Ok(()) => accepted += 1,
                Err(ChannelError::Full) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(accepted, CHANNEL_CAPACITY - 1);

        // Draining frees slots; the ring keeps working across the wrap.
        assert_eq!(chan.drain().len(), accepted as usize);
        chan.try_submit("after-wrap", 3).unwrap();
        let drained = chan.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "after-wrap");
    }

    #[test]
    fn oversized_name_is_rejected() {
        let name = test_name();
        let _cleanup = Unlinker(name.clone());
        let chan = SubmissionChannel::create(&name).unwrap();

        let long = "x".repeat(NAME_MAX);
        let err = chan.try_submit(&long, 1).unwrap_err();
        assert!(matches!(err, ChannelError::NameTooLong(n) if n == NAME_MAX));
        assert!(chan.is_empty());
    }

    #[test]
    fn blocked_submit_resumes_after_drain() {
        let name = test_name();
        let _cleanup = Unlinker(name.clone());
        let producer = SubmissionChannel::create(&name).unwrap();
        let consumer = SubmissionChannel::open(&name).unwrap();

        while producer.try_submit("filler", 0).is_ok() {}

        let handle = thread::spawn(move || {
            producer.submit("late", 7).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        let first = consumer.drain();
        assert_eq!(first.len(), (CHANNEL_CAPACITY - 1) as usize);
        handle.join().unwrap();

        let second = consumer.drain();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].name, "late");
    }
}
