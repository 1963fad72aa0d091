#![cfg(feature = "unix")]

use crate::{
    IPC_PRIVATE, Key,
    error::{Error, Result},
    mode::Mode,
    os::unix::{self, Errno, c_int, c_short, flags},
};

/// A System V counting semaphore: a kernel-held non-negative counter shared
/// by every process that opens the same key.
///
/// Constructing a value always creates or opens the kernel object; dropping
/// it leaves the object in place. Removal is explicit, via
/// [`destroy`](Self::destroy) or [`destroy_by_key`](Self::destroy_by_key).
#[derive(Debug)]
pub struct Semaphore {
    key: Key,
    id: c_int,
}

impl Semaphore {
    /// Id held by a destroyed handle. The kernel hands out `0` as a regular
    /// id, so the sentinel is negative.
    pub const INVALID_ID: c_int = -1;

    /// Creates the semaphore under `key`, or opens it if it already exists.
    ///
    /// A freshly created semaphore starts at `0`.
    pub fn new(key: Key, mode: Mode) -> Result<Self> {
        let id = unix::sem_get(key, 1, flags::CREATE | mode.as_flags())
            .map_err(Error::CreationFailed)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("[Sem]: opened key {:#x}, id {}", key, id);

        Ok(Self { key, id })
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    #[inline]
    pub fn id(&self) -> c_int {
        self.id
    }

    /// Overwrites the counter.
    ///
    /// Not ordered against operations already in flight in other processes.
    pub fn set_value(&self, value: i32) -> Result<()> {
        if value < 0 {
            return Err(Error::invalid(format!("semaphore value {value} is negative")));
        }
        let id = self.valid_id()?;
        unix::sem_set_value(id, value).map_err(Error::OperationFailed)
    }

    /// Current counter, read from the kernel.
    pub fn value(&self) -> Result<i32> {
        let id = self.valid_id()?;
        unix::sem_value(id).map_err(Error::OperationFailed)
    }

    /// Number of processes blocked in [`acquire`](Self::acquire).
    pub fn waiters(&self) -> Result<i32> {
        let id = self.valid_id()?;
        unix::sem_waiters(id).map_err(Error::OperationFailed)
    }

    /// Adds `count` to the counter, waking waiters as far as it allows.
    pub fn increase(&self, count: i32) -> Result<()> {
        let Some(op) = Self::op_count(count)? else {
            return Ok(());
        };
        let id = self.valid_id()?;
        unix::sem_op(id, op, 0).map_err(Error::OperationFailed)
    }

    /// Subtracts `count` from the counter, blocking the calling thread until
    /// that much is available.
    ///
    /// There is no timeout. A signal interrupting the wait surfaces as
    /// [`Error::OperationFailed`] with `EINTR`; removal of the semaphore
    /// meanwhile with `EIDRM`.
    pub fn decrease(&self, count: i32) -> Result<()> {
        let Some(op) = Self::op_count(count)? else {
            return Ok(());
        };
        let id = self.valid_id()?;
        unix::sem_op(id, -op, 0).map_err(Error::OperationFailed)
    }

    #[inline]
    pub fn release(&self, count: i32) -> Result<()> {
        self.increase(count)
    }

    #[inline]
    pub fn acquire(&self, count: i32) -> Result<()> {
        self.decrease(count)
    }

    /// Like [`acquire`](Self::acquire) but returns `false` instead of
    /// blocking when the counter is too small.
    pub fn try_acquire(&self, count: i32) -> Result<bool> {
        let Some(op) = Self::op_count(count)? else {
            return Ok(true);
        };
        let id = self.valid_id()?;
        match unix::sem_op(id, -op, flags::NOWAIT) {
            Ok(()) => Ok(true),
            Err(Errno::EAGAIN) => Ok(false),
            Err(e) => Err(Error::OperationFailed(e)),
        }
    }

    /// Removes the semaphore from the IPC namespace. Blocked waiters fail
    /// with `EIDRM`; this handle becomes invalid.
    pub fn destroy(&mut self) -> Result<()> {
        let id = self.valid_id()?;
        unix::sem_remove(id).map_err(Error::DestroyFailed)?;
        self.id = Self::INVALID_ID;

        #[cfg(feature = "tracing")]
        tracing::debug!("[Sem]: destroyed key {:#x}, id {}", self.key, id);

        Ok(())
    }

    /// Removes the semaphore under `key` without keeping a handle.
    ///
    /// Returns `Ok(false)` if there is no such semaphore.
    pub fn destroy_by_key(key: Key, mode: Mode) -> Result<bool> {
        // `semget(IPC_PRIVATE)` would create rather than look up.
        if key == IPC_PRIVATE {
            return Err(Error::invalid("private semaphores cannot be looked up by key"));
        }
        let id = match unix::sem_get(key, 1, mode.as_flags()) {
            Ok(id) => id,
            Err(Errno::ENOENT) => return Ok(false),
            Err(e) => return Err(Error::OperationFailed(e)),
        };
        unix::sem_remove(id).map_err(Error::DestroyFailed)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("[Sem]: destroyed key {:#x}, id {}", key, id);

        Ok(true)
    }

    #[inline]
    fn valid_id(&self) -> Result<c_int> {
        if self.id < 0 {
            return Err(Error::InvalidHandle);
        }
        Ok(self.id)
    }

    /// Validates a counter delta; `None` for the no-op `0`.
    fn op_count(count: i32) -> Result<Option<c_short>> {
        match count {
            0 => Ok(None),
            c if c < 0 => Err(Error::invalid(format!("semaphore count {c} is negative"))),
            c => c_short::try_from(c)
                .map(Some)
                .map_err(|_| Error::invalid(format!("semaphore count {c} exceeds {}", c_short::MAX))),
        }
    }
}

#[cfg(test)]
mod tests {
    #![cfg(target_os = "linux")]

    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::SharedSegment;
    use crate::tests::{tracing_init, unique_key};

    struct Cleanup(Key);

    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = Semaphore::destroy_by_key(self.0, Mode::default());
        }
    }

    /// Waits until a thread blocks on `sem`, failing if `waiter` returns first
    /// or nothing blocks within ten seconds.
    fn await_blocked<T>(sem: &Semaphore, waiter: &thread::JoinHandle<T>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while sem.waiters().unwrap() == 0 {
            assert!(!waiter.is_finished(), "waiter returned without blocking");
            assert!(Instant::now() < deadline, "no waiter blocked in time");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn round_trip() {
        tracing_init();
        let key = unique_key();
        let _guard = Cleanup(key);

        let sem = Semaphore::new(key, Mode::default()).expect("should create");
        assert_eq!(sem.key(), key);
        assert_eq!(sem.value(), Ok(0));

        sem.set_value(5).unwrap();
        assert_eq!(sem.value(), Ok(5));
        sem.acquire(3).unwrap();
        assert_eq!(sem.value(), Ok(2));
        sem.release(3).unwrap();
        assert_eq!(sem.value(), Ok(5));

        // A second handle on the same key sees the same counter.
        let other = Semaphore::new(key, Mode::default()).unwrap();
        assert_eq!(other.id(), sem.id());
        assert_eq!(other.value(), Ok(5));
    }

    #[test]
    fn counts() {
        let key = unique_key();
        let _guard = Cleanup(key);
        let sem = Semaphore::new(key, Mode::default()).unwrap();

        assert!(matches!(sem.decrease(-1), Err(Error::InvalidArgument(_))));
        assert!(matches!(sem.acquire(-1), Err(Error::InvalidArgument(_))));
        assert!(matches!(sem.increase(-1), Err(Error::InvalidArgument(_))));
        assert!(matches!(sem.release(40_000), Err(Error::InvalidArgument(_))));
        assert!(matches!(sem.set_value(-3), Err(Error::InvalidArgument(_))));

        // Zero never blocks, even on an empty counter.
        sem.acquire(0).unwrap();
        sem.release(0).unwrap();
        assert_eq!(sem.value(), Ok(0));
    }

    #[test]
    fn try_acquire() {
        let key = unique_key();
        let _guard = Cleanup(key);
        let sem = Semaphore::new(key, Mode::default()).unwrap();

        assert_eq!(sem.try_acquire(1), Ok(false));
        sem.release(2).unwrap();
        assert_eq!(sem.try_acquire(3), Ok(false));
        assert_eq!(sem.try_acquire(2), Ok(true));
        assert_eq!(sem.value(), Ok(0));
    }

    #[test]
    fn double_destroy() {
        let key = unique_key();
        let mut sem = Semaphore::new(key, Mode::default()).unwrap();

        sem.destroy().expect("first destroy");
        assert_eq!(sem.id(), Semaphore::INVALID_ID);
        assert_eq!(sem.destroy(), Err(Error::InvalidHandle));
        assert_eq!(sem.value(), Err(Error::InvalidHandle));
        assert_eq!(sem.release(1), Err(Error::InvalidHandle));
        assert_eq!(Semaphore::destroy_by_key(key, Mode::default()), Ok(false));
    }

    #[test]
    fn destroy_by_key() {
        let key = unique_key();
        let sem = Semaphore::new(key, Mode::default()).unwrap();
        drop(sem);

        // Dropping the handle leaves the kernel object.
        assert_eq!(Semaphore::destroy_by_key(key, Mode::default()), Ok(true));
        assert_eq!(Semaphore::destroy_by_key(key, Mode::default()), Ok(false));
    }

    #[test]
    fn release_orders_write() {
        tracing_init();
        const VALUE: u64 = 0xfeed_beef;
        let key = unique_key();
        let _guard = Cleanup(key);

        let sem = Arc::new(Semaphore::new(key, Mode::default()).unwrap());
        sem.set_value(0).unwrap();
        let shm = SharedSegment::open(key, 4096, Mode::default()).unwrap();
        let reader = shm.reopen().unwrap();

        let bar = Arc::new(Barrier::new(2));
        let waiter = {
            let sem = sem.clone();
            let bar = bar.clone();
            thread::spawn(move || {
                bar.wait();
                sem.acquire(1).unwrap();
                unsafe { reader.as_ptr().cast::<u64>().read_volatile() }
            })
        };

        bar.wait();
        await_blocked(&sem, &waiter);
        assert!(!waiter.is_finished());

        unsafe { shm.as_ptr().cast::<u64>().write_volatile(VALUE) };
        sem.release(1).unwrap();

        assert_eq!(waiter.join().unwrap(), VALUE);
        assert_eq!(sem.value(), Ok(0));
    }

    #[test]
    fn destroy_wakes_waiter() {
        let key = unique_key();
        let mut sem = Semaphore::new(key, Mode::default()).unwrap();
        let waiter = {
            let sem = Semaphore::new(key, Mode::default()).unwrap();
            thread::spawn(move || sem.acquire(1))
        };

        await_blocked(&sem, &waiter);
        sem.destroy().unwrap();

        let res = waiter.join().unwrap();
        assert_eq!(res.err().and_then(|e| e.errno()), Some(Errno::EIDRM));
    }
}
