use core::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

pub use nix::{
    errno::Errno,
    libc::{self, c_int, c_short, key_t, shmid_ds},
};

/// Creation flags ORed onto the permission bits by the callers of [`shm_get`]
/// and [`sem_get`].
pub mod flags {
    use super::{c_int, libc};

    pub const CREATE: c_int = libc::IPC_CREAT;
    pub const EXCL: c_int = libc::IPC_EXCL;
    pub const NOWAIT: c_int = libc::IPC_NOWAIT;
}

/// `shmget(2)`: looks up, or creates, the segment under `key`.
pub fn shm_get(key: key_t, size: usize, flags: c_int) -> nix::Result<c_int> {
    Errno::result(unsafe { libc::shmget(key, size, flags) })
}

/// `shmat(2)`: maps the segment `id` at an address chosen by the kernel.
pub fn shm_attach(id: c_int) -> nix::Result<NonNull<u8>> {
    let ptr = unsafe { libc::shmat(id, core::ptr::null(), 0) };
    if ptr as isize == -1 {
        return Err(Errno::last());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or(Errno::EINVAL)
}

/// `shmdt(2)`.
///
/// ## Safety
/// `addr` must be a mapping returned by [`shm_attach`] that is no longer
/// referenced by this process.
pub unsafe fn shm_detach(addr: NonNull<u8>) -> nix::Result<()> {
    let ptr = addr.as_ptr().cast::<c_void>().cast_const();
    Errno::result(unsafe { libc::shmdt(ptr) }).map(drop)
}

/// `shmctl(IPC_RMID)`: marks the segment for removal once the last
/// attachment goes away.
pub fn shm_remove(id: c_int) -> nix::Result<()> {
    Errno::result(unsafe { libc::shmctl(id, libc::IPC_RMID, core::ptr::null_mut()) }).map(drop)
}

/// `shmctl(IPC_STAT)`.
pub fn shm_stat(id: c_int) -> nix::Result<shmid_ds> {
    let mut buf = MaybeUninit::<shmid_ds>::uninit();
    Errno::result(unsafe { libc::shmctl(id, libc::IPC_STAT, buf.as_mut_ptr()) })?;
    // Safety: the kernel filled `buf` on success.
    Ok(unsafe { buf.assume_init() })
}

/// Key recorded in `ipc_perm`, on targets whose libc bindings expose it.
#[cfg(all(
    target_os = "linux",
    any(target_env = "gnu", target_env = "musl"),
    not(any(target_arch = "m68k", target_arch = "powerpc"))
))]
pub fn perm_key(perm: &libc::ipc_perm) -> Option<key_t> {
    Some(perm.__key)
}

#[cfg(target_vendor = "apple")]
pub fn perm_key(perm: &libc::ipc_perm) -> Option<key_t> {
    Some(perm._key)
}

#[cfg(not(any(
    all(
        target_os = "linux",
        any(target_env = "gnu", target_env = "musl"),
        not(any(target_arch = "m68k", target_arch = "powerpc"))
    ),
    target_vendor = "apple"
)))]
pub fn perm_key(_perm: &libc::ipc_perm) -> Option<key_t> {
    None
}

/// `semget(2)` for a set of `nsems` semaphores.
pub fn sem_get(key: key_t, nsems: c_int, flags: c_int) -> nix::Result<c_int> {
    Errno::result(unsafe { libc::semget(key, nsems, flags) })
}

/// `semctl(GETVAL)` on the first semaphore of the set.
pub fn sem_value(id: c_int) -> nix::Result<c_int> {
    Errno::result(unsafe { libc::semctl(id, 0, libc::GETVAL) })
}

/// `semctl(GETNCNT)`: processes blocked waiting for the value to grow.
pub fn sem_waiters(id: c_int) -> nix::Result<c_int> {
    Errno::result(unsafe { libc::semctl(id, 0, libc::GETNCNT) })
}

/// `semctl(SETVAL)`.
pub fn sem_set_value(id: c_int, value: c_int) -> nix::Result<()> {
    // The `semun` union is passed by value; its `val` member is a plain int.
    Errno::result(unsafe { libc::semctl(id, 0, libc::SETVAL, value) }).map(drop)
}

/// `semop(2)` with a single operation on the first semaphore of the set.
///
/// Blocks while `op` is negative and the value is too small, unless `flags`
/// carries [`flags::NOWAIT`].
pub fn sem_op(id: c_int, op: c_short, flags: c_int) -> nix::Result<()> {
    let mut sop = libc::sembuf {
        sem_num: 0,
        sem_op: op,
        sem_flg: flags as c_short,
    };
    Errno::result(unsafe { libc::semop(id, &mut sop, 1) }).map(drop)
}

/// `semctl(IPC_RMID)`: removes the set and wakes every waiter with `EIDRM`.
pub fn sem_remove(id: c_int) -> nix::Result<()> {
    Errno::result(unsafe { libc::semctl(id, 0, libc::IPC_RMID) }).map(drop)
}

#[cfg(test)]
mod tests {
    #![cfg(target_os = "linux")]

    use super::*;
    use crate::tests::unique_key;

    #[test]
    fn shm_raw_lifecycle() {
        const SIZE: usize = 4096;
        const VALUE: &[u8] = b"hello";

        let key = unique_key();
        let id = shm_get(key, SIZE, flags::CREATE | flags::EXCL | 0o600).expect("should create");
        assert_eq!(
            shm_get(key, SIZE, flags::CREATE | flags::EXCL | 0o600),
            Err(Errno::EEXIST)
        );

        let addr = shm_attach(id).expect("should attach");
        unsafe {
            core::ptr::copy_nonoverlapping(VALUE.as_ptr(), addr.as_ptr(), VALUE.len());
        }

        let ds = shm_stat(id).expect("should stat");
        assert_eq!(ds.shm_segsz as usize, SIZE);
        assert_eq!(ds.shm_nattch as u64, 1);

        let addr2 = shm_attach(id).expect("should attach twice");
        assert_ne!(addr, addr2);
        let read = unsafe { core::slice::from_raw_parts(addr2.as_ptr(), VALUE.len()) };
        assert_eq!(read, VALUE);

        unsafe {
            shm_detach(addr).unwrap();
            shm_detach(addr2).unwrap();
        }
        shm_remove(id).expect("should remove");
        assert_eq!(shm_get(key, SIZE, 0o600), Err(Errno::ENOENT));
    }

    #[test]
    fn sem_raw_lifecycle() {
        let key = unique_key();
        let id = sem_get(key, 1, flags::CREATE | 0o600).expect("should create");

        sem_set_value(id, 2).unwrap();
        assert_eq!(sem_value(id), Ok(2));
        sem_op(id, -2, 0).unwrap();
        assert_eq!(sem_op(id, -1, flags::NOWAIT), Err(Errno::EAGAIN));
        assert_eq!(sem_waiters(id), Ok(0));

        sem_remove(id).unwrap();
        assert!(sem_value(id).is_err());
    }
}
