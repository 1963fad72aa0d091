#![cfg(feature = "unix")]

use core::ptr::NonNull;

use crate::{
    IPC_PRIVATE, Key,
    error::{Error, Result},
    mode::Mode,
    os::{
        self,
        unix::{self, Errno, c_int, flags},
    },
};

/// What dropping a [`SharedSegment`] does to the OS resources it refers to.
///
/// Fixed when the handle is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposal {
    /// Leave the mapping in place until the process exits.
    Retain,
    /// Borrowed attachment: unmap, leave the segment to its other users.
    #[default]
    Detach,
    /// Owning segment: unmap and remove the segment from the IPC namespace.
    Destroy,
}

/// Receives errors swallowed while a [`SharedSegment`] is dropped.
pub type DisposeHook = Box<dyn Fn(&Error) + Send + Sync>;

/// Live kernel accounting of a segment, from `IPC_STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStats {
    /// Attachments across all processes.
    pub attached: u64,
    /// Segment size as the kernel sees it.
    pub size: usize,
    pub perm: Permissions,
    pub creator_pid: i32,
    /// Last process to attach or detach.
    pub last_pid: i32,
    pub attach_time: i64,
    pub detach_time: i64,
    pub change_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    /// Key the segment was created under; [`IPC_PRIVATE`] for private ones.
    pub key: Key,
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32,
    pub cgid: u32,
    pub mode: Mode,
}

impl From<&unix::shmid_ds> for SegmentStats {
    fn from(ds: &unix::shmid_ds) -> Self {
        let perm = &ds.shm_perm;
        Self {
            attached: ds.shm_nattch as u64,
            size: ds.shm_segsz as usize,
            perm: Permissions {
                key: unix::perm_key(perm).unwrap_or(IPC_PRIVATE),
                uid: perm.uid as u32,
                gid: perm.gid as u32,
                cuid: perm.cuid as u32,
                cgid: perm.cgid as u32,
                mode: Mode::from_octal(perm.mode as u32),
            },
            creator_pid: ds.shm_cpid as i32,
            last_pid: ds.shm_lpid as i32,
            attach_time: ds.shm_atime as i64,
            detach_time: ds.shm_dtime as i64,
            change_time: ds.shm_ctime as i64,
        }
    }
}

/// One attachment to a System V shared memory segment.
///
/// A handle is either *unattached* or *attached* to exactly one mapping.
/// Several handles, in this or other processes, may be attached to the same
/// segment; each gets its own address. The segment itself is refcounted by
/// the kernel and outlives the handle unless it is destroyed explicitly or
/// the handle was built with [`Disposal::Destroy`].
///
/// The handle never reads or writes the mapped bytes itself and performs no
/// locking; pair accesses with a [`Semaphore`](crate::Semaphore) when other
/// processes write concurrently.
pub struct SharedSegment {
    key: Key,
    id: Option<c_int>,
    addr: Option<NonNull<u8>>,
    size: usize,
    mode: Mode,
    owner: bool,
    removed: bool,
    disposal: Disposal,
    hook: Option<DisposeHook>,
}

// Safety: the handle only carries the mapping address; every dereference of
// it goes through `unsafe` accessors whose callers uphold synchronization.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl core::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("mode", &self.mode)
            .field("owner", &self.owner)
            .field("disposal", &self.disposal)
            .finish()
    }
}

impl SharedSegment {
    /// An unattached, borrowing handle for `key`.
    #[inline]
    pub const fn new(key: Key) -> Self {
        Self::with_disposal(key, Disposal::Detach)
    }

    /// An unattached handle that removes its segment when dropped.
    #[inline]
    pub const fn owning(key: Key) -> Self {
        Self::with_disposal(key, Disposal::Destroy)
    }

    pub const fn with_disposal(key: Key, disposal: Disposal) -> Self {
        Self {
            key,
            id: None,
            addr: None,
            size: 0,
            mode: Mode::OWNER_RW,
            owner: false,
            removed: false,
            disposal,
            hook: None,
        }
    }

    /// Attaches to `key`, creating the segment if nobody has yet.
    ///
    /// The handle owns (and destroys on drop) the segment iff this call
    /// created it.
    pub fn open(key: Key, size: usize, mode: Mode) -> Result<Self> {
        let mut shm = Self::new(key);
        shm.attach(size, mode)?;
        if shm.owner {
            shm.disposal = Disposal::Destroy;
        }
        Ok(shm)
    }

    /// Maps an existing segment by its OS id, e.g. one received from another
    /// process. The handle is borrowing and keyless.
    pub fn attach_id(id: c_int, size: usize) -> Result<Self> {
        if id < 0 {
            return Err(Error::invalid(format!("illegal shared memory id {id}")));
        }
        let addr = unix::shm_attach(id).map_err(|e| match e {
            Errno::EINVAL | Errno::EIDRM => Error::NotFound,
            Errno::EACCES => Error::AccessDenied,
            e => Error::AccessFailed(e),
        })?;

        let mut shm = Self::new(IPC_PRIVATE);
        shm.bind(id, addr, size, Mode::default(), false);
        Ok(shm)
    }

    /// Opens a second, independent attachment to the same segment.
    ///
    /// The new handle has its own address and only ever detaches on drop.
    /// Keyed segments are looked up again by key; private ones by id.
    pub fn reopen(&self) -> Result<Self> {
        match self.id {
            Some(id) if self.key == IPC_PRIVATE => {
                let mut shm = Self::attach_id(id, self.size)?;
                shm.mode = self.mode;
                Ok(shm)
            }
            _ if self.key > 0 => {
                let mut shm = Self::new(self.key);
                shm.attach(self.size, self.mode)?;
                Ok(shm)
            }
            _ => Err(Error::NotAttached),
        }
    }

    /// Installs a callback for errors swallowed while dropping.
    pub fn with_dispose_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Creates a new segment of `size` bytes under `key` and attaches it.
    ///
    /// Fails if `key` already names a segment; this handle becomes its owner.
    pub fn create(&mut self, key: Key, size: usize, mode: Mode) -> Result<NonNull<u8>> {
        if key <= 0 {
            return Err(Error::invalid(format!("illegal shared memory key {key}")));
        }
        if self.is_attached() {
            return Err(Error::AlreadyAttached);
        }
        let max = Self::max_size();
        if size > max {
            return Err(Error::invalid(format!(
                "requested {size} bytes, system allows at most {max}"
            )));
        }

        let id = unix::shm_get(key, size, flags::CREATE | flags::EXCL | mode.as_flags())
            .map_err(Error::CreationFailed)?;
        let addr = Self::map_created(id)?;

        self.key = key;
        self.bind(id, addr, size, mode, true);

        #[cfg(feature = "tracing")]
        tracing::debug!("[Shm]: created key {:#x}, id {}, size {}", key, id, size);

        Ok(addr)
    }

    /// Attaches to the segment under this handle's key.
    ///
    /// [`IPC_PRIVATE`] always yields a fresh private segment. Any other key
    /// is created exclusively first; if it already exists the existing
    /// segment is opened instead and this handle does not own it.
    pub fn attach(&mut self, size: usize, mode: Mode) -> Result<NonNull<u8>> {
        let key = self.key;
        if key < 0 {
            return Err(Error::invalid(format!("illegal shared memory key {key}")));
        }
        if self.is_attached() {
            return Err(Error::AlreadyAttached);
        }
        let max = Self::max_size();
        if size > max {
            return Err(Error::invalid(format!(
                "requested {size} bytes, system allows at most {max}"
            )));
        }

        let perm = mode.as_flags();
        let (id, owner) = if key == IPC_PRIVATE {
            let id = unix::shm_get(key, size, flags::CREATE | perm).map_err(Error::CreationFailed)?;
            (id, true)
        } else {
            match unix::shm_get(key, size, flags::CREATE | flags::EXCL | perm) {
                Ok(id) => (id, true),
                Err(Errno::EEXIST) => {
                    let id = unix::shm_get(key, size, perm).map_err(Error::CreationFailed)?;
                    (id, false)
                }
                Err(e) => return Err(Error::CreationFailed(e)),
            }
        };
        let addr = if owner {
            Self::map_created(id)?
        } else {
            unix::shm_attach(id).map_err(Error::CreationFailed)?
        };

        self.bind(id, addr, size, mode, owner);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[Shm]: attached key {:#x}, id {}, size {}, owner {}",
            key,
            id,
            size,
            owner
        );

        Ok(addr)
    }

    /// Unmaps the segment from this process. The segment itself stays.
    pub fn detach(&mut self) -> Result<()> {
        let addr = self.addr.ok_or(Error::NotAttached)?;
        // Safety: `addr` came from `shmat`; outstanding borrows of the bytes
        // are tied to `&self` and cannot outlive this `&mut self` call.
        unsafe { unix::shm_detach(addr) }.map_err(Error::DetachFailed)?;
        self.addr = None;

        #[cfg(feature = "tracing")]
        tracing::debug!("[Shm]: detached id {:?}", self.id);

        Ok(())
    }

    /// Detaches if needed and removes the segment from the IPC namespace.
    ///
    /// Other attachments keep working until they detach; the key becomes
    /// free immediately.
    pub fn destroy(&mut self) -> Result<()> {
        let id = self.id.ok_or(Error::NotAttached)?;
        if let Some(addr) = self.addr {
            unsafe { unix::shm_detach(addr) }.map_err(Error::DetachFailed)?;
        }
        self.addr = None;
        self.id = None;
        unix::shm_remove(id).map_err(Error::DestroyFailed)?;
        self.removed = true;

        #[cfg(feature = "tracing")]
        tracing::debug!("[Shm]: destroyed key {:#x}, id {}", self.key, id);

        Ok(())
    }

    /// Base address of the mapping, `None` while unattached.
    #[inline]
    pub fn get(&self) -> Option<NonNull<u8>> {
        self.addr
    }

    /// Base address of the mapping, null while unattached.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    /// The mapped bytes.
    ///
    /// ## Safety
    /// No other attachment, in any process, may write the segment while the
    /// slice is alive, and the segment must be at least [`size`](Self::size)
    /// bytes long.
    pub unsafe fn as_bytes(&self) -> Option<&[u8]> {
        self.addr
            .map(|addr| unsafe { core::slice::from_raw_parts(addr.as_ptr(), self.size) })
    }

    /// The mapped bytes, mutably.
    ///
    /// ## Safety
    /// No other attachment, in any process, may access the segment while the
    /// slice is alive, and the segment must be at least [`size`](Self::size)
    /// bytes long.
    pub unsafe fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        self.addr
            .map(|addr| unsafe { core::slice::from_raw_parts_mut(addr.as_ptr(), self.size) })
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.addr.is_some()
    }

    /// Whether this handle created the segment.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    #[inline]
    pub fn key(&self) -> Key {
        self.key
    }

    /// OS id of the segment, known once attached.
    #[inline]
    pub fn id(&self) -> Option<c_int> {
        self.id
    }

    /// Byte length requested at creation or attach time.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn disposal(&self) -> Disposal {
        self.disposal
    }

    pub fn stats(&self) -> Result<SegmentStats> {
        let id = self.id.ok_or(Error::AccessFailed(Errno::EINVAL))?;
        let ds = unix::shm_stat(id).map_err(Error::AccessFailed)?;
        let mut st = SegmentStats::from(&ds);
        // Some libc bindings hide the key; fall back to the one we used.
        if unix::perm_key(&ds.shm_perm).is_none() {
            st.perm.key = self.key;
        }
        Ok(st)
    }

    /// Number of attachments across all processes.
    pub fn n_attached(&self) -> Result<u64> {
        self.stats().map(|st| st.attached)
    }

    pub fn permissions(&self) -> Result<Permissions> {
        self.stats().map(|st| st.perm)
    }

    /// Segment size as recorded by the kernel.
    pub fn segment_size(&self) -> Result<usize> {
        self.stats().map(|st| st.size)
    }

    /// Whether a segment of at least `size` bytes exists under `key`.
    ///
    /// Absence is `Ok(false)`; a segment we may not access is
    /// [`Error::AccessDenied`].
    pub fn exists(key: Key, size: usize) -> Result<bool> {
        // `shmget(IPC_PRIVATE)` would create rather than look up.
        if key <= 0 {
            return Err(Error::invalid(format!("illegal shared memory key {key}")));
        }
        // No permission bits: the kernel then only checks that the segment
        // exists and is large enough, not that its mode matches ours.
        match unix::shm_get(key, size, 0) {
            Ok(_) => Ok(true),
            Err(Errno::ENOENT) => Ok(false),
            Err(Errno::EACCES) => Err(Error::AccessDenied),
            Err(e) => Err(Error::AccessFailed(e)),
        }
    }

    /// Largest segment the system allows, re-read on every call.
    ///
    /// `usize::MAX` when the limit cannot be determined.
    pub fn max_size() -> usize {
        os::shmmax().unwrap_or(usize::MAX)
    }

    /// Removes the segment under `key` without attaching to it.
    ///
    /// Returns `Ok(false)` if there is no such segment.
    pub fn destroy_by_key(key: Key, size: usize, mode: Mode) -> Result<bool> {
        if key <= 0 {
            return Err(Error::invalid(format!("illegal shared memory key {key}")));
        }
        let id = match unix::shm_get(key, size, mode.as_flags()) {
            Ok(id) => id,
            Err(Errno::ENOENT) => return Ok(false),
            Err(e) => return Err(Error::AccessFailed(e)),
        };
        unix::shm_remove(id).map_err(Error::DestroyFailed)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("[Shm]: destroyed key {:#x}, id {}", key, id);

        Ok(true)
    }

    fn bind(&mut self, id: c_int, addr: NonNull<u8>, size: usize, mode: Mode, owner: bool) {
        self.id = Some(id);
        self.addr = Some(addr);
        self.size = size;
        self.mode = mode;
        self.owner = owner;
        self.removed = false;
    }

    /// Maps a segment this process just created, removing it again if the
    /// mapping fails so it does not linger unreferenced.
    fn map_created(id: c_int) -> Result<NonNull<u8>> {
        unix::shm_attach(id).map_err(|e| {
            let _ = unix::shm_remove(id);
            Error::CreationFailed(e)
        })
    }

    fn report(&self, err: &Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "[Shm]: disposal of key {:#x}, id {:?} failed: {}",
            self.key,
            self.id,
            err
        );

        if let Some(hook) = &self.hook {
            hook(err);
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if self.disposal == Disposal::Retain {
            return;
        }
        if self.is_attached()
            && let Err(err) = self.detach()
        {
            self.report(&err);
        }
        if self.disposal != Disposal::Destroy || self.removed {
            return;
        }

        let res = match self.id {
            Some(id) => unix::shm_remove(id).map_err(Error::DestroyFailed),
            None if self.key > 0 => Self::destroy_by_key(self.key, self.size, self.mode).map(drop),
            None => Ok(()),
        };
        if let Err(err) = res {
            self.report(&err);
        }
    }
}
