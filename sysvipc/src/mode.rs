bitflags::bitflags! {
    /// Permission bits of an IPC object, as in `ipc_perm.mode`.
    ///
    /// Only the nine `rwx` bits are representable; creation flags such as
    /// `IPC_CREAT` are managed by the crate and cannot be passed through here.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Mode: u16 {
        const OWNER_READ  = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC  = 0o100;
        const GROUP_READ  = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_EXEC  = 0o010;
        const OTHER_READ  = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_EXEC  = 0o001;

        const OWNER_RW = Self::OWNER_READ.bits() | Self::OWNER_WRITE.bits();
        const GROUP_RW = Self::GROUP_READ.bits() | Self::GROUP_WRITE.bits();
        const OTHER_RW = Self::OTHER_READ.bits() | Self::OTHER_WRITE.bits();
    }
}

impl Mode {
    /// Builds a mode from octal notation, dropping anything above `0o777`.
    #[inline]
    pub const fn from_octal(bits: u32) -> Self {
        Self::from_bits_truncate((bits & 0o777) as u16)
    }

    #[inline]
    pub const fn as_octal(self) -> u32 {
        self.bits() as u32
    }

    #[cfg(feature = "unix")]
    #[inline]
    pub(crate) const fn as_flags(self) -> nix::libc::c_int {
        self.bits() as nix::libc::c_int
    }
}

/// Owner read/write, `0o600`.
impl Default for Mode {
    fn default() -> Self {
        Self::OWNER_RW
    }
}

impl core::fmt::Display for Mode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#05o}", self.bits())
    }
}
