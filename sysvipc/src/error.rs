use nix::errno::Errno;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Every failure surfaced by [`SharedSegment`](crate::SharedSegment) and
/// [`Semaphore`](crate::Semaphore).
///
/// Variants name the condition the caller observes rather than the syscall
/// that failed, so recoverable cases (`NotFound` while probing,
/// `AlreadyAttached` on a reused handle) can be matched apart from
/// environmental failures such as `DestroyFailed`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Rejected before any OS call: bad key, bad count, oversize request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("a segment is already attached to this handle")]
    AlreadyAttached,
    #[error("no segment is attached to this handle")]
    NotAttached,
    /// The semaphore id was never valid or has been destroyed.
    #[error("invalid semaphore handle")]
    InvalidHandle,
    #[error("no such IPC object")]
    NotFound,
    #[error("access to IPC object denied")]
    AccessDenied,
    #[error("creating IPC object failed: {0}")]
    CreationFailed(#[source] Errno),
    #[error("detaching shared memory failed: {0}")]
    DetachFailed(#[source] Errno),
    #[error("destroying IPC object failed: {0}")]
    DestroyFailed(#[source] Errno),
    #[error("access to shared memory failed: {0}")]
    AccessFailed(#[source] Errno),
    #[error("semaphore operation failed: {0}")]
    OperationFailed(#[source] Errno),
}

impl Error {
    #[inline]
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// The OS error behind this failure, if one was involved.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::CreationFailed(e)
            | Self::DetachFailed(e)
            | Self::DestroyFailed(e)
            | Self::AccessFailed(e)
            | Self::OperationFailed(e) => Some(*e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_source() {
        use std::error::Error as _;

        let err = Error::DestroyFailed(Errno::EPERM);
        assert_eq!(err.errno(), Some(Errno::EPERM));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("destroying IPC object failed"));

        let err = Error::invalid("negative count");
        assert_eq!(err.errno(), None);
        assert_eq!(err.to_string(), "invalid argument: negative count");
    }
}
