//! Shutdown state (C7)
//!
//! First-writer-wins tracking of why a connection direction closed and
//! which socket error it carried, spec §4.7. A single atomic word holds
//! the `ShutdownKind`; `socket_error_code` is a separate cell written only
//! by the CAS that lands the state on a socket-error kind.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

/// Why a connection direction closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownKind {
    None = 0,
    ReadEof = 1,
    WriteEof = 2,
    ReadSocketError = 3,
    WriteSocketError = 4,
    ReadFlushCompleted = 5,
    ReadFlushCanceled = 6,
    ReadDisposed = 7,
    WriteDisposed = 8,
    ReadIoError = 9,
    WriteIoError = 10,
    ReadOtherError = 11,
    WriteOtherError = 12,
}

impl ShutdownKind {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::ReadEof,
            2 => Self::WriteEof,
            3 => Self::ReadSocketError,
            4 => Self::WriteSocketError,
            5 => Self::ReadFlushCompleted,
            6 => Self::ReadFlushCanceled,
            7 => Self::ReadDisposed,
            8 => Self::WriteDisposed,
            9 => Self::ReadIoError,
            10 => Self::WriteIoError,
            11 => Self::ReadOtherError,
            _ => Self::WriteOtherError,
        }
    }

    const fn carries_socket_error(self) -> bool {
        matches!(self, Self::ReadSocketError | Self::WriteSocketError)
    }
}

impl fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::ReadEof => "read_eof",
            Self::WriteEof => "write_eof",
            Self::ReadSocketError => "read_socket_error",
            Self::WriteSocketError => "write_socket_error",
            Self::ReadFlushCompleted => "read_flush_completed",
            Self::ReadFlushCanceled => "read_flush_canceled",
            Self::ReadDisposed => "read_disposed",
            Self::WriteDisposed => "write_disposed",
            Self::ReadIoError => "read_io_error",
            Self::WriteIoError => "write_io_error",
            Self::ReadOtherError => "read_other_error",
            Self::WriteOtherError => "write_other_error",
        };
        f.write_str(s)
    }
}

/// CAS-only shutdown tracker for one `StreamConnection` or `FrameChannel`.
///
/// `set(kind)` only has an effect the first time it is called with a
/// non-`None` kind; every subsequent call is ignored. This matches spec
/// §4.7's "all subsequent writes are ignored".
#[derive(Debug, Default)]
pub struct ShutdownState {
    kind: AtomicU8,
    socket_error_code: AtomicI32,
}

impl ShutdownState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: AtomicU8::new(ShutdownKind::None as u8),
            socket_error_code: AtomicI32::new(0),
        }
    }

    /// Current shutdown kind.
    #[must_use]
    pub fn kind(&self) -> ShutdownKind {
        ShutdownKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    /// The socket error code, if the winning kind carried one.
    #[must_use]
    pub fn socket_error_code(&self) -> Option<i32> {
        if self.kind().carries_socket_error() {
            Some(self.socket_error_code.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Attempt to move the state from `None` to `kind`. Returns `true` iff
    /// this call won the race; all later callers observe `false` and the
    /// first-set kind via [`Self::kind`].
    pub fn set(&self, kind: ShutdownKind) -> bool {
        self.set_with_error_code(kind, 0)
    }

    /// Same as [`Self::set`], additionally recording a socket error code.
    /// The code is only retained if this call is the one that wins the CAS
    /// and `kind` carries a socket error.
    pub fn set_with_error_code(&self, kind: ShutdownKind, error_code: i32) -> bool {
        let won = self
            .kind
            .compare_exchange(
                ShutdownKind::None as u8,
                kind as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won && kind.carries_socket_error() {
            self.socket_error_code.store(error_code, Ordering::Release);
        }
        won
    }

    /// `true` once any non-`None` kind has landed.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.kind() != ShutdownKind::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_writer_wins() {
        let s = ShutdownState::new();
        assert_eq!(s.kind(), ShutdownKind::None);
        assert!(s.set(ShutdownKind::ReadEof));
        assert!(!s.set(ShutdownKind::WriteEof));
        assert_eq!(s.kind(), ShutdownKind::ReadEof);
    }

    #[test]
    fn socket_error_code_only_for_socket_error_kinds() {
        let s = ShutdownState::new();
        assert!(s.set_with_error_code(ShutdownKind::ReadSocketError, 104));
        assert_eq!(s.socket_error_code(), Some(104));

        let s2 = ShutdownState::new();
        assert!(s2.set(ShutdownKind::ReadEof));
        assert_eq!(s2.socket_error_code(), None);
    }

    #[test]
    fn monotonic_once_set() {
        let s = ShutdownState::new();
        assert!(s.set(ShutdownKind::ReadDisposed));
        for _ in 0..10 {
            assert!(!s.set(ShutdownKind::WriteDisposed));
        }
        assert_eq!(s.kind(), ShutdownKind::ReadDisposed);
    }
}
