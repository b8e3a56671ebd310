//! Error surface.
//!
//! The core never panics and never terminates the process; every fallible
//! operation reports failure through its `-1`/`None` return value together
//! with an [`ErrorKind`] written into the caller-supplied out-parameter,
//! rather than a `Result` across the FFI-shaped boundary in
//! [`crate::ops`].

use core::fmt;

/// The kind of failure raised by a core operation.
///
/// Each variant corresponds to one of the internal conditions an
/// operation in [`crate::ops`] can fail with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Region too small to format, or header invalid in a way that
    /// prevents formatting.
    BadFilesystem,
    /// Path resolution failed at some segment; rename `from` absent.
    NoSuchEntry,
    /// Path not absolute, empty/illegal name, or rmdir of a non-directory.
    InvalidArgument,
    /// `mknod`/`mkdir` target path already exists.
    AlreadyExists,
    /// `rmdir` of a non-empty directory.
    NotEmpty,
    /// Offset argument exceeds payload size on read/write.
    TooLarge,
    /// No free inode or block available to satisfy the request.
    NoSpace,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BadFilesystem => "bad filesystem",
            ErrorKind::NoSuchEntry => "no such entry",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::NotEmpty => "not empty",
            ErrorKind::TooLarge => "too large",
            ErrorKind::NoSpace => "no space",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Maps this error kind to the POSIX errno the host binary replies
    /// with. The core itself never constructs or depends on `libc`
    /// errno values; this conversion is purely a host-side convenience.
    pub fn to_errno(self) -> libc::c_int {
        match self {
            ErrorKind::BadFilesystem => libc::EIO,
            ErrorKind::NoSuchEntry => libc::ENOENT,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::AlreadyExists => libc::EEXIST,
            ErrorKind::NotEmpty => libc::ENOTEMPTY,
            ErrorKind::TooLarge => libc::EFBIG,
            ErrorKind::NoSpace => libc::ENOSPC,
        }
    }
}

/// Sets `*err` to `kind` and returns `r`.
///
/// A small helper so every operation in [`crate::ops`] can fail with a
/// single expression: `return fail(err, ErrorKind::NoSuchEntry, -1);`.
pub(crate) fn fail<T>(err: &mut ErrorKind, kind: ErrorKind, r: T) -> T {
    *err = kind;
    r
}
