// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Errno-shaped error constructors. Engine calls surface errors as negative
//! errno integers; these macros build the matching `io::Error` values and log
//! the failure site.

use std::io::Error;

pub fn make_error(err: Error, file: &str, line: u32) -> Error {
    error!("{}:{} - {}", file, line, err);
    err
}

#[macro_export]
macro_rules! einval {
    () => {
        $crate::error::make_error(
            std::io::Error::from_raw_os_error(libc::EINVAL),
            file!(),
            line!(),
        )
    };
    ($msg:expr) => {{
        error!("{}:{} - {}", file!(), line!(), $msg);
        std::io::Error::from_raw_os_error(libc::EINVAL)
    }};
}

#[macro_export]
macro_rules! enoent {
    ($msg:expr) => {{
        error!("{}:{} - {}", file!(), line!(), $msg);
        std::io::Error::from_raw_os_error(libc::ENOENT)
    }};
}

#[macro_export]
macro_rules! ebadf {
    ($msg:expr) => {{
        error!("{}:{} - {}", file!(), line!(), $msg);
        std::io::Error::from_raw_os_error(libc::EBADF)
    }};
}

#[macro_export]
macro_rules! eio {
    ($msg:expr) => {{
        error!("{}:{} - {}", file!(), line!(), $msg);
        std::io::Error::from_raw_os_error(libc::EIO)
    }};
}

#[macro_export]
macro_rules! enospc {
    ($msg:expr) => {{
        error!("{}:{} - {}", file!(), line!(), $msg);
        std::io::Error::from_raw_os_error(libc::ENOSPC)
    }};
}

#[macro_export]
macro_rules! last_error {
    () => {
        $crate::error::make_error(std::io::Error::last_os_error(), file!(), line!())
    };
    ($msg:expr) => {{
        let err = std::io::Error::last_os_error();
        error!("{}:{} - {}: {}", file!(), line!(), $msg, err);
        err
    }};
}

/// The negative errno carried by an `io::Error`, or `-EIO` when the error
/// has no os-level code.
pub fn neg_errno(err: &Error) -> i32 {
    match err.raw_os_error() {
        Some(e) => -e,
        None => -libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neg_errno() {
        let err = Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(neg_errno(&err), -libc::ENOENT);
        let err = Error::new(std::io::ErrorKind::Other, "opaque");
        assert_eq!(neg_errno(&err), -libc::EIO);
    }
}
