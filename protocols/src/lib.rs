// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Generated wire definitions for the FalconFS peer-I/O and metadata
//! services, plus the shared transport-status fold.

pub mod peer {
    tonic::include_proto!("falcon.peer");
}

pub mod meta {
    tonic::include_proto!("falcon.meta");
}

use tonic::{Code, Status};

/// Fold a transport-level status into an errno value. Application errors
/// travel inside replies and never reach this path.
pub fn status_to_errno(status: &Status) -> i32 {
    match status.code() {
        Code::Unimplemented => libc::EOPNOTSUPP,
        Code::InvalidArgument => libc::EINVAL,
        Code::PermissionDenied | Code::Unauthenticated => libc::EPERM,
        Code::DeadlineExceeded | Code::Cancelled => libc::ETIMEDOUT,
        Code::Unavailable => libc::EIO,
        _ => libc::EFAULT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_fold() {
        assert_eq!(
            status_to_errno(&Status::unimplemented("x")),
            libc::EOPNOTSUPP
        );
        assert_eq!(status_to_errno(&Status::invalid_argument("x")), libc::EINVAL);
        assert_eq!(status_to_errno(&Status::permission_denied("x")), libc::EPERM);
        assert_eq!(
            status_to_errno(&Status::deadline_exceeded("x")),
            libc::ETIMEDOUT
        );
        assert_eq!(status_to_errno(&Status::unavailable("x")), libc::EIO);
        assert_eq!(status_to_errno(&Status::internal("x")), libc::EFAULT);
    }
}
