// Copyright 2020 Ant Group. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

pub mod mem_pool;
pub mod open_instance;
pub mod read_stream;
pub mod write_stream;

pub use mem_pool::{AlignedBuf, MemPool, PoolBlock};
pub use open_instance::OpenInstance;
pub use read_stream::ReadStream;
pub use write_stream::WriteStream;
