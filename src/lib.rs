// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Byte-range I/O on top of block-granular, asynchronous storage transports.
//!
//! A [`StorageDevice`] accepts reads and writes at arbitrary byte offsets and lengths, and turns
//! them into at most two block-aligned [`BlockRequest`]s: one for the whole blocks, transferred
//! directly to or from caller memory, and one single-block request for the sub-block tail, which
//! goes through an engine-owned scratch block (read-modify-write in the case of writes). Each
//! request is handed to a [`Transport`] that completes it from its own execution context, while
//! the calling context blocks on the request's [`Completion`] or gets [`Interrupt`]ed.
//!
//! Caller memory is expressed through `vm-memory`, so the engine works with any
//! `GuestAddressSpace` implementation.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub mod block;
pub mod device;

use std::{fmt, io, result};

use vm_memory::GuestMemoryError;

pub use block::completion::{Completion, Interrupt, WaitResult};
pub use block::request::{BlockRequest, Outcome, RequestBuffer, RequestType};
pub use block::transport::{BackendTransport, BlockBackend, MemoryDisk, Transport};
pub use device::descriptor::{CommandSet, DeviceDescriptor, DeviceId, InterfaceType, LunAddress};
pub use device::registry::{DeviceDirectory, DeviceRegistry, RegistryEntry};
pub use device::{ControlRequest, StorageDevice};

/// Size of a memory page, which bounds the length of a single transfer.
pub const PAGE_SIZE: usize = 4096;

/// Log2 of the default sector size.
pub const SECTOR_SHIFT: u8 = 9;

/// Default sector size in bytes.
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;

/// Storage device errors.
#[derive(Debug)]
pub enum Error {
    /// The calling context was interrupted while waiting for a transfer.
    Interrupted,
    /// The transport failed or cancelled a transfer.
    Io,
    /// The transport could not access the caller's memory.
    MemoryFault,
    /// Copying between a scratch block and caller memory failed.
    GuestMemory(GuestMemoryError),
    /// Unknown control request.
    InvalidArgument,
    /// A scratch block could not be allocated.
    NoMemory,
    /// Sector size is not a power of two fitting in a page.
    InvalidSectorSize(usize),
    /// Setting up or waiting on a completion signal failed.
    Wait(io::Error),
    /// The device is already present in the registry.
    AlreadyRegistered(DeviceId),
    /// The device is not present in the registry.
    NotRegistered(DeviceId),
}

impl Error {
    /// Returns the errno value reported for this error at the system call boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Interrupted => libc::EINTR,
            Error::Io | Error::Wait(_) => libc::EIO,
            Error::MemoryFault | Error::GuestMemory(_) => libc::EFAULT,
            Error::InvalidArgument | Error::InvalidSectorSize(_) => libc::EINVAL,
            Error::NoMemory => libc::ENOMEM,
            Error::AlreadyRegistered(_) => libc::EEXIST,
            Error::NotRegistered(_) => libc::ENODEV,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Interrupted => write!(f, "interrupted while waiting for a transfer"),
            Error::Io => write!(f, "transfer failed"),
            Error::MemoryFault => write!(f, "transfer hit an invalid memory region"),
            Error::GuestMemory(e) => write!(f, "cannot access caller memory: {}", e),
            Error::InvalidArgument => write!(f, "invalid control request"),
            Error::NoMemory => write!(f, "cannot allocate scratch block"),
            Error::InvalidSectorSize(size) => write!(f, "invalid sector size: {}", size),
            Error::Wait(e) => write!(f, "completion signal error: {}", e),
            Error::AlreadyRegistered(id) => write!(f, "device {} is already registered", id),
            Error::NotRegistered(id) => write!(f, "device {} is not registered", id),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::GuestMemory(e) => Some(e),
            Error::Wait(e) => Some(e),
            _ => None,
        }
    }
}

/// Storage device result type.
pub type Result<T> = result::Result<T, Error>;
