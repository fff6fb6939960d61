// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Asynchronous block transfer requests.
//!
//! A `BlockRequest` describes one block-aligned transfer. The engine creates it, the transport
//! executes it from its own context and stores the terminal `Outcome` exactly once, then resolves
//! the bound `Completion`.

use std::sync::{Mutex, MutexGuard};
use std::{fmt, mem, result};

use vm_memory::{Bytes, GuestAddress, GuestAddressSpace, GuestMemoryError};

use crate::block::completion::{Completion, Interrupt, WaitResult};
use crate::{Error, Result};

/// Direction of a transfer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RequestType {
    /// Device to buffer.
    Read,
    /// Buffer to device.
    Write,
}

/// Outcome of a transfer, as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    /// The transport has not finished with the request yet.
    Pending,
    /// The transfer completed.
    Success,
    /// The device reported an error.
    Failure,
    /// The transfer was dropped before it could run.
    Cancelled,
    /// The request buffer could not be accessed.
    MemoryFault,
}

impl Outcome {
    /// Returns `true` for every outcome other than `Pending`.
    pub fn is_terminal(self) -> bool {
        self != Outcome::Pending
    }
}

/// Memory a request transfers to or from.
pub enum RequestBuffer<M: GuestAddressSpace> {
    /// Caller memory starting at `addr`.
    Guest {
        /// The caller's address space.
        mem: M,
        /// Start of the buffer.
        addr: GuestAddress,
    },
    /// An engine-owned scratch buffer.
    Scratch(Vec<u8>),
}

impl<M: GuestAddressSpace> RequestBuffer<M> {
    /// Allocates a zeroed scratch buffer of `len` bytes, failing instead of aborting when memory
    /// is short.
    pub fn scratch(len: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| Error::NoMemory)?;
        data.resize(len, 0);
        Ok(RequestBuffer::Scratch(data))
    }

    fn store(&mut self, data: &[u8]) -> result::Result<(), GuestMemoryError> {
        match self {
            RequestBuffer::Guest { mem, addr } => mem.memory().write_slice(data, *addr),
            RequestBuffer::Scratch(buf) => {
                if buf.len() < data.len() {
                    return Err(GuestMemoryError::PartialBuffer {
                        expected: data.len(),
                        completed: 0,
                    });
                }
                buf[..data.len()].copy_from_slice(data);
                Ok(())
            }
        }
    }

    fn load(&self, data: &mut [u8]) -> result::Result<(), GuestMemoryError> {
        match self {
            RequestBuffer::Guest { mem, addr } => mem.memory().read_slice(data, *addr),
            RequestBuffer::Scratch(buf) => {
                if buf.len() < data.len() {
                    return Err(GuestMemoryError::PartialBuffer {
                        expected: data.len(),
                        completed: 0,
                    });
                }
                data.copy_from_slice(&buf[..data.len()]);
                Ok(())
            }
        }
    }
}

/// One block-aligned transfer handed to a transport.
pub struct BlockRequest<M: GuestAddressSpace> {
    request_type: RequestType,
    start_block: u64,
    block_count: usize,
    byte_length: usize,
    buffer: Mutex<RequestBuffer<M>>,
    outcome: Mutex<Outcome>,
    completion: Completion,
}

impl<M: GuestAddressSpace> BlockRequest<M> {
    /// Creates a pending request for `block_count` blocks starting at `start_block`.
    pub fn new(
        request_type: RequestType,
        start_block: u64,
        block_count: usize,
        buffer: RequestBuffer<M>,
        byte_length: usize,
    ) -> Result<Self> {
        Ok(BlockRequest {
            request_type,
            start_block,
            block_count,
            byte_length,
            buffer: Mutex::new(buffer),
            outcome: Mutex::new(Outcome::Pending),
            completion: Completion::new()?,
        })
    }

    /// Returns the request type.
    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    /// Returns the first block of the transfer.
    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    /// Returns the number of blocks to transfer.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Returns the number of bytes to transfer.
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Returns the current outcome.
    pub fn outcome(&self) -> Outcome {
        *lock(&self.outcome)
    }

    /// Copies data produced by the device into the request buffer.
    pub fn write_buffer(&self, data: &[u8]) -> result::Result<(), GuestMemoryError> {
        lock(&self.buffer).store(data)
    }

    /// Copies the request buffer into `data`, to be consumed by the device.
    pub fn read_buffer(&self, data: &mut [u8]) -> result::Result<(), GuestMemoryError> {
        lock(&self.buffer).load(data)
    }

    /// Stores the terminal `outcome` and resolves the completion.
    ///
    /// Returns `false`, leaving the request untouched, when the outcome was already set or
    /// `outcome` is `Pending`.
    pub fn complete(&self, outcome: Outcome) -> bool {
        {
            let mut current = lock(&self.outcome);
            if current.is_terminal() || !outcome.is_terminal() {
                error!(
                    "invalid completion of block request at {}: {:?} -> {:?}",
                    self.start_block, *current, outcome
                );
                return false;
            }
            *current = outcome;
        }

        if let Err(e) = self.completion.signal() {
            error!("Failed to signal block request completion: {}", e);
        }
        true
    }

    /// Blocks the calling context until the request is completed or `interrupt` is raised.
    pub fn wait(&self, interrupt: &Interrupt) -> Result<WaitResult> {
        self.completion.wait(interrupt)
    }

    /// Takes the scratch buffer back from a completed request.
    ///
    /// Returns `None` for requests that target caller memory.
    pub fn take_scratch(&self) -> Option<Vec<u8>> {
        match &mut *lock(&self.buffer) {
            RequestBuffer::Scratch(buf) => Some(mem::take(buf)),
            RequestBuffer::Guest { .. } => None,
        }
    }
}

impl<M: GuestAddressSpace> fmt::Debug for BlockRequest<M> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockRequest")
            .field("request_type", &self.request_type)
            .field("start_block", &self.start_block)
            .field("block_count", &self.block_count)
            .field("byte_length", &self.byte_length)
            .field("outcome", &self.outcome())
            .finish()
    }
}

// The protected data stays consistent even if a holder panicked, so poisoning is ignored.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
