// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Storage devices: byte-range reads and writes translated into block requests.
//!
//! A call is split into an aligned phase, covering whole blocks and transferring straight to or
//! from caller memory, and a tail phase for the sub-block remainder, which goes through a
//! scratch buffer of one block (two when a sub-block range straddles a block boundary). A single request never carries more than a page worth of blocks;
//! longer calls are short-served and the caller re-issues the rest. The two phases run strictly
//! one after the other.

pub mod descriptor;
pub mod registry;

use std::marker::PhantomData;
use std::sync::Arc;

use vm_memory::{Address, Bytes, GuestAddress, GuestAddressSpace, GuestMemoryError};

use crate::block::completion::Interrupt;
use crate::block::request::{BlockRequest, Outcome, RequestBuffer, RequestType};
use crate::block::transport::Transport;
use crate::{Error, Result};

use descriptor::DeviceDescriptor;
use registry::{DeviceRegistry, RegistryEntry};

/// Control request returning the device capacity in bytes.
pub const STORAGE_DEVICE_GET_SIZE: u32 = 1;
/// Control request returning the sector size in bytes.
pub const STORAGE_DEVICE_GET_BLOCK_SIZE: u32 = 2;

/// Control requests understood by a storage device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlRequest {
    /// Capacity in bytes.
    GetSize,
    /// Sector size in bytes.
    GetBlockSize,
    /// Unknown request.
    Unsupported(u32),
}

impl From<u32> for ControlRequest {
    fn from(value: u32) -> Self {
        match value {
            STORAGE_DEVICE_GET_SIZE => ControlRequest::GetSize,
            STORAGE_DEVICE_GET_BLOCK_SIZE => ControlRequest::GetBlockSize,
            r => ControlRequest::Unsupported(r),
        }
    }
}

// Block range covered by a byte-range call.
#[derive(Debug, PartialEq)]
struct Transfer {
    index: u64,
    whole_blocks: usize,
    remaining: usize,
    offset_within_block: usize,
    tail_blocks: usize,
}

impl Transfer {
    fn new(descriptor: &DeviceDescriptor, offset: u64, len: usize) -> Self {
        let log = descriptor.block_size_log();
        let block_size = descriptor.sector_size();
        let index = offset >> log;
        let mut whole_blocks = len >> log;
        let mut remaining = len - (whole_blocks << log);

        // The transport DMA buffer is a single page.
        if whole_blocks >= descriptor.blocks_per_page() {
            whole_blocks = descriptor.blocks_per_page();
            remaining = 0;
        }

        let mut offset_within_block = 0;
        let mut tail_blocks = if remaining > 0 { 1 } else { 0 };
        if len < block_size {
            offset_within_block = (offset - (index << log)) as usize;
            if offset_within_block + remaining > block_size {
                // The range spills into the next block. With one block per page, the range is
                // cut at the block boundary instead.
                tail_blocks = descriptor.blocks_per_page().min(2);
                remaining = remaining.min((tail_blocks << log) - offset_within_block);
            }
        }

        Transfer {
            index,
            whole_blocks,
            remaining,
            offset_within_block,
            tail_blocks,
        }
    }

    fn tail_block(&self) -> u64 {
        self.index + self.whole_blocks as u64
    }

    fn tail_range(&self) -> std::ops::Range<usize> {
        self.offset_within_block..self.offset_within_block + self.remaining
    }
}

/// A block device accessed at byte granularity.
pub struct StorageDevice<M: GuestAddressSpace, T: Transport<M>> {
    descriptor: DeviceDescriptor,
    transport: T,
    interrupt: Interrupt,
    phantom: PhantomData<fn() -> M>,
}

impl<M: GuestAddressSpace + Clone, T: Transport<M>> StorageDevice<M, T> {
    /// Creates a device executing its requests on `transport`. Raising `interrupt` aborts the
    /// call currently waiting for a transfer; the interrupt is consumed by the call it aborts.
    pub fn new(descriptor: DeviceDescriptor, transport: T, interrupt: Interrupt) -> Self {
        StorageDevice {
            descriptor,
            transport,
            interrupt,
            phantom: PhantomData,
        }
    }

    /// Returns the device descriptor.
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Returns the interrupt handle waits are bound to.
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Reads up to `len` bytes at `offset` into caller memory at `addr`.
    ///
    /// Returns the number of bytes read, which is smaller than `len` when the call exceeds a
    /// page worth of blocks or the tail block cannot be read.
    pub fn read(&self, offset: u64, mem: &M, addr: GuestAddress, len: usize) -> Result<usize> {
        let t = Transfer::new(&self.descriptor, offset, len);
        debug!(
            "StorageDevice::read() index={}, whole_blocks={}, remaining={}",
            t.index, t.whole_blocks, t.remaining
        );

        if t.whole_blocks > 0 {
            let buffer = RequestBuffer::Guest {
                mem: mem.clone(),
                addr,
            };
            let request = self.dispatch(RequestType::Read, t.index, t.whole_blocks, buffer)?;
            check_aligned(&request)?;
        }

        let pos = t.whole_blocks << self.descriptor.block_size_log();

        if t.remaining > 0 {
            let tail_len = t.tail_blocks << self.descriptor.block_size_log();
            let buffer = RequestBuffer::scratch(tail_len)?;
            let request =
                self.dispatch(RequestType::Read, t.tail_block(), t.tail_blocks, buffer)?;
            if !check_tail(&request)? {
                return Ok(pos);
            }
            let data = take_scratch(&request);
            mem.memory()
                .write_slice(&data[t.tail_range()], caller_addr(addr, pos)?)
                .map_err(Error::GuestMemory)?;
        }

        Ok(pos + t.remaining)
    }

    /// Returns `true` if `offset` lies within the device.
    pub fn can_read(&self, offset: u64) -> bool {
        offset < self.descriptor.capacity_bytes()
    }

    /// Writes up to `len` bytes from caller memory at `addr` to `offset`.
    ///
    /// Sub-block tails are read, patched, and written back. Returns the number of bytes
    /// written, with the same short-transfer rules as `read`.
    pub fn write(&self, offset: u64, mem: &M, addr: GuestAddress, len: usize) -> Result<usize> {
        let t = Transfer::new(&self.descriptor, offset, len);

        // Allocate the tail block before any full block is written, so running out of memory
        // never leaves a partial write behind.
        let partial_write_block = if t.remaining > 0 {
            Some(RequestBuffer::scratch(
                t.tail_blocks << self.descriptor.block_size_log(),
            )?)
        } else {
            None
        };

        debug!(
            "StorageDevice::write() index={}, whole_blocks={}, remaining={}",
            t.index, t.whole_blocks, t.remaining
        );

        if t.whole_blocks > 0 {
            let buffer = RequestBuffer::Guest {
                mem: mem.clone(),
                addr,
            };
            let request = self.dispatch(RequestType::Write, t.index, t.whole_blocks, buffer)?;
            check_aligned(&request)?;
        }

        let pos = t.whole_blocks << self.descriptor.block_size_log();

        if let Some(block) = partial_write_block {
            let request =
                self.dispatch(RequestType::Read, t.tail_block(), t.tail_blocks, block)?;
            if !check_tail(&request)? {
                return Ok(pos);
            }

            let mut data = take_scratch(&request);
            mem.memory()
                .read_slice(&mut data[t.tail_range()], caller_addr(addr, pos)?)
                .map_err(Error::GuestMemory)?;

            let buffer = RequestBuffer::Scratch(data);
            let request =
                self.dispatch(RequestType::Write, t.tail_block(), t.tail_blocks, buffer)?;
            if !check_tail(&request)? {
                return Ok(pos);
            }
        }

        Ok(pos + t.remaining)
    }

    /// Returns `true` if `offset` lies within the device.
    pub fn can_write(&self, offset: u64) -> bool {
        offset < self.descriptor.capacity_bytes()
    }

    /// Returns the capacity in bytes.
    pub fn query_capacity_bytes(&self) -> u64 {
        self.descriptor.capacity_bytes()
    }

    /// Returns the sector size in bytes.
    pub fn query_sector_size(&self) -> usize {
        self.descriptor.sector_size()
    }

    /// Answers a typed control request.
    pub fn control(&self, request: ControlRequest) -> Result<u64> {
        match request {
            ControlRequest::GetSize => Ok(self.query_capacity_bytes()),
            ControlRequest::GetBlockSize => Ok(self.query_sector_size() as u64),
            ControlRequest::Unsupported(r) => {
                warn!("unknown storage device control request: {}", r);
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Answers control request `request` by storing the result in caller memory at `arg`.
    ///
    /// The size is stored as a `u64`, the block size as a `usize`.
    pub fn ioctl(&self, request: u32, mem: &M, arg: GuestAddress) -> Result<()> {
        let request = ControlRequest::from(request);
        let value = self.control(request)?;
        let mem = mem.memory();
        let result = match request {
            ControlRequest::GetBlockSize => mem.write_obj(value as usize, arg),
            _ => mem.write_obj(value, arg),
        };
        result.map_err(Error::GuestMemory)
    }

    /// Publishes the device in `registry`.
    pub fn after_inserting(&self, registry: &dyn DeviceRegistry) -> Result<()> {
        registry.register(RegistryEntry::from(&self.descriptor))
    }

    /// Removes the device from `registry`.
    pub fn will_be_destroyed(&self, registry: &dyn DeviceRegistry) -> Result<()> {
        registry.unregister(self.descriptor.id())
    }

    // Submits a request and blocks until the transport resolves it.
    fn dispatch(
        &self,
        request_type: RequestType,
        start_block: u64,
        block_count: usize,
        buffer: RequestBuffer<M>,
    ) -> Result<Arc<BlockRequest<M>>> {
        let byte_length = block_count << self.descriptor.block_size_log();
        let request = Arc::new(BlockRequest::new(
            request_type,
            start_block,
            block_count,
            buffer,
            byte_length,
        )?);
        self.transport.submit(request.clone());
        if request.wait(&self.interrupt)?.was_interrupted() {
            // The signal aborts this call only.
            self.interrupt.clear()?;
            return Err(Error::Interrupted);
        }
        Ok(request)
    }
}

fn caller_addr(addr: GuestAddress, pos: usize) -> Result<GuestAddress> {
    addr.checked_add(pos as u64)
        .ok_or(Error::GuestMemory(GuestMemoryError::InvalidGuestAddress(addr)))
}

// Whole-block transfers either succeed or fail the call.
fn check_aligned<M: GuestAddressSpace>(request: &BlockRequest<M>) -> Result<()> {
    match request.outcome() {
        Outcome::Success => Ok(()),
        Outcome::Failure | Outcome::Cancelled => Err(Error::Io),
        Outcome::MemoryFault => Err(Error::MemoryFault),
        Outcome::Pending => panic!("{:?} completed without an outcome", request),
    }
}

// Returns `false` when the tail block failed and the call ends short.
fn check_tail<M: GuestAddressSpace>(request: &BlockRequest<M>) -> Result<bool> {
    match request.outcome() {
        Outcome::Success => Ok(true),
        Outcome::Failure => Ok(false),
        Outcome::Cancelled => Err(Error::Io),
        // Tail transfers only ever target scratch memory.
        Outcome::MemoryFault => unreachable!("memory fault on scratch block: {:?}", request),
        Outcome::Pending => panic!("{:?} completed without an outcome", request),
    }
}

fn take_scratch<M: GuestAddressSpace>(request: &BlockRequest<M>) -> Vec<u8> {
    match request.take_scratch() {
        Some(data) => data,
        None => unreachable!("tail request without scratch block: {:?}", request),
    }
}
