// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Transports execute block requests and report their outcome.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use vm_memory::GuestAddressSpace;

use crate::block::request::{BlockRequest, Outcome, RequestType};

/// Executes block requests on behalf of a `StorageDevice`.
///
/// Every submitted request must eventually be completed exactly once, with a terminal outcome,
/// even when the transport itself runs into trouble.
pub trait Transport<M: GuestAddressSpace>: Send + Sync {
    /// Queues `request` for execution.
    fn submit(&self, request: Arc<BlockRequest<M>>);
}

impl<M: GuestAddressSpace, T: Transport<M> + ?Sized> Transport<M> for Arc<T> {
    fn submit(&self, request: Arc<BlockRequest<M>>) {
        (**self).submit(request)
    }
}

/// Storage behind a `BackendTransport`.
pub trait BlockBackend: Read + Seek + Write + Send {
    /// The number of sectors the backend holds.
    fn num_sectors(&self) -> u64;
}

/// A zero-filled disk held in memory.
pub struct MemoryDisk {
    data: Cursor<Vec<u8>>,
    sector_size: usize,
}

impl MemoryDisk {
    /// Creates a disk of `num_sectors` sectors of `sector_size` bytes each.
    ///
    /// Fails with `InvalidInput` for a zero sector size or a disk too large to address.
    pub fn new(num_sectors: usize, sector_size: usize) -> io::Result<Self> {
        check_sector_size(sector_size)?;
        let len = num_sectors
            .checked_mul(sector_size)
            .ok_or_else(|| invalid_input("memory disk size overflows"))?;
        Ok(MemoryDisk {
            data: Cursor::new(vec![0; len]),
            sector_size,
        })
    }

    /// Creates a disk holding `data`, rounded down to whole sectors.
    pub fn from_bytes(mut data: Vec<u8>, sector_size: usize) -> io::Result<Self> {
        check_sector_size(sector_size)?;
        let len = data.len() - data.len() % sector_size;
        data.truncate(len);
        Ok(MemoryDisk {
            data: Cursor::new(data),
            sector_size,
        })
    }
}

fn check_sector_size(sector_size: usize) -> io::Result<()> {
    if sector_size == 0 {
        return Err(invalid_input("zero sector size"));
    }
    Ok(())
}

fn invalid_input(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

impl Read for MemoryDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

impl Write for MemoryDisk {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A cursor would grow the vector past the end of the disk.
        let len = self.data.get_ref().len() as u64;
        let available = len.saturating_sub(self.data.position()) as usize;
        let count = buf.len().min(available);
        self.data.write(&buf[..count])
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryDisk {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.data.seek(pos)
    }
}

impl BlockBackend for MemoryDisk {
    fn num_sectors(&self) -> u64 {
        (self.data.get_ref().len() / self.sector_size) as u64
    }
}

/// Serves block requests from a `BlockBackend` on a dedicated worker thread.
pub struct BackendTransport<M: GuestAddressSpace> {
    sender: Mutex<Option<Sender<Arc<BlockRequest<M>>>>>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<M> BackendTransport<M>
where
    M: GuestAddressSpace + Send + 'static,
{
    /// Starts a worker executing requests against `backend`, with `sector_size` byte sectors.
    pub fn new<B: BlockBackend + 'static>(mut backend: B, sector_size: usize) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Arc<BlockRequest<M>>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();

        let worker = thread::Builder::new()
            .name("block-transport".to_string())
            .spawn(move || {
                for request in receiver {
                    let outcome = if stop.load(Ordering::Acquire) {
                        Outcome::Cancelled
                    } else {
                        execute(&mut backend, sector_size, &request)
                    };
                    request.complete(outcome);
                }
            })?;

        Ok(BackendTransport {
            sender: Mutex::new(Some(sender)),
            shutdown,
            worker: Some(worker),
        })
    }

    /// Starts a worker serving a zero-filled `MemoryDisk`.
    pub fn memory_disk(num_sectors: usize, sector_size: usize) -> io::Result<Self> {
        Self::new(MemoryDisk::new(num_sectors, sector_size)?, sector_size)
    }
}

impl<M: GuestAddressSpace + Send> Transport<M> for BackendTransport<M> {
    fn submit(&self, request: Arc<BlockRequest<M>>) {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match sender.as_ref() {
            Some(sender) => {
                if let Err(mpsc::SendError(request)) = sender.send(request) {
                    warn!("block transport worker is gone, cancelling request");
                    request.complete(Outcome::Cancelled);
                }
            }
            None => {
                request.complete(Outcome::Cancelled);
            }
        }
    }
}

impl<M: GuestAddressSpace> Drop for BackendTransport<M> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("block transport worker panicked");
            }
        }
    }
}

fn execute<M, B>(backend: &mut B, sector_size: usize, request: &BlockRequest<M>) -> Outcome
where
    M: GuestAddressSpace,
    B: BlockBackend + ?Sized,
{
    let end = request
        .start_block()
        .checked_add(request.block_count() as u64);
    match end {
        Some(end) if end <= backend.num_sectors() => (),
        _ => {
            warn!(
                "block request past end of device: start={} count={}",
                request.start_block(),
                request.block_count()
            );
            return Outcome::Failure;
        }
    }

    let offset = request.start_block() * sector_size as u64;
    if let Err(e) = backend.seek(SeekFrom::Start(offset)) {
        error!("Failed to seek to sector {}: {}", request.start_block(), e);
        return Outcome::Failure;
    }

    let mut data = vec![0u8; request.byte_length()];
    match request.request_type() {
        RequestType::Read => {
            if let Err(e) = backend.read_exact(&mut data) {
                error!("Failed to read sector {}: {}", request.start_block(), e);
                return Outcome::Failure;
            }
            if let Err(e) = request.write_buffer(&data) {
                error!("Failed to fill block request buffer: {}", e);
                return Outcome::MemoryFault;
            }
        }
        RequestType::Write => {
            if let Err(e) = request.read_buffer(&mut data) {
                error!("Failed to read block request buffer: {}", e);
                return Outcome::MemoryFault;
            }
            if let Err(e) = backend.write_all(&data).and_then(|_| backend.flush()) {
                error!("Failed to write sector {}: {}", request.start_block(), e);
                return Outcome::Failure;
            }
        }
    }
    Outcome::Success
}
