// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Blocking wait for a transfer to finish, which an external signal can cut short.

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use crate::{Error, Result};

const COMPLETION_TOKEN: u64 = 0;
const INTERRUPT_TOKEN: u64 = 1;

/// What the waiter observed when `Completion::wait` returned.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WaitResult {
    /// The transport resolved the request.
    Completed,
    /// The waiting context was interrupted before the request was resolved.
    Interrupted,
}

impl WaitResult {
    /// Returns `true` if the wait ended because of an interruption.
    pub fn was_interrupted(self) -> bool {
        self == WaitResult::Interrupted
    }
}

/// Handle used to interrupt a context blocked on a `Completion`.
///
/// Clones share the same underlying event. A raised interrupt stays pending, and aborts every
/// subsequent wait, until it is cleared.
#[derive(Clone)]
pub struct Interrupt {
    event: Arc<EventFd>,
}

impl Interrupt {
    /// Creates a new, cleared interrupt handle.
    pub fn new() -> Result<Self> {
        let event = EventFd::new(EFD_NONBLOCK).map_err(Error::Wait)?;
        Ok(Interrupt {
            event: Arc::new(event),
        })
    }

    /// Delivers the interrupt to any current or future waiter.
    pub fn raise(&self) -> Result<()> {
        self.event.write(1).map_err(Error::Wait)
    }

    /// Discards a pending interrupt.
    pub fn clear(&self) -> Result<()> {
        match self.event.read() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(Error::Wait(e)),
        }
    }
}

impl AsRawFd for Interrupt {
    fn as_raw_fd(&self) -> i32 {
        self.event.as_raw_fd()
    }
}

/// Single-waiter signal resolved by the transport once a request reaches a terminal outcome.
pub struct Completion {
    event: EventFd,
}

impl Completion {
    /// Creates an unresolved completion.
    pub fn new() -> Result<Self> {
        let event = EventFd::new(EFD_NONBLOCK).map_err(Error::Wait)?;
        Ok(Completion { event })
    }

    /// Resolves the completion, waking the waiter.
    pub fn signal(&self) -> Result<()> {
        self.event.write(1).map_err(Error::Wait)
    }

    /// Blocks until the completion is resolved or `interrupt` is raised.
    ///
    /// A completion that is already resolved wins over a pending interrupt.
    pub fn wait(&self, interrupt: &Interrupt) -> Result<WaitResult> {
        let epoll = Epoll::new().map_err(Error::Wait)?;
        epoll
            .ctl(
                ControlOperation::Add,
                self.event.as_raw_fd(),
                EpollEvent::new(EventSet::IN, COMPLETION_TOKEN),
            )
            .map_err(Error::Wait)?;
        epoll
            .ctl(
                ControlOperation::Add,
                interrupt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, INTERRUPT_TOKEN),
            )
            .map_err(Error::Wait)?;

        let mut events = vec![EpollEvent::default(); 2];
        loop {
            let count = match epoll.wait(-1, &mut events[..]) {
                Ok(count) => count,
                // A signal delivered to this thread.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    return Ok(WaitResult::Interrupted)
                }
                Err(e) => return Err(Error::Wait(e)),
            };

            let mut interrupted = false;
            for event in &events[..count] {
                match event.data() {
                    COMPLETION_TOKEN => {
                        // Drain the counter; the completion is never waited on twice.
                        let _ = self.event.read();
                        return Ok(WaitResult::Completed);
                    }
                    INTERRUPT_TOKEN => interrupted = true,
                    token => warn!("unexpected epoll token while waiting: {}", token),
                }
            }
            if interrupted {
                return Ok(WaitResult::Interrupted);
            }
        }
    }
}
