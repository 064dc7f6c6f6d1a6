//! Per-session outbound delivery.
//!
//! Messages go out on a non-blocking seqpacket socket. The fast path is
//! a direct send; if the kernel would block, the whole message is
//! parked in a FIFO and drained when the socket turns writable again.
//! Messages are never interleaved or partially sent: seqpacket either
//! takes the whole datagram or none of it, so a short send is a
//! transport fault, not something to resume.

use std::collections::VecDeque;
use std::os::fd::RawFd;

use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags};

/// Outcome of a [`SendQueue::post`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the kernel immediately.
    Sent,
    /// Parked; the caller must enable write-interest and flush later.
    Queued,
}

/// FIFO of whole serialized messages awaiting socket capacity.
#[derive(Default)]
pub struct SendQueue {
    pending: VecDeque<Vec<u8>>,
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Send `msg` or park it. While anything is already parked, new
    /// messages are parked unconditionally so nothing overtakes.
    pub fn post(&mut self, fd: RawFd, msg: &[u8]) -> Result<Delivery, Errno> {
        if !self.pending.is_empty() {
            self.pending.push_back(msg.to_vec());
            return Ok(Delivery::Queued);
        }
        loop {
            match socket::send(fd, msg, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) if n == msg.len() => return Ok(Delivery::Sent),
                Ok(_) => return Err(Errno::EMSGSIZE),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    self.pending.push_back(msg.to_vec());
                    return Ok(Delivery::Queued);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drain parked messages in order. `Ok(true)` means the queue is
    /// empty and write-interest can be dropped; `Ok(false)` means the
    /// socket filled up again mid-drain.
    pub fn flush(&mut self, fd: RawFd) -> Result<bool, Errno> {
        while let Some(msg) = self.pending.front() {
            match socket::send(fd, msg, MsgFlags::MSG_NOSIGNAL) {
                Ok(n) if n == msg.len() => {
                    self.pending.pop_front();
                }
                Ok(_) => return Err(Errno::EMSGSIZE),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(false),
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}
