//! Per-client session state.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::queue::SendQueue;
use crate::shm::Framebuffer;
use crate::toolkit::{CursorId, WindowId};

/// One connected client: its socket, its window and framebuffer once
/// negotiated, its cursor table and its outbound queue.
pub struct Session {
    fd: OwnedFd,
    pub window: Option<WindowId>,
    pub framebuffer: Option<Framebuffer>,
    /// Tombstoned table: an index handed to the client stays valid for
    /// the life of the session, deletion leaves a hole.
    cursors: Vec<Option<CursorId>>,
    pub queue: SendQueue,
    pub flip_requested: bool,
    pub draw_pending: bool,
    pub write_interest: bool,
}

impl Session {
    pub fn new(fd: OwnedFd) -> Self {
        Session {
            fd,
            window: None,
            framebuffer: None,
            cursors: Vec::new(),
            queue: SendQueue::new(),
            flip_requested: false,
            draw_pending: false,
            write_interest: false,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Register a toolkit cursor, returning the index the client will
    /// use to refer to it.
    pub fn add_cursor(&mut self, cursor: CursorId) -> i32 {
        self.cursors.push(Some(cursor));
        (self.cursors.len() - 1) as i32
    }

    pub fn cursor(&self, index: i32) -> Option<CursorId> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.cursors.get(i))
            .copied()
            .flatten()
    }

    /// Remove a cursor without shifting later indices.
    pub fn delete_cursor(&mut self, index: i32) -> Option<CursorId> {
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.cursors.get_mut(i))?;
        slot.take()
    }

    /// Drain every live cursor for teardown.
    pub fn take_cursors(&mut self) -> Vec<CursorId> {
        self.cursors.drain(..).flatten().collect()
    }
}
