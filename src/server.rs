//! Session registry, readiness reactor and request dispatch.
//!
//! One thread, one `mio::Poll`. The listener and every session socket
//! are raw fds registered through `SourceFd`; sessions live in a map
//! keyed by their poll token. Each reactor turn runs the frame tick if
//! it is due, sleeps until the next pacing deadline or readiness,
//! drains whatever became ready, and pumps the toolkit event queue.
//!
//! A misbehaving session only ever takes itself down: protocol
//! violations, transport errors and negotiation failures are confined
//! to closing that one session.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use nix::sys::socket::{self, AddressFamily, Backlog, MsgFlags, SockFlag, SockType, UnixAddr};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pacing::FrameClock;
use crate::protocol::{self, CursorOp, Reply, Request};
use crate::queue::Delivery;
use crate::session::Session;
use crate::shm::{self, Framebuffer};
use crate::toolkit::{Toolkit, ToolkitEvent, WindowId};

/// Hard ceiling on concurrent sessions; later connections are refused.
pub const MAX_SESSIONS: usize = 128;

const LISTENER: Token = Token(0);
const LISTEN_BACKLOG: i32 = 8;
const RECV_CHUNK: usize = 64 * 1024;

/// Set by the signal handlers (and a toolkit Quit event) to stop the
/// reactor after the current turn.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

// Process-wide so concurrent servers never collide on a region name.
static SHM_SERIAL: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("binding {path}: {source}")]
    Bind { path: PathBuf, source: Errno },
    #[error("listening on {path}: {source}")]
    Listen { path: PathBuf, source: Errno },
    #[error(transparent)]
    Poll(#[from] io::Error),
}

pub struct Server<T: Toolkit> {
    poll: Poll,
    events: Events,
    listener: OwnedFd,
    socket_path: PathBuf,
    sessions: HashMap<Token, Session>,
    /// Window handle back to the owning session, for the event pump.
    windows: HashMap<WindowId, Token>,
    toolkit: T,
    clock: FrameClock,
    scratch: Vec<u8>,
    next_token: usize,
}

impl<T: Toolkit> Server<T> {
    /// Bind the listening socket at `path` and set up the reactor.
    pub fn bind(path: &Path, toolkit: T) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            path: path.to_path_buf(),
            source,
        };
        let listen_err = |source| ServerError::Listen {
            path: path.to_path_buf(),
            source,
        };

        let listener = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(bind_err)?;
        let addr = UnixAddr::new(path).map_err(bind_err)?;
        socket::bind(listener.as_raw_fd(), &addr).map_err(bind_err)?;
        let backlog = Backlog::new(LISTEN_BACKLOG).map_err(listen_err)?;
        socket::listen(&listener, backlog).map_err(listen_err)?;

        let poll = Poll::new()?;
        let raw = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&raw), LISTENER, Interest::READABLE)?;

        info!(path = %path.display(), "listening");
        Ok(Server {
            poll,
            events: Events::with_capacity(256),
            listener,
            socket_path: path.to_path_buf(),
            sessions: HashMap::new(),
            windows: HashMap::new(),
            toolkit,
            clock: FrameClock::new(Instant::now()),
            scratch: Vec::new(),
            next_token: 1,
        })
    }

    /// Run turns until shutdown is requested, then tear everything
    /// down and unlink the socket.
    pub fn run(&mut self) -> Result<(), ServerError> {
        while !SHUTDOWN.load(Ordering::Relaxed) {
            self.turn()?;
        }
        info!("shutting down");
        self.shutdown();
        Ok(())
    }

    /// One reactor turn: frame tick if due, poll, drain readiness,
    /// pump the toolkit. Public so tests can drive the loop by hand.
    pub fn turn(&mut self) -> Result<(), ServerError> {
        if self.clock.due(Instant::now()) {
            self.frame_tick();
        }

        let timeout = self.clock.timeout(Instant::now());
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            // A signal landed; the run loop rechecks the flag.
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let ready: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable(), ev.is_error()))
            .collect();
        let mut active = !ready.is_empty();
        for (token, readable, writable, error) in ready {
            if token == LISTENER {
                self.accept_new();
                continue;
            }
            if error {
                debug!(?token, "socket error readiness");
                self.close_session(token);
                continue;
            }
            if writable {
                self.flush_session(token);
            }
            if readable {
                self.read_session(token);
            }
        }
        if self.pump_toolkit() {
            active = true;
        }
        if active {
            self.clock.activity(Instant::now());
        }
        Ok(())
    }

    /// Close every session and remove the socket file.
    pub fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            self.close_session(token);
        }
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.socket_path.display(), %err, "removing socket failed");
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn toolkit(&self) -> &T {
        &self.toolkit
    }

    pub fn toolkit_mut(&mut self) -> &mut T {
        &mut self.toolkit
    }

    fn accept_new(&mut self) {
        loop {
            match socket::accept4(
                self.listener.as_raw_fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(fd) => {
                    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                    if self.sessions.len() >= MAX_SESSIONS {
                        warn!("session table full, refusing connection");
                        continue;
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let raw = fd.as_raw_fd();
                    if let Err(err) = self.poll.registry().register(
                        &mut SourceFd(&raw),
                        token,
                        Interest::READABLE,
                    ) {
                        warn!(%err, "registering session failed");
                        continue;
                    }
                    debug!(?token, "session connected");
                    self.sessions.insert(token, Session::new(fd));
                }
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    fn read_session(&mut self, token: Token) {
        // One transport message per read; the chunk is large enough
        // for the biggest legal request (a cursor upload).
        let mut buf = vec![0u8; RECV_CHUNK];
        loop {
            // Dispatch may have closed the session mid-drain.
            let fd = match self.sessions.get(&token) {
                Some(session) => session.raw_fd(),
                None => return,
            };
            match socket::recv(fd, &mut buf, MsgFlags::empty()) {
                Ok(0) => {
                    debug!(?token, "peer disconnected");
                    self.close_session(token);
                    return;
                }
                Ok(n) => self.dispatch(token, &buf[..n]),
                Err(Errno::EAGAIN) => return,
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(?token, %err, "recv failed");
                    self.close_session(token);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, token: Token, msg: &[u8]) {
        let request = match protocol::decode(msg) {
            Ok(request) => request,
            Err(err) => {
                warn!(?token, %err, "protocol violation");
                self.close_session(token);
                return;
            }
        };
        match request {
            Request::SetVideoMode {
                width,
                height,
                double_buffered,
                resizable,
            } => self.handle_set_video_mode(token, width, height, double_buffered, resizable),
            Request::Draw { flip } => self.handle_draw(token, flip),
            Request::WarpMouse { x, y } => self.handle_warp_mouse(token, x, y),
            Request::SetCaption { text } => self.handle_set_caption(token, &text),
            Request::AddCursor {
                width,
                height,
                hot_x,
                hot_y,
                data,
            } => self.handle_add_cursor(token, width, height, hot_x, hot_y, &data),
            Request::ManageCursor { op, index } => self.handle_manage_cursor(token, op, index),
        }
    }

    fn handle_set_video_mode(
        &mut self,
        token: Token,
        width: i32,
        height: i32,
        double_buffered: bool,
        resizable: bool,
    ) {
        let name = next_shm_name();
        let fb = match Framebuffer::negotiate(&name, width, height, double_buffered) {
            Ok(fb) => fb,
            Err(err) => {
                warn!(?token, %err, "framebuffer negotiation failed");
                self.post(token, &video_mode_failed(width, height, double_buffered));
                return;
            }
        };

        // Reuse the existing window on renegotiation.
        let window = match self.sessions.get(&token).and_then(|s| s.window) {
            Some(window) => {
                self.toolkit.resize_window(window, width, height);
                self.toolkit.mark_dirty(window);
                Some(window)
            }
            None => {
                let window = self.toolkit.create_window(width, height, "", resizable);
                if let Some(window) = window {
                    self.windows.insert(window, token);
                }
                window
            }
        };
        let Some(window) = window else {
            warn!(?token, "window creation failed");
            // fb drops: the fresh region is unmapped and unlinked.
            self.post(token, &video_mode_failed(width, height, double_buffered));
            return;
        };

        let format = self.toolkit.pixel_format();
        let front = fb.front();
        let reply = Reply::VideoModeSet {
            success: true,
            double_buffered: fb.double_buffered(),
            width: front.width(),
            height: front.height(),
            pitch: front.pitch(),
            depth: shm::DEPTH,
            rmask: format.rmask,
            gmask: format.gmask,
            bmask: format.bmask,
            name: fb.name().to_string(),
        };

        // Commit last; the replaced framebuffer (if any) is unmapped
        // and unlinked as it drops.
        if let Some(session) = self.sessions.get_mut(&token) {
            session.window = Some(window);
            session.framebuffer = Some(fb);
            session.flip_requested = false;
            session.draw_pending = false;
        }
        debug!(?token, width, height, double_buffered, "video mode set");
        self.post(token, &reply);
    }

    fn handle_draw(&mut self, token: Token, flip: bool) {
        let has_window = self
            .sessions
            .get(&token)
            .is_some_and(|s| s.window.is_some());
        if !has_window {
            warn!(?token, "draw before video mode negotiation");
            self.close_session(token);
            return;
        }
        if let Some(session) = self.sessions.get_mut(&token) {
            // Assigned, not accumulated: the latest draw decides.
            session.flip_requested = flip;
            session.draw_pending = true;
        }
    }

    fn handle_warp_mouse(&mut self, token: Token, x: i32, y: i32) {
        let Some(window) = self.sessions.get(&token).and_then(|s| s.window) else {
            return;
        };
        // Only the topmost window may move the shared pointer.
        if !self.toolkit.is_top(window) {
            return;
        }
        let rect = self.toolkit.client_rect(window);
        let x = x.clamp(0, (rect.width - 1).max(0));
        let y = y.clamp(0, (rect.height - 1).max(0));
        self.toolkit.warp_pointer(window, x, y);
    }

    fn handle_set_caption(&mut self, token: Token, text: &str) {
        if let Some(window) = self.sessions.get(&token).and_then(|s| s.window) {
            self.toolkit.set_title(window, text);
        }
    }

    fn handle_add_cursor(
        &mut self,
        token: Token,
        width: i32,
        height: i32,
        hot_x: i32,
        hot_y: i32,
        data: &[u8],
    ) {
        let mut index = -1;
        if width >= 0 && height >= 0 && width % 8 == 0 {
            let plane = (width / 8) as usize * height as usize;
            if data.len() >= plane * 2 {
                let (bitmap, rest) = data.split_at(plane);
                if let Some(cursor) = self
                    .toolkit
                    .create_cursor(width, height, hot_x, hot_y, bitmap, &rest[..plane])
                {
                    match self.sessions.get_mut(&token) {
                        Some(session) => index = session.add_cursor(cursor),
                        None => self.toolkit.free_cursor(cursor),
                    }
                }
            }
        }
        if index < 0 {
            debug!(?token, width, height, "cursor rejected");
        }
        self.post(token, &Reply::CursorAdded { index });
    }

    fn handle_manage_cursor(&mut self, token: Token, op: i32, index: i32) {
        // Unknown ops and dangling indices are silent no-ops.
        let Some(op) = CursorOp::from_raw(op) else {
            return;
        };
        let Some(window) = self.sessions.get(&token).and_then(|s| s.window) else {
            return;
        };
        match op {
            CursorOp::Set => {
                if index == -1 {
                    self.toolkit.set_cursor(window, None);
                } else if let Some(cursor) =
                    self.sessions.get(&token).and_then(|s| s.cursor(index))
                {
                    self.toolkit.set_cursor(window, Some(cursor));
                }
            }
            CursorOp::Delete => {
                let deleted = self
                    .sessions
                    .get_mut(&token)
                    .and_then(|s| s.delete_cursor(index));
                if let Some(cursor) = deleted {
                    if self.toolkit.active_cursor(window) == Some(cursor) {
                        self.toolkit.set_cursor(window, None);
                    }
                    self.toolkit.free_cursor(cursor);
                }
            }
            CursorOp::Show => self.toolkit.show_cursor(window, true),
            CursorOp::Hide => self.toolkit.show_cursor(window, false),
        }
    }

    /// Present every session with a pending draw, or record an idle
    /// wakeup if there were none.
    fn frame_tick(&mut self) {
        let due: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.draw_pending)
            .map(|(t, _)| *t)
            .collect();
        if due.is_empty() {
            self.clock.idle_tick(Instant::now());
            return;
        }
        for token in due {
            let flip = match self.sessions.get(&token) {
                Some(session) => session.flip_requested,
                None => continue,
            };
            // Ack first so the client can start its next frame while
            // we blit this one.
            if flip && !self.post(token, &Reply::Flipped) {
                continue;
            }
            let Some(session) = self.sessions.get_mut(&token) else {
                continue;
            };
            session.draw_pending = false;
            session.flip_requested = false;
            let window = session.window;
            let view = session.framebuffer.as_mut().map(|fb| {
                if flip {
                    fb.swap();
                }
                (fb.front(), fb.front_ptr())
            });
            if let (Some(window), Some((surface, pixels))) = (window, view) {
                self.toolkit.blit(window, &surface, pixels);
                self.toolkit.mark_dirty(window);
            }
        }
        self.toolkit.present();
        self.clock.frame_presented(Instant::now());
    }

    /// Encode and deliver a reply. Returns false when the session was
    /// closed by a delivery failure.
    fn post(&mut self, token: Token, reply: &Reply) -> bool {
        let mut scratch = std::mem::take(&mut self.scratch);
        protocol::encode(reply, &mut scratch);
        let result = match self.sessions.get_mut(&token) {
            Some(session) => {
                let fd = session.raw_fd();
                session.queue.post(fd, &scratch)
            }
            None => {
                self.scratch = scratch;
                return false;
            }
        };
        self.scratch = scratch;
        match result {
            Ok(Delivery::Sent) => true,
            Ok(Delivery::Queued) => {
                self.set_write_interest(token, true);
                true
            }
            Err(err) => {
                warn!(?token, %err, "send failed");
                self.close_session(token);
                false
            }
        }
    }

    fn post_window(&mut self, window: WindowId, reply: &Reply) {
        if let Some(token) = self.windows.get(&window).copied() {
            self.post(token, reply);
        }
    }

    fn set_write_interest(&mut self, token: Token, on: bool) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        if session.write_interest == on {
            return;
        }
        session.write_interest = on;
        let raw = session.raw_fd();
        let interest = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(err) = self
            .poll
            .registry()
            .reregister(&mut SourceFd(&raw), token, interest)
        {
            warn!(?token, %err, "reregister failed");
        }
    }

    fn flush_session(&mut self, token: Token) {
        let result = {
            let Some(session) = self.sessions.get_mut(&token) else {
                return;
            };
            let fd = session.raw_fd();
            session.queue.flush(fd)
        };
        match result {
            Ok(true) => self.set_write_interest(token, false),
            Ok(false) => {}
            Err(err) => {
                warn!(?token, %err, "flush failed");
                self.close_session(token);
            }
        }
    }

    /// Drain toolkit events and fan them out to the owning sessions.
    fn pump_toolkit(&mut self) -> bool {
        let mut any = false;
        while let Some(event) = self.toolkit.poll_event() {
            any = true;
            match event {
                ToolkitEvent::Quit => {
                    info!("display quit");
                    SHUTDOWN.store(true, Ordering::Relaxed);
                }
                ToolkitEvent::CloseRequested { window } => {
                    if let Some(token) = self.windows.get(&window).copied() {
                        self.post(token, &Reply::QuitEvent);
                        self.close_session(token);
                    }
                }
                ToolkitEvent::Key {
                    window,
                    pressed,
                    sym,
                    modifiers,
                } => self.post_window(
                    window,
                    &Reply::KeyEvent {
                        pressed,
                        sym,
                        modifiers,
                    },
                ),
                ToolkitEvent::MouseButton {
                    window,
                    pressed,
                    button,
                    x,
                    y,
                } => self.post_window(
                    window,
                    &Reply::MouseButtonEvent {
                        pressed,
                        button,
                        x,
                        y,
                    },
                ),
                ToolkitEvent::MouseMove {
                    window,
                    buttons,
                    x,
                    y,
                    dx,
                    dy,
                } => self.post_window(window, &Reply::MouseMoveEvent { buttons, x, y, dx, dy }),
                ToolkitEvent::Resized {
                    window,
                    width,
                    height,
                } => self.post_window(window, &Reply::ResizedEvent { width, height }),
                ToolkitEvent::Focus { window, gained } => self.post_window(
                    window,
                    &Reply::ActiveEvent {
                        gain: gained,
                        input_focus: true,
                    },
                ),
                ToolkitEvent::PointerCrossing { window, entered } => self.post_window(
                    window,
                    &Reply::ActiveEvent {
                        gain: entered,
                        input_focus: false,
                    },
                ),
            }
        }
        any
    }

    /// Tear a session down: shared memory, cursors, window, then the
    /// socket and queue go with the session value. Idempotent.
    fn close_session(&mut self, token: Token) {
        let Some(mut session) = self.sessions.remove(&token) else {
            return;
        };
        debug!(?token, "closing session");
        let raw = session.raw_fd();
        if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&raw)) {
            warn!(?token, %err, "deregister failed");
        }
        session.framebuffer = None;
        for cursor in session.take_cursors() {
            self.toolkit.free_cursor(cursor);
        }
        if let Some(window) = session.window.take() {
            self.windows.remove(&window);
            self.toolkit.close_window(window);
        }
    }
}

fn next_shm_name() -> String {
    let serial = SHM_SERIAL.fetch_add(1, Ordering::Relaxed);
    format!("/pixmux_{}_{}", std::process::id(), serial)
}

fn video_mode_failed(width: i32, height: i32, double_buffered: bool) -> Reply {
    Reply::VideoModeSet {
        success: false,
        double_buffered,
        width,
        height,
        pitch: 0,
        depth: 0,
        rmask: 0,
        gmask: 0,
        bmask: 0,
        name: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolkit::HeadlessToolkit;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pixmux_srv_{}_{}", std::process::id(), tag))
    }

    fn connected(tag: &str) -> (Server<HeadlessToolkit>, OwnedFd, PathBuf) {
        let path = temp_path(tag);
        let _ = std::fs::remove_file(&path);
        let mut server = Server::bind(&path, HeadlessToolkit::new(640, 480)).unwrap();
        let client = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        socket::connect(client.as_raw_fd(), &UnixAddr::new(&path).unwrap()).unwrap();
        server.turn().unwrap();
        assert_eq!(server.session_count(), 1);
        (server, client, path)
    }

    fn msg(tag: i32, body: &[u8]) -> Vec<u8> {
        let mut m = tag.to_le_bytes().to_vec();
        m.extend_from_slice(body);
        m
    }

    fn send(client: &OwnedFd, m: &[u8]) {
        socket::send(client.as_raw_fd(), m, MsgFlags::empty()).unwrap();
    }

    fn recv_reply(server: &mut Server<HeadlessToolkit>, client: &OwnedFd) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        for _ in 0..200 {
            server.turn().unwrap();
            match socket::recv(client.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(n) => return buf[..n].to_vec(),
                Err(Errno::EAGAIN) => continue,
                Err(err) => panic!("recv: {err}"),
            }
        }
        panic!("no reply arrived");
    }

    fn set_video_mode(w: i32, h: i32, double: bool) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&w.to_le_bytes());
        body.extend_from_slice(&h.to_le_bytes());
        body.push(u8::from(double));
        body.push(0);
        msg(protocol::SET_VIDEO_MODE, &body)
    }

    fn attach(server: &mut Server<HeadlessToolkit>, path: &Path) -> OwnedFd {
        let client = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        socket::connect(client.as_raw_fd(), &UnixAddr::new(path).unwrap()).unwrap();
        server.turn().unwrap();
        client
    }

    fn warp(x: i32, y: i32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&x.to_le_bytes());
        body.extend_from_slice(&y.to_le_bytes());
        msg(protocol::WARP_MOUSE, &body)
    }

    fn manage_cursor(op: i32, index: i32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&op.to_le_bytes());
        body.extend_from_slice(&index.to_le_bytes());
        msg(protocol::MANAGE_CURSOR, &body)
    }

    fn add_cursor_16x2() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&16i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&[0xff; 8]);
        msg(protocol::ADD_CURSOR, &body)
    }

    fn settle(server: &mut Server<HeadlessToolkit>) {
        for _ in 0..3 {
            server.turn().unwrap();
        }
    }

    #[test]
    fn draw_without_window_closes_the_session() {
        let (mut server, client, path) = connected("draw_no_window");
        send(&client, &msg(protocol::DRAW, &[1]));
        for _ in 0..50 {
            server.turn().unwrap();
            if server.session_count() == 0 {
                break;
            }
        }
        assert_eq!(server.session_count(), 0);
        let mut buf = [0u8; 16];
        let n = socket::recv(client.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(n, 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn flip_cycle_swaps_buffers_and_acks() {
        let (mut server, client, path) = connected("flip");
        send(&client, &set_video_mode(64, 32, true));
        let reply = recv_reply(&mut server, &client);
        assert_eq!(reply[..4], protocol::VIDEO_MODE_SET.to_le_bytes());
        assert_eq!(reply[4], 1);

        let token = *server.sessions.keys().next().unwrap();
        let offset_before = server.sessions[&token]
            .framebuffer
            .as_ref()
            .map(|fb| fb.front().offset())
            .unwrap();

        send(&client, &msg(protocol::DRAW, &[1]));
        std::thread::sleep(std::time::Duration::from_millis(25));
        let ack = recv_reply(&mut server, &client);
        assert_eq!(ack[..4], protocol::FLIPPED.to_le_bytes());

        let offset_after = server.sessions[&token]
            .framebuffer
            .as_ref()
            .map(|fb| fb.front().offset())
            .unwrap();
        assert_ne!(offset_before, offset_after);
        assert!(server.toolkit().presents >= 1);
        assert!(server.toolkit().blits >= 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn draw_without_flip_presents_without_swapping() {
        let (mut server, client, path) = connected("noflip");
        send(&client, &set_video_mode(64, 32, true));
        let _ = recv_reply(&mut server, &client);

        let token = *server.sessions.keys().next().unwrap();
        let offset_before = server.sessions[&token]
            .framebuffer
            .as_ref()
            .map(|fb| fb.front().offset())
            .unwrap();

        send(&client, &msg(protocol::DRAW, &[0]));
        std::thread::sleep(std::time::Duration::from_millis(25));
        for _ in 0..10 {
            server.turn().unwrap();
            if server.toolkit().presents > 0 {
                break;
            }
        }
        assert!(server.toolkit().presents >= 1);
        let offset_after = server.sessions[&token]
            .framebuffer
            .as_ref()
            .map(|fb| fb.front().offset())
            .unwrap();
        assert_eq!(offset_before, offset_after);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn caption_before_negotiation_is_ignored() {
        let (mut server, client, path) = connected("caption");
        send(&client, &msg(protocol::SET_CAPTION, b"early"));
        for _ in 0..10 {
            server.turn().unwrap();
        }
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.toolkit().window_count(), 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn warp_clamps_to_the_window_client_rect() {
        let (mut server, client, path) = connected("warp_clamp");
        send(&client, &set_video_mode(64, 32, false));
        let _ = recv_reply(&mut server, &client);

        send(&client, &warp(10_000, -5));
        settle(&mut server);
        assert_eq!(server.toolkit().pointer, (63, 0));

        send(&client, &warp(9_999, 9_999));
        settle(&mut server);
        assert_eq!(server.toolkit().pointer, (63, 31));

        // In-range coordinates pass through untouched, inside the
        // display either way.
        send(&client, &warp(5, 7));
        settle(&mut server);
        assert_eq!(server.toolkit().pointer, (5, 7));
        let (dw, dh) = server.toolkit().display_size();
        let (px, py) = server.toolkit().pointer;
        assert!(px < dw && py < dh);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn warp_from_a_covered_window_is_ignored() {
        let (mut server, first, path) = connected("warp_top");
        send(&first, &set_video_mode(64, 32, false));
        let _ = recv_reply(&mut server, &first);

        let second = attach(&mut server, &path);
        send(&second, &set_video_mode(64, 32, false));
        let _ = recv_reply(&mut server, &second);
        assert_eq!(server.session_count(), 2);

        // The first window is no longer topmost; its warp is dropped.
        send(&first, &warp(10, 10));
        settle(&mut server);
        assert_eq!(server.toolkit().pointer, (0, 0));

        send(&second, &warp(10, 10));
        settle(&mut server);
        assert_eq!(server.toolkit().pointer, (10, 10));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn cursor_set_delete_show_hide_through_the_protocol() {
        let (mut server, client, path) = connected("cursor_ops");
        send(&client, &set_video_mode(32, 32, false));
        let _ = recv_reply(&mut server, &client);

        send(&client, &add_cursor_16x2());
        let _ = recv_reply(&mut server, &client);
        send(&client, &add_cursor_16x2());
        let added = recv_reply(&mut server, &client);
        assert_eq!(added[4..8], 1i32.to_le_bytes());
        assert_eq!(server.toolkit().live_cursor_count(), 2);

        // Set, then clear with -1.
        send(&client, &manage_cursor(0, 0));
        settle(&mut server);
        assert!(server.toolkit().active_cursor(1).is_some());
        send(&client, &manage_cursor(0, -1));
        settle(&mut server);
        assert_eq!(server.toolkit().active_cursor(1), None);

        // Deleting the active cursor clears it before freeing.
        send(&client, &manage_cursor(0, 1));
        settle(&mut server);
        assert!(server.toolkit().active_cursor(1).is_some());
        send(&client, &manage_cursor(1, 1));
        settle(&mut server);
        assert_eq!(server.toolkit().active_cursor(1), None);
        assert_eq!(server.toolkit().live_cursor_count(), 1);

        // Hide and show.
        assert!(server.toolkit().cursor_visible(1));
        send(&client, &manage_cursor(3, 0));
        settle(&mut server);
        assert!(!server.toolkit().cursor_visible(1));
        send(&client, &manage_cursor(2, 0));
        settle(&mut server);
        assert!(server.toolkit().cursor_visible(1));

        // Tombstoned or out-of-range indices are silent no-ops.
        send(&client, &manage_cursor(1, 1));
        send(&client, &manage_cursor(0, 9));
        settle(&mut server);
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.toolkit().live_cursor_count(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn session_teardown_releases_window_and_cursors() {
        let (mut server, client, path) = connected("teardown");
        send(&client, &set_video_mode(32, 32, false));
        let _ = recv_reply(&mut server, &client);

        send(&client, &add_cursor_16x2());
        let added = recv_reply(&mut server, &client);
        assert_eq!(added[..4], protocol::CURSOR_ADDED.to_le_bytes());
        assert_eq!(added[4..8], 0i32.to_le_bytes());
        assert_eq!(server.toolkit().live_cursor_count(), 1);
        assert_eq!(server.toolkit().window_count(), 1);

        drop(client);
        for _ in 0..50 {
            server.turn().unwrap();
            if server.session_count() == 0 {
                break;
            }
        }
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.toolkit().window_count(), 0);
        assert_eq!(server.toolkit().live_cursor_count(), 0);
        assert!(server.windows.is_empty());
        let _ = std::fs::remove_file(path);
    }
}
