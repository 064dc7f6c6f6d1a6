//! pixmux — a local display-multiplexing server.
//!
//! Clients connect over a Unix `SOCK_SEQPACKET` socket, negotiate a
//! shared-memory pixel buffer, and receive a window on the single real
//! display. The server fans input events out to the owning client and
//! arbitrates when each client's buffer is presented.
//!
//! The crate is the session/protocol engine: wire codec, per-session
//! outbound buffering, shared-memory framebuffer negotiation, cursor
//! resource tracking, and the adaptive frame-pacing reactor. The
//! windowing/chrome toolkit lives behind the [`toolkit::Toolkit`]
//! trait; [`toolkit::HeadlessToolkit`] is the built-in backend.

pub mod pacing;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod shm;
pub mod toolkit;

pub use server::{Server, ServerError};
pub use toolkit::{HeadlessToolkit, Toolkit};
