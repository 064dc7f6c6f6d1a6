//! Wire protocol codec.
//!
//! Every application message is exactly one transport message: a 4-byte
//! little-endian type discriminant, a fixed-size payload for that type,
//! and optionally a trailing variable-length blob whose length is
//! implied by the transport message length (there is no inner length
//! field). Decoding never reads past the fixed part for fixed fields;
//! whatever bytes remain after it are the trailing payload.
//!
//! The codec is pure: no I/O, no state. Replies are serialized into a
//! caller-owned scratch buffer that is cleared on every call.

use thiserror::Error;

// Type discriminants. Client → server.
pub const SET_VIDEO_MODE: i32 = 1;
pub const DRAW: i32 = 4;
pub const WARP_MOUSE: i32 = 16;
pub const SET_CAPTION: i32 = 32;
pub const ADD_CURSOR: i32 = 4096;
pub const MANAGE_CURSOR: i32 = 16384;

// Server → client.
pub const VIDEO_MODE_SET: i32 = 2;
pub const FLIPPED: i32 = 8;
pub const KEY_EVENT: i32 = 64;
pub const MOUSE_BUTTON_EVENT: i32 = 128;
pub const MOUSE_MOVE_EVENT: i32 = 256;
pub const RESIZED_EVENT: i32 = 512;
pub const ACTIVE_EVENT: i32 = 1024;
pub const QUIT_EVENT: i32 = 2048;
pub const CURSOR_ADDED: i32 = 8192;

/// Why an inbound message could not be decoded. Either way the session
/// is in violation and gets closed without a response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message too short: {got} bytes, fixed part needs {need}")]
    Malformed { got: usize, need: usize },
    #[error("unrecognized message type {0}")]
    Unrecognized(i32),
}

/// Cursor management operations carried by [`Request::ManageCursor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    Set,
    Delete,
    Show,
    Hide,
}

impl CursorOp {
    /// Unknown operation values are a silent no-op, not a violation.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(CursorOp::Set),
            1 => Some(CursorOp::Delete),
            2 => Some(CursorOp::Show),
            3 => Some(CursorOp::Hide),
            _ => None,
        }
    }
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SetVideoMode {
        width: i32,
        height: i32,
        double_buffered: bool,
        resizable: bool,
    },
    Draw {
        flip: bool,
    },
    WarpMouse {
        x: i32,
        y: i32,
    },
    SetCaption {
        text: String,
    },
    AddCursor {
        width: i32,
        height: i32,
        hot_x: i32,
        hot_y: i32,
        /// Bitmap followed by mask, `width / 8 * height` bytes each.
        data: Vec<u8>,
    },
    ManageCursor {
        op: i32,
        index: i32,
    },
}

/// A reply or unsolicited event bound for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    VideoModeSet {
        success: bool,
        double_buffered: bool,
        width: i32,
        height: i32,
        pitch: i32,
        depth: i32,
        rmask: u32,
        gmask: u32,
        bmask: u32,
        /// Shared-memory name the client maps itself; trailing payload.
        name: String,
    },
    Flipped,
    KeyEvent {
        pressed: bool,
        sym: u32,
        modifiers: u16,
    },
    MouseButtonEvent {
        pressed: bool,
        button: u8,
        x: i32,
        y: i32,
    },
    MouseMoveEvent {
        buttons: u8,
        x: i32,
        y: i32,
        dx: i32,
        dy: i32,
    },
    ResizedEvent {
        width: i32,
        height: i32,
    },
    ActiveEvent {
        gain: bool,
        /// true = keyboard focus, false = pointer focus
        input_focus: bool,
    },
    QuitEvent,
    CursorAdded {
        index: i32,
    },
}

fn i32_at(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn fixed(body: &[u8], need: usize) -> Result<(), DecodeError> {
    if body.len() < need {
        Err(DecodeError::Malformed {
            got: body.len() + 4,
            need: need + 4,
        })
    } else {
        Ok(())
    }
}

/// Decode one transport message into a typed request.
pub fn decode(buf: &[u8]) -> Result<Request, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Malformed {
            got: buf.len(),
            need: 4,
        });
    }
    let tag = i32_at(buf, 0);
    let body = &buf[4..];
    match tag {
        SET_VIDEO_MODE => {
            fixed(body, 10)?;
            Ok(Request::SetVideoMode {
                width: i32_at(body, 0),
                height: i32_at(body, 4),
                double_buffered: body[8] != 0,
                resizable: body[9] != 0,
            })
        }
        DRAW => {
            fixed(body, 1)?;
            Ok(Request::Draw { flip: body[0] != 0 })
        }
        WARP_MOUSE => {
            fixed(body, 8)?;
            Ok(Request::WarpMouse {
                x: i32_at(body, 0),
                y: i32_at(body, 4),
            })
        }
        SET_CAPTION => {
            // The caption is the whole remainder; tolerate a trailing NUL
            // from C-ish clients.
            let text = String::from_utf8_lossy(body)
                .trim_end_matches('\0')
                .to_string();
            Ok(Request::SetCaption { text })
        }
        ADD_CURSOR => {
            fixed(body, 16)?;
            Ok(Request::AddCursor {
                width: i32_at(body, 0),
                height: i32_at(body, 4),
                hot_x: i32_at(body, 8),
                hot_y: i32_at(body, 12),
                data: body[16..].to_vec(),
            })
        }
        MANAGE_CURSOR => {
            fixed(body, 8)?;
            Ok(Request::ManageCursor {
                op: i32_at(body, 0),
                index: i32_at(body, 4),
            })
        }
        other => Err(DecodeError::Unrecognized(other)),
    }
}

/// Serialize a reply into `out`, clearing it first. The caller owns the
/// buffer and must copy or send `out[..]` before the next call.
pub fn encode(reply: &Reply, out: &mut Vec<u8>) {
    out.clear();
    match reply {
        Reply::VideoModeSet {
            success,
            double_buffered,
            width,
            height,
            pitch,
            depth,
            rmask,
            gmask,
            bmask,
            name,
        } => {
            out.extend_from_slice(&VIDEO_MODE_SET.to_le_bytes());
            out.push(u8::from(*success));
            out.push(u8::from(*double_buffered));
            out.extend_from_slice(&width.to_le_bytes());
            out.extend_from_slice(&height.to_le_bytes());
            out.extend_from_slice(&pitch.to_le_bytes());
            out.extend_from_slice(&depth.to_le_bytes());
            out.extend_from_slice(&rmask.to_le_bytes());
            out.extend_from_slice(&gmask.to_le_bytes());
            out.extend_from_slice(&bmask.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        Reply::Flipped => {
            out.extend_from_slice(&FLIPPED.to_le_bytes());
        }
        Reply::KeyEvent {
            pressed,
            sym,
            modifiers,
        } => {
            out.extend_from_slice(&KEY_EVENT.to_le_bytes());
            out.push(u8::from(*pressed));
            out.extend_from_slice(&sym.to_le_bytes());
            out.extend_from_slice(&modifiers.to_le_bytes());
        }
        Reply::MouseButtonEvent {
            pressed,
            button,
            x,
            y,
        } => {
            out.extend_from_slice(&MOUSE_BUTTON_EVENT.to_le_bytes());
            out.push(u8::from(*pressed));
            out.push(*button);
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        Reply::MouseMoveEvent {
            buttons,
            x,
            y,
            dx,
            dy,
        } => {
            out.extend_from_slice(&MOUSE_MOVE_EVENT.to_le_bytes());
            out.push(*buttons);
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
            out.extend_from_slice(&dx.to_le_bytes());
            out.extend_from_slice(&dy.to_le_bytes());
        }
        Reply::ResizedEvent { width, height } => {
            out.extend_from_slice(&RESIZED_EVENT.to_le_bytes());
            out.extend_from_slice(&width.to_le_bytes());
            out.extend_from_slice(&height.to_le_bytes());
        }
        Reply::ActiveEvent { gain, input_focus } => {
            out.extend_from_slice(&ACTIVE_EVENT.to_le_bytes());
            out.push(u8::from(*gain));
            out.push(u8::from(*input_focus));
        }
        Reply::QuitEvent => {
            out.extend_from_slice(&QUIT_EVENT.to_le_bytes());
        }
        Reply::CursorAdded { index } => {
            out.extend_from_slice(&CURSOR_ADDED.to_le_bytes());
            out.extend_from_slice(&index.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(tag: i32, body: &[u8]) -> Vec<u8> {
        let mut m = tag.to_le_bytes().to_vec();
        m.extend_from_slice(body);
        m
    }

    #[test]
    fn decode_set_video_mode() {
        let mut body = Vec::new();
        body.extend_from_slice(&320i32.to_le_bytes());
        body.extend_from_slice(&240i32.to_le_bytes());
        body.push(1);
        body.push(0);
        let req = decode(&msg(SET_VIDEO_MODE, &body)).unwrap();
        assert_eq!(
            req,
            Request::SetVideoMode {
                width: 320,
                height: 240,
                double_buffered: true,
                resizable: false,
            }
        );
    }

    #[test]
    fn decode_too_short_for_discriminant() {
        let err = decode(&[1, 0, 0]).unwrap_err();
        assert_eq!(err, DecodeError::Malformed { got: 3, need: 4 });
    }

    #[test]
    fn decode_too_short_for_fixed_part() {
        // SetVideoMode with only 6 of its 10 fixed bytes.
        let err = decode(&msg(SET_VIDEO_MODE, &[0; 6])).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { got: 10, need: 14 }));
    }

    #[test]
    fn decode_unknown_type() {
        let err = decode(&msg(3, &[])).unwrap_err();
        assert_eq!(err, DecodeError::Unrecognized(3));
    }

    #[test]
    fn decode_caption_takes_remainder() {
        let req = decode(&msg(SET_CAPTION, b"hello\0")).unwrap();
        assert_eq!(
            req,
            Request::SetCaption {
                text: "hello".into()
            }
        );
    }

    #[test]
    fn decode_add_cursor_trailing_payload() {
        let mut body = Vec::new();
        body.extend_from_slice(&16i32.to_le_bytes());
        body.extend_from_slice(&2i32.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&[0xAA; 8]); // 16/8 * 2 * 2 planes
        let req = decode(&msg(ADD_CURSOR, &body)).unwrap();
        match req {
            Request::AddCursor { width, height, data, .. } => {
                assert_eq!(width, 16);
                assert_eq!(height, 2);
                assert_eq!(data.len(), 8);
            }
            other => panic!("wrong request: {other:?}"),
        }
    }

    #[test]
    fn decode_manage_cursor() {
        let mut body = Vec::new();
        body.extend_from_slice(&1i32.to_le_bytes());
        body.extend_from_slice(&7i32.to_le_bytes());
        let req = decode(&msg(MANAGE_CURSOR, &body)).unwrap();
        assert_eq!(req, Request::ManageCursor { op: 1, index: 7 });
        assert_eq!(CursorOp::from_raw(1), Some(CursorOp::Delete));
        assert_eq!(CursorOp::from_raw(9), None);
    }

    #[test]
    fn encode_video_mode_set_layout() {
        let reply = Reply::VideoModeSet {
            success: true,
            double_buffered: true,
            width: 320,
            height: 240,
            pitch: 1280,
            depth: 32,
            rmask: 0x00ff0000,
            gmask: 0x0000ff00,
            bmask: 0x000000ff,
            name: "/pixmux_1_0".into(),
        };
        let mut out = Vec::new();
        encode(&reply, &mut out);
        assert_eq!(i32_at(&out, 0), VIDEO_MODE_SET);
        assert_eq!(out[4], 1); // success
        assert_eq!(out[5], 1); // double buffered
        assert_eq!(i32_at(&out, 6), 320);
        assert_eq!(i32_at(&out, 10), 240);
        assert_eq!(i32_at(&out, 14), 1280);
        assert_eq!(i32_at(&out, 18), 32);
        assert_eq!(&out[34..], b"/pixmux_1_0");
    }

    #[test]
    fn encode_clears_scratch_between_calls() {
        let mut out = Vec::new();
        encode(
            &Reply::MouseMoveEvent {
                buttons: 1,
                x: 10,
                y: 20,
                dx: 1,
                dy: -1,
            },
            &mut out,
        );
        let first = out.len();
        assert_eq!(first, 4 + 17);
        encode(&Reply::Flipped, &mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(i32_at(&out, 0), FLIPPED);
    }
}
