//! The windowing-toolkit boundary.
//!
//! The server core never talks to a display directly. Everything it
//! needs from the chrome side is captured by the [`Toolkit`] trait:
//! window lifecycle, pixel blits, presentation, cursors, pointer warp
//! and the raw input event stream. [`HeadlessToolkit`] is the built-in
//! backend: it keeps the bookkeeping, renders nothing, and doubles as
//! the test harness.

use std::collections::{HashMap, VecDeque};

use crate::shm::Surface;

pub type WindowId = u32;
pub type CursorId = u32;

/// Channel masks of the 32-bit pixel layout the display expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub rmask: u32,
    pub gmask: u32,
    pub bmask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Raw input and window events as the toolkit reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolkitEvent {
    Key {
        window: WindowId,
        pressed: bool,
        sym: u32,
        modifiers: u16,
    },
    MouseButton {
        window: WindowId,
        pressed: bool,
        button: u8,
        x: i32,
        y: i32,
    },
    MouseMove {
        window: WindowId,
        buttons: u8,
        x: i32,
        y: i32,
        dx: i32,
        dy: i32,
    },
    PointerCrossing {
        window: WindowId,
        entered: bool,
    },
    Focus {
        window: WindowId,
        gained: bool,
    },
    Resized {
        window: WindowId,
        width: i32,
        height: i32,
    },
    CloseRequested {
        window: WindowId,
    },
    /// The whole display is going away.
    Quit,
}

/// Everything the session engine needs from a windowing backend.
pub trait Toolkit {
    fn pixel_format(&self) -> PixelFormat;

    fn create_window(
        &mut self,
        width: i32,
        height: i32,
        title: &str,
        resizable: bool,
    ) -> Option<WindowId>;
    fn resize_window(&mut self, window: WindowId, width: i32, height: i32);
    fn close_window(&mut self, window: WindowId);
    fn set_title(&mut self, window: WindowId, title: &str);
    fn client_rect(&self, window: WindowId) -> Rect;
    fn is_top(&self, window: WindowId) -> bool;
    fn mark_dirty(&mut self, window: WindowId);

    fn warp_pointer(&mut self, window: WindowId, x: i32, y: i32);

    fn create_cursor(
        &mut self,
        width: i32,
        height: i32,
        hot_x: i32,
        hot_y: i32,
        bitmap: &[u8],
        mask: &[u8],
    ) -> Option<CursorId>;
    fn free_cursor(&mut self, cursor: CursorId);
    fn set_cursor(&mut self, window: WindowId, cursor: Option<CursorId>);
    fn active_cursor(&self, window: WindowId) -> Option<CursorId>;
    fn show_cursor(&mut self, window: WindowId, visible: bool);

    /// Copy the front surface into the window's backing store.
    ///
    /// # Safety contract
    /// `pixels` must point at least `surface.pitch() * surface.height()`
    /// readable bytes; the caller derives it from a live mapping.
    fn blit(&mut self, window: WindowId, surface: &Surface, pixels: *const u8);
    /// Composite all dirty windows onto the display.
    fn present(&mut self);

    fn poll_event(&mut self) -> Option<ToolkitEvent>;
}

#[derive(Debug)]
struct HeadlessWindow {
    width: i32,
    height: i32,
    title: String,
    cursor: Option<CursorId>,
    cursor_visible: bool,
    dirty: bool,
}

/// Backend that tracks windows and cursors without a display.
pub struct HeadlessToolkit {
    display_width: i32,
    display_height: i32,
    windows: HashMap<WindowId, HeadlessWindow>,
    next_window: WindowId,
    live_cursors: usize,
    next_cursor: CursorId,
    events: VecDeque<ToolkitEvent>,
    /// Stacking order, back to front.
    stack: Vec<WindowId>,
    pub blits: u64,
    pub presents: u64,
    pub pointer: (i32, i32),
}

impl HeadlessToolkit {
    pub fn new(display_width: i32, display_height: i32) -> Self {
        HeadlessToolkit {
            display_width,
            display_height,
            windows: HashMap::new(),
            next_window: 1,
            live_cursors: 0,
            next_cursor: 1,
            events: VecDeque::new(),
            stack: Vec::new(),
            blits: 0,
            presents: 0,
            pointer: (0, 0),
        }
    }

    pub fn display_size(&self) -> (i32, i32) {
        (self.display_width, self.display_height)
    }

    /// Inject an event, as a real backend's input thread would.
    pub fn push_event(&mut self, event: ToolkitEvent) {
        self.events.push_back(event);
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn live_cursor_count(&self) -> usize {
        self.live_cursors
    }

    pub fn window_title(&self, window: WindowId) -> Option<&str> {
        self.windows.get(&window).map(|w| w.title.as_str())
    }

    pub fn cursor_visible(&self, window: WindowId) -> bool {
        self.windows.get(&window).is_some_and(|w| w.cursor_visible)
    }
}

impl Toolkit for HeadlessToolkit {
    fn pixel_format(&self) -> PixelFormat {
        PixelFormat {
            rmask: 0x00ff_0000,
            gmask: 0x0000_ff00,
            bmask: 0x0000_00ff,
        }
    }

    fn create_window(
        &mut self,
        width: i32,
        height: i32,
        title: &str,
        _resizable: bool,
    ) -> Option<WindowId> {
        let id = self.next_window;
        self.next_window += 1;
        self.windows.insert(
            id,
            HeadlessWindow {
                width,
                height,
                title: title.to_string(),
                cursor: None,
                cursor_visible: true,
                dirty: false,
            },
        );
        self.stack.push(id);
        Some(id)
    }

    fn resize_window(&mut self, window: WindowId, width: i32, height: i32) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.width = width;
            w.height = height;
        }
    }

    fn close_window(&mut self, window: WindowId) {
        self.windows.remove(&window);
        self.stack.retain(|id| *id != window);
    }

    fn set_title(&mut self, window: WindowId, title: &str) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.title = title.to_string();
        }
    }

    fn client_rect(&self, window: WindowId) -> Rect {
        match self.windows.get(&window) {
            Some(w) => Rect {
                x: 0,
                y: 0,
                width: w.width,
                height: w.height,
            },
            None => Rect::default(),
        }
    }

    fn is_top(&self, window: WindowId) -> bool {
        self.stack.last() == Some(&window)
    }

    fn mark_dirty(&mut self, window: WindowId) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.dirty = true;
        }
    }

    fn warp_pointer(&mut self, _window: WindowId, x: i32, y: i32) {
        self.pointer = (x, y);
    }

    fn create_cursor(
        &mut self,
        width: i32,
        height: i32,
        _hot_x: i32,
        _hot_y: i32,
        bitmap: &[u8],
        mask: &[u8],
    ) -> Option<CursorId> {
        let plane = (width / 8) as usize * height as usize;
        if bitmap.len() < plane || mask.len() < plane {
            return None;
        }
        let id = self.next_cursor;
        self.next_cursor += 1;
        self.live_cursors += 1;
        Some(id)
    }

    fn free_cursor(&mut self, _cursor: CursorId) {
        self.live_cursors = self.live_cursors.saturating_sub(1);
    }

    fn set_cursor(&mut self, window: WindowId, cursor: Option<CursorId>) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.cursor = cursor;
        }
    }

    fn active_cursor(&self, window: WindowId) -> Option<CursorId> {
        self.windows.get(&window).and_then(|w| w.cursor)
    }

    fn show_cursor(&mut self, window: WindowId, visible: bool) {
        if let Some(w) = self.windows.get_mut(&window) {
            w.cursor_visible = visible;
        }
    }

    fn blit(&mut self, window: WindowId, _surface: &Surface, _pixels: *const u8) {
        self.blits += 1;
        self.mark_dirty(window);
    }

    fn present(&mut self) {
        for w in self.windows.values_mut() {
            w.dirty = false;
        }
        self.presents += 1;
    }

    fn poll_event(&mut self) -> Option<ToolkitEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_created_window_is_top() {
        let mut tk = HeadlessToolkit::new(640, 480);
        let a = tk.create_window(100, 100, "a", false).unwrap();
        let b = tk.create_window(100, 100, "b", false).unwrap();
        assert!(!tk.is_top(a));
        assert!(tk.is_top(b));
        tk.close_window(b);
        assert!(tk.is_top(a));
    }

    #[test]
    fn cursor_creation_validates_plane_sizes() {
        let mut tk = HeadlessToolkit::new(640, 480);
        assert!(tk.create_cursor(16, 2, 0, 0, &[0; 4], &[0; 4]).is_some());
        assert!(tk.create_cursor(16, 2, 0, 0, &[0; 3], &[0; 4]).is_none());
        assert_eq!(tk.live_cursor_count(), 1);
    }

    #[test]
    fn events_come_back_in_order() {
        let mut tk = HeadlessToolkit::new(640, 480);
        tk.push_event(ToolkitEvent::Quit);
        tk.push_event(ToolkitEvent::Focus {
            window: 1,
            gained: true,
        });
        assert_eq!(tk.poll_event(), Some(ToolkitEvent::Quit));
        assert!(matches!(tk.poll_event(), Some(ToolkitEvent::Focus { .. })));
        assert_eq!(tk.poll_event(), None);
    }
}
