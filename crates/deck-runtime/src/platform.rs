//! The desktop event source and window sink behind the `Window` connector.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;

pub type WindowId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Quit,
    MouseMotion {
        window: WindowId,
        x: i32,
        y: i32,
    },
    MouseButton {
        window: WindowId,
        x: i32,
        y: i32,
        button: u8,
        pressed: bool,
    },
    Key {
        window: WindowId,
        key: String,
        pressed: bool,
    },
    Resized {
        window: WindowId,
        width: u32,
        height: u32,
    },
    CloseRequested {
        window: WindowId,
    },
}

impl PlatformEvent {
    pub fn window(&self) -> Option<WindowId> {
        match self {
            PlatformEvent::Quit => None,
            PlatformEvent::MouseMotion { window, .. }
            | PlatformEvent::MouseButton { window, .. }
            | PlatformEvent::Key { window, .. }
            | PlatformEvent::Resized { window, .. }
            | PlatformEvent::CloseRequested { window } => Some(*window),
        }
    }
}

pub trait Platform {
    fn poll_events(&mut self) -> Vec<PlatformEvent>;

    fn create_window(&mut self, title: &str, width: u32, height: u32) -> Result<WindowId>;

    fn set_title(&mut self, window: WindowId, title: &str) -> Result<()>;

    fn set_size(&mut self, window: WindowId, width: u32, height: u32) -> Result<()>;

    fn set_visible(&mut self, window: WindowId, visible: bool) -> Result<()>;

    /// Presents an RGBA frame of `width * height` pixels.
    fn present(&mut self, window: WindowId, width: u32, height: u32, rgba: &[u8]) -> Result<()>;

    fn destroy_window(&mut self, window: WindowId);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadlessWindow {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub visible: bool,
    pub frames_presented: usize,
    pub last_frame: Vec<u8>,
}

#[derive(Debug, Default)]
struct HeadlessState {
    queue: Vec<PlatformEvent>,
    windows: BTreeMap<WindowId, HeadlessWindow>,
    next_id: WindowId,
}

/// A platform with no display. Events are injected through a
/// [`HeadlessHandle`]; windows only record what was presented.
#[derive(Debug, Default)]
pub struct HeadlessPlatform {
    state: Rc<RefCell<HeadlessState>>,
}

#[derive(Debug, Clone)]
pub struct HeadlessHandle {
    state: Rc<RefCell<HeadlessState>>,
}

impl HeadlessPlatform {
    pub fn new() -> Self {
        HeadlessPlatform::default()
    }

    pub fn handle(&self) -> HeadlessHandle {
        HeadlessHandle {
            state: self.state.clone(),
        }
    }
}

impl HeadlessHandle {
    pub fn push(&self, event: PlatformEvent) {
        self.state.borrow_mut().queue.push(event);
    }

    pub fn window(&self, id: WindowId) -> Option<HeadlessWindow> {
        self.state.borrow().windows.get(&id).cloned()
    }

    pub fn window_ids(&self) -> Vec<WindowId> {
        self.state.borrow().windows.keys().copied().collect()
    }
}

impl HeadlessState {
    fn window_mut(&mut self, id: WindowId) -> Result<&mut HeadlessWindow> {
        self.windows
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("unknown window id {id}"))
    }
}

impl Platform for HeadlessPlatform {
    fn poll_events(&mut self) -> Vec<PlatformEvent> {
        std::mem::take(&mut self.state.borrow_mut().queue)
    }

    fn create_window(&mut self, title: &str, width: u32, height: u32) -> Result<WindowId> {
        let mut st = self.state.borrow_mut();
        st.next_id += 1;
        let id = st.next_id;
        st.windows.insert(
            id,
            HeadlessWindow {
                title: title.to_string(),
                width,
                height,
                visible: true,
                ..HeadlessWindow::default()
            },
        );
        Ok(id)
    }

    fn set_title(&mut self, window: WindowId, title: &str) -> Result<()> {
        self.state.borrow_mut().window_mut(window)?.title = title.to_string();
        Ok(())
    }

    fn set_size(&mut self, window: WindowId, width: u32, height: u32) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let w = st.window_mut(window)?;
        w.width = width;
        w.height = height;
        Ok(())
    }

    fn set_visible(&mut self, window: WindowId, visible: bool) -> Result<()> {
        self.state.borrow_mut().window_mut(window)?.visible = visible;
        Ok(())
    }

    fn present(&mut self, window: WindowId, width: u32, height: u32, rgba: &[u8]) -> Result<()> {
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            anyhow::bail!("frame is {} bytes, expected {expected}", rgba.len());
        }
        let mut st = self.state.borrow_mut();
        let w = st.window_mut(window)?;
        w.frames_presented += 1;
        w.last_frame = rgba.to_vec();
        Ok(())
    }

    fn destroy_window(&mut self, window: WindowId) {
        self.state.borrow_mut().windows.remove(&window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_records_windows_and_frames() {
        let mut p = HeadlessPlatform::new();
        let h = p.handle();
        let id = p.create_window("deck", 2, 1).unwrap();
        p.present(id, 2, 1, &[0; 8]).unwrap();
        assert!(p.present(id, 2, 2, &[0; 8]).is_err());
        assert_eq!(h.window(id).unwrap().frames_presented, 1);

        h.push(PlatformEvent::CloseRequested { window: id });
        let events = p.poll_events();
        assert_eq!(events[0].window(), Some(id));
        assert!(p.poll_events().is_empty());

        p.destroy_window(id);
        assert!(h.window(id).is_none());
        assert!(p.set_title(id, "x").is_err());
    }
}
