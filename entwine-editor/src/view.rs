//! Headless view collaborator.
//!
//! The terminal renderer is a separate concern; the replication core only
//! needs two things from it: where the local cursor is, and a way to say
//! "something changed, repaint". This module provides both for a node
//! running without a screen.

use std::sync::{Arc, Mutex};

use entwine_collab::session::{CursorSource, Redraw};
use entwine_core::Loc;

/// Shared view state: the local cursor plus a redraw signal.
pub struct ViewState {
    cursor: Mutex<Loc>,
}

impl ViewState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { cursor: Mutex::new(Loc::default()) })
    }

    /// Move the local cursor; wired up by the input loop of a real
    /// frontend.
    #[allow(dead_code)]
    pub fn set_cursor(&self, loc: Loc) {
        *self.cursor.lock().unwrap() = loc;
    }
}

impl CursorSource for ViewState {
    fn cursor(&self) -> Loc {
        *self.cursor.lock().unwrap()
    }
}

impl Redraw for ViewState {
    fn redraw_all(&self) {
        // A real frontend repaints here.
        log::trace!("redraw requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let view = ViewState::new();
        assert_eq!(view.cursor(), Loc::default());
        view.set_cursor(Loc::new(4, 2));
        assert_eq!(view.cursor(), Loc::new(4, 2));
    }
}
