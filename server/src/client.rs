//! Per-client state inside a room.
//!
//! A `ClientRecord` is created by the admission path and shared (via `Arc`)
//! between the room loop, the client's read loop, and the tick dispatch
//! tasks. The two frame counters are the only fields written outside the
//! room loop: the read loop updates them when an in-game frame report is
//! decoded, the tick engine reads them to size each client's catch-up
//! window. Everything else is written exclusively by the room loop; the
//! flags are atomics only so the record can live behind an `Arc`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::session::Session;

pub struct ClientRecord {
    uid: u32,
    session: Session,
    /// True when this record was admitted through a reconnect token.
    pub is_reconnected: bool,
    is_ready: AtomicBool,
    is_loaded: AtomicBool,
    /// The next frame the server last saw this client report it was about
    /// to render.
    latest_next_frame: AtomicU32,
    /// The next frame the client has confirmed receipt of all prior frame
    /// data for. Always `<= latest_next_frame`.
    latest_ack_next_frame: AtomicU32,
}

impl ClientRecord {
    pub fn new(uid: u32, session: Session, is_reconnected: bool) -> ClientRecord {
        ClientRecord {
            uid,
            session,
            is_reconnected,
            is_ready: AtomicBool::new(false),
            is_loaded: AtomicBool::new(false),
            latest_next_frame: AtomicU32::new(0),
            latest_ack_next_frame: AtomicU32::new(0),
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.is_ready.store(ready, Ordering::Release);
    }

    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::Acquire)
    }

    pub fn set_loaded(&self, loaded: bool) {
        self.is_loaded.store(loaded, Ordering::Release);
    }

    pub fn latest_next_frame(&self) -> u32 {
        self.latest_next_frame.load(Ordering::Acquire)
    }

    pub fn latest_ack_next_frame(&self) -> u32 {
        self.latest_ack_next_frame.load(Ordering::Acquire)
    }

    /// Folds a frame report into the counters. Both only ever move
    /// forward; stale or reordered reports are ignored.
    pub fn update_frames(&self, frame_id: u32, ack_frame_id: u32) {
        self.latest_next_frame.fetch_max(frame_id, Ordering::AcqRel);
        self.latest_ack_next_frame
            .fetch_max(ack_frame_id, Ordering::AcqRel);
    }

    /// Copies match progress from the record this one replaces on
    /// reconnect, so the rebound client keeps its readiness and frame
    /// pointers.
    pub fn adopt_progress(&self, old: &ClientRecord) {
        self.is_ready.store(old.is_ready(), Ordering::Release);
        self.is_loaded.store(old.is_loaded(), Ordering::Release);
        self.latest_next_frame
            .store(old.latest_next_frame(), Ordering::Release);
        self.latest_ack_next_frame
            .store(old.latest_ack_next_frame(), Ordering::Release);
    }

    /// Clears readiness and frame progress for the next match.
    pub fn reset_progress(&self) {
        self.is_ready.store(false, Ordering::Release);
        self.is_loaded.store(false, Ordering::Release);
        self.latest_next_frame.store(0, Ordering::Release);
        self.latest_ack_next_frame.store(0, Ordering::Release);
    }
}
