//! Storage for published frames and optional per-frame snapshots.
//!
//! The store is the single source of truth for frame replay during one
//! in-game session: every frame the tick engine publishes lands here, and
//! every catch-up window a straggler receives is cut from here. It grows
//! monotonically while a match runs and is emptied when the room returns to
//! the lobby. Owned by the room loop; dispatch tasks only ever see cloned
//! windows.

use std::collections::BTreeMap;

use shared::FrameData;

#[derive(Default)]
pub struct FrameStore {
    frames: BTreeMap<u32, FrameData>,
    snapshots: BTreeMap<u32, Vec<u8>>,
}

impl FrameStore {
    pub fn new() -> FrameStore {
        FrameStore::default()
    }

    pub fn insert(&mut self, frame_id: u32, frame: FrameData) {
        self.frames.insert(frame_id, frame);
    }

    pub fn get(&self, frame_id: u32) -> Option<&FrameData> {
        self.frames.get(&frame_id)
    }

    /// The contiguous catch-up window `(after, up_to]`, oldest first.
    pub fn window(&self, after: u32, up_to: u32) -> Vec<FrameData> {
        if up_to <= after {
            return Vec::new();
        }
        self.frames
            .range(after + 1..=up_to)
            .map(|(_, fd)| fd.clone())
            .collect()
    }

    pub fn insert_snapshot(&mut self, frame_id: u32, snapshot: Vec<u8>) {
        self.snapshots.insert(frame_id, snapshot);
    }

    pub fn snapshot(&self, frame_id: u32) -> Option<&Vec<u8>> {
        self.snapshots.get(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drops all frames and snapshots for the next match.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_contiguous_and_half_open() {
        let mut store = FrameStore::new();
        for id in 1..=10 {
            store.insert(id, FrameData::empty(id));
        }

        let window = store.window(3, 7);
        let ids: Vec<u32> = window.iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);

        assert!(store.window(7, 7).is_empty());
        assert!(store.window(9, 3).is_empty());
    }

    #[test]
    fn window_from_zero_covers_everything() {
        let mut store = FrameStore::new();
        for id in 1..=4 {
            store.insert(id, FrameData::empty(id));
        }
        let ids: Vec<u32> = store.window(0, 4).iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn snapshots_are_independent_of_frames() {
        let mut store = FrameStore::new();
        store.insert(1, FrameData::empty(1));
        store.insert_snapshot(1, vec![0xAB]);

        assert_eq!(store.snapshot(1), Some(&vec![0xAB]));
        assert_eq!(store.snapshot(2), None);
    }

    #[test]
    fn reset_empties_the_store() {
        let mut store = FrameStore::new();
        store.insert(1, FrameData::empty(1));
        store.insert_snapshot(1, vec![1]);
        assert_eq!(store.len(), 1);

        store.reset();
        assert!(store.is_empty());
        assert_eq!(store.snapshot(1), None);
    }
}
