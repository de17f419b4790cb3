use std::collections::BTreeMap;

use util::c64_geometry::{default_speed, HALF_TRACK_COUNT};

/// Raw GCR content of one half track together with its speed zone.
#[derive(Debug)]
pub struct HalfTrack {
    pub data: Vec<u8>,
    pub speed: u8,
}

/// The common in-memory disk representation all image formats convert
/// through. Half tracks not contained in the map are blank.
#[derive(Default, Debug)]
pub struct HalfTrackImage {
    half_tracks: BTreeMap<usize, HalfTrack>,
}

impl HalfTrackImage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, half_track: usize, data: Vec<u8>, speed: u8) {
        debug_assert!(half_track < HALF_TRACK_COUNT);
        debug_assert!(speed <= 3);
        self.half_tracks.insert(half_track, HalfTrack { data, speed });
    }

    #[must_use]
    pub fn get(&self, half_track: usize) -> Option<&HalfTrack> {
        self.half_tracks.get(&half_track)
    }

    /// Data and speed zone of a half track. A blank half track has no data
    /// and reports the speed zone of the standard format.
    #[must_use]
    pub fn data_and_speed(&self, half_track: usize) -> (Option<&[u8]>, u8) {
        match self.half_tracks.get(&half_track) {
            Some(half_track) => (Some(&half_track.data), half_track.speed),
            None => (None, default_speed(half_track)),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.half_tracks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.half_tracks.len()
    }
}
