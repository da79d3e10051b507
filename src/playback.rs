//! Traversal of all tracks of a file in time order, driven by the per-track cursors.

use crate::{event::Event, smf::Smf};
use tracing::debug;

impl Smf {
    /// Point every track cursor back at its first event.
    pub fn rewind(&mut self) {
        for track in self.tracks_mut() {
            track.rewind();
        }
        self.last_seek_position = Some(0.0);
    }

    /// The track holding the next event: the one with the earliest pending event, with ties
    /// going to the lower track number.
    fn track_with_next_event(&self) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (number, track) in self.tracks().iter().enumerate() {
            if track.next_event_number().is_none() {
                continue;
            }
            let time = track.time_of_next_event();
            if best.map_or(true, |(_, best_time)| time < best_time) {
                best = Some((number, time));
            }
        }
        best.map(|(number, _)| number)
    }

    /// The next event in time order, without moving any cursor.
    pub fn peek_next_event(&self) -> Option<&Event> {
        let track_number = self.track_with_next_event()?;
        self.tracks()[track_number].peek_next()
    }

    /// The next event in time order, advancing past it.
    pub fn get_next_event(&mut self) -> Option<&Event> {
        let track_number = self.track_with_next_event()?;
        let event_number = self.tracks_mut()[track_number].advance()?;
        self.tracks()[track_number].event(event_number)
    }

    /// Advance past the next event. Returns `false` once every track is exhausted.
    pub fn skip_next_event(&mut self) -> bool {
        self.get_next_event().is_some()
    }

    /// Position the cursors so that the next event is the first one at or after tick
    /// `pulses`.
    ///
    /// Returns `false` if there is no such event; the cursors are then left at the end.
    #[must_use]
    pub fn seek_to_pulses(&mut self, pulses: u32) -> bool {
        debug!(pulses, "seeking");
        self.rewind();
        self.seek_while(|ev| ev.time_pulses() < pulses)
    }

    /// Position the cursors so that the next event is the first one at or after `seconds`.
    ///
    /// Returns `false` if there is no such event; the cursors are then left at the end.
    #[must_use]
    pub fn seek_to_seconds(&mut self, seconds: f64) -> bool {
        debug!(seconds, "seeking");
        self.rewind();
        let found = self.seek_while(|ev| ev.time_seconds().map_or(true, |time| time < seconds));
        if found {
            self.last_seek_position = Some(seconds);
        }
        found
    }

    /// Position the cursors so that the next event is the given one.
    ///
    /// Returns `false` if the file has no such event.
    #[must_use]
    pub fn seek_to_event(&mut self, track_number: usize, event_number: usize) -> bool {
        debug!(track_number, event_number, "seeking to event");
        self.rewind();
        self.seek_while(|ev| {
            ev.track_number() != Some(track_number) || ev.event_number() != Some(event_number)
        })
    }

    fn seek_while<F: Fn(&Event) -> bool>(&mut self, skip: F) -> bool {
        loop {
            match self.peek_next_event() {
                None => {
                    self.last_seek_position = None;
                    return false;
                }
                Some(ev) if skip(ev) => {}
                Some(ev) => {
                    self.last_seek_position = ev.time_seconds();
                    return true;
                }
            }
            self.skip_next_event();
        }
    }

    /// Time in seconds the cursors were last positioned at by a rewind or a seek.
    #[inline]
    pub fn last_seek_position(&self) -> Option<f64> {
        self.last_seek_position
    }

    /// Absolute tick of the last event of the song.
    pub fn length_pulses(&self) -> u32 {
        self.tracks()
            .iter()
            .map(|track| track.length_pulses())
            .max()
            .unwrap_or(0)
    }

    /// Time in seconds of the last event of the song.
    pub fn length_seconds(&self) -> f64 {
        self.tracks()
            .iter()
            .filter_map(|track| track.last_event())
            .filter_map(Event::time_seconds)
            .fold(0.0, f64::max)
    }

    /// Whether no event of the song happens after `event`. Several events can be last if
    /// they share a tick.
    pub fn is_last_event(&self, event: &Event) -> bool {
        self.length_pulses() <= event.time_pulses()
    }
}
