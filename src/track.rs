//! Tracks: ordered event sequences, their playback cursor, and decoding of track chunks.

use crate::{event::Event, prelude::*};
use tracing::warn;

/// A track: a time-ordered list of events plus a playback cursor.
///
/// Tracks read from a file remember the size of their chunk body in `file_buffer_length`.
/// The cursor (`next_event_number`, `time_of_next_event`, `next_event_offset`) is driven by
/// the playback methods of [`Smf`](crate::Smf).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Track {
    pub(crate) track_number: Option<usize>,
    pub(crate) events: Vec<Event>,
    pub(crate) file_buffer_length: usize,
    pub(crate) next_event_number: Option<usize>,
    pub(crate) time_of_next_event: u32,
    pub(crate) next_event_offset: usize,
    running_status: Option<u8>,
}
impl Track {
    /// Create an empty, detached track.
    pub fn new() -> Track {
        Track::default()
    }

    /// Position of this track within its file, if attached.
    #[inline]
    pub fn track_number(&self) -> Option<usize> {
        self.track_number
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<Event> {
        self.events.iter()
    }

    #[inline]
    pub fn event(&self, event_number: usize) -> Option<&Event> {
        self.events.get(event_number)
    }

    #[inline]
    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Whether the last event is an End-of-Track.
    pub fn ends_with_eot(&self) -> bool {
        self.last_event().map_or(false, Event::is_eot)
    }

    /// Absolute tick of the last event, zero for an empty track.
    pub fn length_pulses(&self) -> u32 {
        self.last_event().map_or(0, |ev| ev.time_pulses)
    }

    /// Size in bytes of this track's chunk body when it was last read or written.
    #[inline]
    pub fn file_buffer_length(&self) -> usize {
        self.file_buffer_length
    }

    /// The event the cursor points at, or `None` once the track is exhausted.
    #[inline]
    pub fn next_event_number(&self) -> Option<usize> {
        self.next_event_number
    }

    /// Absolute tick of the event the cursor points at.
    #[inline]
    pub fn time_of_next_event(&self) -> u32 {
        self.time_of_next_event
    }

    /// Byte offset, within the encoded chunk body, of the event the cursor points at.
    #[inline]
    pub fn next_event_offset(&self) -> usize {
        self.next_event_offset
    }

    /// Move the cursor back to the first event.
    pub(crate) fn rewind(&mut self) {
        self.next_event_offset = 0;
        self.running_status = None;
        match self.events.first() {
            Some(first) => {
                self.next_event_number = Some(0);
                self.time_of_next_event = first.time_pulses;
            }
            None => {
                self.next_event_number = None;
                self.time_of_next_event = 0;
            }
        }
    }

    pub(crate) fn peek_next(&self) -> Option<&Event> {
        self.events.get(self.next_event_number?)
    }

    /// Step the cursor past the next event, returning its position.
    pub(crate) fn advance(&mut self) -> Option<usize> {
        let number = self.next_event_number?;
        let event = self.events.get(number)?;
        self.next_event_offset += event.encoded_len(&mut self.running_status);
        match self.events.get(number + 1) {
            Some(next) => {
                self.next_event_number = Some(number + 1);
                self.time_of_next_event = next.time_pulses;
            }
            None => self.next_event_number = None,
        }
        Some(number)
    }

    /// Recompute absolute times from delta times and renumber every event.
    pub(crate) fn renumber(&mut self) -> Result<()> {
        let track_number = self.track_number;
        let mut time = 0u32;
        for (number, event) in self.events.iter_mut().enumerate() {
            time = time
                .checked_add(event.delta_time_pulses)
                .ok_or(err_input!("absolute event time overflows 32 bits"))?;
            event.time_pulses = time;
            event.event_number = Some(number);
            event.track_number = track_number;
        }
        Ok(())
    }

    /// Place a detached event at `time_pulses`, after any events already at that tick, and
    /// fix up delta times and positions. Returns the position of the new event.
    ///
    /// An ordinary event landing at or after a trailing End-of-Track goes before it, and the
    /// End-of-Track moves to the new event's time.
    pub(crate) fn insert(&mut self, mut event: Event, time_pulses: u32) -> Result<usize> {
        event.detach();
        let ends_with_eot = self.ends_with_eot();
        if event.is_eot() {
            ensure!(
                !ends_with_eot,
                err_input!("track already ends with an end of track event")
            );
            ensure!(
                time_pulses >= self.length_pulses(),
                err_input!("end of track event must not precede the last event")
            );
        }
        let mut index = self
            .events
            .partition_point(|ev| ev.time_pulses <= time_pulses);
        if ends_with_eot && !event.is_eot() {
            let last = self.events.len() - 1;
            index = index.min(last);
            let eot = &mut self.events[last];
            eot.time_pulses = eot.time_pulses.max(time_pulses);
        }
        event.time_pulses = time_pulses;
        event.track_number = self.track_number;
        self.events.insert(index, event);
        self.fix_deltas();
        Ok(index)
    }

    /// Take the event at `event_number` out of the track, folding its delta time into the
    /// event after it.
    pub(crate) fn remove(&mut self, event_number: usize) -> Result<Event> {
        ensure!(
            event_number < self.events.len(),
            err_input!("event number out of range")
        );
        let mut event = self.events.remove(event_number);
        if let Some(next) = self.events.get_mut(event_number) {
            next.delta_time_pulses += event.delta_time_pulses;
        }
        for (number, ev) in self.events.iter_mut().enumerate().skip(event_number) {
            ev.event_number = Some(number);
        }
        event.detach();
        Ok(event)
    }

    fn fix_deltas(&mut self) {
        let mut previous = 0;
        for (number, ev) in self.events.iter_mut().enumerate() {
            ev.delta_time_pulses = ev.time_pulses - previous;
            previous = ev.time_pulses;
            ev.event_number = Some(number);
        }
    }

    /// Attach to position `track_number`, updating the back-reference of every event.
    pub(crate) fn attach(&mut self, track_number: Option<usize>) {
        self.track_number = track_number;
        for ev in self.events.iter_mut() {
            ev.track_number = track_number;
        }
    }

    /// Decode a track chunk body.
    ///
    /// Decoding stops at the first End-of-Track event. If there is none, one is appended at
    /// the time of the last event and the returned flag is set.
    pub(crate) fn read(raw: &[u8]) -> Result<(Track, bool)> {
        let mut iter = EventIter::new(raw);
        let mut events = Vec::with_capacity(raw.len() / 3);
        let mut terminated = false;
        while let Some(event) = iter.next() {
            let event = event?;
            terminated = event.is_eot();
            events.push(event);
            if terminated {
                break;
            }
        }
        if terminated && !iter.unread().is_empty() {
            if cfg!(feature = "strict") {
                bail!(err_format!("events after the end of track"));
            }
            warn!(
                bytes = iter.unread().len(),
                "ignoring data after the end of track event"
            );
        }
        let missing_eot = !terminated;
        if missing_eot {
            if cfg!(feature = "strict") {
                bail!(err_format!("track does not end with an end of track event"));
            }
            let mut eot = Event::end_of_track();
            eot.time_pulses = events.last().map_or(0, |ev: &Event| ev.time_pulses);
            eot.event_number = Some(events.len());
            events.push(eot);
        }
        let track = Track {
            events,
            file_buffer_length: raw.len(),
            ..Track::default()
        };
        Ok((track, missing_eot))
    }

    /// Encode the events of this track into a complete `MTrk` chunk.
    ///
    /// The `Vec` should be empty.
    pub(crate) fn write_chunk(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(b"MTrk\0\0\0\0");
        let mut running_status = None;
        out.reserve(self.events.len() * 3);
        for ev in self.events.iter() {
            ev.write(&mut running_status, out)?;
        }
        let len = u32::try_from(out.len() - 8)
            .map_err(|_| err_input!("midi chunk size exceeds 32 bit range"))?;
        out[4..8].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

/// An iterator of events over a single raw track chunk body.
///
/// Yields events with their absolute time and position filled in, but detached from any
/// track. Iteration ends after the first error.
#[derive(Clone, Debug)]
pub struct EventIter<'a> {
    cursor: ByteCursor<'a>,
    running_status: Option<u8>,
    time_pulses: u32,
    event_number: usize,
    failed: bool,
}
impl<'a> EventIter<'a> {
    pub fn new(raw: &'a [u8]) -> EventIter<'a> {
        EventIter {
            cursor: ByteCursor::new(raw),
            running_status: None,
            time_pulses: 0,
            event_number: 0,
            failed: false,
        }
    }

    /// Get the remaining unread bytes.
    #[inline]
    pub fn unread(&self) -> &'a [u8] {
        self.cursor.unread()
    }

    /// Get the current running status of the track.
    #[inline]
    pub fn running_status(&self) -> Option<u8> {
        self.running_status
    }

    fn read_event(&mut self) -> Result<Event> {
        let mut event = Event::read(&mut self.cursor, &mut self.running_status)?;
        self.time_pulses = self
            .time_pulses
            .checked_add(event.delta_time_pulses)
            .ok_or(err_format!("absolute event time overflows 32 bits"))?;
        event.time_pulses = self.time_pulses;
        event.event_number = Some(self.event_number);
        self.event_number += 1;
        Ok(event)
    }
}
impl<'a> Iterator for EventIter<'a> {
    type Item = Result<Event>;
    fn next(&mut self) -> Option<Result<Event>> {
        if self.failed || self.cursor.is_empty() {
            return None;
        }
        let result = self.read_event().context("malformed event");
        self.failed = result.is_err();
        Some(result)
    }
}
