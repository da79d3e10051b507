//! The tempo map: every tempo and time signature change in a file, ordered by tick, and the
//! tick to second conversion built on top of it.
//!
//! Entries are shared between the map and whoever holds a [`TempoHandle`] to them. An entry
//! starts with a reference count of one, owned by the map itself. [`Smf::get_last_tempo`]
//! acquires another reference and [`Smf::remove_tempo`] gives one back. Once the count drops
//! to zero the entry is retired: it no longer takes part in conversions, and it stays in the
//! map only for as long as some event's cached time in seconds was computed from it. The file
//! re-derives those times as soon as the entry retires, so a retired entry never coexists
//! with times computed without it.
//!
//! [`Smf::get_last_tempo`]: crate::Smf::get_last_tempo
//! [`Smf::remove_tempo`]: crate::Smf::remove_tempo

use crate::{event::Event, prelude::*, primitive::Timing};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::trace;

/// Tempo in effect before the first Set Tempo event: 120 beats per minute.
pub const DEFAULT_TEMPO: u32 = 500_000;

/// Every map gets a distinct id, so that handles from other files can be told apart.
static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type TempoId = u64;

/// A time in seconds, together with the entry it was computed from.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct CachedSeconds {
    pub seconds: f64,
    pub source: Option<TempoId>,
}

/// A time signature, as carried by the `0x58` meta event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimeSignature {
    pub numerator: u8,
    /// The actual note value, eg. `4` for quarter notes, `8` for eighth notes.
    pub denominator: u8,
    /// MIDI clocks in a metronome click.
    pub clocks_per_click: u8,
    /// Notated 32nd notes in a MIDI quarter note.
    pub notes_per_note: u8,
}
impl Default for TimeSignature {
    fn default() -> TimeSignature {
        TimeSignature {
            numerator: 4,
            denominator: 4,
            clocks_per_click: 24,
            notes_per_note: 8,
        }
    }
}

/// A token referring to a tempo map entry.
///
/// Handles are plain values: copying one does not acquire a reference. The reference count
/// they stand for lives in the entry, and is only changed by [`Smf::get_last_tempo`] and
/// [`Smf::remove_tempo`](crate::Smf::remove_tempo).
///
/// [`Smf::get_last_tempo`]: crate::Smf::get_last_tempo
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TempoHandle {
    map_id: u64,
    id: TempoId,
}

/// A point in the song where the tempo or the time signature changes.
///
/// An entry registered by a tempo event alone carries the time signature of the entry before
/// it, and the other way around.
#[derive(Clone, Debug, PartialEq)]
pub struct TempoEntry {
    id: TempoId,
    time_pulses: u32,
    time_seconds: f64,
    microseconds_per_quarter_note: u32,
    time_signature: TimeSignature,
    sets_tempo: bool,
    sets_time_signature: bool,
    ref_count: u32,
    dependents: usize,
}
impl TempoEntry {
    fn new(id: TempoId, time_pulses: u32) -> TempoEntry {
        TempoEntry {
            id,
            time_pulses,
            time_seconds: 0.0,
            microseconds_per_quarter_note: DEFAULT_TEMPO,
            time_signature: TimeSignature::default(),
            sets_tempo: false,
            sets_time_signature: false,
            ref_count: 1,
            dependents: 0,
        }
    }

    /// Tick at which this entry takes effect.
    #[inline]
    pub fn time_pulses(&self) -> u32 {
        self.time_pulses
    }

    /// Seconds at which this entry takes effect.
    #[inline]
    pub fn time_seconds(&self) -> f64 {
        self.time_seconds
    }

    #[inline]
    pub fn microseconds_per_quarter_note(&self) -> u32 {
        self.microseconds_per_quarter_note
    }

    /// Beats per minute corresponding to the tempo of this entry.
    pub fn bpm(&self) -> f64 {
        60_000_000.0 / self.microseconds_per_quarter_note as f64
    }

    #[inline]
    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    #[inline]
    pub fn numerator(&self) -> u8 {
        self.time_signature.numerator
    }

    #[inline]
    pub fn denominator(&self) -> u8 {
        self.time_signature.denominator
    }

    #[inline]
    pub fn clocks_per_click(&self) -> u8 {
        self.time_signature.clocks_per_click
    }

    #[inline]
    pub fn notes_per_note(&self) -> u8 {
        self.time_signature.notes_per_note
    }

    /// Number of live references to this entry, the map's own included.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Number of events whose cached time in seconds was computed from this entry.
    #[inline]
    pub fn dependents(&self) -> usize {
        self.dependents
    }

    /// Whether every reference to this entry has been released.
    ///
    /// Retired entries are not used for conversions anymore.
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.ref_count == 0
    }
}

/// The ordered collection of tempo entries of a file.
#[derive(Debug)]
pub struct TempoMap {
    map_id: u64,
    next_id: TempoId,
    entries: Vec<TempoEntry>,
}
impl Clone for TempoMap {
    /// The clone belongs to a different file, so it gets its own id and does not accept the
    /// handles of the original.
    fn clone(&self) -> TempoMap {
        TempoMap {
            map_id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            next_id: self.next_id,
            entries: self.entries.clone(),
        }
    }
}
impl Default for TempoMap {
    fn default() -> TempoMap {
        TempoMap::new()
    }
}
impl TempoMap {
    pub(crate) fn new() -> TempoMap {
        TempoMap {
            map_id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed),
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Number of entries, retired ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in tick order, retired ones included.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<TempoEntry> {
        self.entries.iter()
    }

    /// Look up the entry a handle refers to, if it is still a member of this map.
    pub fn get(&self, handle: TempoHandle) -> Option<&TempoEntry> {
        if handle.map_id != self.map_id {
            return None;
        }
        self.entries.iter().find(|entry| entry.id == handle.id)
    }

    /// The entry at position `number` in tick order.
    #[inline]
    pub fn by_number(&self, number: usize) -> Option<&TempoEntry> {
        self.entries.get(number)
    }

    /// The live entry in effect at tick `pulses`.
    pub fn by_pulses(&self, pulses: u32) -> Option<&TempoEntry> {
        self.live().rev().find(|entry| entry.time_pulses <= pulses)
    }

    /// The live entry in effect at `seconds`.
    pub fn by_seconds(&self, seconds: f64) -> Option<&TempoEntry> {
        self.live().rev().find(|entry| entry.time_seconds <= seconds)
    }

    /// A handle referring to `entry`. Does not acquire a reference.
    #[inline]
    pub fn handle(&self, entry: &TempoEntry) -> TempoHandle {
        TempoHandle {
            map_id: self.map_id,
            id: entry.id,
        }
    }

    fn live(&self) -> impl DoubleEndedIterator<Item = &TempoEntry> {
        self.entries.iter().filter(|entry| !entry.is_retired())
    }

    /// Record the tempo or time signature change carried by `event`, taking effect at
    /// `time_pulses`.
    ///
    /// A live entry at the same tick is updated in place. Returns whether the map changed;
    /// if it did, cached times at or after `time_pulses` are stale.
    pub(crate) fn register(&mut self, timing: Timing, time_pulses: u32, event: &Event) -> bool {
        let tempo = event.tempo();
        let signature = event.time_signature_value();
        if tempo.is_none() && signature.is_none() {
            return false;
        }
        let index = match self
            .entries
            .iter()
            .position(|entry| entry.time_pulses == time_pulses && !entry.is_retired())
        {
            Some(index) => index,
            None => {
                let index = self
                    .entries
                    .partition_point(|entry| entry.time_pulses <= time_pulses);
                let id = self.next_id;
                self.next_id += 1;
                self.entries.insert(index, TempoEntry::new(id, time_pulses));
                index
            }
        };
        let entry = &mut self.entries[index];
        if let Some(tempo) = tempo {
            entry.microseconds_per_quarter_note = tempo;
            entry.sets_tempo = true;
        }
        if let Some(signature) = signature {
            entry.time_signature = signature;
            entry.sets_time_signature = true;
        }
        trace!(
            id = entry.id,
            time_pulses,
            tempo = ?tempo,
            time_signature = ?signature,
            "registered tempo map entry"
        );
        self.resolve(timing);
        true
    }

    /// Carry tempo and time signature values forward into entries that only set one of them,
    /// and recompute the time in seconds at which each live entry starts.
    pub(crate) fn resolve(&mut self, timing: Timing) {
        let mut tempo = DEFAULT_TEMPO;
        let mut signature = TimeSignature::default();
        //Start of the current segment: (ticks, seconds, tempo)
        let mut anchor = (0, 0.0, DEFAULT_TEMPO);
        for entry in self.entries.iter_mut().filter(|entry| !entry.is_retired()) {
            if entry.sets_tempo {
                tempo = entry.microseconds_per_quarter_note;
            } else {
                entry.microseconds_per_quarter_note = tempo;
            }
            if entry.sets_time_signature {
                signature = entry.time_signature;
            } else {
                entry.time_signature = signature;
            }
            entry.time_seconds = match timing {
                Timing::Metrical(ppqn) => {
                    let (start_pulses, start_seconds, start_tempo) = anchor;
                    start_seconds
                        + segment_seconds(
                            entry.time_pulses.saturating_sub(start_pulses),
                            ppqn.as_int(),
                            start_tempo,
                        )
                }
                Timing::Timecode(..) => timecode_seconds(timing, entry.time_pulses),
            };
            anchor = (entry.time_pulses, entry.time_seconds, tempo);
        }
    }

    /// Acquire a reference to the live entry with the greatest tick not past `end_pulses`.
    pub(crate) fn acquire_last(&mut self, end_pulses: u32) -> Option<TempoHandle> {
        let map_id = self.map_id;
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|entry| !entry.is_retired() && entry.time_pulses <= end_pulses)?;
        entry.ref_count += 1;
        trace!(id = entry.id, ref_count = entry.ref_count, "acquired tempo map entry");
        Some(TempoHandle {
            map_id,
            id: entry.id,
        })
    }

    /// Give back one reference. Returns `false` without doing anything if the handle is not a
    /// live member of this map.
    pub(crate) fn release(&mut self, timing: Timing, handle: TempoHandle) -> bool {
        if handle.map_id != self.map_id {
            return false;
        }
        let index = match self
            .entries
            .iter()
            .position(|entry| entry.id == handle.id && !entry.is_retired())
        {
            Some(index) => index,
            None => return false,
        };
        let entry = &mut self.entries[index];
        entry.ref_count -= 1;
        trace!(id = entry.id, ref_count = entry.ref_count, "released tempo map entry");
        if entry.is_retired() {
            if entry.dependents == 0 {
                trace!(id = entry.id, "evicted tempo map entry");
                self.entries.remove(index);
            }
            self.resolve(timing);
        }
        true
    }

    /// Recount which entries the cached times of events were computed from, and evict retired
    /// entries that no cached time refers to anymore.
    pub(crate) fn sync_dependents<I>(&mut self, sources: I)
    where
        I: IntoIterator<Item = Option<TempoId>>,
    {
        let index_by_id = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.id, index))
            .collect::<HashMap<_, _>>();
        for entry in self.entries.iter_mut() {
            entry.dependents = 0;
        }
        for id in sources.into_iter().flatten() {
            if let Some(&index) = index_by_id.get(&id) {
                self.entries[index].dependents += 1;
            }
        }
        self.entries.retain(|entry| {
            let evict = entry.is_retired() && entry.dependents == 0;
            if evict {
                trace!(id = entry.id, "evicted tempo map entry");
            }
            !evict
        });
    }

    /// Convert an absolute tick into seconds using the live entries.
    pub(crate) fn pulses_to_seconds(&self, timing: Timing, pulses: u32) -> CachedSeconds {
        match timing {
            Timing::Metrical(ppqn) => match self.by_pulses(pulses) {
                Some(entry) => CachedSeconds {
                    seconds: entry.time_seconds
                        + segment_seconds(
                            pulses - entry.time_pulses,
                            ppqn.as_int(),
                            entry.microseconds_per_quarter_note,
                        ),
                    source: Some(entry.id),
                },
                None => CachedSeconds {
                    seconds: segment_seconds(pulses, ppqn.as_int(), DEFAULT_TEMPO),
                    source: None,
                },
            },
            Timing::Timecode(..) => CachedSeconds {
                seconds: timecode_seconds(timing, pulses),
                source: None,
            },
        }
    }

    /// Convert seconds into the nearest absolute tick.
    pub(crate) fn seconds_to_pulses(&self, timing: Timing, seconds: f64) -> Result<u32> {
        ensure!(
            seconds.is_finite() && seconds >= 0.0,
            err_input!("time in seconds must be finite and not negative")
        );
        let pulses = match timing {
            Timing::Metrical(ppqn) => {
                let (start_pulses, start_seconds, tempo) = match self.by_seconds(seconds) {
                    Some(entry) => (
                        entry.time_pulses,
                        entry.time_seconds,
                        entry.microseconds_per_quarter_note,
                    ),
                    None => (0, 0.0, DEFAULT_TEMPO),
                };
                start_pulses as f64
                    + (seconds - start_seconds) * ppqn.as_int() as f64 * 1_000_000.0
                        / tempo as f64
            }
            Timing::Timecode(fps, resolution) => {
                seconds * fps.as_int() as f64 * resolution as f64
            }
        };
        let pulses = pulses.round();
        ensure!(
            pulses <= u32::MAX as f64,
            err_input!("time in seconds is too far into the song")
        );
        Ok(pulses as u32)
    }
}

fn segment_seconds(pulses: u32, ppqn: u16, tempo: u32) -> f64 {
    pulses as f64 / ppqn as f64 * tempo as f64 / 1_000_000.0
}

/// Timecode timing divides each second into frames and each frame into ticks, so the tempo
/// map plays no part. 29.97 fps counts as 29.
fn timecode_seconds(timing: Timing, pulses: u32) -> f64 {
    match timing {
        Timing::Timecode(fps, resolution) => {
            pulses as f64 / (fps.as_int() as f64 * resolution as f64)
        }
        Timing::Metrical(_) => 0.0,
    }
}
