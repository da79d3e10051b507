//! # Overview
//!
//! `smfcore` is the engine of a Standard Midi File (SMF) library: it reads `.mid` files into
//! an editable event model, converts between ticks and seconds through the file's tempo map,
//! and writes the model back out as a standards-compliant file.
//!
//! Usage is as simple as:
//!
//! ```rust,no_run
//! use smfcore::Smf;
//!
//! let smf = Smf::load("song.mid").unwrap();
//!
//! for track in smf.tracks() {
//!     println!("track {:?} has {} events", track.track_number(), track.len());
//! }
//! ```
//!
//! The [`Smf`](struct.Smf.html) struct is the main type in the crate.
//! Every event knows its absolute time both in ticks and in seconds:
//!
//! ```rust
//! use smfcore::{Event, Smf, Track};
//!
//! let mut smf = Smf::new();
//! smf.set_ppqn(480).unwrap();
//! let track = smf.add_track(Track::new()).unwrap();
//! smf.add_event_pulses(track, Event::from_bytes(&[0x90, 60, 100]).unwrap(), 480)
//!     .unwrap();
//!
//! let note = &smf.tracks()[track].events()[0];
//! assert_eq!(note.time_seconds(), Some(0.5));
//! ```
//!
//! # Writing Standard Midi Files
//!
//! Saving replaces the destination atomically: the file is written next to it under a
//! temporary name and renamed over it once complete.
//!
//! ```rust,no_run
//! # use smfcore::Smf;
//! let mut smf = Smf::load("song.mid").unwrap();
//! smf.save("song-copy.mid").unwrap();
//! ```
//!
//! # The tempo map
//!
//! Set Tempo and Time Signature events are collected into the file's tempo map. Entries are
//! reference counted: [`Smf::get_last_tempo`](struct.Smf.html#method.get_last_tempo) hands
//! out a [`TempoHandle`](struct.TempoHandle.html) and
//! [`Smf::remove_tempo`](struct.Smf.html#method.remove_tempo) gives it back. An entry is only
//! evicted once nobody holds it and no cached time in seconds was computed from it.
//!
//! # About features
//!
//! Two optional features are available: `parallel` and `strict`.
//! Only `parallel` is enabled by default.
//!
//! - The `parallel` feature
//!
//!   Decodes and encodes track chunks on multiple threads (through the `rayon` dependency)
//!   when the file is large enough for it to pay off.
//!
//! - The `strict` feature
//!
//!   By default `smfcore` reads through some common deviations from the standard: meta and
//!   sysex events keeping the running status alive, tracks missing their End-of-Track event,
//!   and more track chunks than the header declares. These are reported as
//!   [`Warning`](enum.Warning.html)s. With `strict` enabled they are rejected with
//!   `ErrorKind::Format` errors instead.

macro_rules! bail {
    ($err:expr) => {{
        return Err($err.into());
    }};
}
macro_rules! ensure {
    ($cond:expr, $err:expr) => {{
        if !$cond {
            bail!($err)
        }
    }};
}

/// All of the errors this crate produces.
#[macro_use]
mod error;

mod prelude {
    pub(crate) use crate::{
        error::{Error, Result, ResultExt, Warning},
        io::{ByteCursor, Write, WriteCounter},
        primitive::{u15, u28, vlq, IntRead},
    };
    pub(crate) use core::{convert::TryFrom, fmt, mem, ops};
    pub(crate) use std::{fs, path::Path};

    pub(crate) fn bit_range<T>(val: T, range: ops::Range<u32>) -> T
    where
        T: From<u8>
            + ops::Shr<u32, Output = T>
            + ops::Shl<u32, Output = T>
            + ops::Not<Output = T>
            + ops::BitAnd<Output = T>,
    {
        let mask = !((!T::from(0)) << (range.end - range.start));
        (val >> range.start) & mask
    }
}

mod event;
pub mod io;
mod playback;
mod primitive;
mod riff;
mod smf;
mod tempo;
mod track;

pub use crate::{
    error::{Error, ErrorKind, Result, Warning},
    event::Event,
    primitive::{vlq, Format, Fps, Timing},
    smf::{Header, Smf},
    tempo::{TempoEntry, TempoHandle, TempoMap, TimeSignature, DEFAULT_TEMPO},
    track::{EventIter, Track},
};

/// Exotically-sized integers used by the MIDI standard.
pub mod num {
    pub use crate::primitive::{u15, u28};
}

#[cfg(test)]
mod test;
