//! Events as stored in a track, and their binary codec.
//!
//! An event keeps its MIDI message as raw bytes, status byte first, exactly as it would be sent
//! to a device. The only exceptions are the two SMF-specific kinds: meta events keep their
//! `0xFF`, type byte, varlen length and payload; sysex and escape events keep their `0xF0` or
//! `0xF7` byte followed by the payload, without the varlen length that precedes it in a file.

use crate::{
    prelude::*,
    primitive::{read_varlen_slice, write_varlen_slice},
    tempo::{CachedSeconds, TimeSignature},
};

pub(crate) const STATUS_SYSEX: u8 = 0xF0;
pub(crate) const STATUS_ESCAPE: u8 = 0xF7;
pub(crate) const STATUS_META: u8 = 0xFF;

pub(crate) const META_END_OF_TRACK: u8 = 0x2F;
pub(crate) const META_TEMPO: u8 = 0x51;
pub(crate) const META_TIME_SIGNATURE: u8 = 0x58;
const META_KEY_SIGNATURE: u8 = 0x59;

/// A single timed event within a track.
///
/// Events are created detached, by [`Event::from_bytes`] or one of the typed constructors, and
/// are placed into a track through the [`Smf`](crate::Smf) editing methods, which fill in
/// their positions and times. Events read from a file come out attached.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub(crate) track_number: Option<usize>,
    pub(crate) event_number: Option<usize>,
    pub(crate) delta_time_pulses: u32,
    pub(crate) time_pulses: u32,
    pub(crate) seconds: Option<CachedSeconds>,
    pub(crate) midi_buffer: Vec<u8>,
}
impl Event {
    fn detached(midi_buffer: Vec<u8>) -> Event {
        Event {
            track_number: None,
            event_number: None,
            delta_time_pulses: 0,
            time_pulses: 0,
            seconds: None,
            midi_buffer,
        }
    }

    /// Create an event from a complete raw MIDI message.
    ///
    /// The message must start with a status byte and have the exact length its status
    /// requires. Meta events must be given in their SMF form (`0xFF`, type, varlen length,
    /// payload). System common and system realtime messages cannot be stored in a Standard
    /// Midi File and are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Event> {
        let status = *bytes.first().ok_or(err_input!("empty midi message"))?;
        match status {
            0x00..=0x7F => bail!(err_input!("first byte of a midi message must be a status byte")),
            0x80..=0xEF => {
                ensure!(
                    bytes.len() == 1 + msg_length(status),
                    err_input!("midi message length does not match its status")
                );
                ensure!(
                    bytes[1..].iter().all(|byte| byte & 0x80 == 0),
                    err_input!("midi data byte with top bit set")
                );
            }
            STATUS_META => {
                ensure!(bytes.len() >= 3, err_input!("truncated meta event"));
                let (len, len_size) =
                    vlq::decode(&bytes[2..]).context("invalid meta event length")?;
                ensure!(
                    bytes.len() == 2 + len_size + len as usize,
                    err_input!("meta event length does not match its payload")
                );
            }
            STATUS_SYSEX | STATUS_ESCAPE => {}
            _ => bail!(err_input!(
                "standard midi files cannot contain system common or realtime messages"
            )),
        }
        Ok(Event::detached(bytes.to_vec()))
    }

    /// Create a meta event of the given type carrying `data`.
    pub fn meta(meta_type: u8, data: &[u8]) -> Result<Event> {
        ensure!(meta_type < 0x80, err_input!("meta event type must be below 0x80"));
        let mut buf = Vec::with_capacity(data.len() + 6);
        buf.push(STATUS_META);
        buf.push(meta_type);
        write_varlen_slice(data, &mut buf)?;
        Ok(Event::detached(buf))
    }

    /// Create a textual meta event (types `0x01` to `0x09`: text, copyright, track name, ...).
    pub fn text(meta_type: u8, text: &str) -> Result<Event> {
        ensure!(
            (0x01..=0x09).contains(&meta_type),
            err_input!("not a textual meta event type")
        );
        Event::meta(meta_type, text.as_bytes())
    }

    /// Create a Set Tempo meta event.
    pub fn new_tempo(microseconds_per_quarter_note: u32) -> Result<Event> {
        ensure!(
            microseconds_per_quarter_note > 0 && microseconds_per_quarter_note <= 0xFF_FFFF,
            err_input!("tempo must be a nonzero 24-bit number of microseconds")
        );
        Event::meta(META_TEMPO, &microseconds_per_quarter_note.to_be_bytes()[1..])
    }

    /// Create a Time Signature meta event. `denominator` is the actual note value (4 for
    /// quarter notes) and must be a power of two.
    pub fn time_signature(signature: TimeSignature) -> Result<Event> {
        let TimeSignature {
            numerator,
            denominator,
            clocks_per_click,
            notes_per_note,
        } = signature;
        ensure!(
            denominator.is_power_of_two(),
            err_input!("time signature denominator must be a power of two")
        );
        Event::meta(
            META_TIME_SIGNATURE,
            &[
                numerator,
                denominator.trailing_zeros() as u8,
                clocks_per_click,
                notes_per_note,
            ],
        )
    }

    /// Create an End-of-Track meta event.
    pub fn end_of_track() -> Event {
        Event::detached(vec![STATUS_META, META_END_OF_TRACK, 0])
    }

    /// Position of the owning track within its file, if attached.
    #[inline]
    pub fn track_number(&self) -> Option<usize> {
        self.track_number
    }

    /// Position of this event within its track, if attached.
    #[inline]
    pub fn event_number(&self) -> Option<usize> {
        self.event_number
    }

    /// Ticks since the previous event on the same track.
    #[inline]
    pub fn delta_time_pulses(&self) -> u32 {
        self.delta_time_pulses
    }

    /// Ticks since the start of the song.
    #[inline]
    pub fn time_pulses(&self) -> u32 {
        self.time_pulses
    }

    /// Seconds since the start of the song, as computed from the tempo map when the time was
    /// last derived. `None` for detached events.
    #[inline]
    pub fn time_seconds(&self) -> Option<f64> {
        self.seconds.map(|cached| cached.seconds)
    }

    /// The raw MIDI bytes of this event.
    #[inline]
    pub fn midi_buffer(&self) -> &[u8] {
        &self.midi_buffer
    }

    #[inline]
    pub fn status(&self) -> u8 {
        self.midi_buffer[0]
    }

    /// The channel of a channel voice message, `0..=15`.
    pub fn channel(&self) -> Option<u8> {
        match self.status() {
            status @ 0x80..=0xEF => Some(status & 0x0F),
            _ => None,
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        self.status() == STATUS_META
    }

    #[inline]
    pub fn is_sysex(&self) -> bool {
        self.status() == STATUS_SYSEX || self.status() == STATUS_ESCAPE
    }

    #[inline]
    pub fn is_eot(&self) -> bool {
        self.meta_type() == Some(META_END_OF_TRACK)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self.meta_type(), Some(0x01..=0x09))
    }

    #[inline]
    pub fn is_tempo_change(&self) -> bool {
        self.tempo().is_some()
    }

    #[inline]
    pub fn is_time_signature(&self) -> bool {
        self.time_signature_value().is_some()
    }

    /// The type byte of a meta event.
    pub fn meta_type(&self) -> Option<u8> {
        if self.is_metadata() {
            self.midi_buffer.get(1).copied()
        } else {
            None
        }
    }

    /// The payload of a meta event, without its type and length.
    pub fn meta_payload(&self) -> Option<&[u8]> {
        if !self.is_metadata() {
            return None;
        }
        let (_len, len_size) = vlq::decode(self.midi_buffer.get(2..)?).ok()?;
        self.midi_buffer.get(2 + len_size..)
    }

    /// Microseconds per quarter note, for Set Tempo events.
    pub fn tempo(&self) -> Option<u32> {
        if self.meta_type() != Some(META_TEMPO) {
            return None;
        }
        match self.meta_payload()? {
            [a, b, c, ..] => Some(u32::from_be_bytes([0, *a, *b, *c])),
            _ => None,
        }
    }

    /// The decoded contents of a Time Signature event.
    pub fn time_signature_value(&self) -> Option<TimeSignature> {
        if self.meta_type() != Some(META_TIME_SIGNATURE) {
            return None;
        }
        match self.meta_payload()? {
            [num, den, clocks, notes, ..] => Some(TimeSignature {
                numerator: *num,
                denominator: 1u8.checked_shl(*den as u32)?,
                clocks_per_click: *clocks,
                notes_per_note: *notes,
            }),
            _ => None,
        }
    }

    /// The text carried by a textual meta event, with invalid UTF-8 replaced.
    pub fn extract_text(&self) -> Option<String> {
        if !self.is_textual() {
            return None;
        }
        Some(String::from_utf8_lossy(self.meta_payload()?).into_owned())
    }

    pub(crate) fn detach(&mut self) {
        self.track_number = None;
        self.event_number = None;
        self.delta_time_pulses = 0;
        self.time_pulses = 0;
        self.seconds = None;
    }

    /// Decode one event (deltatime included) and update `running_status`.
    ///
    /// The returned event is detached and its absolute time is left at zero.
    /// In case of failure the cursor might be left in the middle of an event!
    pub(crate) fn read(cursor: &mut ByteCursor, running_status: &mut Option<u8>) -> Result<Event> {
        let delta = u28::read_varlen(cursor).context("failed to read event deltatime")?;
        //Read status
        let lead = cursor
            .peek()
            .ok_or(err_truncated!("track ends between deltatime and event"))?;
        let status = if lead < 0x80 {
            //Running status!
            running_status.ok_or(err_format!(
                "event missing status with no running status active"
            ))?
        } else {
            cursor.skip(1)?;
            lead
        };
        //Delegate further parsing depending on status
        let midi_buffer = match status {
            0x80..=0xEF => {
                *running_status = Some(status);
                let data = cursor
                    .read_bytes(msg_length(status))
                    .context("truncated midi message")?;
                ensure!(
                    data.iter().all(|byte| byte & 0x80 == 0),
                    err_format!("midi data byte with top bit set")
                );
                let mut buf = Vec::with_capacity(1 + data.len());
                buf.push(status);
                buf.extend_from_slice(data);
                buf
            }
            STATUS_META => {
                cancel_running_status(running_status);
                let meta_type = cursor
                    .read_u8()
                    .context("failed to read meta message type")?;
                let data = read_varlen_slice(cursor).context("failed to read meta message data")?;
                let mut buf = Vec::with_capacity(data.len() + 6);
                buf.push(STATUS_META);
                buf.push(meta_type);
                write_varlen_slice(data, &mut buf)?;
                buf
            }
            STATUS_SYSEX | STATUS_ESCAPE => {
                cancel_running_status(running_status);
                let data = read_varlen_slice(cursor).context("failed to read sysex event")?;
                let mut buf = Vec::with_capacity(1 + data.len());
                buf.push(status);
                buf.extend_from_slice(data);
                buf
            }
            0xF1..=0xF6 => bail!(err_format!(
                "standard midi files cannot contain system common events"
            )),
            0xF8..=0xFE => bail!(err_format!(
                "standard midi files cannot contain system realtime events"
            )),
            0x00..=0x7F => bail!(err_format!("invalid running status without top bit set")),
        };
        let mut event = Event::detached(midi_buffer);
        event.delta_time_pulses = delta.as_int();
        Ok(event)
    }

    /// Writes the deltatime and message of this event to the given output writer.
    ///
    /// `running_status` keeps track of the last MIDI status, in order to make proper use of
    /// running status. It should be shared between consecutive calls, and should initially be set
    /// to `None`.
    pub(crate) fn write<W: Write>(&self, running_status: &mut Option<u8>, out: &mut W) -> Result<()> {
        //Running Status rules:
        // - MIDI Messages (0x80 ..= 0xEF) alter and use running status
        // - System Exclusive (0xF0) cancels and cannot use running status
        // - Escape (0xF7) cancels and cannot use running status
        // - Meta Messages (0xFF) cancel and cannot use running status
        u28::try_from(self.delta_time_pulses)
            .ok_or(err_input!("delta time exceeds 28 bits"))?
            .write_varlen(out)?;
        let status = self.status();
        match status {
            0x80..=0xEF => {
                if Some(status) != *running_status {
                    //Explicitly write status
                    out.write_all(&[status])?;
                    *running_status = Some(status);
                }
                out.write_all(&self.midi_buffer[1..])?;
            }
            STATUS_META => {
                *running_status = None;
                out.write_all(&self.midi_buffer)?;
            }
            _ => {
                *running_status = None;
                out.write_all(&[status])?;
                write_varlen_slice(&self.midi_buffer[1..], out)?;
            }
        }
        Ok(())
    }

    /// Size of this event in a track chunk, updating `running_status` as `write` would.
    pub(crate) fn encoded_len(&self, running_status: &mut Option<u8>) -> usize {
        let mut counter = WriteCounter(0);
        match self.write(running_status, &mut counter) {
            Ok(()) => counter.0 as usize,
            Err(_) => 0,
        }
    }
}

/// Meta and sysex events only clear running status in strict mode. Plenty of files in the
/// wild keep using the previous channel status across them.
#[inline]
fn cancel_running_status(running_status: &mut Option<u8>) {
    if cfg!(feature = "strict") {
        *running_status = None;
    }
}

/// Midi messages have a known length.
pub(crate) fn msg_length(status: u8) -> usize {
    const LENGTH_BY_STATUS: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 2, 2, 2, 2, 1, 1, 2, 0];
    LENGTH_BY_STATUS[(status >> 4) as usize] as usize
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let buf = &self.midi_buffer;
        let status = self.status();
        match status {
            0x80..=0xEF => {
                let channel = (status & 0x0F) + 1;
                match status >> 4 {
                    0x8 => write!(
                        f,
                        "Note Off, channel {}, note {}, velocity {}",
                        channel, buf[1], buf[2]
                    ),
                    0x9 => write!(
                        f,
                        "Note On, channel {}, note {}, velocity {}",
                        channel, buf[1], buf[2]
                    ),
                    0xA => write!(
                        f,
                        "Aftertouch, channel {}, note {}, pressure {}",
                        channel, buf[1], buf[2]
                    ),
                    0xB => write!(
                        f,
                        "Controller, channel {}, controller {}, value {}",
                        channel, buf[1], buf[2]
                    ),
                    0xC => write!(f, "Program Change, channel {}, program {}", channel, buf[1]),
                    0xD => write!(f, "Channel Pressure, channel {}, pressure {}", channel, buf[1]),
                    _ => {
                        let bend = (buf[2] as i32) << 7 | buf[1] as i32;
                        write!(f, "Pitch Wheel, channel {}, value {}", channel, bend - 0x2000)
                    }
                }
            }
            STATUS_META => self.fmt_meta(f),
            _ => write!(f, "SysEx, {} bytes", buf.len() - 1),
        }
    }
}
impl Event {
    fn fmt_meta(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let meta_type = self.meta_type().unwrap_or(0);
        let payload = self.meta_payload().unwrap_or(&[]);
        if let Some(text) = self.extract_text() {
            let name = match meta_type {
                0x01 => "Text",
                0x02 => "Copyright",
                0x03 => "Sequence/Track Name",
                0x04 => "Instrument",
                0x05 => "Lyric",
                0x06 => "Marker",
                0x07 => "Cue Point",
                0x08 => "Program Name",
                _ => "Device (Port) Name",
            };
            return write!(f, "{}: {}", name, text);
        }
        if let Some(tempo) = self.tempo() {
            return write!(
                f,
                "Tempo: {} microseconds per quarter note, {:.2} BPM",
                tempo,
                60_000_000.0 / tempo as f64
            );
        }
        if let Some(sig) = self.time_signature_value() {
            return write!(
                f,
                "Time Signature: {}/{}, {} clocks per click, {} notated 32nd notes per quarter note",
                sig.numerator, sig.denominator, sig.clocks_per_click, sig.notes_per_note
            );
        }
        match (meta_type, payload) {
            (0x00, [msb, lsb, ..]) => {
                write!(f, "Sequence number: {}", u16::from_be_bytes([*msb, *lsb]))
            }
            (0x20, [channel, ..]) => write!(f, "Channel Prefix: {}", channel),
            (0x21, [port, ..]) => write!(f, "MIDI Port: {}", port),
            (META_END_OF_TRACK, _) => write!(f, "End Of Track"),
            (0x54, [hours, minutes, seconds, frames, subframes, ..]) => write!(
                f,
                "SMPTE Offset: {}:{}:{}, frame {}.{}",
                hours & 0x1F,
                minutes,
                seconds,
                frames,
                subframes
            ),
            (META_KEY_SIGNATURE, [sf, mi, ..]) => {
                let sharps = *sf as i8;
                write!(
                    f,
                    "Key Signature: {} {}, {}",
                    sharps.unsigned_abs(),
                    if sharps < 0 { "flats" } else { "sharps" },
                    if *mi == 0 { "major" } else { "minor" }
                )
            }
            (0x7F, _) => write!(f, "Proprietary (aka Sequencer) Event, length {}", payload.len()),
            _ => write!(f, "Unknown Event: FF 0x{:02X} len {}", meta_type, payload.len()),
        }
    }
}
