//! Specific to the SMF packaging of MIDI streams: the header, chunk framing, and the
//! top-level `Smf` container with its load, save and editing operations.

use crate::{
    event::Event,
    prelude::*,
    primitive::{Format, Fps, Timing},
    riff,
    tempo::{TempoEntry, TempoHandle, TempoMap},
    track::Track,
};
use tracing::{debug, warn};

/// How many bytes must a MIDI body have in order to enable multithreading.
///
/// When decoding or encoding, the track chunks are processed in parallel if the body exceeds
/// this amount of bytes and the `parallel` feature is enabled.
const PARALLEL_ENABLE_THRESHOLD: usize = 3 * 1024;

/// A Standard Midi File: header, tracks and tempo map.
///
/// Tracks and events are owned by the file. Times in seconds are kept up to date by every
/// editing method and by [`Smf::remove_tempo`]; [`Smf::refresh_seconds`] re-derives them
/// explicitly.
#[derive(Clone, Debug)]
pub struct Smf {
    header: Header,
    tracks: Vec<Track>,
    tempo_map: TempoMap,
    warnings: Vec<Warning>,
    pub(crate) last_seek_position: Option<f64>,
}
impl Default for Smf {
    fn default() -> Smf {
        Smf::new()
    }
}
impl Smf {
    /// Create an empty format 0 file with a metrical division of 120 pulses per quarter note.
    pub fn new() -> Smf {
        Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::from(120))),
            tracks: Vec::new(),
            tempo_map: TempoMap::new(),
            warnings: Vec::new(),
            last_seek_position: None,
        }
    }

    /// Read and parse the file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Smf> {
        fn load_impl(path: &Path) -> Result<Smf> {
            let raw = fs::read(path)
                .map_err(Error::from)
                .context("failed to read midi file")?;
            Smf::parse(&raw)
        }
        load_impl(path.as_ref())
    }

    /// Parse a complete file held in memory.
    ///
    /// RMID files (SMF data wrapped in a RIFF container) are unwrapped first. Parsing either
    /// produces a complete `Smf` or fails; recoverable anomalies are reported through
    /// [`Smf::warnings`].
    pub fn parse(raw: &[u8]) -> Result<Smf> {
        let raw = if riff::is_riff(raw) {
            riff::unwrap(raw).context("invalid rmid wrapper")?
        } else {
            raw
        };
        let mut warnings = Vec::new();
        let (header, chunks) = read_chunks(raw, &mut warnings)?;
        let decoded = decode_tracks(chunks, raw.len())?;

        let mut smf = Smf {
            header,
            tracks: Vec::with_capacity(decoded.len()),
            tempo_map: TempoMap::new(),
            warnings,
            last_seek_position: None,
        };
        for (track_number, (mut track, missing_eot)) in decoded.into_iter().enumerate() {
            if missing_eot {
                warn!(track_number, "track does not end with an end of track event");
                smf.warnings
                    .push(Warning::MissingEndOfTrack { track_number });
            }
            track.attach(Some(track_number));
            smf.tracks.push(track);
        }
        //Tempo changes are registered in track order, so that later tracks win ties
        let timing = smf.header.timing;
        for ev in smf.tracks.iter().flat_map(|track| track.events.iter()) {
            smf.tempo_map.register(timing, ev.time_pulses, ev);
        }
        smf.compute_seconds_from(0);
        smf.rewind();
        debug!(
            format = smf.header.format.as_int(),
            tracks = smf.tracks.len(),
            tempo_entries = smf.tempo_map.len(),
            bytes = raw.len(),
            "loaded midi file"
        );
        Ok(smf)
    }

    /// Encode the file and atomically replace `path` with it.
    ///
    /// The data is written to a temporary file next to the destination, synced, and renamed
    /// over it. If anything fails the destination is left untouched.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        fn save_impl(smf: &mut Smf, path: &Path) -> Result<()> {
            let bytes = smf.to_bytes()?;
            let file_name = path
                .file_name()
                .ok_or(err_input!("destination path has no file name"))?;
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir,
                _ => Path::new("."),
            };
            let temp_path = dir.join(format!(
                ".{}.{}.tmp",
                file_name.to_string_lossy(),
                std::process::id()
            ));
            if let Err(err) = write_and_replace(&temp_path, path, &bytes) {
                let _ = fs::remove_file(&temp_path);
                return Err(err).context("failed to save midi file");
            }
            debug!(
                path = %path.display(),
                tracks = smf.tracks.len(),
                bytes = bytes.len(),
                "saved midi file"
            );
            Ok(())
        }
        save_impl(self, path.as_ref())
    }

    /// Encode the file into memory.
    ///
    /// Tracks lacking a final End-of-Track event get one appended first. Afterwards every
    /// track knows its encoded chunk length and every cursor is rewound.
    ///
    /// Fails with [`ErrorKind::InvalidInput`](crate::ErrorKind::InvalidInput) if a format 0
    /// file does not have exactly one track, or if the file is extremely large (more than
    /// 65535 tracks or a chunk over 4GB).
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        ensure!(
            self.header.format != Format::SingleTrack || self.tracks.len() == 1,
            err_input!("single track format file must have exactly one track")
        );
        let track_count = u16::try_from(self.tracks.len())
            .map_err(|_| err_input!("track count exceeds 16 bit range"))?;
        for track_number in 0..self.tracks.len() {
            if !self.tracks[track_number].ends_with_eot() {
                self.add_eot_delta_pulses(track_number, 0)?;
            }
        }
        let body_len = self.tracks.iter().map(|track| track.len() * 3).sum::<usize>();
        let chunks = encode_tracks(&self.tracks, body_len)?;

        let mut out = Vec::with_capacity(14 + chunks.iter().map(Vec::len).sum::<usize>());
        self.header.write(track_count, &mut out)?;
        for (track, chunk) in self.tracks.iter_mut().zip(chunks) {
            track.file_buffer_length = chunk.len() - 8;
            out.extend_from_slice(&chunk);
        }
        self.rewind();
        Ok(out)
    }

    #[inline]
    pub fn header(&self) -> Header {
        self.header
    }

    #[inline]
    pub fn format(&self) -> Format {
        self.header.format
    }

    #[inline]
    pub fn timing(&self) -> Timing {
        self.header.timing
    }

    /// Pulses per quarter note, for metrical files.
    #[inline]
    pub fn ppqn(&self) -> Option<u16> {
        self.header.timing.ppqn()
    }

    #[inline]
    pub fn frames_per_second(&self) -> Option<u8> {
        self.header.timing.frames_per_second()
    }

    #[inline]
    pub fn resolution(&self) -> Option<u8> {
        self.header.timing.resolution()
    }

    #[inline]
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    #[inline]
    pub fn track(&self, track_number: usize) -> Option<&Track> {
        self.tracks.get(track_number)
    }

    #[inline]
    pub fn number_of_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Anomalies found while loading that did not prevent the file from being read.
    #[inline]
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    #[inline]
    pub fn tempo_map(&self) -> &TempoMap {
        &self.tempo_map
    }

    /// Change the format word. A single track format cannot be set on a file with more than
    /// one track.
    pub fn set_format(&mut self, format: Format) -> Result<()> {
        ensure!(
            format != Format::SingleTrack || self.tracks.len() <= 1,
            err_input!("cannot set single track format on a file with several tracks")
        );
        self.header.format = format;
        Ok(())
    }

    /// Switch to metrical timing with `ppqn` pulses per quarter note, re-deriving every time
    /// in seconds.
    pub fn set_ppqn(&mut self, ppqn: u16) -> Result<()> {
        let ppqn = u15::try_from(ppqn)
            .filter(|ppqn| ppqn.as_int() != 0)
            .ok_or(err_input!("ppqn must be between 1 and 32767"))?;
        self.set_timing(Timing::Metrical(ppqn));
        Ok(())
    }

    /// Switch to timecode timing, re-deriving every time in seconds.
    pub fn set_timecode(&mut self, fps: Fps, resolution: u8) -> Result<()> {
        ensure!(
            resolution != 0,
            err_input!("timecode resolution must not be zero")
        );
        self.set_timing(Timing::Timecode(fps, resolution));
        Ok(())
    }

    fn set_timing(&mut self, timing: Timing) {
        self.header.timing = timing;
        self.tempo_map.resolve(timing);
        self.compute_seconds_from(0);
    }

    /// Append a track, returning its track number.
    ///
    /// Absolute times of the track's events are recomputed from their delta times, and its
    /// tempo changes are registered. A format 0 file becomes format 1 once it has more than
    /// one track.
    pub fn add_track(&mut self, mut track: Track) -> Result<usize> {
        let track_number = self.tracks.len();
        track.attach(Some(track_number));
        track.renumber()?;
        let timing = self.header.timing;
        let mut stale_from = track.events.first().map_or(0, |ev| ev.time_pulses);
        for ev in track.events.iter() {
            if self.tempo_map.register(timing, ev.time_pulses, ev) {
                stale_from = stale_from.min(ev.time_pulses);
            }
        }
        track.rewind();
        self.tracks.push(track);
        if self.tracks.len() > 1 && self.header.format == Format::SingleTrack {
            self.header.format = Format::Parallel;
        }
        self.compute_seconds_from(stale_from);
        Ok(track_number)
    }

    /// Detach and return a track. The tracks after it are renumbered.
    ///
    /// The tempo map is left as is, even if the track carried tempo changes.
    pub fn remove_track(&mut self, track_number: usize) -> Result<Track> {
        ensure!(
            track_number < self.tracks.len(),
            err_input!("track number out of range")
        );
        let mut track = self.tracks.remove(track_number);
        for (number, other) in self.tracks.iter_mut().enumerate().skip(track_number) {
            other.attach(Some(number));
        }
        track.attach(None);
        for ev in track.events.iter_mut() {
            ev.seconds = None;
        }
        self.sync_dependents();
        Ok(track)
    }

    /// Add an event `delta` pulses after the last event of the track.
    pub fn add_event_delta_pulses(
        &mut self,
        track_number: usize,
        event: Event,
        delta: u32,
    ) -> Result<usize> {
        let last = self
            .tracks
            .get(track_number)
            .ok_or(err_input!("track number out of range"))?
            .length_pulses();
        let time_pulses = last
            .checked_add(delta)
            .ok_or(err_input!("absolute event time overflows 32 bits"))?;
        self.add_event_pulses(track_number, event, time_pulses)
    }

    /// Add an event at an absolute tick, after any events already at that tick. Returns the
    /// event number it was given.
    pub fn add_event_pulses(
        &mut self,
        track_number: usize,
        event: Event,
        time_pulses: u32,
    ) -> Result<usize> {
        let track = self
            .tracks
            .get_mut(track_number)
            .ok_or(err_input!("track number out of range"))?;
        let event_number = track.insert(event, time_pulses)?;
        track.rewind();
        let timing = self.header.timing;
        let inserted = &self.tracks[track_number].events[event_number];
        self.tempo_map.register(timing, time_pulses, inserted);
        self.compute_seconds_from(time_pulses);
        Ok(event_number)
    }

    /// Add an event at an absolute time in seconds, converted to the nearest tick.
    pub fn add_event_seconds(
        &mut self,
        track_number: usize,
        event: Event,
        seconds: f64,
    ) -> Result<usize> {
        let time_pulses = self.seconds_to_pulses(seconds)?;
        self.add_event_pulses(track_number, event, time_pulses)
    }

    /// Terminate a track with an End-of-Track event `delta` pulses after its last event.
    pub fn add_eot_delta_pulses(&mut self, track_number: usize, delta: u32) -> Result<usize> {
        self.add_event_delta_pulses(track_number, Event::end_of_track(), delta)
    }

    pub fn add_eot_pulses(&mut self, track_number: usize, time_pulses: u32) -> Result<usize> {
        self.add_event_pulses(track_number, Event::end_of_track(), time_pulses)
    }

    pub fn add_eot_seconds(&mut self, track_number: usize, seconds: f64) -> Result<usize> {
        self.add_event_seconds(track_number, Event::end_of_track(), seconds)
    }

    /// Detach and return an event. The delta time of the event after it absorbs the removed
    /// delta, so later events keep their absolute times.
    ///
    /// Removing a tempo change leaves the tempo map as is.
    pub fn remove_event(&mut self, track_number: usize, event_number: usize) -> Result<Event> {
        let track = self
            .tracks
            .get_mut(track_number)
            .ok_or(err_input!("track number out of range"))?;
        let event = track.remove(event_number)?;
        track.rewind();
        self.sync_dependents();
        Ok(event)
    }

    /// Acquire a reference to the tempo entry in effect at the end of the song.
    ///
    /// Every handle obtained here should be given back through [`Smf::remove_tempo`].
    pub fn get_last_tempo(&mut self) -> Option<TempoHandle> {
        let end = self.length_pulses();
        self.tempo_map.acquire_last(end)
    }

    /// Release one reference to a tempo entry.
    ///
    /// Releasing the last reference retires the entry. Every cached time in seconds is then
    /// re-derived without it, which evicts it from the map.
    ///
    /// Returns `false`, and does nothing, if the handle does not refer to a live entry of this
    /// file (because it was already released or belongs to another file).
    pub fn remove_tempo(&mut self, handle: TempoHandle) -> bool {
        let timing = self.header.timing;
        if !self.tempo_map.release(timing, handle) {
            return false;
        }
        let still_live = self
            .tempo_map
            .get(handle)
            .map_or(false, |entry| !entry.is_retired());
        if !still_live {
            //No cached time may keep counting on the retired entry
            self.compute_seconds_from(0);
        }
        true
    }

    /// The entry a handle refers to, while it is still a member of the tempo map.
    #[inline]
    pub fn tempo(&self, handle: TempoHandle) -> Option<&TempoEntry> {
        self.tempo_map.get(handle)
    }

    #[inline]
    pub fn tempo_by_pulses(&self, pulses: u32) -> Option<&TempoEntry> {
        self.tempo_map.by_pulses(pulses)
    }

    #[inline]
    pub fn tempo_by_seconds(&self, seconds: f64) -> Option<&TempoEntry> {
        self.tempo_map.by_seconds(seconds)
    }

    #[inline]
    pub fn tempo_by_number(&self, number: usize) -> Option<&TempoEntry> {
        self.tempo_map.by_number(number)
    }

    #[inline]
    pub fn tempos(&self) -> std::slice::Iter<TempoEntry> {
        self.tempo_map.iter()
    }

    /// Convert an absolute tick into seconds with the current tempo map.
    pub fn pulses_to_seconds(&self, pulses: u32) -> f64 {
        self.tempo_map
            .pulses_to_seconds(self.header.timing, pulses)
            .seconds
    }

    /// Convert a time in seconds into the nearest absolute tick.
    pub fn seconds_to_pulses(&self, seconds: f64) -> Result<u32> {
        self.tempo_map.seconds_to_pulses(self.header.timing, seconds)
    }

    /// Re-derive every cached time in seconds from the current tempo map.
    ///
    /// Retired tempo entries that no event refers to anymore are evicted.
    pub fn refresh_seconds(&mut self) {
        self.tempo_map.resolve(self.header.timing);
        self.compute_seconds_from(0);
    }

    fn compute_seconds_from(&mut self, from_pulses: u32) {
        let timing = self.header.timing;
        let tempo_map = &self.tempo_map;
        for ev in self
            .tracks
            .iter_mut()
            .flat_map(|track| track.events.iter_mut())
            .filter(|ev| ev.time_pulses >= from_pulses)
        {
            ev.seconds = Some(tempo_map.pulses_to_seconds(timing, ev.time_pulses));
        }
        self.sync_dependents();
    }

    fn sync_dependents(&mut self) {
        let tracks = &self.tracks;
        self.tempo_map.sync_dependents(
            tracks
                .iter()
                .flat_map(|track| track.events.iter())
                .map(|ev| ev.seconds.and_then(|cached| cached.source)),
        );
    }

    pub(crate) fn tracks_mut(&mut self) -> &mut [Track] {
        &mut self.tracks
    }
}

impl fmt::Display for Smf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "format {}, {} track{}, ",
            self.header.format.as_int(),
            self.tracks.len(),
            if self.tracks.len() == 1 { "" } else { "s" }
        )?;
        match self.header.timing {
            Timing::Metrical(ppqn) => write!(f, "{} ppqn", ppqn)?,
            Timing::Timecode(fps, resolution) => write!(
                f,
                "{} fps, {} subframes per frame",
                fps.as_int(),
                resolution
            )?,
        }
        write!(
            f,
            ", length {:.3} seconds ({} pulses)",
            self.length_seconds(),
            self.length_pulses()
        )
    }
}

fn write_and_replace(temp_path: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write as _;
    let mut file = fs::File::create(temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, path)?;
    Ok(())
}

/// Read the header chunk and collect the bodies of the declared track chunks.
fn read_chunks<'a>(raw: &'a [u8], warnings: &mut Vec<Warning>) -> Result<(Header, Vec<&'a [u8]>)> {
    let mut cursor = ByteCursor::new(raw);
    let (header, track_count) = match Chunk::read(&mut cursor).context("invalid midi header")? {
        Some(Chunk::Header(header, track_count)) => (header, track_count as usize),
        Some(_) => bail!(err_format!("file does not start with a header chunk")),
        None => bail!(err_truncated!("no header chunk")),
    };
    ensure!(
        header.format != Format::SingleTrack || track_count == 1,
        err_format!("single track format file declares several tracks")
    );

    let mut tracks = Vec::with_capacity(track_count);
    let mut extra_tracks = 0;
    loop {
        let before = cursor;
        match Chunk::read(&mut cursor) {
            Ok(None) => break,
            Ok(Some(Chunk::Track(body))) => {
                if tracks.len() < track_count {
                    tracks.push(body);
                } else {
                    extra_tracks += 1;
                }
            }
            Ok(Some(Chunk::Header(..))) => {
                bail!(err_format!("found duplicate header chunk"))
            }
            Ok(Some(Chunk::Unknown(id))) => {
                debug!(id = ?String::from_utf8_lossy(&id), "skipping unknown chunk");
            }
            Err(err) => {
                if tracks.len() < track_count {
                    return Err(err).context("failed to read track chunk");
                }
                //Garbage after the last track
                let bytes = before.remaining();
                warn!(bytes, "ignoring trailing data after the last chunk");
                warnings.push(Warning::TrailingData { bytes });
                break;
            }
        }
    }
    ensure!(
        tracks.len() == track_count,
        err_truncated!("file has fewer track chunks than declared")
    );
    if extra_tracks > 0 {
        if cfg!(feature = "strict") {
            bail!(err_format!("file has more track chunks than declared"));
        }
        warn!(count = extra_tracks, "ignoring track chunks beyond the declared count");
        warnings.push(Warning::ExtraTrackChunks {
            count: extra_tracks,
        });
    }
    Ok((header, tracks))
}

fn decode_tracks(chunks: Vec<&[u8]>, total_len: usize) -> Result<Vec<(Track, bool)>> {
    //Attempt to use multiple threads if possible and enabled
    #[cfg(feature = "parallel")]
    {
        if total_len >= PARALLEL_ENABLE_THRESHOLD {
            use rayon::prelude::*;
            return chunks
                .into_par_iter()
                .map(Track::read)
                .collect::<Result<Vec<_>>>();
        }
    }
    //Fall back to single-threaded
    let _ = total_len;
    chunks.into_iter().map(Track::read).collect()
}

fn encode_tracks(tracks: &[Track], total_len: usize) -> Result<Vec<Vec<u8>>> {
    let encode = |track: &Track| -> Result<Vec<u8>> {
        let mut chunk = Vec::with_capacity(8 + track.len() * 3);
        track.write_chunk(&mut chunk)?;
        Ok(chunk)
    };
    #[cfg(feature = "parallel")]
    {
        if total_len >= PARALLEL_ENABLE_THRESHOLD {
            use rayon::prelude::*;
            //Write out the tracks in parallel into several different buffers
            return tracks.par_iter().map(encode).collect::<Result<Vec<_>>>();
        }
    }
    let _ = total_len;
    tracks.iter().map(encode).collect()
}

#[derive(Copy, Clone, Debug)]
enum Chunk<'a> {
    Header(Header, u16),
    Track(&'a [u8]),
    Unknown([u8; 4]),
}
impl<'a> Chunk<'a> {
    /// Read the next chunk, or `None` if the cursor is exactly at the end of its input.
    /// On failure the cursor might be left in the middle of the chunk.
    fn read(cursor: &mut ByteCursor<'a>) -> Result<Option<Chunk<'a>>> {
        if cursor.is_empty() {
            return Ok(None);
        }
        let mut id = [0; 4];
        id.copy_from_slice(cursor.read_bytes(4).context("failed to read chunk id")?);
        let len = u32::read(cursor).context("failed to read chunk length")?;
        Ok(Some(match &id {
            b"MThd" => {
                ensure!(len == 6, err_format!("header chunk length is not 6"));
                let mut data = ByteCursor::new(
                    cursor
                        .read_bytes(6)
                        .context("reached eof before header chunk ended")?,
                );
                let (header, track_count) = Header::read(&mut data)?;
                Chunk::Header(header, track_count)
            }
            b"MTrk" => Chunk::Track(
                cursor
                    .read_bytes(len as usize)
                    .context("reached eof before track chunk ended")?,
            ),
            _ => {
                //Unknown chunk, skip it by its declared length
                cursor
                    .skip(len as usize)
                    .context("reached eof before chunk ended")?;
                Chunk::Unknown(id)
            }
        }))
    }
}

/// A MIDI file header.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Header {
    pub format: Format,
    pub timing: Timing,
}
impl Header {
    pub fn new(format: Format, timing: Timing) -> Header {
        Header { format, timing }
    }

    /// Read both the header and the track count.
    fn read(cursor: &mut ByteCursor) -> Result<(Header, u16)> {
        let format = Format::read(cursor)?;
        let track_count = u16::read(cursor)?;
        let timing = Timing::read(cursor)?;
        Ok((Header::new(format, timing), track_count))
    }

    /// Write a complete header chunk.
    fn write<W: Write>(&self, track_count: u16, out: &mut W) -> Result<()> {
        let mut header_chunk = [0; 4 + 4 + 6];
        header_chunk[0..4].copy_from_slice(&b"MThd"[..]);
        header_chunk[4..8].copy_from_slice(&6u32.to_be_bytes()[..]);
        header_chunk[8..10].copy_from_slice(&self.format.encode()[..]);
        header_chunk[10..12].copy_from_slice(&track_count.to_be_bytes()[..]);
        header_chunk[12..14].copy_from_slice(&self.timing.encode()[..]);
        out.write_all(&header_chunk[..])
    }
}
