use crate::{Error, ErrorKind, Event, Smf, Track, Warning};
use pretty_assertions::assert_eq;
use std::{fs, path::PathBuf};

/// Parse a MIDI file held in memory, printing the error chain on failure.
macro_rules! parse {
    ($raw:expr) => {{
        init_logging();
        match Smf::parse(&$raw[..]) {
            Ok(smf) => smf,
            Err(err) => {
                eprintln!("failed to parse test file:");
                eprintln!("{:?}", err);
                panic!()
            }
        }
    }};
}

/// Assert that parsing fails with the given error kind.
macro_rules! parse_err {
    ($raw:expr => $kind:ident) => {{
        init_logging();
        match Smf::parse(&$raw[..]) {
            Ok(_) => panic!("parsing should have failed with {:?}", ErrorKind::$kind),
            Err(err) => {
                let err: Error = err;
                assert_eq!(err.kind(), ErrorKind::$kind, "unexpected error: {:?}", err);
                err
            }
        }
    }};
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn chunk(id: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let mut out = id.to_vec();
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn header(format: u16, track_count: u16, division: [u8; 2]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&format.to_be_bytes());
    body.extend_from_slice(&track_count.to_be_bytes());
    body.extend_from_slice(&division);
    chunk(b"MThd", &body)
}

/// A complete file with one `MTrk` chunk per track body.
fn file(format: u16, division: [u8; 2], tracks: &[&[u8]]) -> Vec<u8> {
    let mut out = header(format, tracks.len() as u16, division);
    for track in tracks {
        out.extend(chunk(b"MTrk", track));
    }
    out
}

fn ppqn(ppqn: u16) -> [u8; 2] {
    ppqn.to_be_bytes()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("smfcore-test-{}-{}", std::process::id(), name))
}

/// Every event of every track as (track, event, raw bytes, delta, time, microseconds).
///
/// Times in seconds are rounded to the microsecond, so that they compare within tolerance.
fn summary(smf: &Smf) -> Vec<(usize, usize, Vec<u8>, u32, u32, i64)> {
    smf.tracks()
        .iter()
        .flat_map(|track| track.events())
        .map(|ev| {
            (
                ev.track_number().unwrap(),
                ev.event_number().unwrap(),
                ev.midi_buffer().to_vec(),
                ev.delta_time_pulses(),
                ev.time_pulses(),
                (ev.time_seconds().unwrap() * 1e6).round() as i64,
            )
        })
        .collect()
}

fn note_on(key: u8) -> Event {
    Event::from_bytes(&[0x90, key, 100]).unwrap()
}

/// Note on, running status note off, end of track. 96 ppqn.
const BASIC_TRACK: &[u8] = &[
    0x00, 0x90, 0x3C, 0x40, //
    0x60, 0x3C, 0x00, //
    0x00, 0xFF, 0x2F, 0x00,
];

/// Tempo 500000 at tick 0, note at tick 480, end of track. 480 ppqn.
const TEMPO_TRACK: &[u8] = &[
    0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, //
    0x83, 0x60, 0x90, 0x3C, 0x40, //
    0x00, 0xFF, 0x2F, 0x00,
];

/// Tempo 500000 at tick 0, tempo 250000 at tick 960, note at tick 1440. 480 ppqn.
const TWO_TEMPO_TRACK: &[u8] = &[
    0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, //
    0x87, 0x40, 0xFF, 0x51, 0x03, 0x03, 0xD0, 0x90, //
    0x83, 0x60, 0x90, 0x3C, 0x40, //
    0x00, 0xFF, 0x2F, 0x00,
];

/// Test the variable-length quantity codec.
mod vlq {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::vlq;

    #[test]
    fn boundaries() {
        let cases: &[(u32, &[u8])] = &[
            (0, &[0x00]),
            (0x7F, &[0x7F]),
            (0x80, &[0x81, 0x00]),
            (0x3FFF, &[0xFF, 0x7F]),
            (0x4000, &[0x81, 0x80, 0x00]),
            (0x1F_FFFF, &[0xFF, 0xFF, 0x7F]),
            (0x20_0000, &[0x81, 0x80, 0x80, 0x00]),
            (0x0FFF_FFFF, &[0xFF, 0xFF, 0xFF, 0x7F]),
        ];
        for &(value, encoded) in cases {
            let mut out = Vec::new();
            vlq::encode(value, &mut out).unwrap();
            assert_eq!(out, encoded, "encoding {:#X}", value);
            assert_eq!(vlq::decode(encoded).unwrap(), (value, encoded.len()));
            assert_eq!(vlq::encoded_len(value), Some(encoded.len()));
        }
    }

    #[test]
    fn sweep() {
        let boundaries = [0, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1F_FFFF, 0x20_0000, vlq::MAX];
        for value in (0..=vlq::MAX)
            .step_by(4099)
            .chain(boundaries.iter().copied())
        {
            let mut out = Vec::new();
            vlq::encode(value, &mut out).unwrap();
            assert!(out.len() <= 4, "{:#X} took {} bytes", value, out.len());
            assert_eq!(vlq::encoded_len(value), Some(out.len()));
            assert_eq!(vlq::decode(&out).unwrap(), (value, out.len()));
        }
    }

    #[test]
    fn stops_after_terminator() {
        assert_eq!(vlq::decode(&[0x81, 0x00, 0x55]).unwrap(), (0x80, 2));
    }

    #[test]
    fn too_large_to_encode() {
        let mut out = Vec::new();
        let err = vlq::encode(0x1000_0000, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(out.is_empty());
        assert_eq!(vlq::encoded_len(0x1000_0000), None);
    }

    #[test]
    fn malformed() {
        assert_eq!(vlq::decode(&[]).unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(vlq::decode(&[0x81]).unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(
            vlq::decode(&[0x80, 0x80, 0x80, 0x80, 0x00])
                .unwrap_err()
                .kind(),
            ErrorKind::Format
        );
    }
}

/// Test the file and event decoder.
mod parse {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::{EventIter, Format, Fps, Timing};

    #[test]
    fn basic() {
        let smf = parse!(file(0, ppqn(96), &[BASIC_TRACK]));
        assert_eq!(smf.format(), Format::SingleTrack);
        assert_eq!(smf.ppqn(), Some(96));
        assert_eq!(smf.number_of_tracks(), 1);
        assert!(smf.warnings().is_empty());
        assert_eq!(
            summary(&smf),
            vec![
                (0, 0, vec![0x90, 0x3C, 0x40], 0, 0, 0),
                (0, 1, vec![0x90, 0x3C, 0x00], 96, 96, 500_000),
                (0, 2, vec![0xFF, 0x2F, 0x00], 0, 96, 500_000),
            ]
        );
        let track = &smf.tracks()[0];
        assert_eq!(track.track_number(), Some(0));
        assert_eq!(track.file_buffer_length(), BASIC_TRACK.len());
        assert_eq!(track.next_event_number(), Some(0));
        assert!(track.ends_with_eot());
    }

    #[test]
    fn times_are_monotonic() {
        let smf = parse!(file(0, ppqn(480), &[TWO_TEMPO_TRACK]));
        let events = smf.tracks()[0].events();
        let mut total = 0;
        for pair in events.windows(2) {
            assert!(pair[0].time_pulses() <= pair[1].time_pulses());
            assert!(pair[0].time_seconds().unwrap() <= pair[1].time_seconds().unwrap());
        }
        for ev in events {
            total += ev.delta_time_pulses();
            assert_eq!(ev.time_pulses(), total);
        }
    }

    #[test]
    #[cfg(not(feature = "strict"))]
    fn running_status_survives_meta() {
        let track = [
            0x00, 0x90, 0x3C, 0x40, //
            0x00, 0xFF, 0x01, 0x01, b'a', //
            0x10, 0x3C, 0x00, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let smf = parse!(file(0, ppqn(96), &[&track]));
        assert_eq!(smf.tracks()[0].events()[2].midi_buffer(), &[0x90, 0x3C, 0x00]);
    }

    #[test]
    #[cfg(feature = "strict")]
    fn running_status_cancelled_by_meta() {
        let track = [
            0x00, 0x90, 0x3C, 0x40, //
            0x00, 0xFF, 0x01, 0x01, b'a', //
            0x10, 0x3C, 0x00, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        parse_err!(file(0, ppqn(96), &[&track]) => Format);
    }

    #[test]
    fn no_running_status() {
        let track = [0x00, 0x3C, 0x40, 0x00, 0xFF, 0x2F, 0x00];
        parse_err!(file(0, ppqn(96), &[&track]) => Format);
    }

    #[test]
    fn system_common_in_track() {
        let track = [0x00, 0xF2, 0x00, 0x00, 0x00, 0xFF, 0x2F, 0x00];
        parse_err!(file(0, ppqn(96), &[&track]) => Format);
    }

    #[test]
    fn data_byte_with_top_bit() {
        let track = [0x00, 0x90, 0x3C, 0x80, 0x00, 0xFF, 0x2F, 0x00];
        parse_err!(file(0, ppqn(96), &[&track]) => Format);
    }

    #[test]
    fn unterminated_deltatime() {
        parse_err!(file(0, ppqn(96), &[&[0x81]]) => Format);
    }

    #[test]
    fn timecode() {
        let smf = parse!(file(0, [0xE7, 0x28], &[BASIC_TRACK]));
        assert_eq!(smf.timing(), Timing::Timecode(Fps::Fps25, 40));
        assert_eq!(smf.frames_per_second(), Some(25));
        assert_eq!(smf.resolution(), Some(40));
        assert_eq!(smf.ppqn(), None);
    }

    #[test]
    fn unsupported_header() {
        parse_err!(file(3, ppqn(96), &[BASIC_TRACK]) => UnsupportedFormat);
        //-27 fps
        parse_err!(file(0, [0xE5, 0x28], &[BASIC_TRACK]) => UnsupportedFormat);
        parse_err!(file(0, ppqn(0), &[BASIC_TRACK]) => UnsupportedFormat);
    }

    #[test]
    fn bad_header_chunk() {
        parse_err!(chunk(b"MTrk", BASIC_TRACK) => Format);
        let mut long_header = chunk(b"MThd", &[0, 0, 0, 1, 0, 96, 0, 0]);
        long_header.extend(chunk(b"MTrk", BASIC_TRACK));
        parse_err!(long_header => Format);
        parse_err!(Vec::<u8>::new() => TruncatedFile);
        parse_err!(b"MThd\0\0\0\x06\0\0" => TruncatedFile);
    }

    #[test]
    fn single_track_format_with_several_tracks() {
        parse_err!(file(0, ppqn(96), &[BASIC_TRACK, BASIC_TRACK]) => Format);
    }

    #[test]
    fn truncated_track() {
        let mut raw = header(0, 1, ppqn(96));
        raw.extend_from_slice(b"MTrk\0\0\0\x14");
        raw.extend_from_slice(&BASIC_TRACK[..4]);
        let err = parse_err!(raw => TruncatedFile);
        assert!(format!("{:?}", err).contains("caused by"));
    }

    #[test]
    fn fewer_tracks_than_declared() {
        let mut raw = header(1, 2, ppqn(96));
        raw.extend(chunk(b"MTrk", BASIC_TRACK));
        parse_err!(raw => TruncatedFile);
    }

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut raw = header(1, 2, ppqn(96));
        raw.extend(chunk(b"XFIH", &[1, 2, 3]));
        raw.extend(chunk(b"MTrk", BASIC_TRACK));
        raw.extend(chunk(b"XFKM", &[]));
        raw.extend(chunk(b"MTrk", BASIC_TRACK));
        raw.extend(chunk(b"XFIH", &[4, 5]));
        let smf = parse!(raw);
        assert_eq!(smf.number_of_tracks(), 2);
        assert!(smf.warnings().is_empty());
    }

    #[test]
    #[cfg(not(feature = "strict"))]
    fn missing_end_of_track() {
        let smf = parse!(file(0, ppqn(96), &[&BASIC_TRACK[..7]]));
        assert_eq!(
            smf.warnings(),
            &[Warning::MissingEndOfTrack { track_number: 0 }]
        );
        let track = &smf.tracks()[0];
        assert_eq!(track.len(), 3);
        let eot = track.last_event().unwrap();
        assert!(eot.is_eot());
        assert_eq!(eot.time_pulses(), 96);
        assert_eq!(eot.delta_time_pulses(), 0);
    }

    #[test]
    #[cfg(feature = "strict")]
    fn missing_end_of_track() {
        parse_err!(file(0, ppqn(96), &[&BASIC_TRACK[..7]]) => Format);
    }

    #[test]
    #[cfg(not(feature = "strict"))]
    fn extra_track_chunks() {
        let mut raw = header(1, 1, ppqn(96));
        raw.extend(chunk(b"MTrk", BASIC_TRACK));
        raw.extend(chunk(b"MTrk", BASIC_TRACK));
        let smf = parse!(raw);
        assert_eq!(smf.number_of_tracks(), 1);
        assert_eq!(smf.warnings(), &[Warning::ExtraTrackChunks { count: 1 }]);
    }

    #[test]
    fn trailing_data() {
        let mut raw = file(0, ppqn(96), &[BASIC_TRACK]);
        raw.extend_from_slice(&[0, 0, 0]);
        let smf = parse!(raw);
        assert_eq!(smf.number_of_tracks(), 1);
        assert_eq!(smf.warnings(), &[Warning::TrailingData { bytes: 3 }]);
    }

    #[test]
    fn rmid() {
        let plain = file(0, ppqn(96), &[BASIC_TRACK]);
        let mut riff_body = b"RMIDdata".to_vec();
        riff_body.extend_from_slice(&(plain.len() as u32).to_le_bytes());
        riff_body.extend_from_slice(&plain);
        if plain.len() % 2 == 1 {
            riff_body.push(0);
        }
        let mut raw = b"RIFF".to_vec();
        raw.extend_from_slice(&(riff_body.len() as u32).to_le_bytes());
        raw.extend(riff_body);
        let wrapped = parse!(raw);
        let plain = parse!(plain);
        assert_eq!(summary(&wrapped), summary(&plain));
    }

    #[test]
    fn riff_but_not_rmid() {
        let mut raw = b"RIFF\x04\0\0\0".to_vec();
        raw.extend_from_slice(b"WAVE");
        parse_err!(raw => UnsupportedFormat);
    }

    #[test]
    fn sysex_and_text() {
        let track = [
            0x00, 0xF0, 0x03, 0x7E, 0x7F, 0xF7, //
            0x00, 0xFF, 0x03, 0x04, b'L', b'e', b'a', b'd', //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let smf = parse!(file(0, ppqn(96), &[&track]));
        let events = smf.tracks()[0].events();
        assert!(events[0].is_sysex());
        assert_eq!(events[0].midi_buffer(), &[0xF0, 0x7E, 0x7F, 0xF7]);
        assert!(events[1].is_metadata());
        assert!(events[1].is_textual());
        assert_eq!(events[1].meta_type(), Some(0x03));
        assert_eq!(events[1].meta_payload(), Some(&b"Lead"[..]));
        assert_eq!(events[1].extract_text().as_deref(), Some("Lead"));
        assert_eq!(events[1].to_string(), "Sequence/Track Name: Lead");
    }

    #[test]
    fn event_iter() {
        let mut iter = EventIter::new(BASIC_TRACK);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.midi_buffer(), &[0x90, 0x3C, 0x40]);
        assert_eq!(iter.running_status(), Some(0x90));
        assert_eq!(iter.unread(), &BASIC_TRACK[4..]);
        let rest = iter.collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].time_pulses(), 96);
        assert_eq!(rest[1].event_number(), Some(2));
        assert_eq!(rest[1].track_number(), None);
    }

    #[test]
    fn large_file() {
        //Big enough to go through the multithreaded decoder, when enabled
        let mut track = Vec::new();
        for i in 0..2000u32 {
            track.extend_from_slice(&[0x08, 0x90 | (i % 16) as u8, (i % 128) as u8, 0x40]);
        }
        track.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
        let mut smf = parse!(file(1, ppqn(96), &[&track, &track, &track]));
        assert_eq!(smf.number_of_tracks(), 3);
        for track in smf.tracks() {
            assert_eq!(track.len(), 2001);
            assert_eq!(track.length_pulses(), 16000);
        }
        let rewritten = smf.to_bytes().unwrap();
        assert_eq!(rewritten, file(1, ppqn(96), &[&track, &track, &track]));
    }
}

/// Test tick to second conversion and the tempo map.
mod tempo {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::{Fps, TimeSignature, DEFAULT_TEMPO};

    #[test]
    fn single_tempo() {
        let smf = parse!(file(0, ppqn(480), &[TEMPO_TRACK]));
        let note = &smf.tracks()[0].events()[1];
        assert_eq!(note.time_pulses(), 480);
        assert_eq!(note.time_seconds(), Some(0.5));
        assert_eq!(smf.length_seconds(), 0.5);
    }

    #[test]
    fn default_tempo() {
        let smf = parse!(file(0, ppqn(480), &[&TEMPO_TRACK[7..]]));
        assert!(smf.tempo_map().is_empty());
        assert_eq!(smf.tracks()[0].events()[0].time_seconds(), Some(0.5));
    }

    #[test]
    fn tempo_segments() {
        let smf = parse!(file(0, ppqn(480), &[TWO_TEMPO_TRACK]));
        assert_eq!(smf.tempo_map().len(), 2);
        let second = smf.tempo_by_number(1).unwrap();
        assert_eq!(second.time_pulses(), 960);
        assert_eq!(second.time_seconds(), 1.0);
        assert_eq!(second.microseconds_per_quarter_note(), 250_000);
        assert_eq!(second.bpm(), 240.0);
        let note = &smf.tracks()[0].events()[2];
        assert_eq!(note.time_seconds(), Some(1.25));
        assert_eq!(smf.pulses_to_seconds(1440), 1.25);
        assert_eq!(smf.seconds_to_pulses(1.25).unwrap(), 1440);
        assert_eq!(smf.seconds_to_pulses(0.5).unwrap(), 480);
        assert_eq!(smf.tempo_by_pulses(959).unwrap().time_pulses(), 0);
        assert_eq!(smf.tempo_by_seconds(1.1).unwrap().time_pulses(), 960);
        assert_eq!(
            smf.seconds_to_pulses(-1.0).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn timecode() {
        let track = [0x87, 0x68, 0x90, 0x3C, 0x40, 0x00, 0xFF, 0x2F, 0x00];
        let smf = parse!(file(0, [0xE7, 0x28], &[&track]));
        let note = &smf.tracks()[0].events()[0];
        assert_eq!(note.time_pulses(), 1000);
        assert_eq!(note.time_seconds(), Some(1.0));
        assert_eq!(smf.seconds_to_pulses(1.0).unwrap(), 1000);
    }

    #[test]
    fn time_signature() {
        let track = [
            0x00, 0xFF, 0x58, 0x04, 0x03, 0x02, 0x18, 0x08, //
            0x87, 0x40, 0xFF, 0x51, 0x03, 0x03, 0xD0, 0x90, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let smf = parse!(file(0, ppqn(480), &[&track]));
        let three_four = TimeSignature {
            numerator: 3,
            denominator: 4,
            clocks_per_click: 24,
            notes_per_note: 8,
        };
        let first = smf.tempo_by_number(0).unwrap();
        assert_eq!(first.time_signature(), three_four);
        assert_eq!(first.microseconds_per_quarter_note(), DEFAULT_TEMPO);
        let second = smf.tempo_by_number(1).unwrap();
        assert_eq!(second.time_signature(), three_four);
        assert_eq!(second.microseconds_per_quarter_note(), 250_000);
        assert_eq!(second.time_seconds(), 1.0);
        assert!(smf.tracks()[0].events()[0].is_time_signature());
        assert_eq!(
            smf.tracks()[0].events()[0].time_signature_value(),
            Some(three_four)
        );
    }

    #[test]
    fn same_tick_overwrites() {
        let tempo_a = [0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, 0x00, 0xFF, 0x2F, 0x00];
        let tempo_b = [0x00, 0xFF, 0x51, 0x03, 0x03, 0xD0, 0x90, 0x00, 0xFF, 0x2F, 0x00];
        let smf = parse!(file(1, ppqn(480), &[&tempo_a, &tempo_b]));
        assert_eq!(smf.tempo_map().len(), 1);
        assert_eq!(
            smf.tempo_by_number(0).unwrap().microseconds_per_quarter_note(),
            250_000
        );
        assert_eq!(smf.tempo_by_number(0).unwrap().ref_count(), 1);
    }

    #[test]
    fn ref_count_discipline() {
        let mut smf = parse!(file(0, ppqn(480), &[TEMPO_TRACK]));
        let entry = smf.tempo_by_number(0).unwrap();
        assert_eq!(entry.ref_count(), 1);
        assert_eq!(entry.dependents(), 3);

        let handle = smf.get_last_tempo().unwrap();
        assert_eq!(smf.tempo(handle).unwrap().ref_count(), 2);
        assert!(smf.remove_tempo(handle));
        let entry = smf.tempo(handle).unwrap();
        assert_eq!(entry.ref_count(), 1);
        assert!(!entry.is_retired());
        assert_eq!(entry.dependents(), 3);
        assert_eq!(smf.tempo_by_pulses(0).unwrap().ref_count(), 1);

        //Last reference gone: times are re-derived without the entry, which evicts it
        assert!(smf.remove_tempo(handle));
        assert!(smf.tempo(handle).is_none());
        assert!(smf.tempo_map().is_empty());
        assert!(smf.tempo_by_pulses(0).is_none());
        assert!(!smf.remove_tempo(handle));
        assert_eq!(smf.tracks()[0].events()[1].time_seconds(), Some(0.5));
    }

    #[test]
    fn released_tempo_keeps_times_consistent() {
        let mut smf = Smf::new();
        smf.set_ppqn(480).unwrap();
        let track = smf.add_track(Track::new()).unwrap();
        smf.add_event_pulses(track, Event::new_tempo(500_000).unwrap(), 0)
            .unwrap();
        smf.add_event_pulses(track, Event::new_tempo(1_000_000).unwrap(), 480)
            .unwrap();
        smf.add_event_pulses(track, note_on(60), 960).unwrap();
        assert_eq!(smf.tracks()[0].events()[2].time_seconds(), Some(1.5));

        let handle = smf.get_last_tempo().unwrap();
        assert_eq!(smf.tempo(handle).unwrap().time_pulses(), 480);
        assert!(smf.remove_tempo(handle));
        assert!(smf.remove_tempo(handle));
        assert_eq!(smf.tempo_map().len(), 1);
        assert_eq!(smf.tracks()[0].events()[2].time_seconds(), Some(1.0));

        smf.add_event_pulses(track, note_on(62), 1000).unwrap();
        let events = smf.tracks()[0].events();
        for pair in events.windows(2) {
            assert!(pair[0].time_seconds().unwrap() <= pair[1].time_seconds().unwrap());
        }
        for ev in events {
            assert_eq!(
                ev.time_seconds(),
                Some(smf.pulses_to_seconds(ev.time_pulses()))
            );
        }
    }

    #[test]
    fn foreign_handle_is_ignored() {
        let mut a = parse!(file(0, ppqn(480), &[TEMPO_TRACK]));
        let mut b = parse!(file(0, ppqn(480), &[TEMPO_TRACK]));
        let handle = a.get_last_tempo().unwrap();
        assert!(!b.remove_tempo(handle));
        assert_eq!(b.tempo_by_number(0).unwrap().ref_count(), 1);
        assert!(b.tempo(handle).is_none());
        let mut c = a.clone();
        assert!(!c.remove_tempo(handle));
        assert!(a.remove_tempo(handle));
    }

    #[test]
    fn get_last_tempo_on_empty_map() {
        let mut smf = parse!(file(0, ppqn(96), &[BASIC_TRACK]));
        assert!(smf.get_last_tempo().is_none());
    }

    #[test]
    fn inserted_tempo_recomputes_later_events() {
        let mut smf = Smf::new();
        smf.set_ppqn(480).unwrap();
        let track = smf.add_track(Track::new()).unwrap();
        smf.add_event_pulses(track, note_on(60), 960).unwrap();
        assert_eq!(smf.tracks()[0].events()[0].time_seconds(), Some(1.0));
        smf.add_event_pulses(track, Event::new_tempo(250_000).unwrap(), 480)
            .unwrap();
        let note = &smf.tracks()[0].events()[1];
        assert_eq!(note.time_pulses(), 960);
        assert_eq!(note.time_seconds(), Some(0.75));
    }

    #[test]
    fn division_changes_recompute() {
        let mut smf = parse!(file(0, ppqn(480), &[TEMPO_TRACK]));
        smf.set_ppqn(960).unwrap();
        assert_eq!(smf.tracks()[0].events()[1].time_seconds(), Some(0.25));
        smf.set_timecode(Fps::Fps24, 10).unwrap();
        assert_eq!(smf.tracks()[0].events()[1].time_seconds(), Some(2.0));
        assert_eq!(smf.set_ppqn(0).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(
            smf.set_ppqn(0x8000).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            smf.set_timecode(Fps::Fps30, 0).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn removing_tempo_event_keeps_map() {
        let mut smf = parse!(file(0, ppqn(480), &[TEMPO_TRACK]));
        let removed = smf.remove_event(0, 0).unwrap();
        assert!(removed.is_tempo_change());
        assert_eq!(smf.tempo_map().len(), 1);
        assert_eq!(smf.tempo_by_number(0).unwrap().dependents(), 2);
    }
}

/// Test the MIDI writer.
mod write {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rewrite_is_identical() {
        let raw = file(0, ppqn(96), &[BASIC_TRACK]);
        let mut smf = parse!(raw);
        assert_eq!(smf.to_bytes().unwrap(), raw);

        let raw = file(0, ppqn(480), &[TWO_TEMPO_TRACK]);
        let mut smf = parse!(raw);
        assert_eq!(smf.to_bytes().unwrap(), raw);
    }

    #[test]
    fn rewrite_round_trip() {
        let track = [
            0x00, 0xFF, 0x03, 0x04, b'L', b'e', b'a', b'd', //
            0x00, 0xF0, 0x03, 0x7E, 0x7F, 0xF7, //
            0x10, 0xC0, 0x05, //
            0x10, 0xE0, 0x00, 0x40, //
            0x81, 0x00, 0x90, 0x3C, 0x40, //
            0x00, 0x3E, 0x40, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let mut smf = parse!(file(1, ppqn(96), &[TWO_TEMPO_TRACK, &track, BASIC_TRACK]));
        let rewritten = smf.to_bytes().unwrap();
        let reparsed = parse!(rewritten);
        assert_eq!(summary(&smf), summary(&reparsed));
        assert_eq!(smf.header(), reparsed.header());
        assert_eq!(reparsed.tempo_map().len(), 2);
        //Five seconds at 120 BPM, then 480 ticks at 240 BPM
        let last_note = &reparsed.tracks()[0].events()[2];
        assert_eq!(last_note.time_pulses(), 1440);
        assert_eq!(last_note.time_seconds(), Some(6.25));
    }

    #[test]
    fn meta_cancels_running_status() {
        let mut smf = Smf::new();
        let track = smf.add_track(Track::new()).unwrap();
        smf.add_event_pulses(track, note_on(60), 0).unwrap();
        smf.add_event_pulses(track, Event::text(0x01, "x").unwrap(), 0)
            .unwrap();
        smf.add_event_pulses(track, note_on(62), 0).unwrap();
        smf.add_event_pulses(track, note_on(64), 0).unwrap();
        let raw = smf.to_bytes().unwrap();
        assert_eq!(
            &raw[14 + 8..],
            &[
                0x00, 0x90, 60, 100, //
                0x00, 0xFF, 0x01, 0x01, b'x', //
                0x00, 0x90, 62, 100, //
                0x00, 64, 100, //
                0x00, 0xFF, 0x2F, 0x00,
            ][..]
        );
    }

    #[test]
    fn end_of_track_is_appended() {
        let mut smf = Smf::new();
        let track = smf.add_track(Track::new()).unwrap();
        smf.add_event_pulses(track, note_on(60), 10).unwrap();
        assert!(!smf.tracks()[0].ends_with_eot());
        let raw = smf.to_bytes().unwrap();
        assert!(raw.ends_with(&[0x00, 0xFF, 0x2F, 0x00]));
        let track = &smf.tracks()[0];
        assert!(track.ends_with_eot());
        assert_eq!(track.last_event().unwrap().time_pulses(), 10);
        assert_eq!(track.file_buffer_length(), raw.len() - 14 - 8);
        assert_eq!(track.next_event_number(), Some(0));
        assert_eq!(track.next_event_offset(), 0);
    }

    #[test]
    fn save_and_load() {
        let path = temp_path("save_and_load.mid");
        let mut smf = parse!(file(0, ppqn(480), &[TWO_TEMPO_TRACK]));
        smf.save(&path).unwrap();
        let loaded = Smf::load(&path).unwrap();
        assert_eq!(summary(&smf), summary(&loaded));
        assert_eq!(
            loaded.tracks()[0].events()[2].time_seconds(),
            Some(1.25)
        );
        let leftovers = fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.starts_with(".smfcore-test-") && name.contains("save_and_load")
            })
            .count();
        assert_eq!(leftovers, 0);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn failed_save_keeps_previous_file() {
        let path = temp_path("failed_save.mid");
        fs::write(&path, b"previous contents").unwrap();
        let err = Smf::new().save(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(fs::read(&path).unwrap(), b"previous contents");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn save_into_missing_directory() {
        let path = temp_path("missing-dir").join("song.mid");
        let mut smf = parse!(file(0, ppqn(96), &[BASIC_TRACK]));
        let err = smf.save(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(!path.exists());
    }

    #[test]
    fn load_missing_file() {
        let err = Smf::load(temp_path("does-not-exist.mid")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}

/// Test traversal of the whole song in time order.
mod playback {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Tempo and a note in track 0, program change and a note in track 1. 96 ppqn.
    fn two_tracks() -> Smf {
        let track0 = [
            0x00, 0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20, //
            0x60, 0x90, 0x3C, 0x40, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        let track1 = [
            0x00, 0xC0, 0x05, //
            0x30, 0x91, 0x40, 0x40, //
            0x30, 0x81, 0x40, 0x00, //
            0x00, 0xFF, 0x2F, 0x00,
        ];
        parse!(file(1, ppqn(96), &[&track0, &track1]))
    }

    fn next_position(smf: &Smf) -> Option<(usize, usize)> {
        smf.peek_next_event()
            .map(|ev| (ev.track_number().unwrap(), ev.event_number().unwrap()))
    }

    #[test]
    fn time_order() {
        let mut smf = two_tracks();
        let mut order = Vec::new();
        while let Some(ev) = smf.get_next_event() {
            order.push((ev.track_number().unwrap(), ev.event_number().unwrap()));
        }
        assert_eq!(
            order,
            vec![(0, 0), (1, 0), (1, 1), (0, 1), (0, 2), (1, 2), (1, 3)]
        );
        assert!(smf.peek_next_event().is_none());
        assert!(!smf.skip_next_event());
        smf.rewind();
        assert_eq!(next_position(&smf), Some((0, 0)));
    }

    #[test]
    fn peek_does_not_advance() {
        let mut smf = two_tracks();
        assert_eq!(next_position(&smf), Some((0, 0)));
        assert_eq!(next_position(&smf), Some((0, 0)));
        assert!(smf.skip_next_event());
        assert_eq!(next_position(&smf), Some((1, 0)));
    }

    #[test]
    fn seeking() {
        let mut smf = two_tracks();
        assert!(smf.seek_to_pulses(50));
        assert_eq!(next_position(&smf), Some((0, 1)));
        assert_eq!(smf.last_seek_position(), Some(0.5));

        assert!(smf.seek_to_seconds(0.25));
        assert_eq!(next_position(&smf), Some((1, 1)));
        assert_eq!(smf.last_seek_position(), Some(0.25));

        assert!(smf.seek_to_event(1, 2));
        assert_eq!(next_position(&smf), Some((1, 2)));

        assert!(!smf.seek_to_pulses(1000));
        assert!(smf.peek_next_event().is_none());
        assert!(!smf.seek_to_event(2, 0));
    }

    #[test]
    fn length() {
        let smf = two_tracks();
        assert_eq!(smf.length_pulses(), 96);
        assert_eq!(smf.length_seconds(), 0.5);
        let last = &smf.tracks()[1].events()[3];
        assert!(smf.is_last_event(last));
        assert!(!smf.is_last_event(&smf.tracks()[1].events()[1]));
        assert_eq!(
            smf.to_string(),
            "format 1, 2 tracks, 96 ppqn, length 0.500 seconds (96 pulses)"
        );
    }

    #[test]
    fn cursor_tracks_byte_offsets() {
        let mut smf = parse!(file(0, ppqn(96), &[BASIC_TRACK]));
        assert_eq!(smf.tracks()[0].next_event_offset(), 0);
        smf.get_next_event().unwrap();
        assert_eq!(smf.tracks()[0].next_event_offset(), 4);
        assert_eq!(smf.tracks()[0].time_of_next_event(), 96);
        smf.get_next_event().unwrap();
        assert_eq!(smf.tracks()[0].next_event_offset(), 7);
        smf.get_next_event().unwrap();
        assert_eq!(smf.tracks()[0].next_event_offset(), BASIC_TRACK.len());
        assert_eq!(smf.tracks()[0].next_event_number(), None);
    }
}

/// Test the editing API.
mod edit {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::{Format, TimeSignature};

    #[test]
    fn sorted_insertion() {
        let mut smf = Smf::new();
        let track = smf.add_track(Track::new()).unwrap();
        assert_eq!(smf.add_event_pulses(track, note_on(60), 100).unwrap(), 0);
        assert_eq!(smf.add_event_pulses(track, note_on(62), 50).unwrap(), 0);
        assert_eq!(smf.add_event_pulses(track, note_on(64), 50).unwrap(), 1);
        assert_eq!(
            summary(&smf),
            vec![
                (0, 0, vec![0x90, 62, 100], 50, 50, 208_333),
                (0, 1, vec![0x90, 64, 100], 0, 50, 208_333),
                (0, 2, vec![0x90, 60, 100], 50, 100, 416_667),
            ]
        );
    }

    #[test]
    fn end_of_track_rules() {
        let mut smf = Smf::new();
        let track = smf.add_track(Track::new()).unwrap();
        smf.add_event_pulses(track, note_on(60), 100).unwrap();
        assert_eq!(
            smf.add_eot_pulses(track, 80).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(smf.add_eot_pulses(track, 120).unwrap(), 1);
        assert_eq!(
            smf.add_eot_delta_pulses(track, 0).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );

        //Events past the end of track push it back
        assert_eq!(smf.add_event_pulses(track, note_on(62), 200).unwrap(), 1);
        assert_eq!(smf.add_event_delta_pulses(track, note_on(64), 10).unwrap(), 2);
        let events = smf.tracks()[0].events();
        assert_eq!(events.len(), 4);
        assert!(events[3].is_eot());
        assert_eq!(events[2].time_pulses(), 210);
        assert_eq!(events[3].time_pulses(), 210);
        assert_eq!(events[3].delta_time_pulses(), 0);

        //Events before it leave it alone
        smf.add_event_pulses(track, note_on(66), 20).unwrap();
        assert_eq!(smf.tracks()[0].last_event().unwrap().time_pulses(), 210);
    }

    #[test]
    fn remove_event_fixes_deltas() {
        let mut smf = Smf::new();
        let track = smf.add_track(Track::new()).unwrap();
        smf.add_event_pulses(track, note_on(60), 10).unwrap();
        smf.add_event_pulses(track, note_on(62), 30).unwrap();
        smf.add_event_pulses(track, note_on(64), 60).unwrap();
        let removed = smf.remove_event(track, 1).unwrap();
        assert_eq!(removed.midi_buffer(), &[0x90, 62, 100]);
        assert_eq!(removed.track_number(), None);
        assert_eq!(removed.event_number(), None);
        assert_eq!(removed.time_seconds(), None);
        assert_eq!(
            summary(&smf),
            vec![
                (0, 0, vec![0x90, 60, 100], 10, 10, 41_667),
                (0, 1, vec![0x90, 64, 100], 50, 60, 250_000),
            ]
        );
        assert_eq!(
            smf.remove_event(track, 5).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn tracks_and_format() {
        let mut smf = Smf::new();
        assert_eq!(smf.format(), Format::SingleTrack);
        smf.add_track(Track::new()).unwrap();
        assert_eq!(smf.format(), Format::SingleTrack);
        let second = smf.add_track(Track::new()).unwrap();
        assert_eq!(second, 1);
        assert_eq!(smf.format(), Format::Parallel);
        assert_eq!(
            smf.set_format(Format::SingleTrack).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        smf.set_format(Format::Sequential).unwrap();

        smf.add_event_pulses(1, note_on(60), 5).unwrap();
        let removed = smf.remove_track(0).unwrap();
        assert_eq!(removed.track_number(), None);
        assert_eq!(smf.number_of_tracks(), 1);
        let track = &smf.tracks()[0];
        assert_eq!(track.track_number(), Some(0));
        assert_eq!(track.events()[0].track_number(), Some(0));
        assert_eq!(
            smf.remove_track(3).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn readd_removed_track() {
        let mut smf = parse!(file(1, ppqn(480), &[TEMPO_TRACK, BASIC_TRACK]));
        let track = smf.remove_track(0).unwrap();
        let mut other = Smf::new();
        other.set_ppqn(480).unwrap();
        let number = other.add_track(track).unwrap();
        assert_eq!(number, 0);
        assert_eq!(other.tempo_map().len(), 1);
        let note = &other.tracks()[0].events()[1];
        assert_eq!(note.track_number(), Some(0));
        assert_eq!(note.time_seconds(), Some(0.5));
    }

    #[test]
    fn add_event_in_seconds() {
        let mut smf = Smf::new();
        let track = smf.add_track(Track::new()).unwrap();
        smf.add_event_seconds(track, note_on(60), 1.0).unwrap();
        let note = &smf.tracks()[0].events()[0];
        assert_eq!(note.time_pulses(), 240);
        assert_eq!(note.time_seconds(), Some(1.0));
        smf.add_eot_seconds(track, 1.5).unwrap();
        assert_eq!(smf.length_pulses(), 360);
    }

    #[test]
    fn event_constructors() {
        let input_err = |result: crate::Result<Event>| result.unwrap_err().kind();
        assert_eq!(input_err(Event::from_bytes(&[])), ErrorKind::InvalidInput);
        assert_eq!(input_err(Event::from_bytes(&[0x3C])), ErrorKind::InvalidInput);
        assert_eq!(input_err(Event::from_bytes(&[0x90, 0x3C])), ErrorKind::InvalidInput);
        assert_eq!(
            input_err(Event::from_bytes(&[0x90, 0x3C, 0x80])),
            ErrorKind::InvalidInput
        );
        assert_eq!(input_err(Event::from_bytes(&[0xF8])), ErrorKind::InvalidInput);
        assert_eq!(
            input_err(Event::from_bytes(&[0xFF, 0x01, 0x02, b'a'])),
            ErrorKind::InvalidInput
        );
        assert_eq!(input_err(Event::new_tempo(0)), ErrorKind::InvalidInput);
        assert_eq!(input_err(Event::new_tempo(0x0100_0000)), ErrorKind::InvalidInput);
        assert_eq!(input_err(Event::text(0x2F, "x")), ErrorKind::InvalidInput);
        assert_eq!(
            input_err(Event::time_signature(TimeSignature {
                denominator: 3,
                ..TimeSignature::default()
            })),
            ErrorKind::InvalidInput
        );

        let program = Event::from_bytes(&[0xC5, 0x10]).unwrap();
        assert_eq!(program.channel(), Some(5));
        assert!(!program.is_metadata());
        let tempo = Event::new_tempo(500_000).unwrap();
        assert_eq!(tempo.midi_buffer(), &[0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20]);
        assert_eq!(tempo.tempo(), Some(500_000));
        assert_eq!(tempo.channel(), None);
        let signature = Event::time_signature(TimeSignature::default()).unwrap();
        assert_eq!(
            signature.midi_buffer(),
            &[0xFF, 0x58, 0x04, 0x04, 0x02, 0x18, 0x08]
        );
        assert!(Event::end_of_track().is_eot());
        let sysex = Event::from_bytes(&[0xF0, 0x7E, 0xF7]).unwrap();
        assert!(sysex.is_sysex());
    }

    #[test]
    fn event_display() {
        assert_eq!(
            note_on(60).to_string(),
            "Note On, channel 1, note 60, velocity 100"
        );
        assert_eq!(
            Event::from_bytes(&[0xE1, 0x00, 0x40]).unwrap().to_string(),
            "Pitch Wheel, channel 2, value 0"
        );
        assert_eq!(
            Event::new_tempo(500_000).unwrap().to_string(),
            "Tempo: 500000 microseconds per quarter note, 120.00 BPM"
        );
        assert_eq!(Event::end_of_track().to_string(), "End Of Track");
        assert_eq!(
            Event::meta(0x59, &[0xFD, 0x01]).unwrap().to_string(),
            "Key Signature: 3 flats, minor"
        );
        assert_eq!(
            Event::from_bytes(&[0xF0, 0x7E, 0xF7]).unwrap().to_string(),
            "SysEx, 2 bytes"
        );
    }
}
