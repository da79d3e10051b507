//! Simple building-block data that can be read in one go.
//! All primitives but varlen integers have a known, fixed size.
//! Also, primitives advance the cursor when read.

use crate::prelude::*;

/// Implemented on integer types for reading as big-endian.
pub trait IntRead: Sized {
    /// Reads a big-endian integer.
    fn read(cursor: &mut ByteCursor) -> Result<Self>;
}

/// Implement simple big endian integer reads.
macro_rules! impl_read_int {
    {$( $int:ty ),*} => {
        $(
            impl IntRead for $int {
                #[inline]
                fn read(cursor: &mut ByteCursor) -> Result<$int> {
                    let bytes = cursor.read_bytes(mem::size_of::<$int>())
                        .context("failed to read the expected integer")?;
                    Ok(bytes.iter().fold(0, |mut acc, byte| {
                        acc = acc.checked_shl(8).unwrap_or(0);
                        acc |= *byte as $int;
                        acc
                    }))
                }
            }
        )*
    }
}
impl_read_int! {u8,u16,u32}

/// Slightly restricted integers.
macro_rules! restricted_int {
    {$(#[$attr:meta])* $name:ident : $inner:tt => $bits:expr} => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Default)]
        #[repr(transparent)]
        #[allow(non_camel_case_types)]
        pub struct $name($inner);
        impl From<$inner> for $name {
            /// Lossy conversion, loses top bits.
            #[inline]
            fn from(raw: $inner) -> $name {
                $name::from_int_lossy(raw)
            }
        }
        impl From<$name> for $inner {
            #[inline]
            fn from(restricted: $name) -> $inner {restricted.0}
        }
        impl fmt::Display for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
        impl $name {
            const MASK: $inner = (1 << $bits) - 1;

            /// The maximum value that this restricted integer can hold.
            #[inline]
            pub const fn max_value() -> $name {
                $name (Self::MASK)
            }

            /// Creates a restricted int from its non-restricted counterpart by masking off the
            /// extra bits.
            #[inline]
            pub const fn from_int_lossy(raw: $inner) -> $name {
                $name (raw & Self::MASK)
            }

            /// Returns `Some` if the raw integer is within range of the restricted integer, and
            /// `None` otherwise.
            #[inline]
            pub fn try_from(raw: $inner) -> Option<$name> {
                if raw <= Self::MASK {
                    Some($name(raw))
                } else {
                    None
                }
            }

            /// Get the inner integer out of the wrapper.
            /// The inner integer is guaranteed to be in range of the restricted wrapper.
            #[inline]
            pub fn as_int(self) -> $inner {
                self.0
            }
        }
        impl PartialEq<$inner> for $name {
            fn eq(&self, rhs: &$inner) -> bool {
                self.as_int() == *rhs
            }
        }
        impl PartialOrd<$inner> for $name {
            fn partial_cmp(&self, rhs: &$inner) -> Option<core::cmp::Ordering> {
                Some(self.as_int().cmp(rhs))
            }
        }
    };
}
restricted_int! {
    /// A 15-bit integer type.
    ///
    /// Wraps the `u16` type and ensures that the top bit is always zero.
    u15: u16 => 15
}
restricted_int! {
    /// Referred to in the MIDI standard as "variable length int".
    u28: u32 => 28
}

impl u28 {
    /// Read a varlen integer: 7 bits per byte, most significant group first, top bit set on
    /// every byte but the last.
    pub(crate) fn read_varlen(cursor: &mut ByteCursor) -> Result<u28> {
        let mut int: u32 = 0;
        for _ in 0..4 {
            let byte = match cursor.peek() {
                Some(byte) => byte,
                None => bail!(err_format!("unexpected end of data inside varlen integer")),
            };
            cursor.skip(1)?;
            int <<= 7;
            int |= bit_range(byte, 0..7) as u32;
            if bit_range(byte, 7..8) == 0 {
                //Since we did at max 4 reads of 7 bits each, there MUST be at max 28 bits in this int
                //Therefore it's safe to call lossy `from`
                return Ok(u28::from(int));
            }
        }
        Err(err_format!("varlen integer larger than 4 bytes"))
    }

    pub(crate) fn write_varlen<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut buf = [0; 4];
        let len = self.encode_varlen(&mut buf);
        out.write_all(&buf[..len])
    }

    /// Encode into `buf` with minimal length, returning how many bytes were used.
    fn encode_varlen(&self, buf: &mut [u8; 4]) -> usize {
        let int = self.as_int();
        let mut len = 0;
        let mut skipping = true;
        for i in (0..4).rev() {
            let byte = ((int >> (i * 7)) & 0x7F) as u8;
            if skipping && byte == 0 && i != 0 {
                //Skip these leading zeros
            } else {
                skipping = false;
                buf[len] = if i == 0 { byte } else { byte | 0x80 };
                len += 1;
            }
        }
        len
    }

    /// How many bytes the varlen encoding of this integer takes.
    pub(crate) fn varlen_len(&self) -> usize {
        match self.as_int() {
            0..=0x7F => 1,
            0x80..=0x3FFF => 2,
            0x4000..=0x1F_FFFF => 3,
            _ => 4,
        }
    }
}

/// Reads a slice represented in the input as a `u28` `len` followed by `len` bytes.
pub(crate) fn read_varlen_slice<'a>(cursor: &mut ByteCursor<'a>) -> Result<&'a [u8]> {
    let len = u28::read_varlen(cursor)
        .context("failed to read varlen slice length")?
        .as_int();
    cursor
        .read_bytes(len as usize)
        .context("varlen slice extends past the end of its chunk")
}

/// Write a slice represented as a varlen `u28` as its length and then the raw bytes.
pub(crate) fn write_varlen_slice<W: Write>(slice: &[u8], out: &mut W) -> Result<()> {
    let len = u32::try_from(slice.len())
        .ok()
        .and_then(u28::try_from)
        .ok_or(err_input!("varlen slice exceeds 28 bits"))?;
    len.write_varlen(out)?;
    out.write_all(slice)?;
    Ok(())
}

/// Variable-length quantity codec, as used for delta times and meta/sysex lengths.
pub mod vlq {
    use crate::{io::ByteCursor, prelude::*};

    /// The largest value a varlen integer can represent.
    pub const MAX: u32 = 0x0FFF_FFFF;

    /// Decode a varlen integer from the start of `raw`, returning the value and how many bytes
    /// were consumed.
    ///
    /// Fails with [`ErrorKind::Format`](crate::ErrorKind::Format) if `raw` ends before the
    /// terminating byte, or if no terminator appears within 4 bytes.
    pub fn decode(raw: &[u8]) -> Result<(u32, usize)> {
        let mut cursor = ByteCursor::new(raw);
        let value = u28::read_varlen(&mut cursor)?;
        Ok((value.as_int(), cursor.position()))
    }

    /// Encode `value` with the minimal number of bytes, appending to `out`.
    ///
    /// Fails with [`ErrorKind::InvalidInput`](crate::ErrorKind::InvalidInput) for values above
    /// [`MAX`].
    pub fn encode(value: u32, out: &mut Vec<u8>) -> Result<()> {
        u28::try_from(value)
            .ok_or(err_input!("value does not fit in a varlen integer"))?
            .write_varlen(out)
    }

    /// How many bytes `encode` would write for `value`, or `None` if it is out of range.
    pub fn encoded_len(value: u32) -> Option<usize> {
        u28::try_from(value).map(|v| v.varlen_len())
    }
}

/// The order in which tracks should be laid out when playing back this SMF file.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Format {
    /// This file should have a single track only.
    SingleTrack,
    /// This file has several tracks that should be played simultaneously.
    ///
    /// Usually the first track controls tempo and other song metadata.
    Parallel,
    /// This file has several tracks, each one a separate song.
    ///
    /// The tracks should be played sequentially, as completely separate MIDI tracks packaged
    /// within a single SMF file.
    Sequential,
}
impl Format {
    pub(crate) fn read(cursor: &mut ByteCursor) -> Result<Format> {
        let format = u16::read(cursor)?;
        Ok(match format {
            0 => Format::SingleTrack,
            1 => Format::Parallel,
            2 => Format::Sequential,
            _ => bail!(err_unsupported!("smf format is not 0, 1 or 2")),
        })
    }

    /// The numeric code stored in the header.
    #[inline]
    pub fn as_int(self) -> u16 {
        match self {
            Format::SingleTrack => 0,
            Format::Parallel => 1,
            Format::Sequential => 2,
        }
    }

    pub(crate) fn encode(&self) -> [u8; 2] {
        self.as_int().to_be_bytes()
    }
}

/// The timing for an SMF file.
/// This can be in ticks/beat or ticks/second.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Timing {
    /// Specifies ticks/beat (ppqn) as a 15-bit integer.
    ///
    /// The length of a beat is not standard, so in order to fully describe the length of a MIDI
    /// tick the Set Tempo meta event should be present.
    Metrical(u15),
    /// Specifies ticks/second by dividing a second into frames and then into subframes.
    /// Therefore the length of of a tick is `1/fps/subframe`.
    Timecode(Fps, u8),
}
impl Timing {
    pub(crate) fn read(cursor: &mut ByteCursor) -> Result<Timing> {
        let raw = u16::read(cursor).context("unexpected eof when reading midi timing")?;
        if bit_range(raw, 15..16) != 0 {
            //Timecode
            let fps = (bit_range(raw, 8..16) as u8 as i8).wrapping_neg();
            let subframe = bit_range(raw, 0..8) as u8;
            ensure!(subframe != 0, err_unsupported!("timecode division with zero resolution"));
            Ok(Timing::Timecode(
                Fps::from_int(fps as u8).ok_or(err_unsupported!("invalid smpte fps"))?,
                subframe,
            ))
        } else {
            //Metrical
            ensure!(raw != 0, err_unsupported!("metrical division with zero ppqn"));
            Ok(Timing::Metrical(u15::from(raw)))
        }
    }

    pub(crate) fn encode(&self) -> [u8; 2] {
        match self {
            Timing::Metrical(ticksperbeat) => ticksperbeat.as_int().to_be_bytes(),
            Timing::Timecode(framespersec, ticksperframe) => {
                [(-(framespersec.as_int() as i8)) as u8, *ticksperframe]
            }
        }
    }

    /// Pulses per quarter note, for metrical timing.
    #[inline]
    pub fn ppqn(&self) -> Option<u16> {
        match self {
            Timing::Metrical(ppqn) => Some(ppqn.as_int()),
            Timing::Timecode(..) => None,
        }
    }

    /// Nominal SMPTE frames per second, for timecode timing.
    #[inline]
    pub fn frames_per_second(&self) -> Option<u8> {
        match self {
            Timing::Timecode(fps, _) => Some(fps.as_int()),
            Timing::Metrical(_) => None,
        }
    }

    /// Ticks per frame, for timecode timing.
    #[inline]
    pub fn resolution(&self) -> Option<u8> {
        match self {
            Timing::Timecode(_, resolution) => Some(*resolution),
            Timing::Metrical(_) => None,
        }
    }
}

/// One of the four FPS values available for SMPTE times, as defined by the MIDI standard.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Fps {
    /// 24 frames per second.
    Fps24,
    /// 25 frames per second.
    Fps25,
    /// Actually `29.97 = 30 / 1.001` frames per second, stored as 29 in the header.
    Fps29,
    /// 30 frames per second.
    Fps30,
}
impl Fps {
    /// Converts an integer representing the semantic fps to an `Fps` value (ie. `24` -> `Fps24`).
    #[inline]
    pub fn from_int(raw: u8) -> Option<Fps> {
        Some(match raw {
            24 => Fps::Fps24,
            25 => Fps::Fps25,
            29 => Fps::Fps29,
            30 => Fps::Fps30,
            _ => return None,
        })
    }

    /// Get the integral approximate fps out.
    #[inline]
    pub fn as_int(self) -> u8 {
        match self {
            Fps::Fps24 => 24,
            Fps::Fps25 => 25,
            Fps::Fps29 => 29,
            Fps::Fps30 => 30,
        }
    }
}
impl From<Fps> for u8 {
    fn from(x: Fps) -> Self {
        x.as_int()
    }
}
