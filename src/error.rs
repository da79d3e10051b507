use std::{fmt, io};

/// Represents an error while loading, saving or editing a Standard Midi File.
///
/// Leaf variants carry a non-normative message describing which part of the format was
/// violated. `Context` layers are added on the way up, so that the `Debug` output reads as a
/// chain from the outermost operation to the root cause.
///
/// For matching on the broad category of an error, use [`Error::kind`], which looks through
/// any context layers.
#[derive(thiserror::Error)]
pub enum Error {
    /// Malformed data: bad chunk ids or lengths, bad running status, malformed varlen
    /// integers.
    #[error("malformed midi: {0}")]
    Format(&'static str),
    /// Well-formed data describing something this crate cannot represent, such as SMF format
    /// 3 or an invalid SMPTE frame rate.
    #[error("unsupported midi: {0}")]
    UnsupportedFormat(&'static str),
    /// The input ended before a declared structure was complete.
    #[error("truncated midi: {0}")]
    Truncated(&'static str),
    /// An editing or saving request that would produce an invalid file.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    /// The underlying reader or writer failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// An inner error, annotated with the operation that was running.
    #[error("{context}")]
    Context {
        context: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The broad category of this error, looking through context layers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Format(_) => ErrorKind::Format,
            Error::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Error::Truncated(_) => ErrorKind::TruncatedFile,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Io(_) => ErrorKind::Io,
            Error::Context { source, .. } => source.kind(),
        }
    }

    /// The innermost error of a context chain.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get the informative message on what exact part of the MIDI format was not respected.
    ///
    /// I/O errors have no static message and return `None`.
    pub fn message(&self) -> Option<&'static str> {
        match self.root() {
            Error::Format(msg)
            | Error::UnsupportedFormat(msg)
            | Error::Truncated(msg)
            | Error::InvalidInput(msg) => Some(msg),
            _ => None,
        }
    }

    pub(crate) fn chain_ctx(self, context: &'static str) -> Error {
        Error::Context {
            context,
            source: Box::new(self),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)?;
        let mut maybe_src = match self {
            Error::Context { source, .. } => Some(&**source),
            _ => None,
        };
        while let Some(src) = maybe_src {
            writeln!(f)?;
            write!(f, "  caused by: {}", src)?;
            maybe_src = match src {
                Error::Context { source, .. } => Some(&**source),
                _ => None,
            };
        }
        Ok(())
    }
}

/// The category of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed chunk, bad running status, malformed varlen integer.
    Format,
    /// Invalid format word or division bits.
    UnsupportedFormat,
    /// Premature end of the input.
    TruncatedFile,
    /// Misuse of the editing or saving API.
    InvalidInput,
    /// Underlying I/O failure.
    Io,
}

macro_rules! err_format {
    ($msg:expr) => {
        $crate::error::Error::Format($msg)
    };
}
macro_rules! err_unsupported {
    ($msg:expr) => {
        $crate::error::Error::UnsupportedFormat($msg)
    };
}
macro_rules! err_truncated {
    ($msg:expr) => {
        $crate::error::Error::Truncated($msg)
    };
}
macro_rules! err_input {
    ($msg:expr) => {
        $crate::error::Error::InvalidInput($msg)
    };
}

pub(crate) trait ResultExt<T> {
    fn context(self, ctx: &'static str) -> Result<T>;
}
impl<T> ResultExt<T> for Result<T> {
    #[inline]
    fn context(self, ctx: &'static str) -> Result<T> {
        self.map_err(|err| err.chain_ctx(ctx))
    }
}

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A recoverable anomaly found while loading a file.
///
/// Warnings never abort a load; they are logged and kept on the loaded
/// [`Smf`](crate::Smf) for inspection.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    /// The track did not end with an End-of-Track meta event. One was appended.
    #[error("track {track_number} does not end with an end-of-track event")]
    MissingEndOfTrack { track_number: usize },
    /// More track chunks were found than the header declared. They were ignored.
    #[error("{count} track chunks beyond the declared track count were ignored")]
    ExtraTrackChunks { count: usize },
    /// Bytes after the last chunk could not be read as a chunk and were ignored.
    #[error("{bytes} bytes of trailing data were ignored")]
    TrailingData { bytes: usize },
}
