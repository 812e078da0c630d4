//! Error taxonomy of the parallel gzip decoder.
//!
//! Speculative chunk decoding treats `InvalidDeflate` and `InvalidPrecode` as
//! local signals (the candidate block offset was a false positive); committed
//! decoding surfaces every variant to the consumer. `Cancelled` never leaves
//! the fetcher.

use thiserror::Error;

/// All errors the library can surface.
///
/// The set is closed on purpose: callers match on it to distinguish corrupt
/// input from I/O problems, and the chunk fetcher matches on it to tell a
/// speculative miss from fatal corruption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A malformed gzip or BGZF header or footer field.
    #[error("invalid gzip/BGZF format: {0}")]
    InvalidFormat(&'static str),

    /// A DEFLATE-level structural error.
    #[error("invalid deflate stream: {0}")]
    InvalidDeflate(DeflateError),

    /// A dynamic-block precode that fails validation. Kept separate from
    /// `InvalidDeflate` because the block finder uses it as a cheap rejection
    /// signal before any Huffman table is built.
    #[error("invalid deflate precode")]
    InvalidPrecode,

    /// A gzip stream CRC32 or ISIZE footer field does not match the decoded
    /// data.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    /// The input ended in the middle of a construct.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A worker observed its cancellation flag. Consumed by the fetcher,
    /// never surfaced to the consumer.
    #[error("decoding was cancelled")]
    Cancelled,

    /// The underlying byte source raised an I/O error.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

/// Structural DEFLATE failures, each distinct so that the outer loop can
/// report precisely what went wrong at a candidate offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeflateError {
    #[error("reserved block compression type")]
    ReservedBlockType,
    #[error("non-zero padding before an uncompressed block")]
    NonZeroPadding,
    #[error("uncompressed block length and complement mismatch")]
    LengthChecksumMismatch,
    #[error("bit pattern matches no Huffman code")]
    InvalidHuffmanCode,
    #[error("oversubscribed Huffman alphabet")]
    OversubscribedAlphabet,
    #[error("bloating (incomplete) Huffman alphabet")]
    BloatingAlphabet,
    #[error("empty Huffman alphabet")]
    EmptyAlphabet,
    #[error("literal/length code count exceeds 286")]
    ExceededLiteralRange,
    #[error("distance code count exceeds 30")]
    ExceededDistanceRange,
    #[error("code-length repeat instruction without previous code")]
    InvalidCodeLengthRepeat,
    #[error("back-reference distance exceeds decoded data")]
    ExceededWindowRange,
    /// Only produced while probing candidate offsets with final-block
    /// filtering enabled.
    #[error("unexpected final block")]
    UnexpectedFinalBlock,
}

impl From<DeflateError> for Error {
    fn from(error: DeflateError) -> Self {
        Error::InvalidDeflate(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            return Error::UnexpectedEof;
        }
        Error::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(error: Error) -> Self {
        match &error {
            Error::Io { kind, .. } => std::io::Error::new(*kind, error.to_string()),
            Error::UnexpectedEof => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, error.to_string())
            }
            _ => std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that speculative decoding treats as "this candidate
    /// offset was not a real block boundary". Framing errors count: a bogus
    /// entry point can make the decoder walk into bytes that parse as a
    /// stream end followed by garbage.
    pub fn is_speculation_failure(&self) -> bool {
        matches!(
            self,
            Error::InvalidDeflate(_)
                | Error::InvalidPrecode
                | Error::InvalidFormat(_)
                | Error::UnexpectedEof
        )
    }
}
