//! Candidate block-boundary finders.
//!
//! All three finders share one contract: `next()` yields candidate DEFLATE
//! block entry points as bit offsets, strictly increasing, or `None` once the
//! stream is exhausted. The first candidate is always the end of the leading
//! gzip header, found by parsing it once; flush markers and probed offsets
//! never replace the first block.
//!
//! Selection is a sum type rather than trait objects: the stream kind is
//! known at construction and never changes.

mod bgzf;
mod dynamic;
mod pigz;

pub use bgzf::BgzfFinder;
pub use dynamic::DynamicFinder;
pub use pigz::PigzFinder;

use crate::error::Result;
use crate::gzip::FileKind;
use crate::source::SharedSource;

/// Which finder to run over a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinderChoice {
    /// BGZF framing when present, otherwise the generic finder.
    #[default]
    Auto,
    /// Walk BGZF record headers.
    Bgzf,
    /// Search for pigz flush markers (empty stored blocks).
    Pigz,
    /// Probe every bit offset for dynamic-Huffman block headers.
    Generic,
}

pub enum BlockFinder {
    Bgzf(BgzfFinder),
    Pigz(PigzFinder),
    Dynamic(DynamicFinder),
}

impl BlockFinder {
    pub fn new(source: SharedSource, kind: FileKind, choice: FinderChoice) -> Result<Self> {
        Ok(match choice {
            FinderChoice::Bgzf => Self::Bgzf(BgzfFinder::new(source)?),
            FinderChoice::Pigz => Self::Pigz(PigzFinder::new(source)?),
            FinderChoice::Generic => Self::Dynamic(DynamicFinder::new(source, kind)?),
            FinderChoice::Auto => match kind {
                FileKind::Bgzf => Self::Bgzf(BgzfFinder::new(source)?),
                FileKind::Gzip | FileKind::RawDeflate => {
                    Self::Dynamic(DynamicFinder::new(source, kind)?)
                }
            },
        })
    }

    /// Next candidate bit offset, strictly greater than all previous ones.
    pub fn next(&mut self) -> Result<Option<u64>> {
        match self {
            Self::Bgzf(finder) => finder.next(),
            Self::Pigz(finder) => finder.next(),
            Self::Dynamic(finder) => finder.next(),
        }
    }
}
