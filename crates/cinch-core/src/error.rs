//! Error channel of the packer engine.
//!
//! Every structural violation is reported through [`PeError`]; the engine
//! never aborts the process.  Input-driven problems map to `CantPack`
//! (refused on the way in) or `CantUnpack` (corruption detected while
//! taking an image apart), while `Internal` indicates a broken contract
//! inside the engine itself.

use thiserror::Error;

/// Failure kinds raised by the pack and unpack paths.
#[derive(Debug, Error)]
pub enum PeError {
    /// Structural input we refuse to pack.
    #[error("cannot pack: {0}")]
    CantPack(String),

    /// `--exact` was requested; this format cannot guarantee a
    /// byte-identical round trip.
    #[error("cannot pack: --exact is not supported for this format")]
    CantPackExact,

    /// The first input section already carries the packer marker name.
    #[error("file is already packed")]
    AlreadyPacked,

    /// Corruption detected while unpacking.  All bounds violations end
    /// up here so that malformed input never turns into undefined
    /// behavior.
    #[error("cannot unpack: {0}")]
    CantUnpack(String),

    /// The packed result would not be smaller than the source.
    #[error("file is not compressible")]
    NotCompressible,

    /// A contract violation inside the engine; indicates a bug, not bad
    /// input.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeError {
    pub fn cant_pack(msg: impl Into<String>) -> Self {
        PeError::CantPack(msg.into())
    }

    pub fn cant_unpack(msg: impl Into<String>) -> Self {
        PeError::CantUnpack(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        PeError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings() {
        assert_eq!(
            PeError::cant_pack("too many DLL imports 5000").to_string(),
            "cannot pack: too many DLL imports 5000"
        );
        assert_eq!(
            PeError::cant_unpack("corrupted resources").to_string(),
            "cannot unpack: corrupted resources"
        );
        assert_eq!(PeError::AlreadyPacked.to_string(), "file is already packed");
        assert_eq!(
            PeError::NotCompressible.to_string(),
            "file is not compressible"
        );
    }
}
