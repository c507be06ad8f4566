use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod assembler;
pub mod checksum;
pub mod codec;
pub mod compression;
pub mod events;
pub mod fs;
pub mod game;
pub mod hook;
pub mod image;
pub mod mips;
pub mod patch;
pub mod strings;
pub mod symbols;

pub use game::Game;
pub use image::{ByteOrder, LoadOptions, RomImage};

/// Knobs that change how an image is loaded and saved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Load images whose identifier is not a known target. Nothing is
    /// extracted from them, but they can still be normalised and re-saved.
    pub allow_unsupported: bool,
    /// Write every virtual file uncompressed instead of reusing or
    /// regenerating its compressed form.
    pub always_write_decompressed: bool,
    /// Check every redundant patch site of a section against the first one.
    pub validate_patch_groups: bool,
    /// Recompute the boot checksum as the last step of a save.
    pub fix_checksum: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            allow_unsupported: false,
            always_write_decompressed: false,
            validate_patch_groups: true,
            fix_checksum: true,
        }
    }
}

impl Settings {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Error)]
pub enum RomError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image does not start with a known header (magic {magic:#010X})")]
    UnrecognizedImage { magic: u32 },

    #[error("unsupported image identifier '{0}'")]
    UnsupportedImage(String),

    #[error("{what} is truncated at offset {offset:#X}")]
    Truncated { what: String, offset: usize },

    #[error(
        "patch group for {section} disagrees: site {site} resolves to {found:#010X}, expected {expected:#010X}"
    )]
    InconsistentPatchGroup {
        section: String,
        site: usize,
        expected: u32,
        found: u32,
    },

    #[error("malformed instruction {word:#010X}: {reason}")]
    MalformedInstruction { word: u32, reason: &'static str },

    #[error("assembly failed for {game}: {message}")]
    Assembly { game: Game, message: String },

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("{feature} is not available for {target}")]
    UnsupportedTarget { target: String, feature: &'static str },

    #[error("compression type {compression_type}: {message}")]
    Compression { compression_type: u32, message: String },

    #[error("unknown event '{0}'")]
    UnknownEvent(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RomError {
    pub(crate) fn truncated(what: impl Into<String>, offset: usize) -> Self {
        RomError::Truncated {
            what: what.into(),
            offset,
        }
    }

    pub(crate) fn unsupported(target: impl ToString, feature: &'static str) -> Self {
        RomError::UnsupportedTarget {
            target: target.to_string(),
            feature,
        }
    }
}

pub type Result<T> = std::result::Result<T, RomError>;
