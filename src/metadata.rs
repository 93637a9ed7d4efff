//! Metadata byte blocks and the (out-of-scope) container parser interface.
//!
//! The real parser for a specific audio container format — locating the
//! byte ranges a tag-stripping pass removed from an original file — is an
//! external collaborator per the project's scope: this module only models
//! its interface (`MetadataParser`) and ships a minimal stand-in.

use crate::checksum::Checksum;

/// A byte range removed from the original file, plus the bytes that belong
/// there. Offsets are in the *original* (tagged) file's coordinate space.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetadataBlock {
    pub offset: u64,
    pub length: u64,
    pub bytes: Vec<u8>,
}

/// An ordered sequence of blocks with strictly increasing offsets.
pub type MetadataLayout = Vec<MetadataBlock>;

pub fn total_len(layout: &[MetadataBlock]) -> u64 {
    layout.iter().map(|b| b.length).sum()
}

/// Result of parsing a content file: its checksum and the metadata that was
/// stripped from it to produce the stored (content) bytes.
pub struct ParseResult {
    pub checksum: Checksum,
    pub stripped_metadata_layout: MetadataLayout,
}

/// Stateless function over a content file's raw bytes, per spec: locate the
/// metadata regions that were removed and compute the content checksum.
pub trait MetadataParser: Send + Sync {
    fn parse(&self, data: &[u8]) -> anyhow::Result<ParseResult>;
}

/// Minimal default parser: treats the entire file as already stripped (no
/// metadata blocks), checksumming the raw bytes directly. A real
/// container-specific parser (e.g. one that understands ID3/FLAC/APE tag
/// framing) is substituted by implementing [`MetadataParser`] and wiring it
/// into `commands::mount` in place of this stub.
pub struct StubMetadataParser;

impl MetadataParser for StubMetadataParser {
    fn parse(&self, data: &[u8]) -> anyhow::Result<ParseResult> {
        Ok(ParseResult {
            checksum: Checksum::of(data),
            stripped_metadata_layout: Vec::new(),
        })
    }
}
