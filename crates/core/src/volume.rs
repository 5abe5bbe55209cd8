//! Volume codecs (§4.5): filename grammar, and the index/fileset manifest
//! formats. Manifest shapes are grounded on `rustic_core`'s
//! `repofile::indexfile::{IndexFile, IndexPack, IndexBlob}` — a small
//! serde-derived tree, written as compressed JSON.
use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use rand::{rng, RngCore};
use serde_derive::{Deserialize, Serialize};

use std::collections::HashMap;
use std::io::Write;

use crate::backend::VolumeKind;
use crate::error::{ErrorKind, RepairError, RepairResult};
use crate::id::Id;
use crate::hash::HashModule;
use crate::module::CompressionModule;

/// A parsed remote volume filename: `<prefix>-<kindLetter><timestamp>-<random>.<comp>[.<enc>]`.
///
/// Parsing and formatting are a total bijection on the grammar: any name
/// `format`ted from a `VolumeName` parses back to an identical `VolumeName`,
/// and any name this engine itself wrote round-trips through `parse`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeName {
    /// The backup-set prefix shared by every volume of this backup.
    pub prefix: String,
    /// Which of the three volume kinds this file holds.
    pub kind: VolumeKind,
    /// The volume's creation timestamp, truncated to second precision.
    pub timestamp: DateTime<Utc>,
    /// An 8-byte random disambiguator, base32-encoded.
    pub random: String,
    /// The compression module id used to encode the payload (e.g. `"zstd"`).
    pub compression: String,
    /// The encryption module id, if the payload is additionally encrypted.
    pub encryption: Option<String>,
}

fn kind_letter(kind: VolumeKind) -> char {
    match kind {
        VolumeKind::Blocks => 'b',
        VolumeKind::Index => 'i',
        VolumeKind::Files => 'f',
    }
}

fn letter_kind(c: char) -> RepairResult<VolumeKind> {
    match c {
        'b' => Ok(VolumeKind::Blocks),
        'i' => Ok(VolumeKind::Index),
        'f' => Ok(VolumeKind::Files),
        other => Err(RepairError::new(ErrorKind::Codec, "unknown volume kind letter")
            .context("letter", other.to_string())),
    }
}

impl VolumeName {
    /// Build a fresh name for a newly-created volume, with a random suffix.
    #[must_use]
    pub fn new(prefix: impl Into<String>, kind: VolumeKind, compression: impl Into<String>) -> Self {
        let mut random_bytes = [0u8; 8];
        rng().fill_bytes(&mut random_bytes);
        Self {
            prefix: prefix.into(),
            kind,
            timestamp: truncate_to_seconds(Utc::now()),
            random: BASE32_NOPAD.encode(&random_bytes).to_lowercase(),
            compression: compression.into(),
            encryption: None,
        }
    }

    /// Parse a remote filename back into its structured form.
    pub fn parse(name: &str) -> RepairResult<Self> {
        let invalid = || RepairError::new(ErrorKind::Codec, "volume filename does not match the expected grammar")
            .context("name", name.to_string());

        let (prefix, rest) = name.split_once('-').ok_or_else(invalid)?;
        let (body, ext) = rest.split_once('.').ok_or_else(invalid)?;
        let mut ext_parts = ext.split('.');
        let compression = ext_parts.next().ok_or_else(invalid)?.to_string();
        let encryption = ext_parts.next().map(str::to_string);

        let mut chars = body.chars();
        let letter = chars.next().ok_or_else(invalid)?;
        let kind = letter_kind(letter)?;
        let rest = chars.as_str();
        let (ts_part, random) = rest.split_once('-').ok_or_else(invalid)?;

        let ts_bytes = BASE32_NOPAD
            .decode(ts_part.to_uppercase().as_bytes())
            .map_err(|_| invalid())?;
        let ts_str = String::from_utf8(ts_bytes).map_err(|_| invalid())?;
        let timestamp = DateTime::parse_from_rfc3339(&ts_str)
            .map_err(|_| invalid())?
            .with_timezone(&Utc);

        Ok(Self {
            prefix: prefix.to_string(),
            kind,
            timestamp,
            random: random.to_string(),
            compression,
            encryption,
        })
    }

    /// Format back into the on-disk filename.
    #[must_use]
    pub fn format(&self) -> String {
        let ts_encoded = BASE32_NOPAD
            .encode(self.timestamp.to_rfc3339().as_bytes())
            .to_lowercase();
        let mut name = format!(
            "{}-{}{}-{}.{}",
            self.prefix,
            kind_letter(self.kind),
            ts_encoded,
            self.random,
            self.compression
        );
        if let Some(enc) = &self.encryption {
            name.push('.');
            name.push_str(enc);
        }
        name
    }
}

fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

/// One block's location within a data volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockEntry {
    /// The block's content hash.
    pub hash: Id,
    /// Offset of the block within the data volume.
    pub offset: u64,
    /// Length of the (possibly compressed) block payload.
    pub size: u64,
}

impl PartialOrd for BlockEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset.cmp(&other.offset)
    }
}

/// The manifest carried by an index volume: which data volume it describes,
/// and the block list within it. Mirrors `IndexFile`/`IndexPack`/`IndexBlob`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexManifest {
    /// The data volume filename this index describes.
    pub data_volume: String,
    /// The blocks contained in that data volume.
    pub blocks: Vec<BlockEntry>,
    /// The data volume's content hash, as recorded when the index was
    /// written, for verifying adoption of an orphaned index (§4.2 phase 2).
    pub data_volume_hash: Option<Id>,
    /// The data volume's size in bytes, as recorded when the index was
    /// written, for the same adoption check.
    pub data_volume_size: Option<u64>,
}

impl IndexManifest {
    /// Add a block entry.
    pub fn add(&mut self, entry: BlockEntry) {
        self.blocks.push(entry);
    }

    /// Total declared size of the data volume, summed from its blocks.
    #[must_use]
    pub fn data_volume_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.offset + b.size).max().unwrap_or(0)
    }
}

/// One entry (a file or directory) within a fileset snapshot manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesetEntry {
    /// The entry's path, relative to the backup source root.
    pub path: String,
    /// The block hashes making up this entry's content, in order.
    pub block_hashes: Vec<Id>,
    /// The entry's total size in bytes.
    pub size: u64,
}

/// The manifest carried by a fileset volume: a snapshot's directory listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesetManifest {
    /// When this snapshot was taken.
    pub timestamp: Option<DateTime<Utc>>,
    /// The entries in this snapshot.
    pub entries: Vec<FilesetEntry>,
}

/// A local file holding a just-written volume, ready for `Backend::put`.
///
/// Mirrors the writer interface of §4.5: "set remote name, append ..., close,
/// dispose. After close, the writer exposes its local file path and size."
/// This engine never reopens an appender mid-write — each volume's bytes are
/// fully known before the file exists, so `close` and construction collapse
/// into one step; only the path/size pair and a dispose-on-drop temp file
/// survive.
pub struct WrittenVolume {
    /// The eventual remote filename this volume should be uploaded as.
    pub name: String,
    file: tempfile::NamedTempFile,
    /// The file's size in bytes.
    pub size: u64,
}

impl WrittenVolume {
    /// The temp file's current on-disk path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }

    /// Hash the volume's current on-disk contents with `hasher`.
    pub fn hash(&self, hasher: &dyn HashModule) -> RepairResult<Id> {
        let mut file = std::fs::File::open(self.path())
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to open written volume for hashing").source(err))?;
        hasher
            .hash_reader(&mut file)
            .map_err(|err| RepairError::new(ErrorKind::Io, "failed to hash written volume").source(err))
    }
}

/// Serialize `manifest` as compressed JSON under `name`, for reuploading a
/// fileset the database knows about but whose remote volume was lost (§4.2
/// phase 4).
pub fn write_fileset_volume(
    name: impl Into<String>,
    manifest: &FilesetManifest,
    compression: &dyn CompressionModule,
) -> RepairResult<WrittenVolume> {
    let json = serde_json::to_vec(manifest)
        .map_err(|err| RepairError::new(ErrorKind::Codec, "failed to serialize fileset manifest").source(err))?;
    let compressed = compression.compress(&json)?;
    write_to_temp_file(name.into(), &compressed)
}

/// Serialize `manifest` as compressed JSON under `name`, describing a
/// just-rebuilt data volume's new block layout (§4.2 phase 6, following
/// §4.3's locator recovery).
pub fn write_index_volume(
    name: impl Into<String>,
    manifest: &IndexManifest,
    compression: &dyn CompressionModule,
) -> RepairResult<WrittenVolume> {
    let json = serde_json::to_vec(manifest)
        .map_err(|err| RepairError::new(ErrorKind::Codec, "failed to serialize index manifest").source(err))?;
    let compressed = compression.compress(&json)?;
    write_to_temp_file(name.into(), &compressed)
}

/// Recreate a data volume from its index manifest and a set of recovered
/// block bytes, in ascending-offset order, for uploading a data volume the
/// block locator (§4.3) fully recovered. Every block `index` describes must
/// be present in `recovered`; the no-fabrication invariant is enforced by
/// the caller only invoking this once every wanted block has been found.
pub fn write_data_volume(
    name: impl Into<String>,
    index: &IndexManifest,
    recovered: &HashMap<Id, Vec<u8>>,
) -> RepairResult<WrittenVolume> {
    let mut ordered = index.blocks.clone();
    ordered.sort();
    let mut payload = Vec::with_capacity(ordered.iter().map(|b| b.size as usize).sum());
    for entry in &ordered {
        let data = recovered.get(&entry.hash).ok_or_else(|| {
            RepairError::new(ErrorKind::Internal, "missing recovered block while writing data volume")
                .context("hash", entry.hash.to_base64())
        })?;
        payload.extend_from_slice(data);
    }
    write_to_temp_file(name.into(), &payload)
}

fn write_to_temp_file(name: String, data: &[u8]) -> RepairResult<WrittenVolume> {
    let mut file = tempfile::NamedTempFile::new()
        .map_err(|err| RepairError::new(ErrorKind::Io, "failed to create a temp file for a written volume").source(err))?;
    file.write_all(data)
        .map_err(|err| RepairError::new(ErrorKind::Io, "failed to write volume contents to temp file").source(err))?;
    file.flush()
        .map_err(|err| RepairError::new(ErrorKind::Io, "failed to flush written volume").source(err))?;
    Ok(WrittenVolume { name, file, size: data.len() as u64 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_through_parse_and_format() {
        let name = VolumeName::new("backupset", VolumeKind::Blocks, "zstd");
        let formatted = name.format();
        let parsed = VolumeName::parse(&formatted).unwrap();
        assert_eq!(name, parsed);
    }

    #[test]
    fn name_round_trips_with_encryption_suffix() {
        let mut name = VolumeName::new("backupset", VolumeKind::Index, "zstd");
        name.encryption = Some("aes".to_string());
        let formatted = name.format();
        let parsed = VolumeName::parse(&formatted).unwrap();
        assert_eq!(name, parsed);
        assert!(formatted.ends_with(".zstd.aes"));
    }

    #[test]
    fn rejects_unknown_kind_letter() {
        let err = VolumeName::parse("backupset-xAAAA-abcd.zstd");
        assert!(err.is_err());
    }

    #[test]
    fn rejects_malformed_name() {
        assert!(VolumeName::parse("not-a-volume-name").is_err());
    }

    #[test]
    fn index_manifest_tracks_data_volume_size() {
        let mut manifest = IndexManifest::default();
        manifest.add(BlockEntry { hash: Id::random(), offset: 0, size: 100 });
        manifest.add(BlockEntry { hash: Id::random(), offset: 100, size: 50 });
        assert_eq!(manifest.data_volume_size(), 150);
    }

    #[test]
    fn write_fileset_volume_produces_a_parseable_name_and_nonempty_file() {
        use crate::module::ZstdModule;
        let manifest = FilesetManifest { timestamp: Some(Utc::now()), entries: Vec::new() };
        let name = VolumeName::new("backupset", VolumeKind::Files, ZstdModule.id()).format();
        let written = write_fileset_volume(name, &manifest, &ZstdModule).unwrap();
        assert!(VolumeName::parse(&written.name).unwrap().kind == VolumeKind::Files);
        assert!(written.size > 0);
        assert_eq!(std::fs::metadata(written.path()).unwrap().len(), written.size);
    }

    #[test]
    fn write_data_volume_concatenates_blocks_in_offset_order() {
        let hash_a = Id::random();
        let hash_b = Id::random();
        let mut index = IndexManifest::default();
        index.add(BlockEntry { hash: hash_b, offset: 5, size: 5 });
        index.add(BlockEntry { hash: hash_a, offset: 0, size: 5 });
        let mut recovered = HashMap::new();
        recovered.insert(hash_a, b"AAAAA".to_vec());
        recovered.insert(hash_b, b"BBBBB".to_vec());
        let written = write_data_volume("backupset-bAAAA-x.zstd", &index, &recovered).unwrap();
        let contents = std::fs::read(written.path()).unwrap();
        assert_eq!(contents, b"AAAAABBBBB");
    }

    #[test]
    fn write_data_volume_fails_if_a_block_is_missing() {
        let mut index = IndexManifest::default();
        index.add(BlockEntry { hash: Id::random(), offset: 0, size: 5 });
        let err = write_data_volume("backupset-bAAAA-x.zstd", &index, &HashMap::new());
        assert!(err.is_err());
    }
}
