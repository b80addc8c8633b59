//! Object-version file format
//!
//! Every version of an object is a single file with one of two layouts,
//! selected by a 3-byte magic at offset 0:
//!
//! ```text
//! whole:  "ALL" | segsOffset (u40) | header bytes | segment bytes
//! diff:   "DIF" | headerOffset (u40) | segsOffset (u40) | diff JSON | header bytes | segment bytes
//! ```
//!
//! Offsets are 40-bit unsigned integers, most significant byte first.

use crate::error::{FormatError, Result, StoreError};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Magic of the whole (non-diff) layout.
pub const WHOLE_MAGIC: &[u8; 3] = b"ALL";

/// Magic of the diff layout.
pub const DIFF_MAGIC: &[u8; 3] = b"DIF";

/// Fixed prefix length of the whole layout; also its header offset.
pub const WHOLE_PREFIX_LEN: u64 = 8;

/// Fixed prefix length of the diff layout, before the diff JSON.
pub const DIFF_PREFIX_LEN: u64 = 13;

/// Largest value representable in a 40-bit field.
pub const MAX_U40: u64 = (1 << 40) - 1;

/// Where the bytes of a diff section come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionTag {
    /// Bytes inherited from the base version's segment stream.
    Base,
    /// Bytes physically present in this version's file.
    New,
}

impl SectionTag {
    fn as_u8(self) -> u8 {
        match self {
            SectionTag::Base => 0,
            SectionTag::New => 1,
        }
    }
}

/// A contiguous run of a diff version's logical segment stream.
///
/// Serialized as the JSON triple `[tag, srcOffset, length]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "(u8, u64, u64)", try_from = "(u8, u64, u64)")]
pub struct Section {
    pub tag: SectionTag,
    /// Offset in the source: base logical stream, or this file's segment region.
    pub src: u64,
    pub len: u64,
}

impl Section {
    pub fn base(src: u64, len: u64) -> Self {
        Self { tag: SectionTag::Base, src, len }
    }

    pub fn new_bytes(src: u64, len: u64) -> Self {
        Self { tag: SectionTag::New, src, len }
    }
}

impl From<Section> for (u8, u64, u64) {
    fn from(s: Section) -> Self {
        (s.tag.as_u8(), s.src, s.len)
    }
}

impl TryFrom<(u8, u64, u64)> for Section {
    type Error = String;

    fn try_from((tag, src, len): (u8, u64, u64)) -> std::result::Result<Self, Self::Error> {
        let tag = match tag {
            0 => SectionTag::Base,
            1 => SectionTag::New,
            other => return Err(format!("unknown section tag {}", other)),
        };
        Ok(Self { tag, src, len })
    }
}

/// Describes a version's segments relative to an earlier base version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffInfo {
    pub base_version: u64,
    /// Length of the logical segment stream.
    pub segs_size: u64,
    pub sections: Vec<Section>,
}

impl DiffInfo {
    /// Checks the invariants that do not need the base version on disk.
    ///
    /// `new_segs_len` is the physical segment length of the version being
    /// described, `None` when it is not known up front.
    pub fn validate(&self, version: u64, new_segs_len: Option<u64>) -> Result<()> {
        if self.base_version >= version {
            return Err(StoreError::InvalidRequest(format!(
                "diff base version {} is not below version {}",
                self.base_version, version
            )));
        }
        let mut total: u64 = 0;
        for s in &self.sections {
            total = total.checked_add(s.len).ok_or_else(|| {
                StoreError::InvalidRequest("diff section lengths overflow".to_string())
            })?;
            let Some(end) = s.src.checked_add(s.len) else {
                return Err(StoreError::InvalidRequest(format!(
                    "section [{}, +{}) overflows",
                    s.src, s.len
                )));
            };
            if s.tag == SectionTag::New {
                let Some(physical) = new_segs_len else {
                    return Err(StoreError::InvalidRequest(
                        "diff versions need a known segment size".to_string(),
                    ));
                };
                if end > physical {
                    return Err(StoreError::InvalidRequest(format!(
                        "new section [{}, +{}) lies outside {} segment bytes",
                        s.src, s.len, physical
                    )));
                }
            }
        }
        if total != self.segs_size {
            return Err(StoreError::InvalidRequest(format!(
                "diff sections cover {} bytes, segsSize is {}",
                total, self.segs_size
            )));
        }
        Ok(())
    }

    /// Furthest byte of the base stream any section reads.
    pub fn base_extent(&self) -> u64 {
        self.sections
            .iter()
            .filter(|s| s.tag == SectionTag::Base)
            .map(|s| s.src.saturating_add(s.len))
            .max()
            .unwrap_or(0)
    }
}

/// Parsed positions of one version file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    pub header_offset: u64,
    pub segs_offset: u64,
    pub diff: Option<DiffInfo>,
    pub file_size: u64,
}

impl FileLayout {
    pub fn header_len(&self) -> u64 {
        self.segs_offset - self.header_offset
    }

    /// Segment bytes physically stored in the file.
    pub fn physical_segs_len(&self) -> u64 {
        self.file_size - self.segs_offset
    }

    /// Length of the segment stream a reader sees.
    pub fn logical_segs_len(&self) -> u64 {
        match &self.diff {
            Some(diff) => diff.segs_size,
            None => self.physical_segs_len(),
        }
    }
}

/// File name of `version` inside its object folder.
pub fn version_file_name(version: u64) -> String {
    format!("{}.", version)
}

/// Version number encoded in a file name, if it names a version file.
pub fn parse_version_file_name(name: &str) -> Option<u64> {
    name.strip_suffix('.')?.parse().ok()
}

/// Writes `value` as 5 bytes, most significant first.
pub fn write_u40(buf: &mut [u8], value: u64) -> std::result::Result<(), FormatError> {
    if value > MAX_U40 {
        return Err(FormatError::OffsetTooLarge(value));
    }
    for (i, b) in buf[..5].iter_mut().enumerate() {
        *b = (value >> (8 * (4 - i))) as u8;
    }
    Ok(())
}

/// Reads 5 bytes, most significant first.
pub fn read_u40(buf: &[u8]) -> u64 {
    buf[..5].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Bytes preceding the header region for a file with this diff.
pub fn prefix_len(diff: Option<&DiffInfo>) -> Result<u64> {
    match diff {
        None => Ok(WHOLE_PREFIX_LEN),
        Some(diff) => Ok(DIFF_PREFIX_LEN + serde_json::to_vec(diff)?.len() as u64),
    }
}

/// Total size of a version file with these regions.
///
/// Fails `InvalidRequest` when the size cannot be encoded in the 40-bit
/// offsets of the layout.
pub fn planned_size(
    header_size: u64,
    segs_size: Option<u64>,
    diff: Option<&DiffInfo>,
) -> Result<u64> {
    prefix_len(diff)?
        .checked_add(header_size)
        .and_then(|size| size.checked_add(segs_size.unwrap_or(0)))
        .filter(|size| *size <= MAX_U40)
        .ok_or_else(|| {
            StoreError::InvalidRequest(format!(
                "header of {} and segments of {:?} bytes exceed the file size limit",
                header_size, segs_size
            ))
        })
}

/// Creates a new version file with its final size pre-allocated.
///
/// Header and segment regions are left zero-filled. `segs_size` of `None`
/// leaves the segment region empty, to be grown by appends. Fails if the
/// path already exists.
pub async fn create(
    path: &Path,
    header_size: u64,
    segs_size: Option<u64>,
    diff: Option<&DiffInfo>,
) -> Result<FileLayout> {
    let (mut prefix, header_offset) = match diff {
        None => {
            let mut prefix = vec![0u8; WHOLE_PREFIX_LEN as usize];
            prefix[..3].copy_from_slice(WHOLE_MAGIC);
            (prefix, WHOLE_PREFIX_LEN)
        }
        Some(diff) => {
            let diff_bytes = serde_json::to_vec(diff)?;
            let header_offset = DIFF_PREFIX_LEN + diff_bytes.len() as u64;
            let mut prefix = vec![0u8; DIFF_PREFIX_LEN as usize];
            prefix[..3].copy_from_slice(DIFF_MAGIC);
            write_u40(&mut prefix[3..8], header_offset)?;
            prefix.extend_from_slice(&diff_bytes);
            (prefix, header_offset)
        }
    };
    let file_size = planned_size(header_size, segs_size, diff)?;
    let segs_offset = header_offset + header_size;
    match diff {
        None => write_u40(&mut prefix[3..8], segs_offset)?,
        Some(_) => write_u40(&mut prefix[8..13], segs_offset)?,
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.set_len(file_size).await?;
    file.write_all(&prefix).await?;
    file.flush().await?;

    Ok(FileLayout {
        header_offset,
        segs_offset,
        diff: diff.cloned(),
        file_size,
    })
}

/// Parses the layout of the version file at `path`.
pub async fn parse(path: &Path) -> Result<FileLayout> {
    let mut file = File::open(path).await?;
    parse_from(&mut file).await
}

/// Parses the layout of an already opened version file.
pub async fn parse_from(file: &mut File) -> Result<FileLayout> {
    let file_size = file.metadata().await?.len();
    let mut prefix = [0u8; DIFF_PREFIX_LEN as usize];
    let available = file_size.min(DIFF_PREFIX_LEN) as usize;
    file.seek(SeekFrom::Start(0)).await?;
    file.read_exact(&mut prefix[..available]).await?;

    if available < 3 {
        return Err(FormatError::Truncated { needed: WHOLE_PREFIX_LEN, found: file_size }.into());
    }
    let magic = [prefix[0], prefix[1], prefix[2]];

    if &magic == WHOLE_MAGIC {
        if file_size < WHOLE_PREFIX_LEN {
            return Err(FormatError::Truncated {
                needed: WHOLE_PREFIX_LEN,
                found: file_size,
            }
            .into());
        }
        let segs_offset = read_u40(&prefix[3..8]);
        if segs_offset < WHOLE_PREFIX_LEN || segs_offset > file_size {
            return Err(FormatError::Corrupt(format!(
                "segments offset {} outside file of {} bytes",
                segs_offset, file_size
            ))
            .into());
        }
        return Ok(FileLayout {
            header_offset: WHOLE_PREFIX_LEN,
            segs_offset,
            diff: None,
            file_size,
        });
    }

    if &magic == DIFF_MAGIC {
        if file_size < DIFF_PREFIX_LEN {
            return Err(FormatError::Truncated { needed: DIFF_PREFIX_LEN, found: file_size }.into());
        }
        let header_offset = read_u40(&prefix[3..8]);
        let segs_offset = read_u40(&prefix[8..13]);
        if header_offset < DIFF_PREFIX_LEN
            || header_offset > segs_offset
            || segs_offset > file_size
        {
            return Err(FormatError::Corrupt(format!(
                "offsets {}/{} inconsistent with file of {} bytes",
                header_offset, segs_offset, file_size
            ))
            .into());
        }
        let mut diff_bytes = vec![0u8; (header_offset - DIFF_PREFIX_LEN) as usize];
        file.read_exact(&mut diff_bytes).await?;
        let diff: DiffInfo =
            serde_json::from_slice(&diff_bytes).map_err(FormatError::MalformedDiff)?;
        return Ok(FileLayout {
            header_offset,
            segs_offset,
            diff: Some(diff),
            file_size,
        });
    }

    Err(FormatError::BadSignature(magic).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn sample_diff() -> DiffInfo {
        DiffInfo {
            base_version: 1,
            segs_size: 600,
            sections: vec![Section::base(0, 500), Section::new_bytes(0, 100)],
        }
    }

    #[test]
    fn test_u40_is_most_significant_first() {
        let mut buf = [0u8; 5];
        write_u40(&mut buf, 0x01_0203_0405).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        assert_eq!(read_u40(&buf), 0x01_0203_0405);
        assert!(matches!(
            write_u40(&mut buf, MAX_U40 + 1),
            Err(FormatError::OffsetTooLarge(_))
        ));
    }

    #[test]
    fn test_version_file_names() {
        assert_eq!(version_file_name(12), "12.");
        assert_eq!(parse_version_file_name("12."), Some(12));
        assert_eq!(parse_version_file_name("status"), None);
        assert_eq!(parse_version_file_name("12"), None);
    }

    #[test]
    fn test_diff_json_shape() {
        let json = serde_json::to_string(&sample_diff()).unwrap();
        assert_eq!(json, r#"{"baseVersion":1,"segsSize":600,"sections":[[0,0,500],[1,0,100]]}"#);
        let bad: std::result::Result<DiffInfo, _> =
            serde_json::from_str(r#"{"baseVersion":1,"segsSize":1,"sections":[[7,0,1]]}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_diff_validation() {
        let diff = sample_diff();
        diff.validate(2, Some(100)).unwrap();
        assert!(diff.validate(1, Some(100)).is_err());
        assert!(diff.validate(2, Some(99)).is_err());
        assert!(diff.validate(2, None).is_err());

        let mut short = sample_diff();
        short.segs_size = 601;
        assert!(short.validate(2, Some(100)).is_err());
        assert_eq!(diff.base_extent(), 500);
    }

    #[test]
    fn test_diff_validation_rejects_overflowing_sections() {
        let diff = DiffInfo {
            base_version: 1,
            segs_size: 1,
            sections: vec![Section::base(u64::MAX, 1)],
        };
        assert!(matches!(diff.validate(2, Some(0)), Err(StoreError::InvalidRequest(_))));
        assert_eq!(diff.base_extent(), u64::MAX);
    }

    #[test]
    fn test_planned_size_limits() {
        assert_eq!(planned_size(100, Some(500), None).unwrap(), 608);
        assert_eq!(planned_size(0, None, None).unwrap(), 8);
        for (header, segs) in [(u64::MAX, Some(10)), (0, Some(1 << 63)), (MAX_U40, None)] {
            assert!(matches!(
                planned_size(header, segs, None),
                Err(StoreError::InvalidRequest(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_create_rejects_oversized_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1.");
        let err = create(&path, u64::MAX, Some(1), None).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_create_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1.");
        let layout = create(&path, 100, Some(500), None).await.unwrap();
        assert_eq!(layout.header_offset, 8);
        assert_eq!(layout.segs_offset, 108);
        assert_eq!(layout.file_size, 608);

        let raw = tokio::fs::read(&path).await.unwrap();
        assert_eq!(raw.len(), 608);
        assert_eq!(&raw[..3], b"ALL");
        assert_eq!(&raw[3..8], &[0, 0, 0, 0, 108]);
        assert!(raw[8..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_create_refuses_existing_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1.");
        create(&path, 1, Some(1), None).await.unwrap();
        let err = create(&path, 1, Some(1), None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists
        ));
    }

    #[tokio::test]
    async fn test_create_append_mode_has_no_segments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("1.");
        let layout = create(&path, 20, None, None).await.unwrap();
        assert_eq!(layout.file_size, layout.segs_offset);
        assert_eq!(parse(&path).await.unwrap().physical_segs_len(), 0);
    }

    #[tokio::test]
    async fn test_parse_diff_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2.");
        let created = create(&path, 10, Some(100), Some(&sample_diff())).await.unwrap();
        let parsed = parse(&path).await.unwrap();
        assert_eq!(created, parsed);
        assert_eq!(prefix_len(Some(&sample_diff())).unwrap(), parsed.header_offset);
        assert_eq!(parsed.logical_segs_len(), 600);
        assert_eq!(parsed.physical_segs_len(), 100);
        assert_eq!(parsed.header_len(), 10);
    }

    #[tokio::test]
    async fn test_parse_rejects_bad_signature() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        tokio::fs::write(&path, b"XYZ0000000000000").await.unwrap();
        let err = parse(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Format(FormatError::BadSignature(m)) if &m == b"XYZ"));
    }

    #[tokio::test]
    async fn test_parse_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        tokio::fs::write(&path, b"DIF\0\0\0\0").await.unwrap();
        let err = parse(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Format(FormatError::Truncated { needed: 13, found: 7 })));

        tokio::fs::write(&path, b"AL").await.unwrap();
        let err = parse(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Format(FormatError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_parse_wraps_malformed_diff() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x");
        let body = b"{not json";
        let header_offset = DIFF_PREFIX_LEN + body.len() as u64;
        let mut raw = b"DIF".to_vec();
        let mut field = [0u8; 5];
        write_u40(&mut field, header_offset).unwrap();
        raw.extend_from_slice(&field);
        raw.extend_from_slice(&field);
        raw.extend_from_slice(body);
        tokio::fs::write(&path, &raw).await.unwrap();

        let err = parse(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Format(FormatError::MalformedDiff(_))));
    }

    fn arb_diff() -> impl Strategy<Value = Option<DiffInfo>> {
        proptest::option::of(
            (0u64..50, proptest::collection::vec((any::<bool>(), 0u64..1000, 1u64..1000), 0..8))
                .prop_map(|(base_version, raw)| {
                    let sections: Vec<Section> = raw
                        .into_iter()
                        .map(|(is_new, src, len)| {
                            if is_new {
                                Section::new_bytes(src, len)
                            } else {
                                Section::base(src, len)
                            }
                        })
                        .collect();
                    let segs_size = sections.iter().map(|s| s.len).sum();
                    DiffInfo { base_version, segs_size, sections }
                }),
        )
    }

    proptest! {
        #[test]
        fn prop_create_then_parse_round_trips(
            header_size in 0u64..4096,
            segs_size in proptest::option::of(0u64..8192),
            diff in arb_diff(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("1.");
            let (created, parsed) = rt.block_on(async {
                let created = create(&path, header_size, segs_size, diff.as_ref()).await.unwrap();
                let parsed = parse(&path).await.unwrap();
                (created, parsed)
            });
            prop_assert_eq!(&created, &parsed);
            prop_assert_eq!(parsed.header_len(), header_size);
            prop_assert_eq!(parsed.physical_segs_len(), segs_size.unwrap_or(0));
            prop_assert_eq!(parsed.diff, diff);
        }
    }
}
