//! Byte-range reconstruction for diff versions
//!
//! A diff version's logical segment stream is a sequence of sections, each
//! either present in the version's own file or inherited from the logical
//! stream of its base version. Reading a window of such a stream means
//! trimming the sections that overlap it and resolving every inherited
//! piece against the base, which may itself be a diff.

use crate::error::{FormatError, Result};
use crate::obj_file::{FileLayout, Section, SectionTag};
use async_trait::async_trait;

/// The sections of a stream overlapping a requested window.
///
/// `first` and `last` are trimmed copies; everything strictly between
/// them is used as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub first_index: usize,
    pub first: Section,
    pub last_index: usize,
    pub last: Section,
}

impl Window {
    fn single(index: usize, section: Section) -> Self {
        Self {
            first_index: index,
            first: section,
            last_index: index,
            last: section,
        }
    }

    /// Trimmed sections in stream order.
    pub fn pieces(&self, sections: &[Section]) -> Vec<Section> {
        if self.first_index == self.last_index {
            return vec![self.first];
        }
        let mut pieces = Vec::with_capacity(self.last_index - self.first_index + 1);
        pieces.push(self.first);
        pieces.extend_from_slice(&sections[self.first_index + 1..self.last_index]);
        pieces.push(self.last);
        pieces
    }
}

/// Finds the sections covering `[offset, offset + len)` of a logical stream.
///
/// Returns `None` when the window is empty or starts at or past the end of
/// the stream. A window running past the end is cut at the last section.
pub fn locate_window(sections: &[Section], offset: u64, len: u64) -> Option<Window> {
    if len == 0 {
        return None;
    }
    let mut end = 0u64;
    let mut found = None;
    for (i, s) in sections.iter().enumerate() {
        end += s.len;
        if end > offset {
            found = Some((i, end));
            break;
        }
    }
    let (first_index, first_end) = found?;

    let section = sections[first_index];
    let remaining = first_end - offset;
    let mut first = Section {
        tag: section.tag,
        src: section.src + (section.len - remaining),
        len: remaining,
    };
    if first.len >= len {
        first.len = len;
        return Some(Window::single(first_index, first));
    }
    if first_index == sections.len() - 1 {
        return Some(Window::single(first_index, first));
    }

    let mut covered = first.len;
    for (i, s) in sections.iter().enumerate().skip(first_index + 1) {
        covered += s.len;
        if covered >= len {
            let last = Section {
                tag: s.tag,
                src: s.src,
                len: s.len - (covered - len),
            };
            return Some(Window {
                first_index,
                first,
                last_index: i,
                last,
            });
        }
    }

    let last_index = sections.len() - 1;
    Some(Window {
        first_index,
        first,
        last_index,
        last: sections[last_index],
    })
}

/// A run of bytes to copy out of one version file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRead {
    pub version: u64,
    /// Absolute position in the version file.
    pub pos: u64,
    pub len: u64,
}

/// Access to the parsed layouts of one object's versions.
#[async_trait]
pub trait VersionLayouts: Send + Sync {
    async fn layout(&self, version: u64) -> Result<FileLayout>;
}

enum Step {
    Resolve { version: u64, offset: u64, len: u64 },
    Emit(PhysicalRead),
}

fn push_read(reads: &mut Vec<PhysicalRead>, read: PhysicalRead) {
    if read.len == 0 {
        return;
    }
    if let Some(prev) = reads.last_mut() {
        if prev.version == read.version && prev.pos + prev.len == read.pos {
            prev.len += read.len;
            return;
        }
    }
    reads.push(read);
}

/// Resolves a logical window of `version` into physical file reads.
///
/// Base chains are walked with an explicit stack; every hop must move to a
/// strictly lower version, so the walk terminates.
pub async fn plan_reads<L>(
    layouts: &L,
    version: u64,
    offset: u64,
    len: u64,
) -> Result<Vec<PhysicalRead>>
where
    L: VersionLayouts + ?Sized,
{
    let mut reads = Vec::new();
    let mut stack = vec![Step::Resolve { version, offset, len }];

    while let Some(step) = stack.pop() {
        let (version, offset, len) = match step {
            Step::Emit(read) => {
                push_read(&mut reads, read);
                continue;
            }
            Step::Resolve { version, offset, len } => (version, offset, len),
        };
        if len == 0 {
            continue;
        }
        let layout = layouts.layout(version).await?;
        if offset + len > layout.logical_segs_len() {
            return Err(FormatError::Corrupt(format!(
                "version {} has {} segment bytes, window [{}, +{}) requested",
                version,
                layout.logical_segs_len(),
                offset,
                len
            ))
            .into());
        }

        let Some(diff) = &layout.diff else {
            push_read(
                &mut reads,
                PhysicalRead {
                    version,
                    pos: layout.segs_offset + offset,
                    len,
                },
            );
            continue;
        };
        if diff.base_version >= version {
            return Err(FormatError::Corrupt(format!(
                "version {} names base {}",
                version, diff.base_version
            ))
            .into());
        }
        let Some(window) = locate_window(&diff.sections, offset, len) else {
            continue;
        };
        for piece in window.pieces(&diff.sections).into_iter().rev() {
            match piece.tag {
                SectionTag::New => stack.push(Step::Emit(PhysicalRead {
                    version,
                    pos: layout.segs_offset + piece.src,
                    len: piece.len,
                })),
                SectionTag::Base => stack.push(Step::Resolve {
                    version: diff.base_version,
                    offset: piece.src,
                    len: piece.len,
                }),
            }
        }
    }

    Ok(reads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::obj_file::DiffInfo;
    use proptest::prelude::*;
    use std::collections::HashMap;

    /// In-memory versions: physical segment bytes plus an optional diff.
    #[derive(Default)]
    struct FakeVersions {
        versions: HashMap<u64, (Vec<u8>, Option<DiffInfo>)>,
    }

    #[async_trait]
    impl VersionLayouts for FakeVersions {
        async fn layout(&self, version: u64) -> Result<FileLayout> {
            let (bytes, diff) = self
                .versions
                .get(&version)
                .ok_or_else(|| StoreError::ObjUnknown(format!("v{}", version)))?;
            Ok(FileLayout {
                header_offset: 0,
                segs_offset: 0,
                diff: diff.clone(),
                file_size: bytes.len() as u64,
            })
        }
    }

    impl FakeVersions {
        fn read(&self, reads: &[PhysicalRead]) -> Vec<u8> {
            let mut out = Vec::new();
            for r in reads {
                let bytes = &self.versions[&r.version].0;
                out.extend_from_slice(&bytes[r.pos as usize..(r.pos + r.len) as usize]);
            }
            out
        }

        /// Reference: substitute every section to build the whole stream.
        fn materialize(&self, version: u64) -> Vec<u8> {
            let (bytes, diff) = &self.versions[&version];
            let Some(diff) = diff else {
                return bytes.clone();
            };
            let base = self.materialize(diff.base_version);
            let mut out = Vec::new();
            for s in &diff.sections {
                let src = match s.tag {
                    SectionTag::New => bytes,
                    SectionTag::Base => &base,
                };
                out.extend_from_slice(&src[s.src as usize..(s.src + s.len) as usize]);
            }
            out
        }
    }

    fn pattern(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt)).collect()
    }

    #[test]
    fn test_window_within_single_section() {
        let sections = [Section::base(0, 500), Section::new_bytes(0, 100)];
        let w = locate_window(&sections, 100, 50).unwrap();
        assert_eq!(w.pieces(&sections), vec![Section::base(100, 50)]);
    }

    #[test]
    fn test_window_spanning_sections() {
        let sections = [
            Section::base(0, 500),
            Section::new_bytes(0, 100),
            Section::base(700, 200),
        ];
        let w = locate_window(&sections, 450, 200).unwrap();
        assert_eq!(w.first_index, 0);
        assert_eq!(w.last_index, 2);
        assert_eq!(
            w.pieces(&sections),
            vec![Section::base(450, 50), Section::new_bytes(0, 100), Section::base(700, 50)]
        );
    }

    #[test]
    fn test_window_past_end_uses_last_section_untrimmed() {
        let sections = [Section::base(0, 10), Section::new_bytes(5, 10)];
        let w = locate_window(&sections, 5, 1000).unwrap();
        assert_eq!(w.pieces(&sections), vec![Section::base(5, 5), Section::new_bytes(5, 10)]);

        let w = locate_window(&sections, 12, 1000).unwrap();
        assert_eq!(w.pieces(&sections), vec![Section::new_bytes(7, 8)]);
    }

    #[test]
    fn test_window_outside_stream_is_empty() {
        let sections = [Section::base(0, 10)];
        assert!(locate_window(&sections, 10, 5).is_none());
        assert!(locate_window(&sections, 11, 5).is_none());
        assert!(locate_window(&sections, 0, 0).is_none());
        assert!(locate_window(&[], 0, 5).is_none());
    }

    #[tokio::test]
    async fn test_chain_crossing_base_boundary() {
        let mut fake = FakeVersions::default();
        fake.versions.insert(1, (pattern(1000, 1), None));
        fake.versions.insert(
            2,
            (
                pattern(100, 2),
                Some(DiffInfo {
                    base_version: 1,
                    segs_size: 600,
                    sections: vec![Section::base(0, 500), Section::new_bytes(0, 100)],
                }),
            ),
        );
        fake.versions.insert(
            3,
            (
                pattern(50, 3),
                Some(DiffInfo {
                    base_version: 2,
                    segs_size: 250,
                    sections: vec![
                        Section::base(450, 100),
                        Section::new_bytes(0, 50),
                        Section::base(0, 100),
                    ],
                }),
            ),
        );

        let reads = plan_reads(&fake, 3, 0, 250).await.unwrap();
        assert_eq!(
            reads,
            vec![
                PhysicalRead { version: 1, pos: 450, len: 50 },
                PhysicalRead { version: 2, pos: 0, len: 50 },
                PhysicalRead { version: 3, pos: 0, len: 50 },
                PhysicalRead { version: 1, pos: 0, len: 100 },
            ]
        );
        assert_eq!(fake.read(&reads), fake.materialize(3));
    }

    #[tokio::test]
    async fn test_plan_rejects_window_past_base() {
        let mut fake = FakeVersions::default();
        fake.versions.insert(1, (pattern(10, 1), None));
        fake.versions.insert(
            2,
            (
                Vec::new(),
                Some(DiffInfo {
                    base_version: 1,
                    segs_size: 20,
                    sections: vec![Section::base(0, 20)],
                }),
            ),
        );
        let err = plan_reads(&fake, 2, 0, 20).await.unwrap_err();
        assert!(matches!(err, StoreError::Format(FormatError::Corrupt(_))));
    }

    /// Builds valid sections over a base of `base_len` and `new_len` fresh bytes.
    fn build_sections(raw: &[(bool, u64, u64)], base_len: u64, new_len: u64) -> Vec<Section> {
        raw.iter()
            .filter_map(|&(is_new, a, b)| {
                let source_len = if is_new { new_len } else { base_len };
                if source_len == 0 {
                    return None;
                }
                let src = a % source_len;
                let len = 1 + b % (source_len - src);
                Some(if is_new {
                    Section::new_bytes(src, len)
                } else {
                    Section::base(src, len)
                })
            })
            .collect()
    }

    fn arb_raw_sections() -> impl Strategy<Value = Vec<(bool, u64, u64)>> {
        proptest::collection::vec((any::<bool>(), any::<u64>(), any::<u64>()), 1..10)
    }

    proptest! {
        #[test]
        fn prop_reconstruction_matches_materialized_stream(
            base_len in 1u64..400,
            new2 in 0u64..200,
            new3 in 0u64..200,
            raw2 in arb_raw_sections(),
            raw3 in arb_raw_sections(),
            offset_seed in any::<u64>(),
            len_seed in any::<u64>(),
        ) {
            let mut fake = FakeVersions::default();
            fake.versions.insert(1, (pattern(base_len as usize, 1), None));

            let sections2 = build_sections(&raw2, base_len, new2);
            let size2: u64 = sections2.iter().map(|s| s.len).sum();
            fake.versions.insert(2, (pattern(new2 as usize, 2), Some(DiffInfo {
                base_version: 1,
                segs_size: size2,
                sections: sections2,
            })));

            let sections3 = build_sections(&raw3, size2, new3);
            let size3: u64 = sections3.iter().map(|s| s.len).sum();
            fake.versions.insert(3, (pattern(new3 as usize, 3), Some(DiffInfo {
                base_version: 2,
                segs_size: size3,
                sections: sections3,
            })));
            prop_assume!(size3 > 0);

            let offset = offset_seed % size3;
            let len = 1 + len_seed % (size3 - offset);

            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let reads = rt.block_on(plan_reads(&fake, 3, offset, len)).unwrap();
            let expected = fake.materialize(3);
            prop_assert_eq!(
                fake.read(&reads),
                expected[offset as usize..(offset + len) as usize].to_vec()
            );
        }
    }
}
