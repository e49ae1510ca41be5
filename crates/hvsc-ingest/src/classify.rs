//! Archive entry classification
//!
//! Every extracted entry is classified once into an [`EntryKind`] and,
//! where it will be written, a virtual library path. Priority order:
//! deletion list (update archives only), songlength file, song, ignored.
//!
//! Virtual paths are `/`-rooted and stripped of the archive's root folders
//! (`HVSC_80/`, `C64Music/`, ...) and, for updates, of the update payload
//! folder (`new/`, `update/`, `updated/`).

use crate::plan::ArchiveKind;

pub const SONG_EXTENSION: &str = ".sid";
pub const SONGLENGTHS_MD5: &str = "songlengths.md5";
pub const SONGLENGTHS_TXT: &str = "songlengths.txt";

const DELETION_LIST_PREFIXES: &[&str] = &["to_delete", "deleted", "delete", "removed", "remove"];
const UPDATE_FOLDERS: &[&str] = &["new", "update", "updated"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Song,
    SonglengthsMd5,
    SonglengthsTxt,
    DeletionList,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEntry {
    pub kind: EntryKind,
    /// Library path for songs and songlength files, `None` otherwise
    pub virtual_path: Option<String>,
}

impl ClassifiedEntry {
    fn ignored() -> Self {
        Self {
            kind: EntryKind::Ignored,
            virtual_path: None,
        }
    }
}

/// Classify one archive entry.
pub fn classify_entry(archive_path: &str, archive_kind: ArchiveKind) -> ClassifiedEntry {
    let Some(virtual_path) = normalize_virtual_path(archive_path, archive_kind) else {
        return ClassifiedEntry::ignored();
    };
    let file_name = virtual_path
        .rsplit('/')
        .next()
        .unwrap_or(&virtual_path)
        .to_ascii_lowercase();

    if archive_kind == ArchiveKind::Update && is_deletion_list_name(&file_name) {
        return ClassifiedEntry {
            kind: EntryKind::DeletionList,
            virtual_path: None,
        };
    }

    let kind = match file_name.as_str() {
        SONGLENGTHS_MD5 => EntryKind::SonglengthsMd5,
        SONGLENGTHS_TXT => EntryKind::SonglengthsTxt,
        name if name.ends_with(SONG_EXTENSION) => EntryKind::Song,
        _ => return ClassifiedEntry::ignored(),
    };

    ClassifiedEntry {
        kind,
        virtual_path: Some(virtual_path),
    }
}

/// `delete*.txt`, `removed*.txt`, `to_delete*.txt` and friends.
pub fn is_deletion_list_name(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".txt") && DELETION_LIST_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Normalise an archive member path into a virtual library path.
///
/// Returns `None` for paths that escape the archive (`..`) or that are
/// nothing but root folders.
pub fn normalize_virtual_path(archive_path: &str, archive_kind: ArchiveKind) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in archive_path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return None,
            other => segments.push(other),
        }
    }

    let mut start = 0;
    // Keep at least the file name
    while start + 1 < segments.len() {
        let lower = segments[start].to_ascii_lowercase();
        let strip = lower.starts_with("hvsc")
            || lower == "c64music"
            || (archive_kind == ArchiveKind::Update && UPDATE_FOLDERS.contains(&lower.as_str()));
        if !strip {
            break;
        }
        start += 1;
    }

    let rest = &segments[start..];
    if rest.is_empty() {
        return None;
    }
    Some(format!("/{}", rest.join("/")))
}

/// Virtual paths named by a deletion list.
///
/// Blank lines and `#`/`;` comments are skipped; every other line goes
/// through the same normalisation as update archive entries.
pub fn parse_deletion_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| normalize_virtual_path(line, ArchiveKind::Update))
        .collect()
}
