use std::path::{Path, PathBuf};

use super::file::sha256_file;
use crate::types::{MediaKind, MessageId};

/// Clean a filename by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect()
}

/// Deterministic name for media the source sent without one:
/// `photo_42.jpg`, or `voice_42` when no format is known.
pub fn fallback_filename(kind: MediaKind, message_id: MessageId, format: Option<&str>) -> String {
    match format.filter(|f| !f.is_empty()) {
        Some(ext) => format!("{}_{}.{}", kind.as_str(), message_id, ext),
        None => format!("{}_{}", kind.as_str(), message_id),
    }
}

/// Split on the last dot. A name whose only dot is the first character
/// (`.env`) has no extension.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], Some(&name[dot + 1..])),
        _ => (name, None),
    }
}

fn with_counter(name: &str, n: u32) -> String {
    match split_extension(name) {
        (stem, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
        (stem, None) => format!("{} ({})", stem, n),
    }
}

/// Strip a trailing ` (N)` disambiguator: `photo (2)` -> `photo`.
pub fn base_stem(stem: &str) -> &str {
    if let Some(inner) = stem.strip_suffix(')') {
        if let Some(open) = inner.rfind(" (") {
            let digits = &inner[open + 2..];
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return &stem[..open];
            }
        }
    }
    stem
}

/// Pick a destination under `<directory>/<kind>/` that does not exist yet.
///
/// Starts from the cleaned original file name (or [`fallback_filename`]) and
/// appends ` (1)`, ` (2)`, ... before the extension until a free name is
/// found. Only safe with one resolver per directory at a time, which holds
/// because items are processed sequentially.
pub fn resolve(
    directory: &Path,
    kind: MediaKind,
    original_filename: Option<&str>,
    message_id: MessageId,
    format: Option<&str>,
) -> PathBuf {
    let kind_dir = directory.join(kind.as_str());
    let name = original_filename
        .map(clean_filename)
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| fallback_filename(kind, message_id, format));

    let candidate = kind_dir.join(&name);
    if !candidate.exists() {
        return candidate;
    }
    let mut n: u32 = 1;
    loop {
        let candidate = kind_dir.join(with_counter(&name, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Look for an existing artifact with the same content as `new_path`.
///
/// Candidates are regular files in the same directory sharing the base stem
/// (ignoring any ` (N)` disambiguator) and the extension, with the same
/// size. Returns the first whose SHA-256 equals `sha256`, in name order.
pub async fn find_duplicate(new_path: &Path, size: u64, sha256: &str) -> Option<PathBuf> {
    let dir = new_path.parent()?;
    let new_name = new_path.file_name()?.to_str()?;
    let (new_stem, new_ext) = split_extension(new_name);
    let wanted_stem = base_stem(new_stem);

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot scan {} for duplicates: {}", dir.display(), e);
            return None;
        }
    };

    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == new_path {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".part") {
            continue;
        }
        let (stem, ext) = split_extension(name);
        if base_stem(stem) != wanted_stem || ext != new_ext {
            continue;
        }
        match entry.metadata().await {
            Ok(meta) if meta.is_file() && meta.len() == size => candidates.push(path),
            _ => {}
        }
    }
    candidates.sort();

    for candidate in candidates {
        match sha256_file(&candidate).await {
            Ok(digest) if digest == sha256 => return Some(candidate),
            Ok(_) => {}
            Err(e) => tracing::warn!("Cannot read {}: {}", candidate.display(), e),
        }
    }
    None
}
