use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::sanitize_path_component;
use crate::{Error, Result};

pub const MAX_FILENAME_BYTES: usize = 255;
pub const INDEX_FILE_NAME: &str = ".attachments.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub filename: String,
    /// A regular file for this attachment is already on disk; skip the download.
    pub already_exists: bool,
}

/// Which attachment each stored file in a channel directory belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentIndex {
    owners: BTreeMap<String, String>,
    reserved: BTreeSet<String>,
}

impl AttachmentIndex {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(INDEX_FILE_NAME)
    }

    /// A missing or unreadable index yields an empty one.
    pub fn load(dir: &Path) -> Self {
        let path = Self::path_in(dir);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(owners) => Self {
                owners,
                reserved: BTreeSet::new(),
            },
            Err(e) => {
                warn!(
                    event = "attachment_index.corrupt",
                    path = %path.display(),
                    error = %e,
                    "attachment_index.corrupt"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(&self.owners)?;
        std::fs::write(Self::path_in(dir), format!("{data}\n"))?;
        Ok(())
    }

    pub fn owner(&self, filename: &str) -> Option<&str> {
        self.owners.get(filename).map(String::as_str)
    }

    /// Owner of `filename`, falling back to a name that differs only in case.
    /// Case-insensitive filesystems resolve both spellings to one file.
    pub fn owner_ignoring_case(&self, filename: &str) -> Option<&str> {
        if let Some(owner) = self.owner(filename) {
            return Some(owner);
        }
        let folded = filename.to_lowercase();
        self.owners
            .iter()
            .find(|(name, _)| name.to_lowercase() == folded)
            .map(|(_, owner)| owner.as_str())
    }

    /// Marks a name no attachment may take, such as the transcript itself.
    pub fn reserve(&mut self, filename: &str) {
        self.reserved.insert(filename.to_string());
    }

    pub fn is_reserved(&self, filename: &str) -> bool {
        filename == INDEX_FILE_NAME || self.reserved.contains(filename)
    }

    pub fn claim(&mut self, filename: &str, attachment_id: &str) {
        self.owners
            .insert(filename.to_string(), attachment_id.to_string());
    }
}

/// Splits like a shell would: the extension keeps its dot, dotfiles have none.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if name[..pos].chars().any(|c| c != '.') => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

fn truncate_to_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Stem and extension of the name to store, with the stem cut so the whole
/// name fits in [`MAX_FILENAME_BYTES`].
pub fn fit_filename(desired: &str) -> Result<(String, String)> {
    let base = Path::new(desired)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(desired);
    let base = sanitize_path_component(base);
    let (stem, ext) = split_extension(&base);
    if ext.len() > MAX_FILENAME_BYTES {
        return Err(Error::InvalidConfig {
            message: format!("attachment extension longer than {MAX_FILENAME_BYTES} bytes"),
        });
    }
    let stem = truncate_to_bytes(stem, MAX_FILENAME_BYTES - ext.len());
    Ok((stem.to_string(), ext.to_string()))
}

/// `stem_<counter>ext`, with the stem cut again so the suffixed name still
/// fits in [`MAX_FILENAME_BYTES`].
fn suffixed_candidate(stem: &str, ext: &str, counter: u64) -> Result<String> {
    let suffix = format!("_{counter}");
    let budget = MAX_FILENAME_BYTES
        .checked_sub(ext.len() + suffix.len())
        .ok_or_else(|| Error::InvalidConfig {
            message: format!("no room for a numeric suffix within {MAX_FILENAME_BYTES} bytes"),
        })?;
    Ok(format!("{}{suffix}{ext}", truncate_to_bytes(stem, budget)))
}

/// Picks the file name for one attachment inside `dir`.
///
/// Candidates are `stem.ext`, `stem_1.ext`, `stem_2.ext`, ... A candidate is
/// taken when nothing occupies it, or when a regular file occupies it that is
/// not owned by a different attachment. Non-file occupants are always skipped.
/// Ownership is matched ignoring case.
pub fn resolve_filename(
    dir: &Path,
    desired: &str,
    attachment_id: &str,
    index: &AttachmentIndex,
) -> Result<Resolution> {
    let (stem, ext) = fit_filename(desired)?;
    let mut counter: u64 = 0;
    loop {
        let filename = if counter == 0 {
            format!("{stem}{ext}")
        } else {
            suffixed_candidate(&stem, &ext, counter)?
        };
        counter += 1;

        if index.is_reserved(&filename) {
            continue;
        }

        let path = dir.join(&filename);
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Resolution {
                    filename,
                    already_exists: false,
                });
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            continue;
        }
        match index.owner_ignoring_case(&filename) {
            Some(owner) if owner != attachment_id => continue,
            _ => {
                return Ok(Resolution {
                    filename,
                    already_exists: true,
                });
            }
        }
    }
}
