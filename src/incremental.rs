use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io,
    path::{Path, PathBuf},
};

use rayon::prelude::*;

use crate::{page::Fingerprint, walker::DiscoveredFile};

/// Stored fingerprints keyed by corpus-relative source path.
pub type Manifest = HashMap<String, Fingerprint>;

/// Hex BLAKE3 digest of `bytes`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Hex BLAKE3 digest of a file's contents, streamed.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(File::open(path)?)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// A discovered file together with its content hash.
///
/// `content_hash` is `None` when the file could not be read; such files are
/// always scheduled so the extractor reports the failure.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub file: DiscoveredFile,
    pub content_hash: Option<String>,
}

/// Hash every file in parallel. Output order matches input order.
pub fn scan(files: Vec<DiscoveredFile>) -> Vec<ScannedFile> {
    files
        .into_par_iter()
        .map(|file| {
            let content_hash = match hash_file(&file.absolute_path) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    tracing::debug!(
                        path = %file.relative_path,
                        error = %e,
                        "could not hash file",
                    );
                    None
                }
            };
            ScannedFile { file, content_hash }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
}

/// One file to (re-)extract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub change: ChangeKind,
}

/// What a run has to do to bring the store in line with the corpus.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub to_index: Vec<WorkItem>,
    /// Source paths that have vanished from the corpus.
    pub to_remove: Vec<String>,
    pub unchanged: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_index.is_empty() && self.to_remove.is_empty()
    }
}

/// Compare scanned files against the stored manifest.
///
/// Only content hashes decide; timestamps are ignored. With `force`, every
/// scanned file is scheduled, while files missing from the corpus are still
/// removed.
pub fn diff(scanned: Vec<ScannedFile>, manifest: &Manifest, force: bool) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(scanned.len());

    for ScannedFile { file, content_hash } in scanned {
        let known = manifest.get_key_value(&file.relative_path).map(
            |(path, fp)| {
                seen.insert(path.as_str());
                fp
            },
        );

        let change = match known {
            None => ChangeKind::Added,
            Some(fp) => {
                let same =
                    content_hash.as_deref() == Some(fp.content_hash.as_str());
                if same && !force {
                    changes.unchanged += 1;
                    continue;
                }
                ChangeKind::Modified
            }
        };

        changes.to_index.push(WorkItem {
            relative_path: file.relative_path,
            absolute_path: file.absolute_path,
            change,
        });
    }

    let mut removed: Vec<String> = manifest
        .keys()
        .filter(|path| !seen.contains(path.as_str()))
        .cloned()
        .collect();
    removed.sort();
    changes.to_remove = removed;

    changes
}
