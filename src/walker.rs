use std::path::{Component, Path, PathBuf};

use crate::error::Result;

/// A page file found under the corpus root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the corpus root, `/`-separated on every platform.
    pub relative_path: String,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
}

const PAGE_EXTENSION: &str = "xml";

/// Recursively walk the corpus root and collect page files.
///
/// Skips hidden files and directories (names starting with `.`) and returns
/// only `.xml` files, sorted by relative path.
pub fn discover_files(root: &Path) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            walk_dir(root, &path, results)?;
        } else if file_type.is_symlink() {
            let Ok(resolved) = path.canonicalize() else {
                tracing::debug!(path = %path.display(), "skipping broken symlink");
                continue;
            };
            if resolved.is_dir() {
                // Directory links are not followed; they can loop back into
                // the corpus.
                continue;
            }
            if resolved.is_file() && is_page_file(&path) {
                results.push(make_discovered(root, &path, resolved));
            }
        } else if file_type.is_file() && is_page_file(&path) {
            let absolute = path.canonicalize()?;
            results.push(make_discovered(root, &path, absolute));
        }
    }

    Ok(())
}

fn is_page_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PAGE_EXTENSION))
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: PathBuf,
) -> DiscoveredFile {
    let relative = original_path.strip_prefix(root).unwrap_or(original_path);
    DiscoveredFile {
        relative_path: to_corpus_path(relative),
        absolute_path,
    }
}

/// Join path components with `/` regardless of the host separator.
pub fn to_corpus_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(files: &[DiscoveredFile]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn discovers_only_xml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("page.xml"), "<Page/>").unwrap();
        std::fs::write(tmp.path().join("UPPER.XML"), "<Page/>").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "# notes").unwrap();
        std::fs::write(tmp.path().join("image.png"), "binary").unwrap();

        let files = discover_files(tmp.path()).unwrap();
        assert_eq!(names(&files), vec!["UPPER.XML", "page.xml"]);
    }

    #[test]
    fn skips_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".cache");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("stale.xml"), "<Page/>").unwrap();
        std::fs::write(tmp.path().join(".draft.xml"), "<Page/>").unwrap();
        std::fs::write(tmp.path().join("visible.xml"), "<Page/>").unwrap();

        let files = discover_files(tmp.path()).unwrap();
        assert_eq!(names(&files), vec!["visible.xml"]);
    }

    #[test]
    fn nested_paths_use_forward_slashes() {
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("motion").join("axis");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("move.xml"), "<Page/>").unwrap();
        std::fs::write(tmp.path().join("top.xml"), "<Page/>").unwrap();

        let files = discover_files(tmp.path()).unwrap();
        assert_eq!(names(&files), vec!["motion/axis/move.xml", "top.xml"]);
        assert!(files[0].absolute_path.is_absolute());
    }

    #[test]
    fn empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_files(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_files(&tmp.path().join("absent")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn follows_file_symlinks_but_not_directory_links() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("shared.xml"), "<Page/>").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("shared.xml"),
            tmp.path().join("linked.xml"),
        )
        .unwrap();
        std::os::unix::fs::symlink(tmp.path(), tmp.path().join("loop"))
            .unwrap();

        let files = discover_files(tmp.path()).unwrap();
        assert_eq!(names(&files), vec!["linked.xml"]);
    }
}
