//! Corpus enumeration and loading.
//!
//! Walks every configured root recursively for `*.md` files, records
//! modification times as floating-point epoch seconds, and reads contents in
//! parallel. Single-file failures never abort a scan; a root that is missing
//! is reported but only the loss of every root is fatal.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ignore::WalkBuilder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Time source injected into change detection; tests use a fake.
pub trait Clock: Send + Sync {
    /// Current time as seconds since the Unix epoch.
    fn now_secs(&self) -> f64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A corpus file located by a scan, contents not yet read.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub mtime: f64,
}

/// A corpus file with its contents.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub path: PathBuf,
    pub mtime: f64,
    pub content: String,
}

pub fn mtime_secs(metadata: &std::fs::Metadata) -> f64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn is_markdown(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "md")
}

fn walk_root(root: &Path) -> Vec<ScannedFile> {
    WalkBuilder::new(root)
        .standard_filters(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
        .filter(|entry| is_markdown(entry.path()))
        .filter_map(|entry| {
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("failed to stat {}: {}", entry.path().display(), e);
                    return None;
                }
            };
            Some(ScannedFile {
                path: entry.into_path(),
                mtime: mtime_secs(&metadata),
            })
        })
        .collect()
}

/// Enumerate every markdown file under the given roots.
///
/// Missing or non-directory roots are skipped with a warning.
pub fn scan_markdown_files(directories: &[String]) -> Vec<ScannedFile> {
    let mut files = Vec::new();
    for dir in directories {
        let root = Path::new(dir);
        if !root.is_dir() {
            warn!("directory does not exist or is not a directory: {}", dir);
            continue;
        }
        files.extend(walk_root(root));
    }
    files
}

/// Enumerate and read every markdown file under the given roots.
///
/// Unreadable files are skipped with a warning. Fails only when every root
/// was unusable and nothing at all was loaded.
pub fn load_markdown_files(directories: &[String]) -> AppResult<Vec<LoadedFile>> {
    let mut scanned = Vec::new();
    let mut root_errors = Vec::new();

    for dir in directories {
        let root = Path::new(dir);
        if !root.exists() {
            root_errors.push(format!("directory does not exist: {dir}"));
            continue;
        }
        if !root.is_dir() {
            root_errors.push(format!("path is not a directory: {dir}"));
            continue;
        }
        let found = walk_root(root);
        if found.is_empty() {
            warn!("no markdown files found in directory: {}", dir);
        }
        scanned.extend(found);
    }

    if scanned.is_empty() && !root_errors.is_empty() {
        return Err(AppError::CorpusEmpty(root_errors.join("; ")));
    }

    Ok(read_contents(scanned))
}

/// Read the given paths, refreshing mtimes at read time.
///
/// Files that vanished or cannot be decoded are skipped with a warning.
pub fn load_files(paths: &[PathBuf]) -> Vec<LoadedFile> {
    let scanned: Vec<ScannedFile> = paths
        .iter()
        .filter_map(|path| {
            let metadata = match std::fs::metadata(path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("failed to stat {}: {}", path.display(), e);
                    return None;
                }
            };
            Some(ScannedFile {
                path: path.clone(),
                mtime: mtime_secs(&metadata),
            })
        })
        .collect();
    read_contents(scanned)
}

fn read_contents(scanned: Vec<ScannedFile>) -> Vec<LoadedFile> {
    scanned
        .into_par_iter()
        .filter_map(|file| match std::fs::read_to_string(&file.path) {
            Ok(content) => Some(LoadedFile {
                path: file.path,
                mtime: file.mtime,
                content,
            }),
            Err(e) => {
                warn!("failed to read file {}: {}", file.path.display(), e);
                None
            }
        })
        .collect()
}

/// Checksum of the corpus state: file identities and modification times.
///
/// Changes whenever a markdown file is added, removed, or modified under any
/// root. Entries are sorted so the digest is order-independent.
pub fn compute_directories_checksum(directories: &[String]) -> String {
    let mut file_info: Vec<(String, f64)> = Vec::new();

    for dir in directories {
        let root = Path::new(dir);
        if !root.is_dir() {
            continue;
        }
        for file in walk_root(root) {
            let rel = file
                .path
                .strip_prefix(root)
                .unwrap_or(&file.path)
                .to_string_lossy()
                .replace('\\', "/");
            file_info.push((format!("{dir}:{rel}"), file.mtime));
        }
    }

    file_info.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (key, mtime) in &file_info {
        hasher.update(format!("{key}:{mtime}").as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Test helper shared with other modules' tests: force a file's mtime.
#[cfg(test)]
pub(crate) fn set_mtime(path: &Path, to: SystemTime) {
    let file = std::fs::File::options().append(true).open(path).unwrap();
    file.set_modified(to).unwrap();
}

/// Test clock an hour in the future, so freshly written fixture files never
/// look "still being written" to the stability heuristic.
#[cfg(test)]
pub(crate) struct SettledClock;

#[cfg(test)]
impl Clock for SettledClock {
    fn now_secs(&self) -> f64 {
        SystemClock.now_secs() + 3600.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn scans_markdown_recursively_and_ignores_other_files() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.md", "# A");
        write(tmp.path(), "nested/deep/b.md", "# B");
        write(tmp.path(), "c.txt", "not markdown");

        let files = scan_markdown_files(&[tmp.path().to_string_lossy().to_string()]);
        let mut names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.md", "b.md"]);
        assert!(files.iter().all(|f| f.mtime > 0.0));
    }

    #[test]
    fn loads_contents_and_skips_missing_roots() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "doc.md", "hello");

        let files = load_markdown_files(&[
            tmp.path().to_string_lossy().to_string(),
            "/definitely/not/a/real/root".to_string(),
        ])
        .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "hello");
    }

    #[test]
    fn all_roots_failing_is_fatal() {
        let err = load_markdown_files(&["/nope/one".to_string(), "/nope/two".to_string()])
            .unwrap_err();
        assert_eq!(err.kind(), "corpus_empty");
    }

    #[test]
    fn empty_existing_root_is_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let files =
            load_markdown_files(&[tmp.path().to_string_lossy().to_string()]).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn checksum_changes_with_content_changes() {
        let tmp = TempDir::new().unwrap();
        let dirs = vec![tmp.path().to_string_lossy().to_string()];
        let path = write(tmp.path(), "a.md", "one");
        let before = compute_directories_checksum(&dirs);

        // Force a different mtime regardless of filesystem granularity.
        let future = SystemTime::now() + std::time::Duration::from_secs(10);
        fs::write(&path, "two").unwrap();
        set_mtime(&path, future);

        let after = compute_directories_checksum(&dirs);
        assert_ne!(before, after);

        // Unchanged corpus keeps a stable checksum.
        assert_eq!(after, compute_directories_checksum(&dirs));
    }

    #[test]
    fn load_files_skips_vanished_paths() {
        let tmp = TempDir::new().unwrap();
        let real = write(tmp.path(), "real.md", "content");
        let gone = tmp.path().join("gone.md");
        let loaded = load_files(&[real.clone(), gone]);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].path, real);
    }
}
