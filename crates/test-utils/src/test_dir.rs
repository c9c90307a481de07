//! Temporary directory management for tests.
//!
//! [`TestDir`] wraps [`tempfile::TempDir`] and names the directories a
//! database test usually needs: a home, a backup destination and a
//! live-restore source.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

/// A managed temporary directory for tests.
///
/// The directory is removed when this struct is dropped.
///
/// # Example
///
/// ```
/// use cellar_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let home = dir.home();
/// let backup = dir.join("backup");
/// assert!(home.starts_with(dir.path()));
/// assert!(backup.ends_with("backup"));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates a new temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let inner = TempDir::new().expect("failed to create temp directory");
        Self { inner }
    }

    /// Returns the path to the temporary directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Joins a relative path to the temporary directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// Database home directory, `<tmp>/home`. Not created; opening with
    /// `create` does that.
    #[must_use]
    pub fn home(&self) -> PathBuf {
        self.join("home")
    }

    /// Creates `<tmp>/<name>` and returns it.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.join(name);
        fs::create_dir_all(&path).expect("failed to create subdirectory");
        path
    }

    /// Copies the named files from `from` into `to`, creating `to`.
    ///
    /// # Panics
    ///
    /// Panics if a file cannot be copied.
    pub fn copy_files<S: AsRef<str>>(from: &Path, to: &Path, names: &[S]) {
        fs::create_dir_all(to).expect("failed to create copy destination");
        for name in names {
            let name = name.as_ref();
            fs::copy(from.join(name), to.join(name)).expect("failed to copy file");
        }
    }

    /// Size in bytes of `name` under `dir`, or 0 when it does not exist.
    #[must_use]
    pub fn file_size(dir: &Path, name: &str) -> u64 {
        fs::metadata(dir.join(name)).map(|m| m.len()).unwrap_or(0)
    }

    /// Names of the files in `dir` starting with `prefix`, sorted.
    #[must_use]
    pub fn files_with_prefix(dir: &Path, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .filter(|n| n.starts_with(prefix))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
