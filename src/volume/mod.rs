//! Filesystem-backed content volumes (C3).
//!
//! Grounded in the Python `Volume`/`BaseVolume`/`ScopedVolume`/`HostVolume`
//! classes (`libs/mngr/imbue/mngr/interfaces/volume.py`): a small trait over
//! "list/read/write/remove" that can be scoped to a sub-prefix without the
//! scoped view being able to escape its root. `RactorLabs-ractor`'s `content/`
//! module shows the same "walk a directory, return relative paths" idiom used
//! below in `LocalVolume::listdir`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{MngrError, MngrResult};

/// A directory tree an agent, host, or proxy can list, read from, and write
/// to, addressed by paths relative to the volume's own root.
#[async_trait]
pub trait Volume: Send + Sync {
    /// List paths (relative to this volume's root) under `prefix`,
    /// recursively. `prefix` of `""` lists the whole tree.
    async fn listdir(&self, prefix: &str) -> MngrResult<Vec<String>>;

    async fn read_file(&self, path: &str) -> MngrResult<Vec<u8>>;

    /// Write several files atomically-per-file (each write lands via a
    /// temp-file-then-rename so partial writes are never observed).
    async fn write_files(&self, files: &[(String, Vec<u8>)]) -> MngrResult<()>;

    async fn remove_file(&self, path: &str) -> MngrResult<()>;

    /// True if `path` exists under this volume's root.
    async fn exists(&self, path: &str) -> MngrResult<bool>;
}

/// Resolve a volume-relative path against `root`, rejecting any path that
/// would escape it (`..` components, absolute paths). Mirrors the Python
/// `_scoped_path` helper.
fn scoped_path(root: &Path, relative: &str) -> MngrResult<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(MngrError::UserInput(format!(
            "volume path {relative:?} must be relative"
        )));
    }
    let mut resolved = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(MngrError::UserInput(format!(
                    "volume path {relative:?} must not contain '..'"
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(MngrError::UserInput(format!(
                    "volume path {relative:?} must be relative"
                )))
            }
        }
    }
    Ok(resolved)
}

/// A volume rooted directly at a directory on the local filesystem.
pub struct LocalVolume {
    root: PathBuf,
}

impl LocalVolume {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A view of this volume restricted to the sub-prefix `prefix`, unable
    /// to read or write outside it. Mirrors `ScopedVolume`.
    pub fn scoped(&self, prefix: &str) -> MngrResult<ScopedVolume<'_>> {
        let scoped_root = scoped_path(&self.root, prefix)?;
        Ok(ScopedVolume {
            inner: self,
            prefix: prefix.trim_end_matches('/').to_string(),
            _root: scoped_root,
        })
    }
}

#[async_trait]
impl Volume for LocalVolume {
    async fn listdir(&self, prefix: &str) -> MngrResult<Vec<String>> {
        let base = scoped_path(&self.root, prefix)?;
        if !base.exists() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in walkdir::WalkDir::new(&base).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    if let Ok(rel) = entry.path().strip_prefix(&root) {
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
            out.sort();
            out
        })
        .await
        .map_err(|e| MngrError::internal(format!("listdir task panicked: {e}")))
    }

    async fn read_file(&self, path: &str) -> MngrResult<Vec<u8>> {
        let full = scoped_path(&self.root, path)?;
        tokio::fs::read(&full)
            .await
            .map_err(|e| MngrError::Io(e))
    }

    async fn write_files(&self, files: &[(String, Vec<u8>)]) -> MngrResult<()> {
        for (path, contents) in files {
            let full = scoped_path(&self.root, path)?;
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = full.with_extension(format!(
                "{}.tmp-{}",
                full.extension().and_then(|e| e.to_str()).unwrap_or(""),
                crate::primitives::random_suffix()
            ));
            tokio::fs::write(&tmp, contents).await?;
            tokio::fs::rename(&tmp, &full).await?;
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> MngrResult<()> {
        let full = scoped_path(&self.root, path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MngrError::Io(e)),
        }
    }

    async fn exists(&self, path: &str) -> MngrResult<bool> {
        let full = scoped_path(&self.root, path)?;
        Ok(tokio::fs::metadata(&full).await.is_ok())
    }
}

/// A view of a [`LocalVolume`] restricted to one of its sub-prefixes.
/// Composes: a `ScopedVolume`'s own `scoped()` call joins prefixes, it never
/// re-roots relative to the parent's parent.
pub struct ScopedVolume<'a> {
    inner: &'a LocalVolume,
    prefix: String,
    _root: PathBuf,
}

impl<'a> ScopedVolume<'a> {
    fn join(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    /// A further-restricted view rooted at `prefix` relative to this
    /// view's own prefix: `v.scoped("a").scoped("b")` is equivalent to
    /// `v.scoped("a/b")`.
    pub fn scoped(&self, prefix: &str) -> MngrResult<ScopedVolume<'a>> {
        let joined_prefix = self.join(prefix);
        let scoped_root = scoped_path(&self.inner.root, &joined_prefix)?;
        Ok(ScopedVolume {
            inner: self.inner,
            prefix: joined_prefix.trim_end_matches('/').to_string(),
            _root: scoped_root,
        })
    }
}

#[async_trait]
impl<'a> Volume for ScopedVolume<'a> {
    async fn listdir(&self, prefix: &str) -> MngrResult<Vec<String>> {
        let joined = self.join(prefix);
        let entries = self.inner.listdir(&joined).await?;
        let strip = format!("{}/", self.prefix);
        Ok(entries
            .into_iter()
            .filter_map(|p| p.strip_prefix(&strip).map(str::to_string))
            .collect())
    }

    async fn read_file(&self, path: &str) -> MngrResult<Vec<u8>> {
        self.inner.read_file(&self.join(path)).await
    }

    async fn write_files(&self, files: &[(String, Vec<u8>)]) -> MngrResult<()> {
        let joined: Vec<(String, Vec<u8>)> = files
            .iter()
            .map(|(p, c)| (self.join(p), c.clone()))
            .collect();
        self.inner.write_files(&joined).await
    }

    async fn remove_file(&self, path: &str) -> MngrResult<()> {
        self.inner.remove_file(&self.join(path)).await
    }

    async fn exists(&self, path: &str) -> MngrResult<bool> {
        self.inner.exists(&self.join(path)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let vol = LocalVolume::new(dir.path());
        vol.write_files(&[("a/b.txt".to_string(), b"hi".to_vec())])
            .await
            .unwrap();
        let data = vol.read_file("a/b.txt").await.unwrap();
        assert_eq!(data, b"hi");
    }

    #[tokio::test]
    async fn listdir_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let vol = LocalVolume::new(dir.path());
        vol.write_files(&[
            ("b.txt".to_string(), b"2".to_vec()),
            ("sub/a.txt".to_string(), b"1".to_vec()),
        ])
        .await
        .unwrap();
        let entries = vol.listdir("").await.unwrap();
        assert_eq!(entries, vec!["b.txt".to_string(), "sub/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn rejects_parent_dir_escape() {
        let dir = tempfile::tempdir().unwrap();
        let vol = LocalVolume::new(dir.path());
        let result = vol.read_file("../escape.txt").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn scoped_volume_cannot_see_outside_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let vol = LocalVolume::new(dir.path());
        vol.write_files(&[
            ("agents/a1/note.txt".to_string(), b"mine".to_vec()),
            ("agents/a2/note.txt".to_string(), b"theirs".to_vec()),
        ])
        .await
        .unwrap();
        let scoped = vol.scoped("agents/a1").unwrap();
        let entries = scoped.listdir("").await.unwrap();
        assert_eq!(entries, vec!["note.txt".to_string()]);
        let contents = scoped.read_file("note.txt").await.unwrap();
        assert_eq!(contents, b"mine");
    }

    #[tokio::test]
    async fn scoped_composes_across_two_levels() {
        let dir = tempfile::tempdir().unwrap();
        let vol = LocalVolume::new(dir.path());
        vol.write_files(&[("agents/a1/logs/out.txt".to_string(), b"log".to_vec())])
            .await
            .unwrap();

        let chained = vol.scoped("agents").unwrap().scoped("a1/logs").unwrap();
        let direct = vol.scoped("agents/a1/logs").unwrap();

        assert_eq!(chained.listdir("").await.unwrap(), direct.listdir("").await.unwrap());
        assert_eq!(
            chained.read_file("out.txt").await.unwrap(),
            direct.read_file("out.txt").await.unwrap()
        );
    }

    #[tokio::test]
    async fn remove_file_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let vol = LocalVolume::new(dir.path());
        vol.remove_file("nope.txt").await.unwrap();
    }
}
