//! In-memory [`RemoteFs`] for tests

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::progress::ProgressMeter;
use super::{remote_basename, remote_parent, RemoteEntry, RemoteFs, RemoteStat};
use crate::error::{IsyncError, Result};

#[derive(Default)]
struct Tree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
}

/// A fake device filesystem that records every mutating call.
///
/// `mkdir` on an existing path fails, like a real SFTP server, so callers
/// that rely on "already exists" being tolerated are exercised for real.
pub struct MemoryFs {
    tree: Mutex<Tree>,
    ops: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        let mut tree = Tree::default();
        tree.dirs.insert("/".to_string());
        Self {
            tree: Mutex::new(tree),
            ops: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path` and all its parents
    pub fn with_dir(self, path: &str) -> Self {
        {
            let mut tree = self.tree.lock().unwrap();
            let mut current = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                current = format!("{}/{}", current, segment);
                tree.dirs.insert(current.clone());
            }
        }
        self
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        let this = self.with_dir(&remote_parent(path));
        this.tree
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_vec());
        this
    }

    /// Make every put/get touching `path` fail
    pub fn fail_on(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.tree.lock().unwrap().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.tree.lock().unwrap().dirs.contains(path)
    }

    pub fn file_count(&self) -> usize {
        self.tree.lock().unwrap().files.len()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn check_failing(&self, path: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(path) {
            return Err(IsyncError::transfer(path, "injected failure"));
        }
        Ok(())
    }
}

fn children<'a>(keys: impl Iterator<Item = &'a String>, dir: &str) -> Vec<String> {
    keys.filter(|p| p.as_str() != dir && remote_parent(p) == dir)
        .cloned()
        .collect()
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn stat(&self, path: &str) -> Result<Option<RemoteStat>> {
        let tree = self.tree.lock().unwrap();
        if tree.dirs.contains(path) {
            return Ok(Some(RemoteStat { is_dir: true, size: 0 }));
        }
        Ok(tree.files.get(path).map(|data| RemoteStat {
            is_dir: false,
            size: data.len() as u64,
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.record(format!("mkdir {}", path));
        let mut tree = self.tree.lock().unwrap();
        if tree.dirs.contains(path) || tree.files.contains_key(path) {
            return Err(IsyncError::transfer(path, "already exists"));
        }
        if !tree.dirs.contains(&remote_parent(path)) {
            return Err(IsyncError::transfer(path, "no such file"));
        }
        tree.dirs.insert(path.to_string());
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let tree = self.tree.lock().unwrap();
        if !tree.dirs.contains(path) {
            return Err(IsyncError::transfer(path, "no such file"));
        }
        let mut entries = Vec::new();
        for dir in children(tree.dirs.iter(), path) {
            entries.push(RemoteEntry {
                name: remote_basename(&dir).to_string(),
                path: dir,
                is_dir: true,
                size: 0,
                modified: None,
            });
        }
        for file in children(tree.files.keys(), path) {
            let size = tree.files.get(&file).map(|d| d.len() as u64).unwrap_or(0);
            entries.push(RemoteEntry {
                name: remote_basename(&file).to_string(),
                path: file,
                is_dir: false,
                size,
                modified: None,
            });
        }
        Ok(entries)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.record(format!("rm {}", path));
        match self.tree.lock().unwrap().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(IsyncError::transfer(path, "no such file")),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.record(format!("rmdir {}", path));
        let mut tree = self.tree.lock().unwrap();
        let non_empty = !children(tree.dirs.iter(), path).is_empty()
            || !children(tree.files.keys(), path).is_empty();
        if non_empty {
            return Err(IsyncError::transfer(path, "directory not empty"));
        }
        if !tree.dirs.remove(path) {
            return Err(IsyncError::transfer(path, "no such file"));
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.record(format!("rename {} {}", from, to));
        let mut tree = self.tree.lock().unwrap();
        if let Some(data) = tree.files.remove(from) {
            tree.files.insert(to.to_string(), data);
            return Ok(());
        }
        if tree.dirs.remove(from) {
            tree.dirs.insert(to.to_string());
            return Ok(());
        }
        Err(IsyncError::transfer(from, "no such file"))
    }

    async fn put(&self, local: &Path, remote: &str, progress: &mut ProgressMeter) -> Result<()> {
        self.record(format!("put {}", remote));
        self.check_failing(remote)?;
        let data = tokio::fs::read(local).await?;
        let mut tree = self.tree.lock().unwrap();
        if !tree.dirs.contains(&remote_parent(remote)) {
            return Err(IsyncError::transfer(remote, "no such file"));
        }
        let total = data.len() as u64;
        tree.files.insert(remote.to_string(), data);
        progress.update(total, total);
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path, progress: &mut ProgressMeter) -> Result<()> {
        self.record(format!("get {}", remote));
        self.check_failing(remote)?;
        let data = self
            .file(remote)
            .ok_or_else(|| IsyncError::transfer(remote, "no such file"))?;
        tokio::fs::write(local, &data).await?;
        progress.update(data.len() as u64, data.len() as u64);
        Ok(())
    }
}
