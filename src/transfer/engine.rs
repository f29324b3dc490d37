//! Transfer engine
//!
//! Single-file transfers try an ordered list of strategies: the external
//! transport when one is configured, then SFTP. The first success wins and
//! earlier failures are only logged.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::progress::{ProgressMeter, ProgressObserver};
use super::{join_remote, sort_entries, RemoteEntry, RemoteFs};
use crate::error::{IsyncError, Result};

/// One way of moving a single file
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn upload(&self, local: &Path, remote: &str, progress: &mut ProgressMeter) -> Result<()>;

    async fn download(&self, remote: &str, local: &Path, progress: &mut ProgressMeter) -> Result<()>;
}

/// SFTP as a strategy
struct SftpStrategy<'a>(&'a dyn RemoteFs);

#[async_trait]
impl TransferStrategy for SftpStrategy<'_> {
    fn name(&self) -> &str {
        "sftp"
    }

    async fn upload(&self, local: &Path, remote: &str, progress: &mut ProgressMeter) -> Result<()> {
        self.0.put(local, remote, progress).await
    }

    async fn download(&self, remote: &str, local: &Path, progress: &mut ProgressMeter) -> Result<()> {
        self.0.get(remote, local, progress).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// A (local, remote, direction) triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub local: PathBuf,
    pub remote: String,
    pub direction: Direction,
}

impl TransferItem {
    pub fn upload(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            direction: Direction::Upload,
        }
    }

    pub fn download(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            direction: Direction::Download,
        }
    }

    fn subject(&self) -> String {
        match self.direction {
            Direction::Upload => self.local.display().to_string(),
            Direction::Download => self.remote.clone(),
        }
    }
}

/// A failed batch item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub item: String,
    pub error: String,
}

/// Outcome of a batch that may continue past failures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn record_failure(&mut self, item: impl Into<String>, error: &IsyncError) {
        self.failures.push(BatchFailure {
            item: item.into(),
            error: error.to_string(),
        });
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} succeeded", self.succeeded, self.total)
    }
}

/// What `upload_tree` created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeReport {
    pub directories: usize,
    pub files: usize,
}

/// Single-file, tree and batch transfers over one device filesystem
pub struct TransferEngine<'a> {
    fs: &'a dyn RemoteFs,
    external: Option<&'a dyn TransferStrategy>,
    observer: Option<Arc<dyn ProgressObserver>>,
    continue_on_error: bool,
}

impl<'a> TransferEngine<'a> {
    pub fn new(fs: &'a dyn RemoteFs) -> Self {
        Self {
            fs,
            external: None,
            observer: None,
            continue_on_error: false,
        }
    }

    /// Try `strategy` before SFTP for single-file transfers
    pub fn with_external(mut self, strategy: Option<&'a dyn TransferStrategy>) -> Self {
        self.external = strategy;
        self
    }

    pub fn with_observer(mut self, observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        self.observer = observer;
        self
    }

    /// Keep going after a failed batch item instead of stopping
    pub fn continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn fs(&self) -> &'a dyn RemoteFs {
        self.fs
    }

    fn meter(&self) -> ProgressMeter {
        ProgressMeter::from_option(self.observer.clone())
    }

    /// Strategies in the order they are tried
    fn strategies<'s>(&'s self, sftp: &'s SftpStrategy<'a>) -> Vec<&'s dyn TransferStrategy> {
        let mut strategies: Vec<&'s dyn TransferStrategy> = Vec::with_capacity(2);
        if let Some(external) = self.external {
            strategies.push(external);
        }
        strategies.push(sftp);
        strategies
    }

    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mut meter = self.meter();
        self.upload_with(local, remote, &mut meter).await
    }

    pub async fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        let mut meter = self.meter();
        self.download_with(remote, local, &mut meter).await
    }

    async fn upload_with(&self, local: &Path, remote: &str, meter: &mut ProgressMeter) -> Result<()> {
        let sftp = SftpStrategy(self.fs);
        let mut last_error = None;

        for strategy in self.strategies(&sftp) {
            match strategy.upload(local, remote, meter).await {
                Ok(()) => {
                    debug!("Uploaded {} via {}", remote, strategy.name());
                    return Ok(());
                }
                Err(e) => {
                    warn!("{} upload of {} failed: {}", strategy.name(), remote, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| IsyncError::transfer(remote, "no transfer strategy")))
    }

    async fn download_with(&self, remote: &str, local: &Path, meter: &mut ProgressMeter) -> Result<()> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let sftp = SftpStrategy(self.fs);
        let mut last_error = None;

        for strategy in self.strategies(&sftp) {
            match strategy.download(remote, local, meter).await {
                Ok(()) => {
                    debug!("Downloaded {} via {}", remote, strategy.name());
                    return Ok(());
                }
                Err(e) => {
                    warn!("{} download of {} failed: {}", strategy.name(), remote, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| IsyncError::transfer(remote, "no transfer strategy")))
    }

    /// Create every missing segment of `path`, root first.
    ///
    /// Creation errors are logged and ignored; a later write into a directory
    /// that really is missing reports the problem.
    pub async fn ensure_remote_dir(&self, path: &str) {
        let absolute = path.starts_with('/');
        let mut current = String::new();

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = if current.is_empty() && !absolute {
                segment.to_string()
            } else {
                format!("{}/{}", current, segment)
            };

            match self.fs.stat(&current).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => debug!("stat {} failed: {}", current, e),
            }
            if let Err(e) = self.fs.mkdir(&current).await {
                debug!("mkdir {} failed (tolerated): {}", current, e);
            }
        }
    }

    /// Upload `local_dir` so that its contents land in `remote_dir`.
    ///
    /// Directories are created parent-first before any file inside them.
    /// Progress counts completed entries.
    pub async fn upload_tree(&self, local_dir: &Path, remote_dir: &str) -> Result<TreeReport> {
        let root = local_dir.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || collect_tree(&root))
            .await
            .map_err(|e| IsyncError::transfer(local_dir.display().to_string(), e))??;

        info!(
            "Uploading {} ({} entries) to {}",
            local_dir.display(),
            entries.len(),
            remote_dir
        );

        self.ensure_remote_dir(remote_dir).await;

        let total = entries.len() as u64;
        let mut items = self.meter();
        let mut report = TreeReport::default();

        for (done, entry) in entries.iter().enumerate() {
            let remote = join_remote(remote_dir, &entry.relative);
            if entry.is_dir {
                match self.fs.stat(&remote).await {
                    Ok(Some(_)) => {}
                    _ => {
                        if let Err(e) = self.fs.mkdir(&remote).await {
                            debug!("mkdir {} failed (tolerated): {}", remote, e);
                        }
                    }
                }
                report.directories += 1;
            } else {
                let mut silent = ProgressMeter::silent();
                self.upload_with(&entry.local, &remote, &mut silent).await?;
                report.files += 1;
            }
            items.update(done as u64 + 1, total);
        }

        items.update(total, total);
        Ok(report)
    }

    pub async fn upload_items(&self, items: &[TransferItem]) -> Result<BatchReport> {
        self.run_batch(items).await
    }

    pub async fn download_items(&self, items: &[TransferItem]) -> Result<BatchReport> {
        self.run_batch(items).await
    }

    async fn run_batch(&self, items: &[TransferItem]) -> Result<BatchReport> {
        let total = items.len() as u64;
        let mut meter = self.meter();
        let mut report = BatchReport::new(items.len());

        for (done, item) in items.iter().enumerate() {
            let mut silent = ProgressMeter::silent();
            let outcome = match item.direction {
                Direction::Upload => self.upload_with(&item.local, &item.remote, &mut silent).await,
                Direction::Download => {
                    self.download_with(&item.remote, &item.local, &mut silent).await
                }
            };

            match outcome {
                Ok(()) => report.record_success(),
                Err(e) if self.continue_on_error => {
                    warn!("Transfer of {} failed, continuing: {}", item.subject(), e);
                    report.record_failure(item.subject(), &e);
                }
                Err(e) => return Err(e),
            }
            meter.update(done as u64 + 1, total);
        }

        Ok(report)
    }

    /// Delete `path`, descending into directories depth-first.
    ///
    /// A path that does not exist is not an error.
    pub async fn remove_recursive(&self, path: &str) -> Result<()> {
        let Some(stat) = self.fs.stat(path).await? else {
            debug!("{} already gone", path);
            return Ok(());
        };

        if !stat.is_dir {
            return self.fs.remove_file(path).await;
        }

        for entry in self.fs.read_dir(path).await? {
            if entry.is_dir {
                Box::pin(self.remove_recursive(&entry.path)).await?;
            } else {
                self.fs.remove_file(&entry.path).await?;
            }
        }
        self.fs.remove_dir(path).await
    }

    /// Directory listing, directories first
    pub async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = self.fs.read_dir(path).await?;
        sort_entries(&mut entries);
        Ok(entries)
    }
}

struct LocalEntry {
    local: PathBuf,
    /// `/`-separated path below the tree root
    relative: String,
    is_dir: bool,
}

/// Pre-order walk, so every directory precedes its contents
fn collect_tree(root: &Path) -> Result<Vec<LocalEntry>> {
    if !root.is_dir() {
        return Err(IsyncError::invalid_params(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| IsyncError::transfer(entry.path().display().to_string(), e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        entries.push(LocalEntry {
            local: entry.path().to_path_buf(),
            relative,
            is_dir: entry.file_type().is_dir(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::transfer::memory::MemoryFs;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("App.app");
        std::fs::create_dir_all(app.join("Frameworks/Core.framework")).unwrap();
        std::fs::write(app.join("Info.plist"), b"plist").unwrap();
        std::fs::write(app.join("App"), b"\x7fELF binary").unwrap();
        std::fs::write(app.join("Frameworks/Core.framework/Core"), b"core").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_upload_tree_creates_dirs_before_files() {
        let local = sample_tree();
        let fs = MemoryFs::new().with_dir("/var/mobile");
        let engine = TransferEngine::new(&fs);

        let report = engine
            .upload_tree(&local.path().join("App.app"), "/var/mobile/Payload/App.app")
            .await
            .unwrap();
        assert_eq!(report, TreeReport { directories: 2, files: 3 });

        let ops = fs.ops();
        let position = |op: &str| ops.iter().position(|o| o == op).unwrap();
        assert!(position("mkdir /var/mobile/Payload") < position("mkdir /var/mobile/Payload/App.app"));
        assert!(
            position("mkdir /var/mobile/Payload/App.app/Frameworks/Core.framework")
                < position("put /var/mobile/Payload/App.app/Frameworks/Core.framework/Core")
        );
        assert_eq!(
            fs.file("/var/mobile/Payload/App.app/App").unwrap(),
            b"\x7fELF binary".to_vec()
        );
        assert_eq!(fs.file_count(), 3);
    }

    #[tokio::test]
    async fn test_upload_tree_twice_is_idempotent() {
        let local = sample_tree();
        let fs = MemoryFs::new();
        let engine = TransferEngine::new(&fs);
        let src = local.path().join("App.app");

        engine.upload_tree(&src, "/Applications/App.app").await.unwrap();
        let again = engine.upload_tree(&src, "/Applications/App.app").await.unwrap();
        assert_eq!(again.files, 3);
        assert_eq!(fs.file_count(), 3);
    }

    #[tokio::test]
    async fn test_upload_tree_reports_file_errors() {
        let local = sample_tree();
        let fs = MemoryFs::new();
        fs.fail_on("/dst/Info.plist");
        let engine = TransferEngine::new(&fs);

        let err = engine
            .upload_tree(&local.path().join("App.app"), "/dst")
            .await
            .unwrap_err();
        assert!(matches!(err, IsyncError::Transfer { ref path, .. } if path == "/dst/Info.plist"));
    }

    struct Failing(AtomicUsize);

    #[async_trait]
    impl TransferStrategy for Failing {
        fn name(&self) -> &str {
            "broken-scp"
        }

        async fn upload(&self, _: &Path, remote: &str, _: &mut ProgressMeter) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(IsyncError::transfer(remote, "scp exited with status 1"))
        }

        async fn download(&self, remote: &str, _: &Path, _: &mut ProgressMeter) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(IsyncError::local_tool("scp", format!("cannot fetch {}", remote)))
        }
    }

    #[tokio::test]
    async fn test_external_failure_falls_back_to_sftp() {
        let local = tempfile::tempdir().unwrap();
        let file = local.path().join("tweak.deb");
        std::fs::write(&file, b"!<arch>").unwrap();

        let fs = MemoryFs::new().with_dir("/var/root");
        let external = Failing(AtomicUsize::new(0));
        let engine = TransferEngine::new(&fs).with_external(Some(&external));

        engine.upload_file(&file, "/var/root/tweak.deb").await.unwrap();
        assert_eq!(external.0.load(Ordering::SeqCst), 1);
        assert_eq!(fs.file("/var/root/tweak.deb").unwrap(), b"!<arch>".to_vec());

        let back = local.path().join("out/tweak.deb");
        engine.download_file("/var/root/tweak.deb", &back).await.unwrap();
        assert_eq!(std::fs::read(back).unwrap(), b"!<arch>".to_vec());
    }

    #[tokio::test]
    async fn test_batch_continues_and_reports_progress() {
        let local = tempfile::tempdir().unwrap();
        let mut items = Vec::new();
        for name in ["a.ipa", "b.ipa", "c.ipa"] {
            let path = local.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            items.push(TransferItem::upload(path, format!("/var/mobile/ipas/{}", name)));
        }

        let fs = MemoryFs::new().with_dir("/var/mobile/ipas");
        fs.fail_on("/var/mobile/ipas/b.ipa");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let engine = TransferEngine::new(&fs)
            .continue_on_error(true)
            .with_observer(Some(Arc::new(move |p: f64| record.lock().unwrap().push(p))));

        let report = engine.upload_items(&items).await.unwrap();
        assert_eq!(report.to_string(), "2/3 succeeded");
        assert_eq!(report.failures.len(), 1);
        assert!(fs.file("/var/mobile/ipas/c.ipa").is_some());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last(), Some(&100.0));
    }

    #[tokio::test]
    async fn test_batch_stops_without_continue_on_error() {
        let local = tempfile::tempdir().unwrap();
        let a = local.path().join("a.bin");
        std::fs::write(&a, b"a").unwrap();

        let fs = MemoryFs::new().with_file("/srv/x", b"x");
        fs.fail_on("/srv/x");
        let engine = TransferEngine::new(&fs);
        let items = vec![
            TransferItem::download("/srv/x", local.path().join("x")),
            TransferItem::upload(&a, "/srv/a.bin"),
        ];

        assert!(engine.download_items(&items).await.is_err());
        assert!(fs.file("/srv/a.bin").is_none());
    }

    #[tokio::test]
    async fn test_remove_recursive_is_depth_first() {
        let fs = MemoryFs::new()
            .with_file("/var/mobile/App.app/Info.plist", b"p")
            .with_file("/var/mobile/App.app/Base.lproj/Main.nib", b"n")
            .with_dir("/var/mobile/App.app/Empty");
        let engine = TransferEngine::new(&fs);

        engine.remove_recursive("/var/mobile/App.app").await.unwrap();
        assert!(!fs.has_dir("/var/mobile/App.app"));
        assert!(fs.has_dir("/var/mobile"));

        let ops = fs.ops();
        assert_eq!(ops.last().unwrap(), "rmdir /var/mobile/App.app");
        let nib = ops.iter().position(|o| o == "rm /var/mobile/App.app/Base.lproj/Main.nib");
        let lproj = ops.iter().position(|o| o == "rmdir /var/mobile/App.app/Base.lproj");
        assert!(nib < lproj);

        // second run is a no-op
        engine.remove_recursive("/var/mobile/App.app").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_dir_sorted() {
        let fs = MemoryFs::new()
            .with_file("/var/root/zz.deb", b"")
            .with_dir("/var/root/Media")
            .with_file("/var/root/Alpha.txt", b"");
        let engine = TransferEngine::new(&fs);

        let names: Vec<_> = engine
            .list_dir("/var/root")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Media", "Alpha.txt", "zz.deb"]);
    }
}
