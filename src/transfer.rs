use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::archive::{self, ArchiveEntry};
use crate::config::EngineConfig;
use crate::error::{is_cancelled, SessionError};
use crate::paths;
use crate::remote::{absolute, ensure_dir_all, run_checked, Connector, EntryKind, RemoteSession};

pub const ARCHIVE_ID_PREFIX: &str = "archive:";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferAction {
    Upload,
    Download,
}

/// What the caller asks for. Uploads take local sources and a remote
/// destination directory; downloads the other way round.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub action: TransferAction,
    pub sources: Vec<String>,
    /// Empty for downloads means the configured download directory.
    pub destination: String,
    pub compress: bool,
    /// Uploads keep their path relative to this local directory, nested
    /// under a remote directory of the same name.
    pub upload_root: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct TransferTask {
    pub id: String,
    pub action: TransferAction,
    pub sources: Vec<String>,
    pub destination: String,
    pub compress: bool,
    pub upload_root: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Progress {
        id: String,
        percent: u8,
        bytes: u64,
        total: u64,
    },
    Finished {
        id: String,
        success: bool,
        detail: String,
    },
}

/// Splits a request into tasks: one per source, or a single archive batch.
pub fn plan(request: &TransferRequest) -> Vec<TransferTask> {
    let task = |id: String, sources: Vec<String>| TransferTask {
        id,
        action: request.action,
        sources,
        destination: request.destination.clone(),
        compress: request.compress,
        upload_root: request.upload_root.clone(),
    };
    if request.sources.is_empty() {
        return Vec::new();
    }
    if request.compress {
        let id = format!("{ARCHIVE_ID_PREFIX}{}", Uuid::new_v4());
        return vec![task(id, request.sources.clone())];
    }
    request
        .sources
        .iter()
        .map(|src| task(src.clone(), vec![src.clone()]))
        .collect()
}

/// Name a local upload source gets on the remote side.
pub fn upload_name(local: &Path, root: Option<&Path>) -> PathBuf {
    if let Some(root) = root {
        if let (Ok(rel), Some(base)) = (local.strip_prefix(root), root.file_name()) {
            if rel.as_os_str().is_empty() {
                return PathBuf::from(base);
            }
            return Path::new(base).join(rel);
        }
    }
    local
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| local.to_path_buf())
}

fn remote_archive_path() -> String {
    format!("/tmp/rusty-remote-{}.tar.gz", Uuid::new_v4())
}

/// Percent tracking for one task. Emits only when the integer percent moves.
struct Progress<'a> {
    id: &'a str,
    events: &'a Sender<TransferEvent>,
    cancel: &'a AtomicBool,
    total: u64,
    done: u64,
    last: Option<u8>,
}

impl Progress<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.cancelled() {
            Err(SessionError::Cancelled.into())
        } else {
            Ok(())
        }
    }

    fn advance(&mut self, bytes: u64) -> bool {
        if self.cancelled() {
            return false;
        }
        self.done = self.done.saturating_add(bytes);
        let percent = if self.total == 0 {
            100
        } else {
            (self.done.min(self.total) * 100 / self.total) as u8
        };
        if self.last != Some(percent) {
            self.last = Some(percent);
            let _ = self.events.send(TransferEvent::Progress {
                id: self.id.to_string(),
                percent,
                bytes: self.done,
                total: self.total,
            });
        }
        true
    }
}

struct Job {
    task: TransferTask,
    cancel: Arc<AtomicBool>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    cfg: EngineConfig,
    events: Sender<TransferEvent>,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Shared {
    fn finish(&self, id: &str, success: bool, detail: String) {
        let _ = self.events.send(TransferEvent::Finished {
            id: id.to_string(),
            success,
            detail,
        });
    }

    fn forget(&self, id: &str, flag: &Arc<AtomicBool>) {
        if let Ok(mut cancels) = self.cancels.lock() {
            if cancels.get(id).is_some_and(|f| Arc::ptr_eq(f, flag)) {
                cancels.remove(id);
            }
        }
    }
}

/// Cheap to clone; clones share the pool. Workers exit once the last clone
/// is dropped or `shutdown` runs.
#[derive(Clone)]
pub struct TransferEngine {
    shared: Arc<Shared>,
    jobs: Arc<Mutex<Option<Sender<Job>>>>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl TransferEngine {
    pub fn new(
        connector: Arc<dyn Connector>,
        cfg: EngineConfig,
        events: Sender<TransferEvent>,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let size = cfg.pool_size();
        let shared = Arc::new(Shared {
            connector,
            cfg,
            events,
            cancels: Mutex::new(HashMap::new()),
        });

        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let rx: Receiver<Job> = rx.clone();
            let worker_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("transfer-{n}"))
                .spawn(move || {
                    for job in rx.iter() {
                        run_job(&worker_shared, job);
                    }
                    debug!(worker = n, "Transfer worker stopped");
                })
                .context("Failed to spawn transfer worker")?;
            workers.push(handle);
        }
        info!(workers = size, "Transfer engine started");
        Ok(Self {
            shared,
            jobs: Arc::new(Mutex::new(Some(tx))),
            workers: Arc::new(Mutex::new(workers)),
        })
    }

    /// Queues the request and returns the ids its events will carry.
    pub fn submit(&self, request: TransferRequest) -> Vec<String> {
        let tasks = plan(&request);
        let sender = self.jobs.lock().ok().and_then(|s| s.clone());
        let mut ids = Vec::with_capacity(tasks.len());

        for task in tasks {
            let id = task.id.clone();
            let cancel = Arc::new(AtomicBool::new(false));
            if let Ok(mut cancels) = self.shared.cancels.lock() {
                cancels.insert(id.clone(), cancel.clone());
            }
            let queued = match &sender {
                Some(tx) => tx.send(Job { task, cancel: cancel.clone() }).is_ok(),
                None => false,
            };
            if !queued {
                self.shared.forget(&id, &cancel);
                self.shared
                    .finish(&id, false, "Transfer engine is shut down".to_string());
            }
            ids.push(id);
        }
        ids
    }

    /// Best effort: takes effect at the next chunk boundary. Returns false
    /// for unknown or already finished ids.
    pub fn cancel(&self, id: &str) -> bool {
        let flag = self
            .shared
            .cancels
            .lock()
            .ok()
            .and_then(|c| c.get(id).cloned());
        match flag {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(id, "Transfer cancel requested");
                true
            }
            None => false,
        }
    }

    /// Lets queued tasks finish, then joins the workers. Idempotent.
    pub fn shutdown(&self) {
        let sender = self.jobs.lock().ok().and_then(|mut s| s.take());
        if sender.is_none() {
            return;
        }
        drop(sender);
        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for worker in workers {
            if worker.join().is_err() {
                warn!("Transfer worker panicked");
            }
        }
    }
}

fn run_job(shared: &Shared, job: Job) {
    let id = job.task.id.clone();
    let outcome = if job.cancel.load(Ordering::SeqCst) {
        Err(SessionError::Cancelled.into())
    } else {
        execute(shared, &job.task, &job.cancel)
    };
    shared.forget(&id, &job.cancel);

    match outcome {
        Ok(detail) => {
            info!(id = %id, detail = %detail, "Transfer finished");
            shared.finish(&id, true, detail);
        }
        Err(err) if is_cancelled(&err) => {
            info!(id = %id, "Transfer cancelled");
            shared.finish(&id, false, SessionError::Cancelled.to_string());
        }
        Err(err) => {
            warn!(id = %id, error = %format!("{err:#}"), "Transfer failed");
            shared.finish(&id, false, format!("{err:#}"));
        }
    }
}

fn execute(shared: &Shared, task: &TransferTask, cancel: &AtomicBool) -> Result<String> {
    let mut remote = shared
        .connector
        .connect()
        .context("Failed to open transfer connection")?;

    let remote = remote.as_mut();
    let result = absolute_task(remote, task).and_then(|task| {
        let mut progress = Progress {
            id: &task.id,
            events: &shared.events,
            cancel,
            total: 0,
            done: 0,
            last: None,
        };
        match (task.action, task.compress) {
            (TransferAction::Upload, false) => upload_single(remote, &task, &mut progress),
            (TransferAction::Upload, true) => upload_archive(remote, &task, &mut progress),
            (TransferAction::Download, false) => {
                download_single(remote, &task, &download_dir(&task, &shared.cfg), &mut progress)
            }
            (TransferAction::Download, true) => {
                download_archive(remote, &task, &download_dir(&task, &shared.cfg), &mut progress)
            }
        }
    });

    if let Err(err) = remote.close() {
        debug!(id = %task.id, error = %err, "Transfer connection close failed");
    }
    result
}

/// Remote paths of `task` made absolute against the login directory.
fn absolute_task(remote: &mut dyn RemoteSession, task: &TransferTask) -> Result<TransferTask> {
    let mut task = task.clone();
    match task.action {
        TransferAction::Upload => task.destination = absolute(remote, &task.destination)?,
        TransferAction::Download => {
            for source in &mut task.sources {
                *source = absolute(remote, source)?;
            }
        }
    }
    Ok(task)
}

fn download_dir(task: &TransferTask, cfg: &EngineConfig) -> PathBuf {
    if task.destination.trim().is_empty() {
        cfg.download_dir.clone()
    } else {
        PathBuf::from(&task.destination)
    }
}

fn single_source(task: &TransferTask) -> Result<&str> {
    task.sources
        .first()
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Transfer {} has no source", task.id))
}

fn upload_single(
    remote: &mut dyn RemoteSession,
    task: &TransferTask,
    progress: &mut Progress<'_>,
) -> Result<String> {
    let local = PathBuf::from(single_source(task)?);
    let meta = fs::metadata(&local).with_context(|| format!("Cannot read {}", local.display()))?;
    let name = upload_name(&local, task.upload_root.as_deref());
    let target = paths::join(&task.destination, &name.to_string_lossy());

    if !meta.is_dir() {
        progress.total = meta.len();
        ensure_dir_all(remote, &paths::parent(&target))?;
        remote.upload_file(&local, &target, &mut |n| progress.advance(n))?;
        return Ok(target);
    }

    let entries: Vec<walkdir::DirEntry> = WalkDir::new(&local)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .collect::<Result<_, _>>()
        .with_context(|| format!("Cannot walk {}", local.display()))?;
    progress.total = entries
        .iter()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum();

    for entry in &entries {
        progress.check()?;
        let rel = entry.path().strip_prefix(&local)?;
        let dest = paths::join(&target, &rel.to_string_lossy());
        if entry.file_type().is_dir() {
            ensure_dir_all(remote, &dest)?;
        } else if entry.file_type().is_file() {
            remote.upload_file(entry.path(), &dest, &mut |n| progress.advance(n))?;
        } else {
            debug!(path = %entry.path().display(), "Skipping non-regular file");
        }
    }
    Ok(target)
}

fn upload_archive(
    remote: &mut dyn RemoteSession,
    task: &TransferTask,
    progress: &mut Progress<'_>,
) -> Result<String> {
    let entries: Vec<ArchiveEntry> = task
        .sources
        .iter()
        .map(|src| {
            let source = PathBuf::from(src);
            ArchiveEntry {
                name: upload_name(&source, task.upload_root.as_deref()),
                source,
            }
        })
        .collect();
    // Removed from the local disk when this drops, whatever happens below.
    let local_archive = archive::pack(&entries)?;
    progress.check()?;
    progress.total = local_archive.as_file().metadata()?.len();

    let dest = task.destination.clone();
    ensure_dir_all(remote, &dest)?;
    let remote_archive = remote_archive_path();

    let result = (|| -> Result<String> {
        remote.upload_file(local_archive.path(), &remote_archive, &mut |n| progress.advance(n))?;
        run_checked(
            remote,
            &format!("tar -xzf {} -C {}", paths::quote(&remote_archive), paths::quote(&dest)),
        )
        .context("Remote extract failed")?;
        Ok(dest)
    })();

    if let Err(err) = remote.exec(&format!("rm -f {}", paths::quote(&remote_archive))) {
        debug!(path = %remote_archive, error = %err, "Could not remove remote archive");
    }
    result
}

/// Regular files under `root`, paths relative to it, plus every directory.
fn remote_walk(
    remote: &mut dyn RemoteSession,
    root: &str,
) -> Result<(Vec<String>, Vec<(String, u64)>)> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let mut stack = vec![String::new()];
    while let Some(rel) = stack.pop() {
        let dir = paths::join(root, &rel);
        let mut entries = remote.read_dir(&dir)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for entry in entries {
            let child = if rel.is_empty() {
                entry.name.clone()
            } else {
                format!("{rel}/{}", entry.name)
            };
            match entry.attrs.kind {
                EntryKind::Directory => {
                    dirs.push(child.clone());
                    stack.push(child);
                }
                EntryKind::File => files.push((child, entry.attrs.size)),
                EntryKind::Symlink => match remote.stat(&paths::join(root, &child))? {
                    Some(target) if target.kind == EntryKind::File => {
                        files.push((child, target.size))
                    }
                    _ => debug!(path = %child, "Skipping symlink"),
                },
                EntryKind::Other => {}
            }
        }
    }
    Ok((dirs, files))
}

fn download_single(
    remote: &mut dyn RemoteSession,
    task: &TransferTask,
    dest: &Path,
    progress: &mut Progress<'_>,
) -> Result<String> {
    let source = single_source(task)?.to_string();
    let attrs = remote
        .stat(&source)?
        .ok_or_else(|| SessionError::NotFound(source.clone()))?;
    let target = dest.join(paths::basename(&source));

    if !attrs.is_dir() {
        fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
        progress.total = attrs.size;
        remote.download_file(&source, &target, &mut |n| progress.advance(n))?;
        return Ok(target.display().to_string());
    }

    let (dirs, files) = remote_walk(remote, &source)?;
    progress.total = files.iter().map(|(_, size)| size).sum();
    fs::create_dir_all(&target).with_context(|| format!("Failed to create {}", target.display()))?;
    for dir in &dirs {
        fs::create_dir_all(target.join(dir))?;
    }
    for (rel, _) in &files {
        progress.check()?;
        remote.download_file(&paths::join(&source, rel), &target.join(rel), &mut |n| {
            progress.advance(n)
        })?;
    }
    Ok(target.display().to_string())
}

fn download_archive(
    remote: &mut dyn RemoteSession,
    task: &TransferTask,
    dest: &Path,
    progress: &mut Progress<'_>,
) -> Result<String> {
    let remote_archive = remote_archive_path();
    let mut command = format!("tar -czf {}", paths::quote(&remote_archive));
    for src in &task.sources {
        command.push_str(&format!(
            " -C {} {}",
            paths::quote(&paths::parent(src)),
            paths::quote(paths::basename(src))
        ));
    }

    let result = (|| -> Result<String> {
        run_checked(remote, &command).context("Remote archive failed")?;
        progress.check()?;
        progress.total = remote.stat(&remote_archive)?.map(|a| a.size).unwrap_or(0);
        let local_archive = archive::temp_archive()?;
        remote.download_file(&remote_archive, local_archive.path(), &mut |n| {
            progress.advance(n)
        })?;
        archive::unpack(local_archive.path(), dest)?;
        Ok(dest.display().to_string())
    })();

    if let Err(err) = remote.exec(&format!("rm -f {}", paths::quote(&remote_archive))) {
        debug!(path = %remote_archive, error = %err, "Could not remove remote archive");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{path_str, LocalConnector};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn engine(connector: LocalConnector, pool: usize) -> (TransferEngine, Receiver<TransferEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let cfg = EngineConfig {
            max_concurrent_transfers: pool,
            ..Default::default()
        };
        (TransferEngine::new(Arc::new(connector), cfg, tx).unwrap(), rx)
    }

    /// Collects events until every id has finished.
    fn drain(rx: &Receiver<TransferEvent>, ids: &[String]) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        let mut open = ids.len();
        while open > 0 {
            let event = rx.recv_timeout(Duration::from_secs(20)).unwrap();
            if matches!(event, TransferEvent::Finished { .. }) {
                open -= 1;
            }
            out.push(event);
        }
        out
    }

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn plan_uses_paths_or_one_archive_id() {
        let mut request = TransferRequest {
            action: TransferAction::Upload,
            sources: vec!["/a".into(), "/b".into()],
            destination: "/srv".into(),
            compress: false,
            upload_root: None,
        };
        let ids: Vec<_> = plan(&request).into_iter().map(|t| t.id).collect();
        assert_eq!(ids, ["/a", "/b"]);

        request.compress = true;
        let tasks = plan(&request);
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].id.starts_with(ARCHIVE_ID_PREFIX));
        assert_eq!(tasks[0].sources.len(), 2);
    }

    #[test]
    fn upload_name_rebases_under_root() {
        let root = Path::new("/home/me/site");
        assert_eq!(
            upload_name(Path::new("/home/me/site/css/a.css"), Some(root)),
            PathBuf::from("site/css/a.css")
        );
        assert_eq!(upload_name(root, Some(root)), PathBuf::from("site"));
        assert_eq!(
            upload_name(Path::new("/tmp/x.txt"), Some(root)),
            PathBuf::from("x.txt")
        );
        assert_eq!(upload_name(Path::new("/tmp/x.txt"), None), PathBuf::from("x.txt"));
    }

    #[test]
    fn directory_upload_reports_one_id_and_cumulative_progress() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let src = local.path().join("proj");
        write(&src.join("a.txt"), &"a".repeat(10_000));
        write(&src.join("sub/b.txt"), &"b".repeat(10_000));

        let connector = LocalConnector::default();
        let (engine, rx) = engine(connector.clone(), 2);
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Upload,
            sources: vec![path_str(&src)],
            destination: path_str(remote.path()),
            compress: false,
            upload_root: None,
        });
        let events = drain(&rx, &ids);

        let id = path_str(&src);
        assert!(events.iter().all(|e| match e {
            TransferEvent::Progress { id: i, .. } | TransferEvent::Finished { id: i, .. } => *i == id,
        }));
        assert!(matches!(events.last(), Some(TransferEvent::Finished { success: true, .. })));
        let last_progress = events.iter().rev().find_map(|e| match e {
            TransferEvent::Progress { percent, total, .. } => Some((*percent, *total)),
            _ => None,
        });
        assert_eq!(last_progress, Some((100, 20_000)));
        assert_eq!(
            fs::read_to_string(remote.path().join("proj/sub/b.txt")).unwrap(),
            "b".repeat(10_000)
        );
        engine.shutdown();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn directory_download_mirrors_the_remote_tree() {
        let remote = tempfile::tempdir().unwrap();
        let back = tempfile::tempdir().unwrap();
        let src = remote.path().join("site");
        write(&src.join("index.html"), &"i".repeat(3_000));
        write(&src.join("css/main.css"), &"c".repeat(5_000));
        write(&src.join("css/vendor/reset.css"), "r");
        fs::create_dir_all(src.join("empty")).unwrap();

        let (engine, rx) = engine(LocalConnector::default(), 2);
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Download,
            sources: vec![path_str(&src)],
            destination: path_str(back.path()),
            compress: false,
            upload_root: None,
        });
        assert_eq!(ids, [path_str(&src)]);
        let events = drain(&rx, &ids);

        let target = back.path().join("site");
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Finished {
                id: ids[0].clone(),
                success: true,
                detail: target.display().to_string(),
            })
        );
        let last_progress = events.iter().rev().find_map(|e| match e {
            TransferEvent::Progress { percent, total, .. } => Some((*percent, *total)),
            _ => None,
        });
        assert_eq!(last_progress, Some((100, 8_001)));
        assert_eq!(fs::read_to_string(target.join("index.html")).unwrap(), "i".repeat(3_000));
        assert_eq!(fs::read_to_string(target.join("css/main.css")).unwrap(), "c".repeat(5_000));
        assert_eq!(fs::read_to_string(target.join("css/vendor/reset.css")).unwrap(), "r");
        assert!(target.join("empty").is_dir());
        engine.shutdown();
    }

    #[test]
    fn rooted_upload_creates_missing_remote_directories() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let root = local.path().join("project");
        let file = root.join("src/lib/mod.rs");
        write(&file, "pub fn f() {}");

        let dest = remote.path().join("deploy/releases/v2");
        assert!(!dest.exists());
        let (engine, rx) = engine(LocalConnector::default(), 1);
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Upload,
            sources: vec![path_str(&file)],
            destination: path_str(&dest),
            compress: false,
            upload_root: Some(root.clone()),
        });
        let events = drain(&rx, &ids);

        let landed = dest.join("project/src/lib/mod.rs");
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Finished {
                id: ids[0].clone(),
                success: true,
                detail: path_str(&landed),
            })
        );
        assert_eq!(fs::read_to_string(&landed).unwrap(), "pub fn f() {}");
        engine.shutdown();
    }

    #[test]
    fn relative_destination_lands_under_the_login_directory() {
        let local = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let file = local.path().join("notes.txt");
        write(&file, "remember");

        let connector = LocalConnector {
            home: Some(path_str(home.path())),
            ..Default::default()
        };
        let (engine, rx) = engine(connector, 1);
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Upload,
            sources: vec![path_str(&file)],
            destination: "inbox/today".into(),
            compress: false,
            upload_root: None,
        });
        let events = drain(&rx, &ids);

        let landed = home.path().join("inbox/today/notes.txt");
        assert!(matches!(
            events.last(),
            Some(TransferEvent::Finished { success: true, detail, .. }) if *detail == path_str(&landed)
        ));
        assert_eq!(fs::read_to_string(&landed).unwrap(), "remember");
        engine.shutdown();
    }

    #[test]
    fn compressed_round_trip_reproduces_files() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let back = tempfile::tempdir().unwrap();
        let src = local.path().join("data");
        write(&src.join("one.txt"), "first");
        write(&src.join("deep/er/two.bin"), "second\0bytes");
        write(&local.path().join("loose.txt"), "loose");

        let (engine, rx) = engine(LocalConnector::default(), 3);
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Upload,
            sources: vec![path_str(&src), path_str(&local.path().join("loose.txt"))],
            destination: path_str(&remote.path().join("inbox")),
            compress: true,
            upload_root: None,
        });
        assert_eq!(ids.len(), 1);
        let events = drain(&rx, &ids);
        let finished: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TransferEvent::Finished { .. }))
            .collect();
        assert_eq!(finished.len(), 1);
        assert!(matches!(finished[0], TransferEvent::Finished { success: true, .. }));

        let ids = engine.submit(TransferRequest {
            action: TransferAction::Download,
            sources: vec![
                path_str(&remote.path().join("inbox/data")),
                path_str(&remote.path().join("inbox/loose.txt")),
            ],
            destination: path_str(back.path()),
            compress: true,
            upload_root: None,
        });
        let events = drain(&rx, &ids);
        assert!(matches!(events.last(), Some(TransferEvent::Finished { success: true, .. })));

        assert_eq!(fs::read_to_string(back.path().join("data/one.txt")).unwrap(), "first");
        assert_eq!(
            fs::read(back.path().join("data/deep/er/two.bin")).unwrap(),
            b"second\0bytes"
        );
        assert_eq!(fs::read_to_string(back.path().join("loose.txt")).unwrap(), "loose");
        // No archive left behind on the remote side.
        let leftovers: Vec<_> = fs::read_dir(remote.path().join("inbox"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tar.gz"))
            .collect();
        assert!(leftovers.is_empty());
        engine.shutdown();
    }

    #[test]
    fn failures_finish_once_with_detail() {
        let back = tempfile::tempdir().unwrap();
        let (engine, rx) = engine(LocalConnector::default(), 1);
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Download,
            sources: vec!["/definitely/missing/file".into()],
            destination: path_str(back.path()),
            compress: false,
            upload_root: None,
        });
        let events = drain(&rx, &ids);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TransferEvent::Finished { success: false, detail, .. } if detail.contains("/definitely/missing/file")
        ));
        engine.shutdown();
    }

    #[test]
    fn cancelled_task_reports_cancelled() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let file = local.path().join("big.bin");
        write(&file, &"z".repeat(64 * 1024));

        let gate = Arc::new(Mutex::new(()));
        let hold = gate.lock().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let inner = LocalConnector::default();
        let blocking = {
            let gate = gate.clone();
            let opened = opened.clone();
            move || {
                opened.fetch_add(1, Ordering::SeqCst);
                let _wait = gate.lock();
                inner.connect()
            }
        };
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = TransferEngine::new(Arc::new(blocking), EngineConfig::default(), tx).unwrap();
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Upload,
            sources: vec![path_str(&file)],
            destination: path_str(remote.path()),
            compress: false,
            upload_root: None,
        });
        while opened.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(engine.cancel(&ids[0]));
        drop(hold);

        let events = drain(&rx, &ids);
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Finished {
                id: ids[0].clone(),
                success: false,
                detail: "cancelled".into()
            })
        );
        assert!(!engine.cancel(&ids[0]));
        engine.shutdown();
    }

    #[test]
    fn submit_after_shutdown_fails_immediately() {
        let (engine, rx) = engine(LocalConnector::default(), 1);
        engine.shutdown();
        engine.shutdown();
        let ids = engine.submit(TransferRequest {
            action: TransferAction::Download,
            sources: vec!["/x".into()],
            destination: String::new(),
            compress: false,
            upload_root: None,
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransferEvent::Finished { id, success: false, .. } if id == ids[0]
        ));
    }
}
