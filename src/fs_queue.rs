use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use crossbeam_channel::{select, Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::identity::IdentityCache;
use crate::paths;
use crate::remote::{ensure_dir_all, run_checked, Connector, EntryKind, RemoteAttrs, RemoteSession};
use crate::transfer::{TransferEngine, TransferRequest};
use crate::tree::{DirectoryTree, NodeKind, TreeSnapshot};

pub type Completion<T> = Box<dyn FnOnce(T) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    File,
    Directory,
    BrokenSymlink,
    Absent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Image or video.
    Media,
    Text,
    Executable,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListDetail {
    Names,
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryDetail {
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub modified: String,
    /// What a symlink points at.
    pub link_target: Option<PathType>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub detail: Option<EntryDetail>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub size: String,
    pub size_bytes: u64,
    pub modified: String,
    pub link_target: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub success: bool,
    /// Failure messages, one per line.
    pub message: String,
}

pub enum FsTask {
    AddPath {
        path: String,
        notify: bool,
    },
    RemovePath {
        path: String,
    },
    /// `None` re-lists every directory already expanded in the cache.
    Refresh {
        paths: Option<Vec<String>>,
    },
    ListDir {
        path: String,
        detail: ListDetail,
        done: Option<Completion<Result<Vec<DirEntryInfo>>>>,
    },
    CheckPathType {
        path: String,
        done: Option<Completion<Result<PathType>>>,
    },
    Delete {
        paths: Vec<String>,
        done: Option<Completion<DeleteOutcome>>,
    },
    Rename {
        path: String,
        new_name: String,
        done: Option<Completion<Result<String>>>,
    },
    CopyOrMove {
        source: String,
        dest: String,
        cut: bool,
        done: Option<Completion<Result<String>>>,
    },
    Mkdir {
        path: String,
        done: Option<Completion<Result<()>>>,
    },
    FileInfo {
        path: String,
        done: Option<Completion<Result<FileInfo>>>,
    },
    FileTypeProbe {
        path: String,
        done: Option<Completion<Result<ContentKind>>>,
    },
    DispatchTransfer {
        request: TransferRequest,
        done: Option<Completion<Vec<String>>>,
    },
}

impl FsTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddPath { .. } => "add-path",
            Self::RemovePath { .. } => "remove-path",
            Self::Refresh { .. } => "refresh",
            Self::ListDir { .. } => "list-dir",
            Self::CheckPathType { .. } => "check-path-type",
            Self::Delete { .. } => "delete",
            Self::Rename { .. } => "rename",
            Self::CopyOrMove { .. } => "copy-or-move",
            Self::Mkdir { .. } => "mkdir",
            Self::FileInfo { .. } => "file-info",
            Self::FileTypeProbe { .. } => "file-type-probe",
            Self::DispatchTransfer { .. } => "dispatch-transfer",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FsEvent {
    Connected,
    TreeUpdated { tree: TreeSnapshot, path: String },
    OperationError(String),
    DeleteFinished { success: bool, message: String },
    Disconnected,
}

pub fn classify_mime(mime: &str) -> Option<ContentKind> {
    let mime = mime.trim().to_ascii_lowercase();
    if mime.starts_with("image/") || mime.starts_with("video/") {
        return Some(ContentKind::Media);
    }
    if mime.starts_with("text/")
        || matches!(
            mime.as_str(),
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/x-sh"
                | "application/x-shellscript"
                | "inode/x-empty"
        )
    {
        return Some(ContentKind::Text);
    }
    if matches!(
        mime.as_str(),
        "application/x-executable"
            | "application/x-pie-executable"
            | "application/x-sharedlib"
            | "application/x-mach-binary"
            | "application/x-elf"
    ) {
        return Some(ContentKind::Executable);
    }
    None
}

pub fn classify_description(description: &str) -> Option<ContentKind> {
    let d = description.to_ascii_lowercase();
    if d.contains("image data") || d.contains("video") || d.contains("movie") {
        Some(ContentKind::Media)
    } else if d.contains("text") {
        Some(ContentKind::Text)
    } else if d.contains("executable") {
        Some(ContentKind::Executable)
    } else {
        None
    }
}

fn node_kind(remote: &mut dyn RemoteSession, dir: &str, name: &str, attrs: &RemoteAttrs) -> NodeKind {
    match attrs.kind {
        EntryKind::Directory => NodeKind::Directory,
        EntryKind::Symlink => match remote.stat(&paths::join(dir, name)) {
            Ok(None) => NodeKind::BrokenSymlink,
            Ok(Some(target)) if target.is_dir() => NodeKind::Directory,
            Ok(Some(_)) => NodeKind::File,
            Err(err) => {
                debug!(dir, name, error = %err, "Cannot resolve symlink");
                NodeKind::File
            }
        },
        EntryKind::File | EntryKind::Other => NodeKind::File,
    }
}

/// Executes tasks against the control connection. Owns the caches.
pub struct FsWorker {
    remote: Box<dyn RemoteSession>,
    tree: DirectoryTree,
    identities: IdentityCache,
    home: String,
    events: Sender<FsEvent>,
    requeue: Sender<FsTask>,
    transfers: TransferEngine,
}

impl FsWorker {
    pub fn new(
        mut remote: Box<dyn RemoteSession>,
        events: Sender<FsEvent>,
        requeue: Sender<FsTask>,
        transfers: TransferEngine,
    ) -> Self {
        let identities = IdentityCache::load(remote.as_mut()).unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "Identity lookup unavailable");
            IdentityCache::default()
        });
        let home = remote.home_dir().unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "Login directory unknown, relative paths start at /");
            "/".to_string()
        });
        Self {
            remote,
            tree: DirectoryTree::new(),
            identities,
            home,
            events,
            requeue,
            transfers,
        }
    }

    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }

    pub fn into_remote(self) -> Box<dyn RemoteSession> {
        self.remote
    }

    fn absolute(&self, path: &str) -> String {
        paths::resolve(&self.home, path)
    }

    fn emit(&self, event: FsEvent) {
        let _ = self.events.send(event);
    }

    fn tree_updated(&self, path: &str) {
        self.emit(FsEvent::TreeUpdated {
            tree: self.tree.snapshot(),
            path: path.to_string(),
        });
    }

    fn report(&self, op: &str, err: &anyhow::Error) {
        warn!(op, error = %format!("{err:#}"), "Filesystem task failed");
        self.emit(FsEvent::OperationError(format!("{op}: {err:#}")));
    }

    fn deliver<T>(&self, op: &str, result: Result<T>, done: Option<Completion<Result<T>>>) {
        if let Err(err) = &result {
            self.report(op, err);
        }
        if let Some(done) = done {
            done(result);
        }
    }

    fn schedule_refresh(&self, mut dirs: Vec<String>) {
        dirs.sort();
        dirs.dedup();
        debug!(?dirs, "Queueing refresh");
        let _ = self.requeue.send(FsTask::Refresh { paths: Some(dirs) });
    }

    pub fn execute(&mut self, task: FsTask) {
        let op = task.name();
        debug!(op, "Running filesystem task");
        match task {
            FsTask::AddPath { path, notify } => {
                let result = self.add_path(&path);
                if result.is_ok() && notify {
                    self.tree_updated(&self.absolute(&path));
                }
                self.deliver(op, result, None);
            }
            FsTask::RemovePath { path } => {
                let path = self.absolute(&path);
                self.tree.remove(&path);
                self.tree_updated(&path);
            }
            FsTask::Refresh { paths } => {
                let result = self.refresh(paths);
                self.deliver(op, result, None);
            }
            FsTask::ListDir { path, detail, done } => {
                let result = self.list_dir(&path, detail);
                self.deliver(op, result, done);
            }
            FsTask::CheckPathType { path, done } => {
                let result = self.path_type(&self.absolute(&path));
                self.deliver(op, result, done);
            }
            FsTask::Delete { paths, done } => {
                let outcome = self.delete(&paths);
                self.emit(FsEvent::DeleteFinished {
                    success: outcome.success,
                    message: outcome.message.clone(),
                });
                if let Some(done) = done {
                    done(outcome);
                }
            }
            FsTask::Rename {
                path,
                new_name,
                done,
            } => {
                let result = self.rename(&path, &new_name);
                self.deliver(op, result, done);
            }
            FsTask::CopyOrMove {
                source,
                dest,
                cut,
                done,
            } => {
                let result = self.copy_or_move(&source, &dest, cut);
                self.deliver(op, result, done);
            }
            FsTask::Mkdir { path, done } => {
                let result = self.mkdir(&path);
                self.deliver(op, result, done);
            }
            FsTask::FileInfo { path, done } => {
                let result = self.file_info(&path);
                self.deliver(op, result, done);
            }
            FsTask::FileTypeProbe { path, done } => {
                let result = self.probe_type(&path);
                self.deliver(op, result, done);
            }
            FsTask::DispatchTransfer { request, done } => {
                let ids = self.transfers.submit(request);
                if let Some(done) = done {
                    done(ids);
                }
            }
        }
    }

    fn list_children(&mut self, dir: &str) -> Result<Vec<(String, NodeKind)>> {
        let entries = self.remote.read_dir(dir)?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let kind = node_kind(self.remote.as_mut(), dir, &entry.name, &entry.attrs);
            out.push((entry.name, kind));
        }
        Ok(out)
    }

    fn relist(&mut self, dir: &str) -> Result<()> {
        let listing = self.list_children(dir)?;
        self.tree.reconcile(dir, &listing);
        Ok(())
    }

    fn add_path(&mut self, path: &str) -> Result<()> {
        let path = self.absolute(path);
        let attrs = self
            .remote
            .stat(&path)?
            .ok_or_else(|| SessionError::NotFound(path.clone()))?;
        let deepest = if attrs.is_dir() {
            path.clone()
        } else {
            paths::parent(&path)
        };
        for dir in paths::ancestors_inclusive(&deepest) {
            self.relist(&dir)?;
        }
        Ok(())
    }

    fn refresh(&mut self, targets: Option<Vec<String>>) -> Result<()> {
        let targets = match targets {
            Some(list) => list.iter().map(|p| self.absolute(p)).collect(),
            None => self.tree.expanded_dirs(),
        };
        let mut failures = Vec::new();
        for dir in &targets {
            // Uncached directories get their node created by the relist.
            match self.remote.stat(dir) {
                Ok(Some(attrs)) if attrs.is_dir() => {
                    if let Err(err) = self.relist(dir) {
                        failures.push(format!("{dir}: {err:#}"));
                    }
                }
                Ok(_) => {
                    self.tree.remove(dir);
                }
                Err(err) => failures.push(format!("{dir}: {err:#}")),
            }
        }
        self.tree_updated(targets.first().map(String::as_str).unwrap_or("/"));
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("\n")))
        }
    }

    fn list_dir(&mut self, path: &str, detail: ListDetail) -> Result<Vec<DirEntryInfo>> {
        let path = self.absolute(path);
        let mut entries = self.remote.read_dir(&path)?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let attrs = &entry.attrs;
            let detail = match detail {
                ListDetail::Names => None,
                ListDetail::Full => {
                    let link_target = if attrs.kind == EntryKind::Symlink {
                        Some(self.path_type_following(&paths::join(&path, &entry.name))?)
                    } else {
                        None
                    };
                    Some(EntryDetail {
                        permissions: paths::permission_string(attrs.mode),
                        owner: attrs.uid.map(|u| self.identities.user(u)).unwrap_or_default(),
                        group: attrs.gid.map(|g| self.identities.group(g)).unwrap_or_default(),
                        modified: paths::modified_label(attrs.mtime),
                        link_target,
                    })
                }
            };
            out.push(DirEntryInfo {
                is_dir: attrs.is_dir(),
                is_symlink: attrs.kind == EntryKind::Symlink,
                size: attrs.size,
                name: entry.name,
                detail,
            });
        }
        Ok(out)
    }

    fn path_type_following(&mut self, path: &str) -> Result<PathType> {
        Ok(match self.remote.stat(path)? {
            None => PathType::BrokenSymlink,
            Some(target) if target.is_dir() => PathType::Directory,
            Some(_) => PathType::File,
        })
    }

    fn path_type(&mut self, path: &str) -> Result<PathType> {
        match self.remote.lstat(path)? {
            None => Ok(PathType::Absent),
            Some(attrs) if attrs.kind == EntryKind::Symlink => self.path_type_following(path),
            Some(attrs) if attrs.is_dir() => Ok(PathType::Directory),
            Some(_) => Ok(PathType::File),
        }
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        let path = self.absolute(path);
        ensure_dir_all(self.remote.as_mut(), &path)?;
        self.schedule_refresh(vec![paths::parent(&path)]);
        Ok(())
    }

    fn delete(&mut self, targets: &[String]) -> DeleteOutcome {
        let mut failures = Vec::new();
        let mut parents = Vec::new();
        for target in targets {
            let path = self.absolute(target);
            if path == "/" {
                failures.push("/: refusing to delete the root directory".to_string());
                continue;
            }
            let removed = match self.remote.lstat(&path) {
                Ok(None) => Err(anyhow!("no such file or directory")),
                Ok(Some(_)) => {
                    run_checked(self.remote.as_mut(), &format!("rm -rf -- {}", paths::quote(&path)))
                }
                Err(err) => Err(err),
            };
            match removed {
                Ok(_) => {
                    info!(path = %path, "Deleted");
                    parents.push(paths::parent(&path));
                }
                Err(err) => failures.push(format!("{path}: {err:#}")),
            }
        }
        if !parents.is_empty() {
            self.schedule_refresh(parents);
        }
        DeleteOutcome {
            success: failures.is_empty(),
            message: failures.join("\n"),
        }
    }

    fn rename(&mut self, path: &str, new_name: &str) -> Result<String> {
        let path = self.absolute(path);
        let new_name = new_name.trim();
        if new_name.is_empty() || new_name == "." || new_name == ".." || new_name.contains('/') {
            return Err(anyhow!("Invalid name {new_name:?}"));
        }
        if self.remote.lstat(&path)?.is_none() {
            return Err(SessionError::NotFound(path).into());
        }
        let parent = paths::parent(&path);
        let dest = paths::join(&parent, new_name);
        if self.remote.lstat(&dest)?.is_some() {
            return Err(anyhow!("{dest} already exists"));
        }
        self.remote.rename(&path, &dest)?;
        self.schedule_refresh(vec![parent]);
        Ok(dest)
    }

    fn copy_or_move(&mut self, source: &str, dest: &str, cut: bool) -> Result<String> {
        let source = self.absolute(source);
        let dest = self.absolute(dest);
        if self.remote.lstat(&source)?.is_none() {
            return Err(SessionError::NotFound(source).into());
        }
        let dest_parent = paths::parent(&dest);
        ensure_dir_all(self.remote.as_mut(), &dest_parent)?;
        let command = if cut {
            format!("mv -- {} {}", paths::quote(&source), paths::quote(&dest))
        } else {
            format!("cp -r -- {} {}", paths::quote(&source), paths::quote(&dest))
        };
        run_checked(self.remote.as_mut(), &command)?;
        self.schedule_refresh(vec![paths::parent(&source), dest_parent]);
        Ok(dest)
    }

    fn file_info(&mut self, path: &str) -> Result<FileInfo> {
        let path = self.absolute(path);
        let attrs = self
            .remote
            .lstat(&path)?
            .ok_or_else(|| SessionError::NotFound(path.clone()))?;
        let link_target = if attrs.kind == EntryKind::Symlink {
            Some(self.remote.read_link(&path)?)
        } else {
            None
        };
        Ok(FileInfo {
            permissions: paths::permission_string(attrs.mode),
            owner: attrs.uid.map(|u| self.identities.user(u)).unwrap_or_default(),
            group: attrs.gid.map(|g| self.identities.group(g)).unwrap_or_default(),
            size: paths::size_label(attrs.size),
            size_bytes: attrs.size,
            modified: paths::modified_label(attrs.mtime),
            link_target,
            path,
        })
    }

    fn probe_type(&mut self, path: &str) -> Result<ContentKind> {
        let path = self.absolute(path);
        let attrs = self
            .remote
            .stat(&path)?
            .ok_or_else(|| SessionError::NotFound(path.clone()))?;
        let quoted = paths::quote(&path);

        let mime = self.remote.exec(&format!("file --mime-type -b -- {quoted}"))?;
        if mime.success() {
            if let Some(kind) = classify_mime(&mime.stdout) {
                return Ok(kind);
            }
        }
        let description = self.remote.exec(&format!("file -b -- {quoted}"))?;
        if description.success() {
            if let Some(kind) = classify_description(&description.stdout) {
                return Ok(kind);
            }
        }
        if !attrs.is_dir() && attrs.is_executable() {
            Ok(ContentKind::Executable)
        } else {
            Ok(ContentKind::Unknown)
        }
    }
}

/// Handle to the worker thread. Dropping it shuts the worker down.
pub struct FsQueue {
    tasks: Sender<FsTask>,
    stop: Sender<()>,
    events: Sender<FsEvent>,
    worker: Option<thread::JoinHandle<Option<Box<dyn RemoteSession>>>>,
}

impl FsQueue {
    pub fn start(
        connector: Arc<dyn Connector>,
        transfers: TransferEngine,
        events: Sender<FsEvent>,
    ) -> Self {
        let (tasks, rx) = crossbeam_channel::unbounded::<FsTask>();
        let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let requeue = tasks.clone();
        let worker_events = events.clone();

        let worker = thread::spawn(move || {
            let remote = match connector.connect() {
                Ok(remote) => remote,
                Err(err) => {
                    error!(error = %format!("{err:#}"), "Control connection failed");
                    let _ = worker_events.send(FsEvent::OperationError(format!("{err:#}")));
                    let _ = worker_events.send(FsEvent::Disconnected);
                    return None;
                }
            };
            let _ = worker_events.send(FsEvent::Connected);
            let mut worker = FsWorker::new(remote, worker_events, requeue, transfers);
            run_loop(&mut worker, &rx, &stop_rx);
            Some(worker.into_remote())
        });

        Self {
            tasks,
            stop,
            events,
            worker: Some(worker),
        }
    }

    pub fn enqueue(&self, task: FsTask) -> Result<()> {
        if self.worker.is_none() {
            return Err(SessionError::Closed.into());
        }
        self.tasks
            .send(task)
            .map_err(|_| SessionError::Closed.into())
    }

    /// Stops after the task in progress, then closes the control connection.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.stop.try_send(());
        match worker.join() {
            Ok(Some(mut remote)) => {
                if let Err(err) = remote.close() {
                    debug!(error = %err, "Control connection close failed");
                }
                let _ = self.events.send(FsEvent::Disconnected);
            }
            Ok(None) => {}
            Err(_) => warn!("Filesystem worker panicked"),
        }
    }
}

impl Drop for FsQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(worker: &mut FsWorker, tasks: &Receiver<FsTask>, stop: &Receiver<()>) {
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(tasks) -> task => match task {
                Ok(task) => worker.execute(task),
                Err(_) => break,
            },
        }
    }
    debug!("Filesystem worker stopped");
}
