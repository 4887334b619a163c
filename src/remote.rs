use std::path::Path;

use anyhow::{anyhow, Result};

use crate::error::SessionError;
use crate::paths;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & paths::S_IFMT {
            paths::S_IFDIR => Self::Directory,
            paths::S_IFREG => Self::File,
            paths::S_IFLNK => Self::Symlink,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteAttrs {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<u32>,
}

impl RemoteAttrs {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

#[derive(Clone, Debug)]
pub struct RemoteEntry {
    pub name: String,
    pub attrs: RemoteAttrs,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout on exit 0, a `RemoteCommand` error otherwise.
    pub fn into_result(self) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            let stderr = self.stderr.trim();
            let stderr = if stderr.is_empty() {
                self.stdout.trim().to_string()
            } else {
                stderr.to_string()
            };
            Err(SessionError::RemoteCommand {
                code: self.exit_code,
                stderr,
            }
            .into())
        }
    }
}

/// Called with the size of each chunk moved. Returning `false` aborts the
/// transfer with `SessionError::Cancelled`.
pub type ChunkFn<'a> = &'a mut dyn FnMut(u64) -> bool;

pub trait RemoteSession: Send {
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// `None` when nothing exists at `path`.
    fn lstat(&mut self, path: &str) -> Result<Option<RemoteAttrs>>;

    /// Follows symlinks. `None` when the path or its target is missing.
    fn stat(&mut self, path: &str) -> Result<Option<RemoteAttrs>>;

    fn create_dir(&mut self, path: &str) -> Result<()>;

    fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    fn read_link(&mut self, path: &str) -> Result<String>;

    /// Absolute login directory; relative remote paths are taken from here.
    fn home_dir(&mut self) -> Result<String>;

    fn exec(&mut self, command: &str) -> Result<ExecOutput>;

    fn upload_file(&mut self, local: &Path, remote: &str, on_chunk: ChunkFn<'_>) -> Result<()>;

    fn download_file(&mut self, remote: &str, local: &Path, on_chunk: ChunkFn<'_>) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Opens a fresh session per call. Transfer tasks each call this once.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RemoteSession>>;
}

impl<F> Connector for F
where
    F: Fn() -> Result<Box<dyn RemoteSession>> + Send + Sync,
{
    fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        self()
    }
}

/// Creates every missing directory along `path`, stopping at the first
/// segment that cannot be created.
pub fn ensure_dir_all(remote: &mut dyn RemoteSession, path: &str) -> Result<()> {
    let path = absolute(remote, path)?;
    for dir in paths::ancestors_inclusive(&path).into_iter().skip(1) {
        match remote.stat(&dir)? {
            Some(attrs) if attrs.is_dir() => continue,
            Some(_) => return Err(anyhow!("{dir} exists and is not a directory")),
            None => remote
                .create_dir(&dir)
                .map_err(|err| anyhow!("Cannot create {dir}: {err}"))?,
        }
    }
    Ok(())
}

/// `path` made absolute, asking the remote for its login directory only
/// when needed.
pub fn absolute(remote: &mut dyn RemoteSession, path: &str) -> Result<String> {
    if path.trim().starts_with('/') {
        Ok(paths::normalize(path))
    } else {
        Ok(paths::resolve(&remote.home_dir()?, path))
    }
}

pub fn run_checked(remote: &mut dyn RemoteSession, command: &str) -> Result<String> {
    remote.exec(command)?.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_mode_masks_type_bits() {
        assert_eq!(EntryKind::from_mode(0o040_755), EntryKind::Directory);
        assert_eq!(EntryKind::from_mode(0o100_600), EntryKind::File);
        assert_eq!(EntryKind::from_mode(0o120_777), EntryKind::Symlink);
        assert_eq!(EntryKind::from_mode(0o010_644), EntryKind::Other);
    }

    #[test]
    fn failed_exec_prefers_stderr() {
        let out = ExecOutput {
            stdout: "partial".into(),
            stderr: "mv: cannot stat 'x'\n".into(),
            exit_code: 1,
        };
        let err = out.into_result().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::RemoteCommand { code: 1, stderr }) if stderr == "mv: cannot stat 'x'"
        ));
    }
}
