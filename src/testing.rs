use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::error::SessionError;
use crate::remote::{ChunkFn, Connector, EntryKind, ExecOutput, RemoteAttrs, RemoteEntry, RemoteSession};

const CHUNK: usize = 4096;

fn attrs_from(meta: &fs::Metadata) -> RemoteAttrs {
    RemoteAttrs {
        kind: EntryKind::from_mode(meta.mode()),
        size: meta.len(),
        mode: meta.mode(),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        mtime: u32::try_from(meta.mtime()).ok(),
    }
}

fn optional(result: std::io::Result<fs::Metadata>) -> Result<Option<RemoteAttrs>> {
    match result {
        Ok(meta) => Ok(Some(attrs_from(&meta))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn copy_chunked(mut src: impl Read, mut dst: impl Write, on_chunk: ChunkFn<'_>) -> Result<()> {
    let mut buf = [0u8; CHUNK];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
        if !on_chunk(n as u64) {
            return Err(SessionError::Cancelled.into());
        }
    }
    dst.flush()?;
    Ok(())
}

#[derive(Default)]
pub struct LocalRemote {
    pub commands: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicUsize>,
    /// Login directory; the process working directory when unset.
    pub home: Option<String>,
}

impl RemoteSession for LocalRemote {
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path).with_context(|| format!("Failed to list {path}"))? {
            let entry = entry?;
            // Shared temp dirs churn while tests run in parallel.
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            out.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                attrs: attrs_from(&meta),
            });
        }
        Ok(out)
    }

    fn lstat(&mut self, path: &str) -> Result<Option<RemoteAttrs>> {
        optional(fs::symlink_metadata(path))
    }

    fn stat(&mut self, path: &str) -> Result<Option<RemoteAttrs>> {
        optional(fs::metadata(path))
    }

    fn create_dir(&mut self, path: &str) -> Result<()> {
        fs::create_dir(path).with_context(|| format!("Failed to create directory {path}"))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        fs::rename(from, to).with_context(|| format!("Failed to rename {from} to {to}"))
    }

    fn read_link(&mut self, path: &str) -> Result<String> {
        Ok(fs::read_link(path)?.to_string_lossy().into_owned())
    }

    fn home_dir(&mut self) -> Result<String> {
        match &self.home {
            Some(home) => Ok(home.clone()),
            None => Ok(path_str(&std::env::current_dir()?)),
        }
    }

    fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        if let Ok(mut log) = self.commands.lock() {
            log.push(command.to_string());
        }
        let out = Command::new("sh").arg("-c").arg(command).output()?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            exit_code: out.status.code().map(|c| c as u32).unwrap_or(255),
        })
    }

    fn upload_file(&mut self, local: &Path, remote: &str, on_chunk: ChunkFn<'_>) -> Result<()> {
        copy_chunked(File::open(local)?, File::create(remote)?, on_chunk)
    }

    fn download_file(&mut self, remote: &str, local: &Path, on_chunk: ChunkFn<'_>) -> Result<()> {
        copy_chunked(File::open(remote)?, File::create(local)?, on_chunk)
    }

    fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out `LocalRemote`s and counts how many were opened and closed.
#[derive(Clone, Default)]
pub struct LocalConnector {
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
    pub commands: Arc<Mutex<Vec<String>>>,
    pub home: Option<String>,
}

impl Connector for LocalConnector {
    fn connect(&self) -> Result<Box<dyn RemoteSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalRemote {
            commands: self.commands.clone(),
            closed: self.closed.clone(),
            home: self.home.clone(),
        }))
    }
}

pub fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
