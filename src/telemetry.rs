use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::model::{AuthKind, SessionDescriptor};
use crate::paths;
use crate::ssh::{self, Connection};

pub const START_TAG: &str = "///Start";
pub const END_TAG: &str = "End///";
const MAX_BUFFER: usize = 64 * 1024;

pub const PROBE_SCRIPT: &str = include_str!("../assets/probe.sh");

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub name: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetRate {
    pub iface: String,
    #[serde(default)]
    pub rx_kbps: f64,
    #[serde(default)]
    pub tx_kbps: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSample {
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub remote: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub mem_percent: f64,
    #[serde(default)]
    pub top_processes: Vec<ProcessSample>,
    #[serde(default)]
    pub net: Vec<NetRate>,
    #[serde(default)]
    pub connections: Vec<ConnectionSample>,
}

/// Accumulates shell output and yields one decoded record per call.
#[derive(Debug, Default)]
pub struct TelemetryScanner {
    buffer: String,
}

impl TelemetryScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        if self.buffer.len() > MAX_BUFFER {
            self.discard_stale();
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// `None` when no complete record is buffered. A record that does not
    /// decode is consumed and returned as an error.
    pub fn next_record(&mut self) -> Option<Result<TelemetrySample>> {
        let start = self.buffer.find(START_TAG)?;
        let payload_start = start + START_TAG.len();
        let end = payload_start + self.buffer[payload_start..].find(END_TAG)?;

        let payload = self.buffer[payload_start..end].trim().to_string();
        self.buffer.drain(..end + END_TAG.len());

        Some(
            serde_json::from_str::<TelemetrySample>(&payload)
                .with_context(|| format!("Malformed telemetry record ({} bytes)", payload.len())),
        )
    }

    /// Keeps only the bytes from the last start tag on, or nothing if the
    /// tail holds no start tag either.
    fn discard_stale(&mut self) {
        match self.buffer.rfind(START_TAG) {
            Some(at) if at > 0 => {
                self.buffer.drain(..at);
            }
            Some(_) => {
                // One oversized record that never closed.
                self.buffer.clear();
            }
            None => {
                let keep = START_TAG.len() - 1;
                let mut cut = self.buffer.len().saturating_sub(keep);
                while !self.buffer.is_char_boundary(cut) {
                    cut += 1;
                }
                self.buffer.drain(..cut);
            }
        }
        debug!(kept = self.buffer.len(), "Telemetry buffer trimmed");
    }
}

/// The line typed into the shell to start the probe.
#[derive(Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub command: String,
    /// Set when `command` embeds the password.
    pub sensitive: bool,
}

impl std::fmt::Debug for LaunchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let command = if self.sensitive { "***" } else { self.command.as_str() };
        f.debug_struct("LaunchPlan").field("command", &command).finish()
    }
}

pub fn launch_plan(desc: &SessionDescriptor, cfg: &EngineConfig) -> LaunchPlan {
    let probe = format!(
        "{} {}",
        paths::quote(&cfg.probe_path()),
        cfg.probe_interval_secs.max(1)
    );
    if desc.is_root() {
        return LaunchPlan {
            command: probe,
            sensitive: false,
        };
    }
    match desc.auth {
        // Password goes to sudo's stdin; -k makes sudo read it every time.
        // Leading space: skipped by history under ignorespace.
        AuthKind::Password if !desc.password.is_empty() => LaunchPlan {
            command: format!(
                " sudo -k; printf '%s\\n' {} | sudo -S -p '' {probe} || {probe}",
                paths::quote(&desc.password)
            ),
            sensitive: true,
        },
        _ => LaunchPlan {
            command: format!("sudo -n {probe} 2>/dev/null || {probe}"),
            sensitive: false,
        },
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Uploads the probe, marks it executable and returns the checksum of the
/// bytes as they now sit on the remote host.
pub async fn deploy_probe(conn: &Connection, cfg: &EngineConfig) -> Result<String> {
    let dir = cfg.probe_dir.trim_end_matches('/');
    let path = cfg.probe_path();

    ssh::exec(&conn.handle, &format!("mkdir -p -m 700 {}", paths::quote(dir)))
        .await?
        .into_result()
        .with_context(|| format!("Cannot create probe directory {dir}"))?;

    let sftp = ssh::open_sftp(&conn.handle).await?;
    ssh::write_remote_file(&sftp, &path, PROBE_SCRIPT.as_bytes()).await?;
    ssh::exec(&conn.handle, &format!("chmod 755 {}", paths::quote(&path)))
        .await?
        .into_result()
        .with_context(|| format!("Cannot make {path} executable"))?;

    let deployed = ssh::read_remote_file(&sftp, &path).await?;
    let _ = sftp.close().await;

    let sum = checksum(&deployed);
    info!(path = %path, checksum = %sum, "Probe deployed");
    Ok(sum)
}
