use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::capture::{CaptureSession, CaptureStep, CommandOutput};
use crate::config::EngineConfig;
use crate::error::SessionError;
use crate::model::SessionDescriptor;
use crate::ssh::{self, Connection};
use crate::telemetry::{self, TelemetrySample, TelemetryScanner};

const INTERRUPT: u8 = 0x03;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellMode {
    Interactive,
    /// Deploys and launches the resource probe after connecting.
    Telemetry,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ShellEvent {
    Connected,
    Output(Vec<u8>),
    CommandCompleted(CommandOutput),
    Telemetry(TelemetrySample),
    /// Recorded identity differs from what the host presented. The session
    /// waits for `ShellSession::verify`.
    VerificationNeeded {
        fingerprint: Option<String>,
        checksum: Option<String>,
    },
    Error(String),
    Disconnected,
}

#[derive(Debug)]
enum WorkerMessage {
    Input(Vec<u8>),
    Resize { cols: u32, rows: u32 },
    RunCommand(String),
    ForceComplete,
    Verify(bool),
    Disconnect,
}

pub struct ShellSession {
    tx: Sender<WorkerMessage>,
    capture_active: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ShellSession {
    pub fn start(
        desc: SessionDescriptor,
        cfg: EngineConfig,
        mode: ShellMode,
        events: Sender<ShellEvent>,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let capture_active = Arc::new(AtomicBool::new(false));
        let flag = capture_active.clone();

        let worker = thread::spawn(move || {
            info!(host = %desc.address(), ?mode, "Starting shell worker");
            let result = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt.block_on(run_shell(&desc, &cfg, mode, &events, rx, &flag)),
                Err(err) => Err(anyhow!("Failed to create async runtime: {err}")),
            };
            flag.store(false, Ordering::SeqCst);

            if let Err(err) = result {
                error!(host = %desc.address(), error = %format!("{err:#}"), "Shell worker failed");
                let _ = events.send(ShellEvent::Error(format!("{err:#}")));
                let _ = events.send(ShellEvent::Disconnected);
            }
        });

        Self {
            tx,
            capture_active,
            worker: Some(worker),
        }
    }

    pub fn send_bytes(&self, data: &[u8]) -> Result<()> {
        self.send(WorkerMessage::Input(data.to_vec()))
    }

    pub fn resize(&self, cols: u32, rows: u32) -> Result<()> {
        self.send(WorkerMessage::Resize { cols, rows })
    }

    pub fn interrupt(&self) -> Result<()> {
        self.send_bytes(&[INTERRUPT])
    }

    /// Starts a capture. Fails with `CaptureBusy` while another one runs.
    pub fn run_command(&self, command: &str) -> Result<()> {
        if self
            .capture_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::CaptureBusy.into());
        }
        if let Err(err) = self.send(WorkerMessage::RunCommand(command.to_string())) {
            self.capture_active.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture_active.load(Ordering::SeqCst)
    }

    /// Completes the active capture with what arrived so far.
    pub fn force_complete(&self) -> Result<()> {
        self.send(WorkerMessage::ForceComplete)
    }

    /// Answers a `VerificationNeeded` event.
    pub fn verify(&self, accept: bool) -> Result<()> {
        self.send(WorkerMessage::Verify(accept))
    }

    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.tx.send(WorkerMessage::Disconnect);
        if worker.join().is_err() {
            warn!("Shell worker panicked");
        }
    }

    fn send(&self, msg: WorkerMessage) -> Result<()> {
        if self.worker.is_none() {
            return Err(SessionError::Closed.into());
        }
        self.tx.send(msg).map_err(|_| SessionError::Closed.into())
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// True when the host key or the probe checksum differs from the recorded
/// value. A missing record counts as a difference.
pub fn identity_mismatch(
    desc: &SessionDescriptor,
    fingerprint: Option<&str>,
    checksum: Option<&str>,
) -> bool {
    let key_ok = matches!(
        (desc.host_key_fingerprint.as_deref(), fingerprint),
        (Some(recorded), Some(seen)) if recorded == seen
    );
    let script_ok = match checksum {
        None => true,
        Some(seen) => desc.probe_checksum.as_deref() == Some(seen),
    };
    !(key_ok && script_ok)
}

/// Capture and telemetry state carried across poll ticks.
struct Relay<'a> {
    events: &'a Sender<ShellEvent>,
    capture_flag: &'a AtomicBool,
    capture: Option<CaptureSession>,
    scanner: Option<TelemetryScanner>,
}

impl Relay<'_> {
    fn emit(&self, event: ShellEvent) {
        let _ = self.events.send(event);
    }

    fn finish_capture(&mut self, output: CommandOutput) {
        self.capture = None;
        self.capture_flag.store(false, Ordering::SeqCst);
        debug!(exit_code = output.exit_code, "Command capture completed");
        self.emit(ShellEvent::CommandCompleted(output));
    }

    fn force_capture(&mut self) {
        if let Some(output) = self.capture.as_mut().and_then(|c| c.force()) {
            self.finish_capture(output);
        }
    }

    /// Returns bytes that must be written back to the PTY.
    fn on_output(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.emit(ShellEvent::Output(data.to_vec()));

        if let Some(scanner) = self.scanner.as_mut() {
            scanner.push(data);
            while let Some(record) = scanner.next_record() {
                match record {
                    Ok(sample) => {
                        let _ = self.events.send(ShellEvent::Telemetry(sample));
                    }
                    Err(err) => warn!(error = %format!("{err:#}"), "Dropping telemetry record"),
                }
            }
        }

        match self.capture.as_mut().map(|c| c.feed(data)) {
            Some(CaptureStep::SendTrailer(bytes)) => Some(bytes),
            Some(CaptureStep::Complete(output)) => {
                self.finish_capture(output);
                None
            }
            Some(CaptureStep::Pending) | None => None,
        }
    }
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(bytes).await.context("Channel write failed")?;
    writer.flush().await.context("Channel flush failed")
}

async fn run_shell(
    desc: &SessionDescriptor,
    cfg: &EngineConfig,
    mode: ShellMode,
    events: &Sender<ShellEvent>,
    rx: Receiver<WorkerMessage>,
    capture_flag: &AtomicBool,
) -> Result<()> {
    let conn = ssh::connect(desc, cfg).await?;

    let checksum = match mode {
        ShellMode::Telemetry => match telemetry::deploy_probe(&conn, cfg).await {
            Ok(sum) => Some(sum),
            Err(err) => {
                conn.disconnect().await;
                return Err(err.context("Probe deployment failed"));
            }
        },
        ShellMode::Interactive => None,
    };

    let mut deferred = Vec::new();
    let fingerprint = conn.host_key_fingerprint.clone();
    if identity_mismatch(desc, fingerprint.as_deref(), checksum.as_deref()) {
        info!(host = %desc.address(), "Host identity needs confirmation");
        let _ = events.send(ShellEvent::VerificationNeeded {
            fingerprint,
            checksum,
        });
        match await_verdict(&rx, cfg, &mut deferred).await {
            Some(true) => info!("Host identity accepted"),
            Some(false) => {
                conn.disconnect().await;
                return Err(SessionError::VerificationRejected.into());
            }
            None => {
                conn.disconnect().await;
                let _ = events.send(ShellEvent::Disconnected);
                return Ok(());
            }
        }
    }

    let mut channel = match open_shell(&conn, cfg).await {
        Ok(channel) => channel,
        Err(err) => {
            conn.disconnect().await;
            return Err(err);
        }
    };
    let _ = events.send(ShellEvent::Connected);
    info!(host = %desc.address(), "Shell connected");

    let mut relay = Relay {
        events,
        capture_flag,
        capture: None,
        scanner: (mode == ShellMode::Telemetry).then(TelemetryScanner::new),
    };

    let result = relay_loop(&mut relay, &conn, &mut channel, desc, cfg, &rx, deferred, mode).await;

    // A capture never outlives the transport.
    relay.force_capture();
    let _ = channel.eof().await;
    let _ = channel.close().await;
    conn.disconnect().await;

    if result.is_ok() {
        let _ = events.send(ShellEvent::Disconnected);
    }
    result
}

/// `None` when the caller disconnected instead of answering.
async fn await_verdict(
    rx: &Receiver<WorkerMessage>,
    cfg: &EngineConfig,
    deferred: &mut Vec<WorkerMessage>,
) -> Option<bool> {
    loop {
        match rx.try_recv() {
            Ok(WorkerMessage::Verify(accept)) => return Some(accept),
            Ok(WorkerMessage::Disconnect) | Err(TryRecvError::Disconnected) => return None,
            Ok(other) => deferred.push(other),
            Err(TryRecvError::Empty) => tokio::time::sleep(cfg.poll_interval()).await,
        }
    }
}

async fn open_shell(conn: &Connection, cfg: &EngineConfig) -> Result<Channel<russh::client::Msg>> {
    let channel = conn
        .handle
        .channel_open_session()
        .await
        .context("Failed to open SSH channel")?;
    channel
        .request_pty(false, &cfg.pty_term, cfg.pty_cols, cfg.pty_rows, 0, 0, &[])
        .await
        .context("Failed to request PTY")?;
    // Some servers ignore the pty type for TERM.
    let _ = channel.set_env(false, "TERM", cfg.pty_term.as_str()).await;
    channel
        .request_shell(true)
        .await
        .context("Failed to start shell")?;
    Ok(channel)
}

#[allow(clippy::too_many_arguments)]
async fn relay_loop(
    relay: &mut Relay<'_>,
    conn: &Connection,
    channel: &mut Channel<russh::client::Msg>,
    desc: &SessionDescriptor,
    cfg: &EngineConfig,
    rx: &Receiver<WorkerMessage>,
    deferred: Vec<WorkerMessage>,
    mode: ShellMode,
) -> Result<()> {
    let mut writer = channel.make_writer();
    let poll = cfg.poll_interval();
    let capture_timeout = cfg.capture_timeout();

    if mode == ShellMode::Telemetry {
        let plan = telemetry::launch_plan(desc, cfg);
        debug!(?plan, "Launching probe");
        write_all(&mut writer, format!("{}\n", plan.command).as_bytes()).await?;
    }

    let mut pending = deferred.into_iter();
    loop {
        loop {
            let msg = match pending.next() {
                Some(msg) => msg,
                None => match rx.try_recv() {
                    Ok(msg) => msg,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                },
            };
            match msg {
                WorkerMessage::Input(data) => write_all(&mut writer, &data).await?,
                WorkerMessage::Resize { cols, rows } => {
                    channel
                        .window_change(cols, rows, 0, 0)
                        .await
                        .map_err(|err| anyhow!("Failed to resize PTY: {err}"))?;
                }
                WorkerMessage::RunCommand(command) => {
                    if relay.capture.is_some() {
                        relay.emit(ShellEvent::Error(SessionError::CaptureBusy.to_string()));
                        continue;
                    }
                    let capture = CaptureSession::new(&command);
                    debug!(marker = capture.start_marker(), "Starting command capture");
                    let opening = capture.opening_input();
                    relay.capture = Some(capture);
                    write_all(&mut writer, &opening).await?;
                }
                WorkerMessage::ForceComplete => relay.force_capture(),
                WorkerMessage::Verify(_) => {}
                WorkerMessage::Disconnect => {
                    info!("Disconnected on request");
                    return Ok(());
                }
            }
        }

        match tokio::time::timeout(poll, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) | Ok(Some(ChannelMsg::ExtendedData { data, .. })) => {
                if let Some(trailer) = relay.on_output(data.as_ref()) {
                    write_all(&mut writer, &trailer).await?;
                }
            }
            Ok(Some(ChannelMsg::Eof)) | Ok(Some(ChannelMsg::Close)) | Ok(None) => {
                info!("Shell channel closed by remote");
                return Ok(());
            }
            Ok(Some(_)) => {}
            Err(_) => {
                // Poll tick.
            }
        }

        if relay
            .capture
            .as_ref()
            .is_some_and(|c| c.elapsed() >= capture_timeout)
        {
            warn!(secs = capture_timeout.as_secs(), "Command capture timed out");
            relay.force_capture();
        }

        if conn.is_closed() {
            warn!("SSH transport is gone");
            return Err(anyhow!("Connection lost"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SessionDescriptor {
        SessionDescriptor {
            host: "h".into(),
            username: "u".into(),
            host_key_fingerprint: Some("SHA256:abc".into()),
            probe_checksum: Some("d41d".into()),
            ..Default::default()
        }
    }

    fn relay<'a>(events: &'a Sender<ShellEvent>, flag: &'a AtomicBool) -> Relay<'a> {
        Relay {
            events,
            capture_flag: flag,
            capture: None,
            scanner: Some(TelemetryScanner::new()),
        }
    }

    #[test]
    fn identity_matches_only_when_both_records_agree() {
        let desc = descriptor();
        assert!(!identity_mismatch(&desc, Some("SHA256:abc"), None));
        assert!(!identity_mismatch(&desc, Some("SHA256:abc"), Some("d41d")));
        assert!(identity_mismatch(&desc, Some("SHA256:xyz"), None));
        assert!(identity_mismatch(&desc, Some("SHA256:abc"), Some("beef")));

        let blank = SessionDescriptor::default();
        assert!(identity_mismatch(&blank, Some("SHA256:abc"), None));
    }

    #[test]
    fn forcing_an_unfinished_capture_emits_exactly_one_completion() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let flag = AtomicBool::new(true);
        let mut relay = relay(&tx, &flag);
        relay.capture = Some(CaptureSession::new("weird-prompt-cmd"));

        relay.on_output(b"some output with no prompt\r\n");
        relay.force_capture();
        relay.force_capture();

        let completions = rx
            .try_iter()
            .filter(|e| matches!(e, ShellEvent::CommandCompleted(_)))
            .count();
        assert_eq!(completions, 1);
        assert!(!flag.load(Ordering::SeqCst));
        assert!(relay.capture.is_none());
    }

    #[test]
    fn telemetry_records_become_events_and_bad_ones_are_dropped() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let flag = AtomicBool::new(false);
        let mut relay = relay(&tx, &flag);
        relay.on_output(b"///Start{broken}End///");
        relay.on_output(br#"///Start{"cpu_percent":5.0,"mem_percent":6.0}End///"#);

        let samples: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                ShellEvent::Telemetry(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].mem_percent, 6.0);
    }

    #[test]
    fn session_reports_failure_for_invalid_descriptor() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut session = ShellSession::start(
            SessionDescriptor::default(),
            EngineConfig::default(),
            ShellMode::Interactive,
            tx,
        );
        let first = rx.recv().unwrap();
        assert!(matches!(first, ShellEvent::Error(msg) if msg.contains("host")));
        assert_eq!(rx.recv().unwrap(), ShellEvent::Disconnected);
        session.shutdown();
        session.shutdown();
        assert!(session.send_bytes(b"ls\n").is_err());
    }

    #[test]
    fn second_capture_is_rejected_while_one_is_active() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let session = ShellSession::start(
            SessionDescriptor::default(),
            EngineConfig::default(),
            ShellMode::Interactive,
            tx,
        );
        // Let the worker finish failing so it no longer touches the flag.
        while rx.recv().map(|e| e != ShellEvent::Disconnected).unwrap_or(false) {}
        session.capture_active.store(true, Ordering::SeqCst);
        let err = session.run_command("ls").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::CaptureBusy)
        ));
    }
}
