use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{select, Receiver};
use tracing::{info, warn};

use rusty_remote::config::{self, EngineConfig};
use rusty_remote::fs_queue::{DirEntryInfo, FileInfo, FsEvent, FsQueue, FsTask, ListDetail};
use rusty_remote::logger;
use rusty_remote::model::SessionDescriptor;
use rusty_remote::paths;
use rusty_remote::remote::Connector;
use rusty_remote::shell::{ShellEvent, ShellMode, ShellSession};
use rusty_remote::ssh::SshConnector;
use rusty_remote::telemetry::TelemetrySample;
use rusty_remote::transfer::{TransferAction, TransferEngine, TransferEvent, TransferRequest};

#[derive(Parser, Debug)]
#[command(author, version, about = "Remote shell, filesystem and transfer client")]
struct Cli {
    /// Session file (TOML) describing the host to reach.
    #[arg(long, short, global = true)]
    session: Option<PathBuf>,

    /// Engine config file. Defaults to the per-user config location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Accept an unrecorded or changed host identity without asking.
    #[arg(long, global = true)]
    trust: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive shell relayed over stdin/stdout.
    Shell,
    /// Run one command in the shell and print its captured output.
    Exec { command: String },
    /// List a remote directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(long)]
        detail: bool,
    },
    /// Show metadata for a remote path.
    Info { path: String },
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        dest: String,
        #[arg(long)]
        compress: bool,
    },
    Download {
        #[arg(required = true)]
        paths: Vec<String>,
        /// Local directory. Defaults to the configured download directory.
        #[arg(long)]
        dest: Option<PathBuf>,
        #[arg(long)]
        compress: bool,
    },
    /// Stream resource telemetry from the host.
    Monitor {
        #[arg(long)]
        json: bool,
    },
    /// Print the effective engine config.
    Config,
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let cfg = config::load_from(&config_path)?;
    logger::init(cfg.log_file.as_deref(), &cfg.log_level)?;

    let command = match cli.command {
        Command::Config => {
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&cfg).context("Failed to serialize config")?);
            return Ok(ExitCode::SUCCESS);
        }
        command => command,
    };

    let session_path = cli
        .session
        .ok_or_else(|| anyhow!("--session <FILE> is required for this command"))?;
    let desc = SessionDescriptor::load_from(&session_path)?;
    desc.validate()?;
    info!(host = %desc.address(), ?command, "Starting");
    let identity = IdentityPrompt {
        session_path,
        trust: cli.trust,
    };

    match command {
        Command::Shell => run_shell(desc, cfg, &identity),
        Command::Exec { command } => run_exec(desc, cfg, &identity, &command),
        Command::Monitor { json } => run_monitor(desc, cfg, &identity, json),
        Command::Ls { path, detail } => {
            let detail = if detail { ListDetail::Full } else { ListDetail::Names };
            let entries = with_queue(desc, cfg, |done| FsTask::ListDir {
                path,
                detail,
                done: Some(done),
            })??;
            print_listing(&entries);
            Ok(ExitCode::SUCCESS)
        }
        Command::Info { path } => {
            let info = with_queue(desc, cfg, |done| FsTask::FileInfo {
                path,
                done: Some(done),
            })??;
            print_info(&info);
            Ok(ExitCode::SUCCESS)
        }
        Command::Upload {
            paths,
            dest,
            compress,
        } => {
            let request = TransferRequest {
                action: TransferAction::Upload,
                sources: paths.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
                destination: dest,
                compress: compress || cfg.compress_uploads,
                upload_root: None,
            };
            run_transfer(desc, cfg, request)
        }
        Command::Download {
            paths,
            dest,
            compress,
        } => {
            let request = TransferRequest {
                action: TransferAction::Download,
                sources: paths,
                destination: dest
                    .map(|d| d.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                compress,
                upload_root: None,
            };
            run_transfer(desc, cfg, request)
        }
        Command::Config => bail!("config does not take a session"),
    }
}

/// Asks whether to trust a host whose identity is unrecorded or changed, and
/// records the accepted values in the session file.
struct IdentityPrompt {
    session_path: PathBuf,
    trust: bool,
}

impl IdentityPrompt {
    fn confirm(&self, fingerprint: Option<&str>, checksum: Option<&str>) -> Result<bool> {
        eprintln!("The host identity is not recorded or has changed.");
        eprintln!("  host key:       {}", fingerprint.unwrap_or("<none>"));
        if let Some(sum) = checksum {
            eprintln!("  probe checksum: {sum}");
        }
        let accept = if self.trust {
            true
        } else {
            eprint!("Continue and record it? [y/N] ");
            io::stderr().flush()?;
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            matches!(line.trim(), "y" | "Y" | "yes")
        };
        if accept {
            self.record(fingerprint, checksum)?;
        }
        Ok(accept)
    }

    fn record(&self, fingerprint: Option<&str>, checksum: Option<&str>) -> Result<()> {
        let mut desc = SessionDescriptor::load_from(&self.session_path)?;
        if let Some(fp) = fingerprint {
            desc.host_key_fingerprint = Some(fp.to_string());
        }
        if let Some(sum) = checksum {
            desc.probe_checksum = Some(sum.to_string());
        }
        desc.save_to(&self.session_path)?;
        info!(path = %self.session_path.display(), "Recorded host identity");
        Ok(())
    }
}

/// Blocks until the shell reports `Connected`, answering identity prompts.
fn await_connected(
    session: &ShellSession,
    events: &Receiver<ShellEvent>,
    identity: &IdentityPrompt,
) -> Result<()> {
    for event in events.iter() {
        match event {
            ShellEvent::Connected => return Ok(()),
            ShellEvent::VerificationNeeded {
                fingerprint,
                checksum,
            } => {
                let accept = identity.confirm(fingerprint.as_deref(), checksum.as_deref())?;
                session.verify(accept)?;
            }
            ShellEvent::Error(message) => bail!(message),
            ShellEvent::Disconnected => bail!("Session closed before it was established"),
            _ => {}
        }
    }
    bail!("Shell worker exited")
}

fn spawn_stdin_reader() -> Receiver<Vec<u8>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn run_shell(desc: SessionDescriptor, cfg: EngineConfig, identity: &IdentityPrompt) -> Result<ExitCode> {
    let (tx, events) = crossbeam_channel::unbounded();
    let mut session = ShellSession::start(desc, cfg, ShellMode::Interactive, tx);
    await_connected(&session, &events, identity)?;

    let input = spawn_stdin_reader();
    let mut stdout = io::stdout().lock();
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(ShellEvent::Output(bytes)) => {
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
                Ok(ShellEvent::Error(message)) => {
                    session.shutdown();
                    bail!(message);
                }
                Ok(ShellEvent::Disconnected) | Err(_) => break,
                Ok(_) => {}
            },
            recv(input) -> data => match data {
                Ok(bytes) => session.send_bytes(&bytes)?,
                Err(_) => break,
            },
        }
    }
    session.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn run_exec(
    desc: SessionDescriptor,
    cfg: EngineConfig,
    identity: &IdentityPrompt,
    command: &str,
) -> Result<ExitCode> {
    let (tx, events) = crossbeam_channel::unbounded();
    let mut session = ShellSession::start(desc, cfg, ShellMode::Interactive, tx);
    await_connected(&session, &events, identity)?;
    session.run_command(command)?;

    let outcome = loop {
        match events.recv() {
            Ok(ShellEvent::CommandCompleted(output)) => break Ok(output),
            Ok(ShellEvent::Error(message)) => break Err(anyhow!(message)),
            Ok(ShellEvent::Disconnected) | Err(_) => {
                break Err(anyhow!("Session closed before the command finished"))
            }
            Ok(_) => {}
        }
    };
    session.shutdown();

    let output = outcome?;
    if !output.text.is_empty() {
        println!("{}", output.text);
    }
    Ok(ExitCode::from(u8::try_from(output.exit_code).unwrap_or(1)))
}

fn run_monitor(
    desc: SessionDescriptor,
    cfg: EngineConfig,
    identity: &IdentityPrompt,
    json: bool,
) -> Result<ExitCode> {
    let (tx, events) = crossbeam_channel::unbounded();
    let mut session = ShellSession::start(desc, cfg, ShellMode::Telemetry, tx);
    await_connected(&session, &events, identity)?;

    for event in events.iter() {
        match event {
            ShellEvent::Telemetry(sample) if json => {
                println!("{}", serde_json::to_string(&sample)?);
            }
            ShellEvent::Telemetry(sample) => println!("{}", telemetry_line(&sample)),
            ShellEvent::Error(message) => {
                session.shutdown();
                bail!(message);
            }
            ShellEvent::Disconnected => break,
            _ => {}
        }
    }
    session.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn telemetry_line(sample: &TelemetrySample) -> String {
    let top = sample
        .top_processes
        .first()
        .map(|p| format!("{} {:.1}%", p.name, p.cpu))
        .unwrap_or_else(|| "-".to_string());
    let (rx, tx) = sample
        .net
        .iter()
        .fold((0.0, 0.0), |(rx, tx), n| (rx + n.rx_kbps, tx + n.tx_kbps));
    format!(
        "cpu {:5.1}%  mem {:5.1}%  net rx {rx:.1} KB/s tx {tx:.1} KB/s  conns {}  top {top}",
        sample.cpu_percent,
        sample.mem_percent,
        sample.connections.len(),
    )
}

/// Starts a control queue, runs one task and hands back what its completion
/// produced.
fn with_queue<T: Send + 'static>(
    desc: SessionDescriptor,
    cfg: EngineConfig,
    task: impl FnOnce(Box<dyn FnOnce(T) + Send>) -> FsTask,
) -> Result<T> {
    let connector: Arc<dyn Connector> = Arc::new(SshConnector::new(desc, cfg.clone()));
    let (transfer_tx, _transfer_events) = crossbeam_channel::unbounded();
    let transfers = TransferEngine::new(connector.clone(), cfg, transfer_tx)?;
    let (fs_tx, fs_events) = crossbeam_channel::unbounded();
    let mut queue = FsQueue::start(connector, transfers.clone(), fs_tx);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    queue.enqueue(task(Box::new(move |value| {
        let _ = done_tx.send(value);
    })))?;

    let mut last_error = None;
    let result = loop {
        select! {
            recv(done_rx) -> value => break value.map_err(|_| anyhow!("Task was dropped")),
            recv(fs_events) -> event => match event {
                Ok(FsEvent::Disconnected) | Err(_) => {
                    break done_rx.try_recv().map_err(|_| {
                        anyhow!(last_error.take().unwrap_or_else(|| "Control connection closed".to_string()))
                    });
                }
                Ok(FsEvent::OperationError(message)) => {
                    warn!(%message, "Operation failed");
                    last_error = Some(message);
                }
                Ok(_) => {}
            },
        }
    };
    queue.shutdown();
    transfers.shutdown();
    result
}

fn print_listing(entries: &[DirEntryInfo]) {
    let mut entries: Vec<_> = entries.iter().collect();
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    for entry in entries {
        let suffix = if entry.is_dir { "/" } else if entry.is_symlink { "@" } else { "" };
        match &entry.detail {
            Some(d) => println!(
                "{} {:<8} {:<8} {:>10} {} {}{suffix}",
                d.permissions,
                d.owner,
                d.group,
                paths::size_label(entry.size),
                d.modified,
                entry.name
            ),
            None => println!("{}{suffix}", entry.name),
        }
    }
}

fn print_info(info: &FileInfo) {
    println!("path:        {}", info.path);
    println!("permissions: {}", info.permissions);
    println!("owner:       {}:{}", info.owner, info.group);
    println!("size:        {} ({} bytes)", info.size, info.size_bytes);
    println!("modified:    {}", info.modified);
    if let Some(target) = &info.link_target {
        println!("link:        {target}");
    }
}

fn run_transfer(desc: SessionDescriptor, cfg: EngineConfig, request: TransferRequest) -> Result<ExitCode> {
    if request.action == TransferAction::Download && !request.destination.is_empty() {
        std::fs::create_dir_all(Path::new(&request.destination))
            .with_context(|| format!("Failed to create {}", request.destination))?;
    }
    let connector: Arc<dyn Connector> = Arc::new(SshConnector::new(desc, cfg.clone()));
    let (tx, events) = crossbeam_channel::unbounded();
    let engine = TransferEngine::new(connector, cfg, tx)?;
    let ids = engine.submit(request);

    let mut pending = ids.len();
    let mut failed = 0usize;
    for event in events.iter() {
        match event {
            TransferEvent::Progress { id, percent, .. } => {
                eprint!("\r{id}: {percent:>3}%");
                let _ = io::stderr().flush();
            }
            TransferEvent::Finished { id, success, detail } => {
                eprint!("\r");
                if success {
                    println!("{id}: {detail}");
                } else {
                    failed += 1;
                    eprintln!("{id}: failed: {detail}");
                }
                pending -= 1;
                if pending == 0 {
                    break;
                }
            }
        }
    }
    engine.shutdown();
    Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
