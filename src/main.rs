use anyhow::{bail, Context};
use clap::Parser;
use pystalker::engine::channel::StatusChannel;
use pystalker::engine::ConnError;
use pystalker::version::RuntimeVersion;
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;

/// Create the status channel for a process and wait for its attach engine to report.
///
/// Run this before `pystalker_attach` is triggered inside the target process.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target process id.
    pid: u32,

    /// Port the debugger script connects back to.
    #[arg(short, long, env = "PYSTALKER_PORT", default_value_t = 5678)]
    port: i32,

    /// Session id passed to the debugger script.
    #[arg(short, long, env = "PYSTALKER_SESSION", default_value_t = String::new())]
    session_id: String,

    /// Options string passed to the debugger script.
    #[arg(short, long, env = "PYSTALKER_OPTIONS", default_value_t = String::new())]
    options: String,

    /// Seconds to wait for the "starting" event.
    #[arg(long, default_value_t = 60)]
    start_timeout: u64,

    /// Seconds to wait for the "done" event once started.
    #[arg(long, default_value_t = 30)]
    done_timeout: u64,
}

const POLL: Duration = Duration::from_millis(100);

fn version_name(wire: i32) -> String {
    RuntimeVersion::iter()
        .find(|v| v.wire() == wire)
        .map(|v| v.to_string())
        .unwrap_or_else(|| format!("{wire:#06x}"))
}

/// Wait for "starting". An engine that failed early signals only "done".
fn wait_start(channel: &StatusChannel, timeout: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if channel.wait_starting(POLL).is_ok() {
            return Ok(());
        }
        if channel.block().done.is_set() {
            let error = channel.error().unwrap_or(ConnError::None);
            bail!("attach failed before start: {error}");
        }
        if Instant::now() >= deadline {
            bail!("attach engine did not start in {timeout:?}");
        }
    }
}

fn main() -> anyhow::Result<()> {
    pystalker::log::init(Some("info"));
    let args = Args::parse();

    let channel = StatusChannel::create(args.pid, args.port, &args.session_id, &args.options)
        .with_context(|| format!("create status channel for process {}", args.pid))?;
    println!("status channel: {}", channel.path().display());

    wait_start(&channel, Duration::from_secs(args.start_timeout))?;
    println!("interpreter version: {}", version_name(channel.version()));
    channel
        .wait_done(Duration::from_secs(args.done_timeout))
        .context("attach engine did not finish bootstrap")?;

    match channel.error().unwrap_or(ConnError::None) {
        ConnError::None => {
            println!("threading initialized, debugger reports over 127.0.0.1:{}", args.port);
            Ok(())
        }
        error => bail!("attach failed: {error}"),
    }
}
