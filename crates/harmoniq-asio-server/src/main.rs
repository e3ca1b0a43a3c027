use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use harmoniq_asio_bridge::{rt, BridgeConfig, ServerSession, StreamParams};
use tracing_subscriber::EnvFilter;

mod exit;
mod host;

use exit::{ExitReason, Failure, FailureExt};
use host::{AudioServer, ServerEvent, ServerOptions};

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-server side of the Harmoniq ASIO bridge")]
struct Cli {
    /// Bridge configuration (JSON). Flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Playback device name.
    #[arg(long)]
    device: Option<String>,
    /// Capture device name.
    #[arg(long)]
    capture_device: Option<String>,
    /// Leave every input port silent.
    #[arg(long)]
    no_capture: bool,
    /// Frames per bridge period.
    #[arg(long, default_value_t = 256)]
    buffer_frames: u32,
    #[arg(long, default_value_t = 48_000)]
    sample_rate: u32,
    /// Input ports exposed to the driver.
    #[arg(long)]
    inputs: Option<u32>,
    /// Output ports exposed to the driver.
    #[arg(long)]
    outputs: Option<u32>,
    /// Prefix of the shared object names.
    #[arg(long)]
    prefix: Option<String>,
    /// List audio devices and exit.
    #[arg(long)]
    list_devices: bool,
    /// SCHED_FIFO priority of the audio callback; 0 keeps the default policy.
    #[arg(long, default_value_t = 70)]
    realtime_priority: i32,
}

impl Cli {
    fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => BridgeConfig::default(),
        };
        if let Some(prefix) = &self.prefix {
            config.name_prefix = prefix.clone();
        }
        if let Some(inputs) = self.inputs {
            config.inputs = inputs;
        }
        if let Some(outputs) = self.outputs {
            config.outputs = outputs;
        }
        config.validate()?;
        Ok(config)
    }

    fn server_options(&self) -> ServerOptions {
        ServerOptions {
            device: self.device.clone(),
            capture_device: self.capture_device.clone(),
            capture: !self.no_capture,
            realtime_priority: (self.realtime_priority > 0).then_some(self.realtime_priority),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            tracing::error!(reason = %failure.reason, err = ?failure.error, "bridge server exiting");
            failure.reason.into()
        }
    }
}

fn run(cli: Cli) -> Result<(), Failure> {
    if cli.list_devices {
        return host::list_devices().exit_with(ExitReason::Setup);
    }

    let config = cli.bridge_config().exit_with(ExitReason::Setup)?;
    let params = StreamParams::new(
        config.inputs,
        config.outputs,
        cli.buffer_frames,
        cli.sample_rate,
    );

    if let Err(err) = rt::lock_memory() {
        tracing::warn!(?err, "failed to lock memory");
    }

    let (mut session, collector) = ServerSession::create(&config, params).map_err(|err| {
        let reason = ExitReason::from_session_error(&err);
        Failure::new(reason, err)
    })?;

    let (events_tx, events_rx) = crossbeam_channel::bounded(4);
    let interrupt_tx = events_tx.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(ServerEvent::Interrupted);
    })
    .exit_with(ExitReason::Setup)?;

    let server = AudioServer::start(collector, params, &cli.server_options(), events_tx)
        .exit_with(ExitReason::Activation)?;
    session.activate();
    tracing::info!(
        device = server.device_name(),
        prefix = %config.name_prefix,
        state = %session.state(),
        "waiting for driver"
    );

    let event = events_rx
        .recv()
        .context("event channel closed")
        .exit_with(ExitReason::Setup)?;
    session.begin_shutdown();
    tracing::info!(?event, state = %session.state(), "stopping bridge server");

    if let Err(err) = server.shutdown() {
        tracing::warn!(?err, "failed to pause audio streams");
    }
    session.close();

    match event {
        ServerEvent::Interrupted => Ok(()),
        ServerEvent::StreamError(message) => Err(Failure::new(
            ExitReason::UpstreamShutdown,
            anyhow::anyhow!(message),
        )),
    }
}
