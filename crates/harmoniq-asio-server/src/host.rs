//! cpal-backed stand-in for the audio server client.
//!
//! The playback callback drives the bridge: whenever it has handed out a full
//! bridge period it runs one collector cycle. Capture, when enabled, reaches
//! that callback through an `rtrb` ring.

use anyhow::{anyhow, Context};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::Sender;
use harmoniq_asio_bridge::collector::{CollectorBridge, PlanarCycle, Transport};
use harmoniq_asio_bridge::rt;
use harmoniq_asio_bridge::sem::Semaphore;
use harmoniq_asio_bridge::StreamParams;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info, warn};

/// Periods of capture audio the ring can hold before new input is dropped.
const CAPTURE_PERIODS: usize = 4;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Playback device name; the host default when omitted.
    pub device: Option<String>,
    /// Capture device name; the host default when omitted.
    pub capture_device: Option<String>,
    pub capture: bool,
    /// SCHED_FIFO priority for the playback callback thread.
    pub realtime_priority: Option<i32>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            device: None,
            capture_device: None,
            capture: true,
            realtime_priority: Some(70),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Ctrl+C or SIGTERM.
    Interrupted,
    /// The audio backend reported a fatal stream error.
    StreamError(String),
}

/// Runs the collector from inside a device callback.
pub struct BridgePump<S> {
    collector: CollectorBridge<S>,
    cycle: PlanarCycle,
    frames: usize,
    /// Next frame of `cycle.outputs` to hand to the device.
    cursor: usize,
    capture: Option<Consumer<f32>>,
    capture_channels: usize,
    realtime_priority: Option<i32>,
    prepared: bool,
    failing: bool,
}

impl<S: Semaphore> BridgePump<S> {
    pub fn new(collector: CollectorBridge<S>, params: StreamParams) -> Self {
        let frames = params.frames();
        let mut cycle = PlanarCycle::new(params.inputs as usize, params.outputs as usize, frames);
        cycle.transport = Transport {
            rolling: true,
            frame: 0,
        };
        Self {
            collector,
            cycle,
            frames,
            cursor: frames,
            capture: None,
            capture_channels: 0,
            realtime_priority: None,
            prepared: false,
            failing: false,
        }
    }

    pub fn with_capture(mut self, consumer: Consumer<f32>, channels: usize) -> Self {
        self.capture = Some(consumer);
        self.capture_channels = channels.max(1);
        self
    }

    pub fn with_realtime_priority(mut self, priority: Option<i32>) -> Self {
        self.realtime_priority = priority;
        self
    }

    /// Transport frame the next cycle will report.
    #[cfg(test)]
    fn next_frame(&self) -> u64 {
        self.cycle.transport.frame
    }

    /// Fills one interleaved device buffer with `channels` channels.
    /// Port `output-<n>` feeds device channel `n`; other channels are silent.
    pub fn render<T>(&mut self, output: &mut [T], channels: usize)
    where
        T: Sample + FromSample<f32>,
    {
        if !self.prepared {
            self.prepare_thread();
        }
        for frame in output.chunks_mut(channels.max(1)) {
            if self.cursor >= self.frames {
                self.run_cycle();
            }
            for (ch, sample) in frame.iter_mut().enumerate() {
                let value = self
                    .cycle
                    .outputs
                    .get(ch)
                    .map_or(0.0, |port| port[self.cursor]);
                *sample = T::from_sample(value);
            }
            self.cursor += 1;
        }
    }

    fn prepare_thread(&mut self) {
        self.prepared = true;
        rt::enable_denormal_kill_once();
        if let Some(priority) = self.realtime_priority {
            if let Err(err) = rt::promote_current_thread(priority) {
                warn!(?err, priority, "failed to apply realtime priority");
            }
        }
    }

    fn run_cycle(&mut self) {
        self.pull_capture();
        match self.collector.process(&mut self.cycle) {
            Ok(_) if self.failing => {
                info!("driver answering again");
                self.failing = false;
            }
            Ok(_) => {}
            Err(err) => {
                if !self.failing {
                    warn!(%err, "bridge cycle failed; output silenced");
                }
                self.failing = true;
            }
        }
        self.cycle.transport.frame += self.frames as u64;
        self.cursor = 0;
    }

    /// Capture channel `n` feeds port `input-<n>`; an underrun yields silence.
    fn pull_capture(&mut self) {
        let Some(consumer) = self.capture.as_mut() else {
            return;
        };
        let channels = self.capture_channels;
        if consumer.slots() < self.frames * channels {
            for port in &mut self.cycle.inputs {
                port.fill(0.0);
            }
            return;
        }
        for frame in 0..self.frames {
            for ch in 0..channels {
                let value = consumer.pop().unwrap_or(0.0);
                if let Some(port) = self.cycle.inputs.get_mut(ch) {
                    port[frame] = value;
                }
            }
        }
    }
}

fn push_capture<T>(input: &[T], producer: &mut Producer<f32>)
where
    T: Sample,
    f32: FromSample<T>,
{
    for &sample in input {
        if producer.push(sample.to_sample::<f32>()).is_err() {
            break;
        }
    }
}

/// Open device streams driving one bridge session.
pub struct AudioServer {
    output: cpal::Stream,
    capture: Option<cpal::Stream>,
    device_name: String,
}

impl AudioServer {
    pub fn start<S>(
        collector: CollectorBridge<S>,
        params: StreamParams,
        options: &ServerOptions,
        events: Sender<ServerEvent>,
    ) -> anyhow::Result<Self>
    where
        S: Semaphore + 'static,
    {
        let host = cpal::default_host();
        let device = select_output_device(&host, options.device.as_deref())
            .context("failed to select output device")?;
        let device_name = device
            .name()
            .unwrap_or_else(|_| "unknown device".to_string());

        let supported = select_config(
            device.supported_output_configs()?,
            params.sample_rate,
        )
        .or_else(|_| device.default_output_config().map_err(anyhow::Error::from))
        .context("output device does not expose a compatible configuration")?;
        let mut stream_config: StreamConfig = supported.config();
        stream_config.buffer_size = BufferSize::Fixed(params.buffer_frames);
        if stream_config.sample_rate.0 != params.sample_rate {
            anyhow::bail!(
                "device {device_name} runs at {} Hz, bridge session needs {} Hz",
                stream_config.sample_rate.0,
                params.sample_rate
            );
        }

        let mut pump = BridgePump::new(collector, params)
            .with_realtime_priority(options.realtime_priority);

        let capture = if options.capture && params.inputs > 0 {
            match open_capture(&host, options.capture_device.as_deref(), params, events.clone()) {
                Ok((stream, consumer, channels)) => {
                    pump = pump.with_capture(consumer, channels);
                    Some(stream)
                }
                Err(err) => {
                    warn!(?err, "capture unavailable; input ports stay silent");
                    None
                }
            }
        } else {
            None
        };

        let output = build_output_stream(
            &device,
            &stream_config,
            supported.sample_format(),
            pump,
            events,
        )?;
        output.play().context("failed to start output stream")?;
        if let Some(stream) = &capture {
            stream.play().context("failed to start capture stream")?;
        }

        info!(
            device = %device_name,
            channels = stream_config.channels,
            frames = params.buffer_frames,
            rate = params.sample_rate,
            "audio server running"
        );

        Ok(Self {
            output,
            capture,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn shutdown(self) -> anyhow::Result<()> {
        if let Some(capture) = &self.capture {
            capture.pause()?;
        }
        self.output.pause()?;
        debug!("audio streams paused");
        Ok(())
    }
}

fn select_output_device(
    host: &cpal::Host,
    selection: Option<&str>,
) -> anyhow::Result<cpal::Device> {
    if let Some(target) = selection {
        if let Ok(devices) = host.output_devices() {
            for device in devices {
                if device.name().map(|name| name == target).unwrap_or(false) {
                    return Ok(device);
                }
            }
        }
        warn!(device = target, "output device not found; using default");
    }

    host.default_output_device()
        .or_else(|| host.output_devices().ok().and_then(|mut list| list.next()))
        .ok_or_else(|| anyhow!("no output device available"))
}

fn select_input_device(host: &cpal::Host, selection: Option<&str>) -> anyhow::Result<cpal::Device> {
    if let Some(target) = selection {
        if let Ok(devices) = host.input_devices() {
            for device in devices {
                if device.name().map(|name| name == target).unwrap_or(false) {
                    return Ok(device);
                }
            }
        }
        warn!(device = target, "capture device not found; using default");
    }

    host.default_input_device()
        .or_else(|| host.input_devices().ok().and_then(|mut list| list.next()))
        .ok_or_else(|| anyhow!("no capture device available"))
}

fn select_config<I>(configs: I, sample_rate: u32) -> anyhow::Result<cpal::SupportedStreamConfig>
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    let desired = cpal::SampleRate(sample_rate);
    configs
        .into_iter()
        .find(|config| config.min_sample_rate() <= desired && config.max_sample_rate() >= desired)
        .map(|config| config.with_sample_rate(desired))
        .ok_or_else(|| anyhow!("no configuration supports {sample_rate} Hz"))
}

fn open_capture(
    host: &cpal::Host,
    selection: Option<&str>,
    params: StreamParams,
    events: Sender<ServerEvent>,
) -> anyhow::Result<(cpal::Stream, Consumer<f32>, usize)> {
    let device = select_input_device(host, selection)?;
    let supported = select_config(device.supported_input_configs()?, params.sample_rate)?;
    let mut config: StreamConfig = supported.config();
    config.buffer_size = BufferSize::Fixed(params.buffer_frames);
    let channels = usize::from(config.channels).max(1);

    let (producer, consumer) = RingBuffer::new(params.frames() * channels * CAPTURE_PERIODS);
    let stream = build_input_stream(&device, &config, supported.sample_format(), producer, events)?;
    debug!(
        device = %device.name().unwrap_or_default(),
        channels,
        "capture stream opened"
    );
    Ok((stream, consumer, channels))
}

fn error_callback(events: Sender<ServerEvent>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        tracing::error!(?err, "audio stream error");
        let _ = events.try_send(ServerEvent::StreamError(err.to_string()));
    }
}

fn build_output_stream<S>(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    mut pump: BridgePump<S>,
    events: Sender<ServerEvent>,
) -> anyhow::Result<cpal::Stream>
where
    S: Semaphore + 'static,
{
    let channels = usize::from(config.channels);
    let err_fn = error_callback(events);

    match sample_format {
        SampleFormat::F32 => Ok(device.build_output_stream(
            config,
            move |output: &mut [f32], _| pump.render(output, channels),
            err_fn,
            None,
        )?),
        SampleFormat::I16 => Ok(device.build_output_stream(
            config,
            move |output: &mut [i16], _| pump.render(output, channels),
            err_fn,
            None,
        )?),
        SampleFormat::I32 => Ok(device.build_output_stream(
            config,
            move |output: &mut [i32], _| pump.render(output, channels),
            err_fn,
            None,
        )?),
        other => Err(anyhow!("unsupported output sample format: {other:?}")),
    }
}

fn build_input_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    producer: Producer<f32>,
    events: Sender<ServerEvent>,
) -> anyhow::Result<cpal::Stream> {
    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut producer: Producer<f32>,
        events: Sender<ServerEvent>,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        Ok(device.build_input_stream(
            config,
            move |input: &[T], _| push_capture(input, &mut producer),
            error_callback(events),
            None,
        )?)
    }

    match sample_format {
        SampleFormat::F32 => build::<f32>(device, config, producer, events),
        SampleFormat::I16 => build::<i16>(device, config, producer, events),
        SampleFormat::I32 => build::<i32>(device, config, producer, events),
        other => Err(anyhow!("unsupported capture sample format: {other:?}")),
    }
}

/// Prints every device the default host exposes.
pub fn list_devices() -> anyhow::Result<()> {
    let host = cpal::default_host();
    println!("host: {}", host.id().name());
    for device in host.output_devices()? {
        println!("  output: {}", device.name().unwrap_or_default());
    }
    for device in host.input_devices()? {
        println!("  input:  {}", device.name().unwrap_or_default());
    }
    Ok(())
}
