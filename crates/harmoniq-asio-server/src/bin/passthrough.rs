//! Minimal host: attaches to a running bridge server and routes every input
//! channel to the output channel with the same index.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use harmoniq_asio_bridge::{
    AsioDriver, BridgeConfig, BufferRequest, HostBuffers, HostCallbacks, MessageSelector,
};
use tracing_subscriber::EnvFilter;

struct PassThrough;

impl HostCallbacks for PassThrough {
    fn buffer_switch(&mut self, buffers: &mut HostBuffers<'_>, _direct_process: bool) {
        for ch in 0..buffers.input_count().min(buffers.output_count()) {
            if let Some((src, dst)) = buffers.io_mut(ch, ch) {
                dst.copy_from_slice(src);
            }
        }
    }

    fn message(&mut self, selector: MessageSelector, _value: i64) -> i64 {
        match selector {
            MessageSelector::SelectorSupported | MessageSelector::EngineVersion => 1,
            _ => 0,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = BridgeConfig::from_env()?;
    let mut driver = AsioDriver::init(&config).context("is harmoniq-asio-server running?")?;

    let (inputs, outputs) = driver.channels();
    let requests: Vec<BufferRequest> = (0..i64::from(inputs))
        .map(BufferRequest::input)
        .chain((0..i64::from(outputs)).map(BufferRequest::output))
        .collect();
    let (input_latency, output_latency) = driver.latencies();
    tracing::info!(
        driver = driver.driver_name(),
        inputs,
        outputs,
        input_latency,
        output_latency,
        rate = driver.sample_rate(),
        "driver ready"
    );

    let frames = driver.buffer_size().preferred;
    driver.create_buffers(&requests, frames, Some(Box::new(PassThrough)))?;
    driver.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }

    let (position, _) = driver.sample_position();
    tracing::info!(position = position.to_u64(), "stopping pass-through");
    driver.stop()?;
    driver.dispose_buffers()?;
    driver.shutdown();
    Ok(())
}
