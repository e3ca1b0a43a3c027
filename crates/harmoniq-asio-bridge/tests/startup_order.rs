#![cfg(target_os = "linux")]

use std::fs;
use std::path::Path;

use harmoniq_asio_bridge::layout::StreamParams;
use harmoniq_asio_bridge::shm::{ControlSegment, SampleSegment};
use harmoniq_asio_bridge::{AsioDriver, BridgeConfig, BridgeError, ErrorKind, ServerSession};

fn config(dir: &Path, test: &str) -> BridgeConfig {
    BridgeConfig {
        name_prefix: format!("harmoniq-startup-{test}-{}", std::process::id()),
        shm_dir: dir.to_path_buf(),
        poll_interval_ms: 5,
        ..BridgeConfig::default()
    }
}

fn entries(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

#[test]
fn driver_before_server_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "none");

    let err = AsioDriver::init(&config).err().unwrap();
    assert!(matches!(err, BridgeError::ControlSegmentUnavailable { .. }));
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_eq!(entries(dir.path()), 0);
}

#[test]
fn missing_sample_segment_is_reported_separately() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "samples");
    let paths = config.paths();
    let params = StreamParams::new(8, 8, 256, 48_000);
    let _control = ControlSegment::create(&paths.control, &params).unwrap();

    let err = AsioDriver::init(&config).err().unwrap();
    assert!(matches!(err, BridgeError::SampleSegmentUnavailable { .. }));
    assert!(!paths.samples.exists());
    assert_eq!(entries(dir.path()), 1);
}

#[test]
fn missing_semaphores_are_reported_separately() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "sems");
    let paths = config.paths();
    let params = StreamParams::new(2, 2, 64, 48_000);
    let _control = ControlSegment::create(&paths.control, &params).unwrap();
    let _samples = SampleSegment::create(&paths.samples, params).unwrap();

    let err = AsioDriver::init(&config).err().unwrap();
    assert!(matches!(err, BridgeError::SemaphoreUnavailable { .. }));
    assert_eq!(entries(dir.path()), 2);
}

#[test]
fn server_first_then_driver_attaches() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), "ordered");
    let params = StreamParams::new(8, 8, 256, 48_000);

    let (mut session, collector) = ServerSession::create(&config, params).unwrap();
    session.activate();

    let driver = AsioDriver::init(&config).unwrap();
    assert_eq!(driver.channels(), (8, 8));
    assert_eq!(driver.sample_rate(), 48_000.0);

    driver.shutdown();
    assert!(!collector.control().block().is_running());
    assert!(!session.paths().control.exists());
    session.close();
}
