use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use tally_log::{Level, LogConfig, LogFormat};
use tally_metrics::{Metrics, MetricsConfig, Registry, Unit};

#[test]
fn test_engine_after_log_init() {
    let log_config = LogConfig {
        level: Level::Debug,
        format: LogFormat::Json,
        ..LogConfig::default()
    };
    tally_log::init(&log_config);
    // A second initialization keeps the installed subscriber.
    tally_log::init(&log_config);

    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let registry = Registry::new();
    let def = registry
        .counter("service.started", "", Unit::Unit, &[])
        .unwrap();

    let config = MetricsConfig {
        host: format!("udp://{}", server.local_addr().unwrap()),
        flush_interval_ms: 3_600_000,
        ..MetricsConfig::default()
    };
    let metrics = Metrics::new(&config, Arc::new(registry)).unwrap();
    tally_log::info!(host = %config.host, "metrics engine started");

    metrics.counter(&def.resolve()).add(1);
    metrics.flush();

    let mut buf = [0; 1500];
    let len = server.recv(&mut buf).unwrap();
    let frame = std::str::from_utf8(&buf[..len]).unwrap();
    assert!(
        frame.lines().any(|line| line == "service.started:1|c|@1"),
        "unexpected frame: {frame:?}"
    );
}
