use std::collections::BTreeMap;
use std::env;
use std::future::Future;
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::pin::Pin;

use anyhow::{Context, Result};
use stampede_service::config::{Config as ServiceConfig, Metrics};
use stampede_service::{logging, metrics};

#[derive(Debug, Default)]
pub struct Config {
    pub sentry: bool,
    pub tracing: bool,
    /// Print logs the way the service config asks for, instead of discarding them.
    pub verbose: bool,
    pub metrics: bool,
}

#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
    pub udp_sink: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// Sets up all the reporting machinery, so the stresstest pays for it like production does.
///
/// # Safety
/// This modifies the environment, so it may only be called while the process is single-threaded.
pub unsafe fn init(config: Config, service_config: &ServiceConfig) -> Result<Guard> {
    let mut guard = Guard::default();

    if config.sentry {
        // events only leave the process if `SENTRY_DSN` is set
        guard._sentry = Some(sentry::init(sentry::ClientOptions {
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        }));
    }

    if config.tracing {
        if config.verbose {
            // SAFETY: As documented, this function may only be called in a single-threaded context.
            unsafe { logging::init_logging(service_config) };
        } else {
            if service_config.logging.enable_backtraces {
                // SAFETY: As documented, this function may only be called in a single-threaded context.
                unsafe { env::set_var("RUST_BACKTRACE", "1") };
            }
            // we want all the tracing machinery to be active, but not spam the console,
            // so redirect everything into the void:
            let level = service_config.logging.level.to_string();
            logging::init_json_logging(&level, || NoopWriter);
        }
    }

    if config.metrics {
        let host = match &service_config.metrics.statsd {
            Some(host) => host.clone(),
            None => {
                let addr = SocketAddr::from(([127, 0, 0, 1], 0));
                let listener = UdpSocket::bind(addr).context("failed to bind metrics sink")?;
                listener.set_nonblocking(true)?;
                let socket = listener.local_addr()?;

                guard.udp_sink = Some(Box::pin(async move {
                    let Ok(listener) = tokio::net::UdpSocket::from_std(listener) else {
                        return;
                    };
                    let mut buf = Vec::with_capacity(1024);
                    loop {
                        buf.clear();
                        if listener.recv_buf(&mut buf).await.is_err() {
                            break;
                        }
                    }
                }));

                format!("127.0.0.1:{}", socket.port())
            }
        };

        let metrics_config = &service_config.metrics;
        metrics::configure_statsd(&metrics_config.prefix, host, stresstest_tags(metrics_config))?;
    }

    Ok(guard)
}

/// The configured tags, with some defaults to be closer to the real world config.
fn stresstest_tags(config: &Metrics) -> BTreeMap<String, String> {
    let mut tags = config.tags();
    tags.entry("host".into()).or_insert_with(|| "stresstest".into());
    tags.entry("env".into()).or_insert_with(|| "stresstest".into());
    tags
}

struct NoopWriter;
impl Write for NoopWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        // try to prevent the compiler from optimizing away all the formatting code:
        let buf = std::hint::black_box(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
