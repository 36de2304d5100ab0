use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bifrost::config::DnsConfig;
use bifrost::forward::Forward;
use bifrost::metrics::DnsMetrics;
use bifrost::server::socket::{bind_udp_socket, SocketOpts};
use bifrost::server::{serve_udp, UdpServerOpts};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first to get runtime settings.
    let config = DnsConfig::from_env();

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    if config.worker_threads > 0 {
        runtime_builder.worker_threads(config.worker_threads);
    }

    let runtime = runtime_builder
        .enable_all()
        .thread_name("bifrost-worker")
        .build()?;

    runtime.block_on(async_main(config))
}

async fn async_main(config: DnsConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bifrost=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("bifrost starting up");
    info!("bind address: {}", config.bind_addr);
    info!("upstreams: {}", config.upstreams.join(", "));

    let metrics = DnsMetrics::new();
    let forward = Arc::new(Forward::from_config(&config, &metrics)?);
    info!("forwarding to {} upstreams", forward.upstream_count());

    let socket_opts = SocketOpts {
        reuse_port: config.reuse_port,
        recv_buffer_size: config.recv_buffer_size,
        send_buffer_size: config.send_buffer_size,
    };
    let socket = bind_udp_socket(config.bind_addr, &socket_opts)?;

    let server_opts = UdpServerOpts {
        worker_pool_size: config.worker_pool_size,
        cpu_affinity: config.cpu_affinity,
    };

    tokio::select! {
        result = serve_udp(socket, forward, server_opts) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    info!("bifrost stopped");
    Ok(())
}
