//! Echo server.
//!
//! ```text
//! RUST_LOG=debug cargo run -p srpc-server --example echo
//! ```

use srpc_server::{MethodError, RpcServer, ServerConfig, Service, ServiceRegistry};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    let services = ServiceRegistry::new().with(
        Service::builder("Echo")
            .typed("say", &["string"], |(text,): (String,)| async move {
                Ok::<_, MethodError>(text)
            })
            .typed("repeat", &["string", "int"], |(text, times): (String, usize)| async move {
                if times > 1024 {
                    return Err(MethodError::new("too many repetitions"));
                }
                Ok(text.repeat(times))
            })
            .build(),
    );

    let handle = RpcServer::new(config, services).bind().await?;
    tracing::info!(addr = %handle.local_addr(), "echo server ready, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}
