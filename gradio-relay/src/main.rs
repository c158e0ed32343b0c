use tracing::info;

mod config;
mod console;
mod context;
mod error;
mod gradio;
mod imagegen;
mod service;
mod textgen;

use crate::service::RelayService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!("Starting gradio relay v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config()?;
    info!(
        textgen_host = %config.textgen.host,
        image_host = %config.image.host,
        conversation_id = %config.console.conversation_id,
        "Configuration loaded"
    );

    let console_config = config.console.clone();
    let service = RelayService::new(config)?;

    console::run(&service, &console_config).await?;

    info!("Shutting down");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gradio_relay=info"));

    // Logs go to stderr so replies on stdout stay readable
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .event_format(format)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}
