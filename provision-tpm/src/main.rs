use std::process::ExitCode;

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod cli;
mod console;
mod provision;

use provision_device as device;
use provision_security as security;
use provision_service as service;
use provision_util as util;

use crate::provision::ExitStatus;

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,hyper=error,rustls=warn,rumqttc=warn")
            }),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::CLOSE)
                .event_format(fmt::format().compact().with_target(false).without_time()),
        )
        .init();
}

// The TPM context is not Send, so everything runs on the main thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version come through here too
            let status = if err.use_stderr() {
                ExitStatus::InvalidArguments
            } else {
                ExitStatus::Success
            };
            let _ = err.print();
            return status.into();
        }
    };

    initialize_tracing();

    provision::run(cli).await.into()
}
