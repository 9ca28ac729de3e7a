//! Runs the Foo controller against the configured cluster
use clap::Parser;
use sample_controller::{config::Args, signals::Lifecycle, Controller};
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.init_tracing();

    let lifecycle = Lifecycle::new();
    lifecycle.install_signal_handler()?;

    let client = args
        .client()
        .await
        .inspect_err(|error| error!(%error, "Error building kubernetes client"))?;

    Controller::new(client)
        .run(lifecycle.token(), args.settings())
        .await
        .inspect_err(|error| error!(%error, "Error running controller"))?;
    Ok(())
}
