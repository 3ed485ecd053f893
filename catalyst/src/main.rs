#[macro_use]
extern crate tracing;

mod service;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use catalyst::config::ConfHandle;

use crate::service::CatalystService;

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<Utf8PathBuf> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("missing value for --config")?;
                config_path = Some(Utf8PathBuf::from(path));
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            unexpected => anyhow::bail!("unexpected argument: {unexpected}"),
        }
    }

    let conf_handle = ConfHandle::init(config_path.as_deref()).context("unable to initialize configuration")?;

    let mut service = CatalystService::load(conf_handle).context("service loading failed")?;

    service.start().context("failed to start")?;

    // Wait for some stop signal (CTRL-C, SIGTERM…)
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the signal runtime")?;
    rt.block_on(build_signals_fut())?;

    service.stop();

    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_help() {
    println!(
        r#"Catalyst, a multi-protocol metrics ingestion proxy.

USAGE:
    catalyst [--config <CONFIG_PATH>]

OPTIONS:
    --config <CONFIG_PATH>   configuration file to use
    -h, --help               display this help
"#
    );
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
