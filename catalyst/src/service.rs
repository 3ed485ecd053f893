use std::time::Duration;

use anyhow::Context as _;
use catalyst::config::ConfHandle;
use catalyst::graphite::GraphiteListener;
use catalyst::{AppState, log, metrics};
use tokio::net::TcpListener;
use tokio::runtime::{self, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const SERVICE_NAME: &str = "catalyst";

enum ServiceState {
    Stopped,
    Running {
        shutdown_tx: watch::Sender<bool>,
        runtime: Runtime,
        tasks: Vec<JoinHandle<anyhow::Result<()>>>,
    },
}

pub struct CatalystService {
    conf_handle: ConfHandle,
    state: ServiceState,
}

impl CatalystService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        log::init(conf.log_directive.as_deref()).context("failed to set up the logger")?;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            hostname = %conf.hostname,
            "{SERVICE_NAME} starting"
        );

        if conf.dryrun {
            warn!("dryrun mode: request bodies are echoed and nothing reaches the sink");
        }

        metrics::register();

        Ok(Self {
            conf_handle,
            state: ServiceState::Stopped,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build the async runtime")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // binding happens inside the runtime
        let tasks = runtime.block_on(spawn_tasks(self.conf_handle.clone(), shutdown_rx))?;

        info!("{SERVICE_NAME} started");

        self.state = ServiceState::Running {
            shutdown_tx,
            runtime,
            tasks,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, ServiceState::Stopped) {
            ServiceState::Stopped => {
                info!("attempted to stop the service, but it is already stopped");
            }
            ServiceState::Running {
                shutdown_tx,
                runtime,
                tasks,
            } => {
                info!("stopping {SERVICE_NAME}");

                let _ = shutdown_tx.send(true);

                runtime.block_on(async {
                    tokio::select! {
                        results = futures::future::join_all(tasks) => {
                            for result in results {
                                match result {
                                    Ok(Ok(())) => {}
                                    Ok(Err(error)) => error!(error = format!("{error:#}"), "a task failed"),
                                    Err(error) => error!(%error, "a task panicked"),
                                }
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("some tasks did not terminate in time");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));
            }
        }
    }
}

async fn spawn_tasks(
    conf_handle: ConfHandle,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<Vec<JoinHandle<anyhow::Result<()>>>> {
    let conf = conf_handle.get_conf();
    let state = AppState::new(conf.clone())?;

    let mut tasks = Vec::new();

    let http_listener = TcpListener::bind(conf.listen)
        .await
        .with_context(|| format!("failed to bind {}", conf.listen))?;
    info!(addr = %conf.listen, "HTTP listener started");

    let app = catalyst::make_http_service(state.clone());
    let mut http_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        axum::serve(http_listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .context("HTTP server failure")
    }));

    let metrics_listener = TcpListener::bind(conf.metrics_listen)
        .await
        .with_context(|| format!("failed to bind {}", conf.metrics_listen))?;
    info!(addr = %conf.metrics_listen, "metrics listener started");

    let metrics_app = catalyst::make_metrics_service();
    let mut metrics_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_app)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .context("metrics server failure")
    }));

    let graphite = GraphiteListener::bind(conf.graphite_listen, conf.graphite_parse, state.warp.clone()).await?;
    let mut graphite_shutdown = shutdown_rx;
    tasks.push(tokio::spawn(async move {
        tokio::select! {
            result = graphite.run() => result,
            _ = graphite_shutdown.wait_for(|stop| *stop) => Ok(()),
        }
    }));

    Ok(tasks)
}
