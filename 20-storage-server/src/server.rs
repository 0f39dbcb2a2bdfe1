use std::{future::Future, io, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    select,
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    config::{FramingConfig, ServerMode, Settings},
    dispatcher::Dispatcher,
    endpoint::{Endpoint, Listener},
    host::{Clock, Notifier},
    store::Store,
};

/// Single-connection storage server.
///
/// Connections are served strictly one after another: accept, receive one
/// request, dispatch, reply, then go back to accepting. The abort signal is
/// only observed between requests.
pub struct Server {
    listener: Listener,
    dispatcher: Dispatcher,
    mode: ServerMode,
    idle_timeout: Duration,
    framing: FramingConfig,
}

/// Summary returned when the loop exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerReport {
    pub requests_served: u64,
}

impl Server {
    pub fn new(
        listener: Listener,
        dispatcher: Dispatcher,
        mode: ServerMode,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            dispatcher,
            mode,
            idle_timeout,
            framing: FramingConfig::default(),
        }
    }

    /// Opens the store and binds the endpoint described by `settings`.
    ///
    /// A bind failure is surfaced to the user through `notifier` before the
    /// error is returned.
    pub async fn bind(
        settings: &Settings,
        mode: ServerMode,
        clock: Arc<dyn Clock>,
        notifier: &dyn Notifier,
    ) -> Result<Self> {
        let database = settings.database_path();
        let store = Store::open(&database)
            .with_context(|| format!("failed to open store at {}", database.display()))?;

        let endpoint = settings.endpoint();
        let listener = match endpoint.bind().await {
            Ok(listener) => listener,
            Err(error) => {
                notifier.notify(
                    "Storage server",
                    &format!("could not listen on {endpoint}: {error}"),
                );
                return Err(error).with_context(|| format!("failed to bind {endpoint}"));
            }
        };

        Ok(Self::new(
            listener,
            Dispatcher::new(store, clock),
            mode,
            settings.idle_timeout(),
        ))
    }

    pub fn with_framing(mut self, framing: FramingConfig) -> Self {
        self.framing = framing;
        self
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.listener.local_endpoint()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<ServerReport>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            mut dispatcher,
            mode,
            idle_timeout,
            framing,
        } = self;
        tokio::pin!(shutdown);

        let endpoint = listener.local_endpoint()?;
        info!(%endpoint, ?mode, started_at = dispatcher.started_at(), "storage server starting");

        let mut report = ServerReport::default();
        let mut idle_since = Instant::now();
        let mut asleep = false;

        loop {
            let idle_deadline = idle_since + idle_timeout;
            select! {
                _ = &mut shutdown => {
                    info!("abort requested");
                    break;
                }
                accepted = listener.accept() => {
                    if asleep {
                        info!(slept_secs = idle_since.elapsed().as_secs(), "waking up");
                        asleep = false;
                    }
                    handle_accept_result(accepted, &mut dispatcher, &framing, &mut report).await;
                    idle_since = Instant::now();
                }
                _ = sleep_until(idle_deadline), if !asleep => {
                    let idle_secs = idle_timeout.as_secs_f64();
                    match mode {
                        ServerMode::Instance => {
                            info!(idle_secs, "idle; shutting down");
                            break;
                        }
                        ServerMode::Daemon => {
                            info!(idle_secs, "idle; going to sleep");
                            asleep = true;
                        }
                    }
                }
            }
        }

        info!(requests = report.requests_served, "closing down");
        listener.close();
        Ok(report)
    }

    pub async fn run_until_ctrl_c(self) -> Result<ServerReport> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: io::Result<crate::endpoint::Stream>,
    dispatcher: &mut Dispatcher,
    framing: &FramingConfig,
    report: &mut ServerReport,
) {
    match result {
        Ok(mut stream) => match dispatcher.serve(&mut stream, framing).await {
            Ok(()) => {
                report.requests_served += 1;
                debug!(served = report.requests_served, "request done");
            }
            Err(error) => warn!(%error, "request abandoned"),
        },
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

/// Owner-side handle of a server running on a background task.
pub struct ServerHandle {
    endpoint: Endpoint,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<ServerReport>>,
}

impl ServerHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the loop to stop after the current request and waits for it.
    pub async fn shutdown(self) -> Result<ServerReport> {
        let _ = self.shutdown.send(());
        self.task.await.context("server task panicked")?
    }

    /// Waits for the loop to end on its own, e.g. an instance going idle.
    pub async fn join(self) -> Result<ServerReport> {
        let ServerHandle { shutdown, task, .. } = self;
        let report = task.await.context("server task panicked")?;
        drop(shutdown);
        report
    }
}

/// Runs `server` on a background task and hands back the task's owner handle.
pub fn spawn_server(server: Server) -> io::Result<ServerHandle> {
    let endpoint = server.local_endpoint()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async move {
        if shutdown_rx.await.is_err() {
            std::future::pending::<()>().await;
        }
    }));

    Ok(ServerHandle {
        endpoint,
        shutdown: shutdown_tx,
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::ManualClock,
        message::{Request, Response},
        transport::{recv_message, send_message},
    };

    async fn loopback_server(mode: ServerMode, idle: Duration) -> Server {
        let listener = Endpoint::loopback(0).bind().await.expect("bind");
        let dispatcher = Dispatcher::new(
            Store::in_memory().expect("store"),
            Arc::new(ManualClock::new(1000.0)),
        );
        Server::new(listener, dispatcher, mode, idle)
    }

    async fn exchange(endpoint: &Endpoint, request: &Request) -> Option<Response> {
        let framing = FramingConfig::default();
        let mut stream = endpoint.connect().await.expect("connect");
        send_message(&mut stream, &request.encode().expect("encode"), &framing)
            .await
            .expect("send");
        recv_message(&mut stream, &framing)
            .await
            .ok()
            .map(|raw| Response::decode(&raw).expect("decode"))
    }

    #[tokio::test]
    async fn serves_connections_in_turn_until_shut_down() {
        let server = loopback_server(ServerMode::Daemon, Duration::from_secs(60)).await;
        let handle = spawn_server(server).expect("spawn");
        let endpoint = handle.endpoint().clone();

        let set = Request::Set {
            table: "t".into(),
            name: "k".into(),
            data: "v".into(),
        };
        assert_eq!(exchange(&endpoint, &set).await, None);
        let get = Request::Get {
            table: "t".into(),
            name: "k".into(),
        };
        assert_eq!(exchange(&endpoint, &get).await, Some(Response::Text("v".into())));

        let report = handle.shutdown().await.expect("shutdown");
        assert_eq!(report.requests_served, 2);
    }

    #[tokio::test]
    async fn instance_exits_once_idle() {
        let server = loopback_server(ServerMode::Instance, Duration::from_millis(200)).await;
        let started = std::time::Instant::now();
        let report = spawn_server(server)
            .expect("spawn")
            .join()
            .await
            .expect("join");
        assert_eq!(report.requests_served, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn daemon_sleeps_instead_of_exiting() {
        let server = loopback_server(ServerMode::Daemon, Duration::from_millis(50)).await;
        let handle = spawn_server(server).expect("spawn");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        let lock = Request::Lock {
            table: "t".into(),
            name: "job".into(),
        };
        assert_eq!(
            exchange(handle.endpoint(), &lock).await,
            Some(Response::flag(true))
        );
        handle.shutdown().await.expect("shutdown");
    }
}
