use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    client_listener::run_listener,
    client_sender::run_sender,
    connection::Connection,
    context::ServerContext,
    events::LifecycleEvent,
    rate_limit::ConnectionThrottle,
    registry::{self, RegistryRequest},
    replies,
    result::Result,
};

// how long a closing connection gets to flush its last lines
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// A running server: the registry actor plus the shutdown signal every
/// connection listens to. Streams are handed in through `connect`, so
/// anything that reads and writes bytes can be a client.
pub struct Server {
    context: Arc<ServerContext>,
    registry: mpsc::Sender<RegistryRequest>,
    registry_task: JoinHandle<Result<()>>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    pub fn start(context: ServerContext) -> Self {
        let context = Arc::new(context);
        let (shutdown, _) = broadcast::channel(1);
        let (registry, registry_task) = registry::spawn(context.clone(), shutdown.subscribe());

        Server {
            context,
            registry,
            registry_task,
            shutdown,
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Serves one client over `stream` until it disconnects.
    /// `certificate` is the fingerprint of a verified client certificate,
    /// when the transport has one.
    pub fn connect<S>(
        &self,
        stream: S,
        client_host: &str,
        certificate: Option<String>,
    ) -> JoinHandle<Result<()>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let context = self.context.clone();
        let registry = self.registry.clone();
        let shutdown = self.shutdown.subscribe();
        let client_host = client_host.to_string();

        tokio::spawn(async move {
            let (reader, writer) = tokio::io::split(stream);
            let (outbound_tx, mut outbound) = mpsc::channel(context.settings.limits.outbound_queue);

            let (connection, events) =
                Connection::new(context.clone(), registry, &client_host, outbound_tx.clone());
            let connection = connection.with_certificate(certificate);
            let connection_id = connection.id();

            context.events.publish(LifecycleEvent::ConnectionOpened {
                connection_id,
                host: client_host,
            });

            let mut writer_task = tokio::spawn(async move { run_sender(writer, &mut outbound).await });
            let result = run_listener(reader, connection, events, outbound_tx, context, shutdown).await;

            match timeout(WRITER_GRACE, &mut writer_task).await {
                Ok(Ok(Err(error))) => debug!(%connection_id, %error, "writer stopped"),
                Ok(Err(error)) => warn!(%connection_id, %error, "writer task failed"),
                Err(_) => {
                    // a client that stopped reading would hold the socket forever
                    debug!(%connection_id, "writer did not flush in time");
                    writer_task.abort();
                }
                Ok(Ok(Ok(()))) => {}
            }

            result
        })
    }

    /// Accepts TCP clients until shutdown, throttling per remote address.
    pub async fn listen(&self, listener: TcpListener) -> Result<()> {
        let mut throttle = ConnectionThrottle::new(&self.context.settings.flood);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.recv() => return Ok(()),
            };

            let (stream, address) = match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };

            let now = Instant::now();
            throttle.prune(now);
            if !throttle.allow(address.ip(), now) {
                info!(%address, "throttling connection");
                tokio::spawn(reject(stream, address));
                continue;
            }

            debug!(%address, "accepted connection");
            self.connect(stream, &address.ip().to_string(), None);
        }
    }

    /// Tells every connection and the registry to stop, then waits for the
    /// registry to finish.
    pub async fn shutdown(self) -> Result<()> {
        // nobody listening just means nothing is connected
        let _ = self.shutdown.send(());

        match self.registry_task.await {
            Ok(result) => result,
            Err(error) => {
                warn!(%error, "registry task failed");
                Ok(())
            }
        }
    }
}

async fn reject(mut stream: TcpStream, address: SocketAddr) {
    let line = replies::error("Too many connections").encode();
    if let Err(error) = stream.write_all(&line).await {
        debug!(%address, %error, "could not send rejection");
    }
    let _ = stream.shutdown().await;
}
