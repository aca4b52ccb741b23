//! Remote command server.
//!
//! One listener per configured port; each accepted client gets its own task that reads request
//! lines and forwards them to the panel through a [`PanelHandle`]. Failed commands are
//! answered with `Error: <message>` and reported under the socket source, and the session
//! stays open. Clients are dropped on `Close`, on [`RpcServer::force_disconnect`], and at
//! shutdown.

use crate::error::{AppResult, PanelError};
use crate::panel::PanelHandle;
use crate::reporter::{ErrorReporter, ErrorSource};
use crate::rpc::protocol::{self, RpcRequest, SUCCESS};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Shared {
    panel: PanelHandle,
    reporter: Arc<ErrorReporter>,
    clients: AtomicUsize,
}

impl Shared {
    async fn dispatch(&self, request: RpcRequest, port: u16) -> String {
        if request.printout() {
            info!("Received command on port {}: {}", port, request);
        }
        let command = request.command();
        let result = match request {
            RpcRequest::Get {
                widget_nickname,
                field_name,
                ..
            } => self.panel.get_field(&widget_nickname, &field_name).await,
            RpcRequest::Set {
                widget_nickname,
                field_name,
                new_value,
                ..
            } => self
                .panel
                .set_field(&widget_nickname, &field_name, &new_value, false)
                .await
                .map(|()| SUCCESS.to_string()),
            RpcRequest::Confirm {
                widget_nickname, ..
            } => self
                .panel
                .confirm(&widget_nickname)
                .await
                .map(|()| SUCCESS.to_string()),
            RpcRequest::Eval { code, .. } => self.panel.eval(&code).await,
            RpcRequest::Exec { code, .. } => self.panel.exec(&code).await,
            RpcRequest::Close => Ok(String::new()),
        };

        match result {
            Ok(value) => value,
            Err(e) => {
                let response = protocol::error_response(&e);
                self.reporter.report(
                    ErrorSource::Socket,
                    Some(&format!("port {}", port)),
                    &anyhow::Error::new(e).context(format!("{} request failed", command)),
                );
                response
            }
        }
    }
}

/// Running server. Dropping it closes the listeners and clients without waiting for them.
pub struct RpcServer {
    local_addrs: Vec<SocketAddr>,
    shared: Arc<Shared>,
    disconnect: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    listeners: Vec<JoinHandle<()>>,
}

impl RpcServer {
    /// Bind every port on `bind` and start accepting.
    ///
    /// A port that cannot be bound is skipped with an error log; failing to bind any is an
    /// error. Port 0 picks a free port, see [`RpcServer::local_addrs`].
    pub async fn start(
        panel: PanelHandle,
        reporter: Arc<ErrorReporter>,
        bind: &str,
        ports: &[u16],
    ) -> AppResult<Self> {
        let shared = Arc::new(Shared {
            panel,
            reporter,
            clients: AtomicUsize::new(0),
        });
        let (disconnect, _) = watch::channel(0u64);
        let (shutdown, _) = watch::channel(false);

        let mut local_addrs = Vec::new();
        let mut listeners = Vec::new();
        for &port in ports {
            let listener = match TcpListener::bind((bind, port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Port {} on {} could not be opened: {}", port, bind, e);
                    continue;
                }
            };
            let addr = listener.local_addr()?;
            info!("Remote command server listening on {}", addr);
            local_addrs.push(addr);
            listeners.push(tokio::spawn(accept_loop(
                listener,
                addr.port(),
                shared.clone(),
                disconnect.subscribe(),
                shutdown.subscribe(),
            )));
        }

        if local_addrs.is_empty() {
            return Err(PanelError::Rpc(format!(
                "none of the ports {:?} could be opened on {}",
                ports, bind
            )));
        }

        Ok(Self {
            local_addrs,
            shared,
            disconnect,
            shutdown,
            listeners,
        })
    }

    /// Addresses actually bound, in configured order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.shared.clients.load(Ordering::SeqCst)
    }

    /// Drop every connected client. Listeners keep accepting new ones.
    pub fn force_disconnect(&self) {
        info!("Disconnecting every remote client; they will see a broken pipe");
        self.disconnect.send_modify(|generation| *generation += 1);
    }

    /// Close every listener and client.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for listener in self.listeners {
            if let Err(e) = listener.await {
                warn!("Remote command listener ended abnormally: {}", e);
            }
        }
        info!("Remote command server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    port: u16,
    shared: Arc<Shared>,
    disconnect: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions = Vec::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    sessions.retain(|s: &JoinHandle<()>| !s.is_finished());
                    sessions.push(tokio::spawn(serve_client(
                        socket,
                        peer,
                        port,
                        shared.clone(),
                        disconnect.clone(),
                        shutdown.clone(),
                    )));
                }
                Err(e) => warn!("Accept error on port {}: {}", port, e),
            }
        }
    }
    for session in sessions {
        let _ = session.await;
    }
}

async fn serve_client(
    socket: TcpStream,
    peer: SocketAddr,
    port: u16,
    shared: Arc<Shared>,
    mut disconnect: watch::Receiver<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Only disconnects requested after this client arrived apply to it
    disconnect.borrow_and_update();
    shared.clients.fetch_add(1, Ordering::SeqCst);
    info!("Connection to port {} from {}", port, peer);

    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => {
                info!("Port {} was left open at shutdown; closing it", port);
                break;
            }
            _ = disconnect.changed() => {
                info!("Disconnected {} from port {}", peer, port);
                break;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Client {} on port {} hung up", peer, port);
                break;
            }
            Err(e) => {
                warn!("Read error from {} on port {}: {}", peer, port, e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match RpcRequest::decode(&line) {
            Ok(RpcRequest::Close) => {
                info!("Port {} closed normally", port);
                break;
            }
            Ok(request) => shared.dispatch(request, port).await,
            Err(e) => {
                debug!("Bad request from {}: {}", peer, line);
                let response = protocol::error_response(&e);
                shared.reporter.report(
                    ErrorSource::Socket,
                    Some(&format!("port {}", port)),
                    &anyhow::Error::new(e),
                );
                response
            }
        };
        if let Err(e) = writer
            .write_all(protocol::response_line(&response).as_bytes())
            .await
        {
            warn!("Failed to answer {} on port {}: {}", peer, port, e);
            break;
        }
    }
    shared.clients.fetch_sub(1, Ordering::SeqCst);
}
