//! Client for the remote command server.
//!
//! ```no_run
//! use daq_panel::rpc::{ErrorHandling, RpcClient};
//!
//! # async fn example() -> daq_panel::error::AppResult<()> {
//! let mut client = RpcClient::connect("127.0.0.1:12345")
//!     .await?
//!     .with_error_handling(ErrorHandling::Raise);
//! client.set_field("MFC A", "Setpoint Entry", "20").await?;
//! client.confirm("MFC A").await?;
//! println!("{}", client.get_field("MFC A", "Actual Flow").await?);
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, PanelError};
use crate::rpc::protocol::{self, RpcRequest};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the client does with `Error: ...` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorHandling {
    /// Return the response text as is
    #[default]
    Ignore,
    /// Log a warning, then return the response text
    Log,
    /// Turn the response into [`PanelError::Rpc`]
    Raise,
}

/// One session with a panel's command server.
pub struct RpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    handling: ErrorHandling,
    timeout: Duration,
}

impl RpcClient {
    /// Connect with `Raise` error handling and the default timeout.
    pub async fn connect(addr: impl ToSocketAddrs) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        info!("Connected to remote command server at {}", peer);
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            handling: ErrorHandling::default(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// How error responses are surfaced.
    pub fn with_error_handling(mut self, handling: ErrorHandling) -> Self {
        self.handling = handling;
        self
    }

    /// How long to wait for each response.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn query(&mut self, request: RpcRequest) -> AppResult<String> {
        self.writer
            .write_all(request.encode()?.as_bytes())
            .await?;
        let line = tokio::time::timeout(self.timeout, self.lines.next_line())
            .await
            .map_err(|_| {
                PanelError::Rpc(format!(
                    "no response to {} within {:?}",
                    request.command(),
                    self.timeout
                ))
            })??
            .ok_or_else(|| PanelError::Rpc("server closed the connection".to_string()))?;

        if protocol::is_error(&line) {
            match self.handling {
                ErrorHandling::Ignore => {}
                ErrorHandling::Log => warn!("In {}, {}", request.command(), line),
                ErrorHandling::Raise => {
                    return Err(PanelError::Rpc(format!("In {}, {}", request.command(), line)))
                }
            }
        }
        Ok(line)
    }

    /// Read a field.
    pub async fn get_field(&mut self, widget: &str, field: &str) -> AppResult<String> {
        self.query(RpcRequest::Get {
            widget_nickname: widget.to_string(),
            field_name: field.to_string(),
            printout: true,
        })
        .await
    }

    /// Write a field. The server never confirms it; call [`RpcClient::confirm`] for that.
    pub async fn set_field(&mut self, widget: &str, field: &str, value: &str) -> AppResult<String> {
        self.query(RpcRequest::Set {
            widget_nickname: widget.to_string(),
            field_name: field.to_string(),
            new_value: value.to_string(),
            printout: true,
        })
        .await
    }

    /// Push a widget's inputs to its device.
    pub async fn confirm(&mut self, widget: &str) -> AppResult<String> {
        self.query(RpcRequest::Confirm {
            widget_nickname: widget.to_string(),
            printout: true,
        })
        .await
    }

    /// Evaluate an expression remotely and return its value.
    pub async fn eval(&mut self, code: &str) -> AppResult<String> {
        self.query(RpcRequest::Eval {
            code: code.to_string(),
            printout: true,
        })
        .await
    }

    /// Run statements remotely.
    pub async fn exec(&mut self, code: &str) -> AppResult<String> {
        self.query(RpcRequest::Exec {
            code: code.to_string(),
            printout: true,
        })
        .await
    }

    /// End the session.
    pub async fn close(mut self) -> AppResult<()> {
        self.writer
            .write_all(RpcRequest::Close.encode()?.as_bytes())
            .await?;
        self.writer.shutdown().await?;
        info!("Remote session closed");
        Ok(())
    }
}
