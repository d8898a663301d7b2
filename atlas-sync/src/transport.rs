//! Newline-delimited JSON over TCP.
//!
//! The first line of every connection is a request:
//!
//! ```text
//! {"setup":{"docId":"…"}}                               ──► {"backend":"host:port","token":"…"}   (closed)
//! {"connect":{"docId":"…","token":"…","clientId":"…"}}  ──► welcome, then OutgoingMessage lines
//!                                                           while IncomingMessage lines flow in
//! ```
//!
//! A refused request gets one `{"error": "...", "redirect"?: "host:port",
//! "retryable": bool}` line before the socket closes.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backend::{Backend, BackendError};
use crate::matchmaker::MatchmakerError;
use crate::protocol::{IncomingMessage, ProtocolError};
use crate::registry::{Registry, RegistryError};
use crate::session::Connection;

/// Longest accepted line.
pub const MAX_LINE: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing: {0}")]
    Lines(#[from] LinesCodecError),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Setup { doc_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Connect {
        doc_id: Uuid,
        token: Uuid,
        client_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refusal {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    pub retryable: bool,
}

impl From<&BackendError> for Refusal {
    fn from(e: &BackendError) -> Self {
        let redirect = match e {
            BackendError::Matchmaker(MatchmakerError::ShouldTrySpecific { addr }) => Some(addr.clone()),
            _ => None,
        };
        let retryable = match e {
            BackendError::Matchmaker(e) => e.is_retryable(),
            _ => false,
        };
        Refusal {
            error: e.to_string(),
            redirect,
            retryable,
        }
    }
}

impl From<&RegistryError> for Refusal {
    fn from(e: &RegistryError) -> Self {
        Refusal {
            error: e.to_string(),
            redirect: None,
            retryable: matches!(e, RegistryError::Setup { .. }),
        }
    }
}

type Lines = Framed<TcpStream, LinesCodec>;

/// Accept connections until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    backend: Backend,
    registry: Registry,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    log::info!("Listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        log::debug!("New TCP connection from {addr}");

        let backend = backend.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, backend, registry).await {
                log::warn!("Connection error from {addr}: {e}");
            }
        });
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    backend: Backend,
    registry: Registry,
) -> Result<(), TransportError> {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));
    let Some(first) = lines.next().await else {
        return Ok(());
    };
    let request: Request = serde_json::from_str(&first?)?;

    match request {
        Request::Setup { doc_id } => match registry.setup_connection(doc_id).await {
            Ok(ticket) => lines.send(serde_json::to_string(&ticket)?).await?,
            Err(e) => refuse(&mut lines, Refusal::from(&e)).await?,
        },
        Request::Connect {
            doc_id,
            token,
            client_id,
        } => match backend.connect(doc_id, token, client_id).await {
            Ok(connection) => {
                log::info!("{addr} joined {doc_id} as {client_id}");
                pump(&mut lines, connection).await?;
            }
            Err(e) => refuse(&mut lines, Refusal::from(&e)).await?,
        },
    }
    Ok(())
}

async fn refuse(lines: &mut Lines, refusal: Refusal) -> Result<(), TransportError> {
    lines.send(serde_json::to_string(&refusal)?).await?;
    Ok(())
}

/// Shuttle messages until either side goes away.
async fn pump(lines: &mut Lines, mut connection: Connection) -> Result<(), TransportError> {
    let result = loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => match IncomingMessage::decode(line.as_bytes()) {
                    Ok(msg) => {
                        if let Err(e) = connection.send(msg).await {
                            log::warn!("Client {} send failed: {e}", connection.client_id());
                            break Ok(());
                        }
                    }
                    Err(e) => break Err(e.into()),
                },
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },
            outgoing = connection.recv() => match outgoing {
                Some(msg) => {
                    let encoded = String::from_utf8(msg.encode()?).map_err(|e| {
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
                    })?;
                    lines.send(encoded).await?;
                }
                None => break Ok(()),
            },
        }
    };
    connection.disconnect().await;
    result
}
