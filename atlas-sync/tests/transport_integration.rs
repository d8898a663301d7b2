//! End-to-end over TCP: registry ticket, token connect, edits and broadcasts.

use std::sync::Arc;

use atlas_sync::backend::{Backend, BackendConfig};
use atlas_sync::lock::MemoryLockStore;
use atlas_sync::protocol::OutgoingMessage;
use atlas_sync::registry::{ConnectionTicket, Registry};
use atlas_sync::storage::MemoryDocLog;
use atlas_sync::transport::{serve, Refusal, Request};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type Lines = Framed<TcpStream, LinesCodec>;

struct Server {
    addr: String,
    cancel: CancellationToken,
    backend: Backend,
}

async fn start_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let registry = Registry::new();
    let backend = Backend::start(
        BackendConfig::for_testing(addr.clone()),
        Arc::new(MemoryLockStore::new()),
        Arc::new(MemoryDocLog::new()),
        Some(Arc::new(registry.clone())),
    )
    .unwrap();
    registry.register_backend(Arc::new(backend.clone())).await;

    let cancel = CancellationToken::new();
    tokio::spawn(serve(listener, backend.clone(), registry, cancel.clone()));
    Server {
        addr,
        cancel,
        backend,
    }
}

async fn open(addr: &str, request: &Request) -> Lines {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut lines = Framed::new(stream, LinesCodec::new());
    lines
        .send(serde_json::to_string(request).unwrap())
        .await
        .unwrap();
    lines
}

async fn read<T: serde::de::DeserializeOwned>(lines: &mut Lines) -> T {
    let line = lines.next().await.unwrap().unwrap();
    serde_json::from_str(&line).unwrap()
}

async fn ticket(server: &Server, doc_id: Uuid) -> ConnectionTicket {
    let mut lines = open(&server.addr, &Request::Setup { doc_id }).await;
    read(&mut lines).await
}

#[tokio::test]
async fn test_edit_reaches_second_client() {
    let server = start_server().await;
    let doc_id = Uuid::new_v4();

    let first = ticket(&server, doc_id).await;
    assert_eq!(first.backend, server.addr);
    let alice_id = Uuid::new_v4();
    let mut alice = open(
        &server.addr,
        &Request::Connect {
            doc_id,
            token: first.token,
            client_id: alice_id,
        },
    )
    .await;
    let welcome: OutgoingMessage = read(&mut alice).await;
    assert!(welcome.aware.unwrap().contains_key(&alice_id));

    alice
        .send(r#"{"seq":1,"change":{"fadd":["pin"],"fset":{"pin":{"id":"pin","parent":"","idx":"O","name":"Lighthouse"}}}}"#)
        .await
        .unwrap();
    loop {
        let msg: OutgoingMessage = read(&mut alice).await;
        if msg.acks.as_ref().is_some_and(|acks| acks.get(&alice_id) == Some(&1)) {
            break;
        }
    }

    let second = ticket(&server, doc_id).await;
    let mut bob = open(
        &server.addr,
        &Request::Connect {
            doc_id,
            token: second.token,
            client_id: Uuid::new_v4(),
        },
    )
    .await;
    let welcome: OutgoingMessage = read(&mut bob).await;
    let snapshot = welcome.change.unwrap();
    assert_eq!(snapshot.fset["pin"].name.get().map(String::as_str), Some("Lighthouse"));

    server.backend.shutdown().await;
    server.cancel.cancel();
}

#[tokio::test]
async fn test_bad_token_is_refused() {
    let server = start_server().await;
    let mut lines = open(
        &server.addr,
        &Request::Connect {
            doc_id: Uuid::new_v4(),
            token: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
        },
    )
    .await;
    let refusal: Refusal = read(&mut lines).await;
    assert!(refusal.error.contains("token"));
    assert!(!refusal.retryable);
    assert!(lines.next().await.is_none());
    server.cancel.cancel();
}
