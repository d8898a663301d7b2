//! Single-process Atlas backend: registry, backend gate and matchmaker behind
//! one TCP listener, persisting to RocksDB.
//!
//! Configuration comes from the environment:
//!
//! | Variable                   | Default          |
//! |----------------------------|------------------|
//! | `ATLAS_ADDR`               | `127.0.0.1:9090` |
//! | `ATLAS_DATA_DIR`           | `./atlas-data`   |
//! | `ATLAS_LOCK_TTL_SECS`      | 300              |
//! | `ATLAS_SAVE_INTERVAL_SECS` | 60               |
//! | `ATLAS_IDLE_TIMEOUT_SECS`  | 300              |
//! | `ATLAS_TRAFFIC_LOG_DIR`    | unset (off)      |
//! | `RUST_LOG`                 | env_logger       |

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use atlas_sync::{serve, Backend, BackendConfig, MemoryLockStore, Registry, RocksDocLog, StoreConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

fn env_secs(name: &str, default: u64) -> Result<Duration, Box<dyn std::error::Error>> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|e| format!("{name}={raw:?} is not a number of seconds: {e}"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn config_from_env() -> Result<(BackendConfig, StoreConfig), Box<dyn std::error::Error>> {
    let addr = env::var("ATLAS_ADDR").unwrap_or_else(|_| "127.0.0.1:9090".to_string());
    let data_dir = env::var("ATLAS_DATA_DIR").unwrap_or_else(|_| "./atlas-data".to_string());

    let mut backend = BackendConfig::new(addr);
    backend.lock_ttl = env_secs("ATLAS_LOCK_TTL_SECS", 300)?;
    backend.session.save_interval = env_secs("ATLAS_SAVE_INTERVAL_SECS", 60)?;
    backend.session.idle_timeout = env_secs("ATLAS_IDLE_TIMEOUT_SECS", 300)?;
    backend.session.traffic_log_dir = env::var("ATLAS_TRAFFIC_LOG_DIR").ok().map(PathBuf::from);

    let store = StoreConfig {
        path: PathBuf::from(data_dir),
        ..StoreConfig::default()
    };
    Ok((backend, store))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let (backend_config, store_config) = config_from_env()?;
    log::info!(
        "Starting Atlas backend on {} with data in {}",
        backend_config.external_addr,
        store_config.path.display()
    );

    let doc_log = Arc::new(RocksDocLog::open(store_config)?);
    let locks = Arc::new(MemoryLockStore::new());
    let registry = Registry::new();
    let listener = TcpListener::bind(&backend_config.external_addr).await?;

    let backend = Backend::start(backend_config, locks, doc_log, Some(Arc::new(registry.clone())))?;
    registry.register_backend(Arc::new(backend.clone())).await;

    let cancel = CancellationToken::new();
    let server = tokio::spawn(serve(listener, backend.clone(), registry.clone(), cancel.clone()));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");
    cancel.cancel();

    tokio::spawn(async {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        log::error!("Shutdown took longer than {SHUTDOWN_GRACE:?}, exiting");
        process::exit(1);
    });

    backend.shutdown().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Listener failed: {e}"),
        Err(e) => log::error!("Listener task panicked: {e}"),
    }
    log::info!("Stopped");
    Ok(())
}
