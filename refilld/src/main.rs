#![deny(unsafe_code)]

use refill_api::model::NozzleId;
use refill_api::{Error, FleetDirectory, Result, TransactionStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod config;
mod health;
mod httpd;
mod stability;
mod supervisor;

use supervisor::Supervisor;

/// Initializes the application: finds and parses the config file,
/// then sets up the global tracing subscriber at the level it names.
async fn init_app() -> Option<config::Config> {
    if let Some(cfg) = config::get().await {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(cfg.get_log_level())
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("unable to set global default subscriber");
        Some(cfg)
    } else {
        None
    }
}

/// Joins a spawned task and flattens panics/cancellation into the
/// same `Result` the task itself would return.
async fn wrap_task(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Err(e) if e.is_panic() => {
            error!("terminated due to panic");
            Err(Error::OperationError("task panicked".to_owned()))
        }

        Err(_) => {
            error!("terminated due to cancellation");
            Err(Error::OperationError("task was canceled".to_owned()))
        }

        Ok(Ok(())) => Ok(()),

        Ok(Err(e)) => {
            error!("task returned error -- {}", &e);
            Err(e)
        }
    }
}

async fn run() -> Result<()> {
    if let Some(cfg) = init_app().await {
        let nozzle_id = NozzleId::from_str(&cfg.nozzle_id)?;

        let nozzle = refill_nozzle::SerialNozzlePort::open(refill_nozzle::PortConfig {
            path: cfg.serial.path.clone(),
            baud: cfg.serial.baud,
            response_timeout: cfg.limits.uart_response_timeout(),
        })?;

        let mut directory = refill_directory::HttpFleetDirectory::new(refill_directory::DirectoryConfig {
            base_url: cfg.directory.base_url.clone(),
            username: cfg.directory.username.clone(),
            password: cfg.directory.password.clone(),
        });

        info!("logging in to fleet directory");
        directory.login().await?;

        let mut store = refill_store::FileTransactionStore::open(&cfg.store_path).await?;

        info!("clearing incomplete transactions from a previous run");
        store.clear_incomplete().await?;

        let (supervisor, operator_tx, snapshot_rx) =
            Supervisor::new(nozzle, directory, store, cfg.limits.clone(), nozzle_id, cfg.tank_id);

        let ctxt = httpd::HttpContext::new(
            operator_tx,
            snapshot_rx,
            cfg.http.shared_secret.clone(),
            PathBuf::from(&cfg.http.uploads_dir),
        );

        let bind: SocketAddr = cfg
            .http
            .bind
            .parse()
            .map_err(|e| Error::ConfigError(format!("bad http.bind {:?}: {}", cfg.http.bind, e)))?;

        info!("starting supervisor for nozzle {}", nozzle_id);

        let sup_task = wrap_task(tokio::spawn(async move { supervisor.run().await }));

        let http_task = wrap_task(tokio::spawn(async move {
            httpd::serve(ctxt, bind).await;
            Err(Error::OperationError("http server exited".to_owned()))
        }));

        tokio::select! {
            res = sup_task => {
                if let Err(e) = res {
                    error!("supervisor task exited -- {}", e);
                }
            }
            res = http_task => {
                if let Err(e) = res {
                    error!("http server task exited -- {}", e);
                }
            }
        }

        warn!("shutting down");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e:?}")
    }
}
