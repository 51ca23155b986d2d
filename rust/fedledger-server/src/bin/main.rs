use std::{path::PathBuf, process, time::Duration};

use structopt::StructOpt;
use tokio::{signal, time};
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

use fedledger_server::{
    federation::Federation,
    ledger::{
        storage::{FileStore, MemoryStore},
        LedgerStorage,
    },
    settings::{FederationSettings, Settings},
};

/// The interval in which overdue rounds are failed.
const SUPERVISION_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let (settings, log_settings) = settings.into_parts();

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    if let Err(err) = fedledger_core::init() {
        error!("{}", err);
        process::exit(1);
    }

    let result = match settings.ledger.path.clone() {
        Some(path) => match FileStore::open(&path).await {
            Ok(store) => run(settings, store).await,
            Err(err) => Err(format!("failed to open ledger {}: {:#}", path.display(), err)),
        },
        None => {
            warn!("no ledger path configured, the ledger is kept in memory");
            run(settings, MemoryStore::new()).await
        }
    };
    if let Err(err) = result {
        error!("shutting down: {}", err);
        process::exit(1);
    }
}

async fn run<S>(settings: FederationSettings, store: S) -> Result<(), String>
where
    S: LedgerStorage,
{
    let federation = Federation::new(settings, store)
        .await
        .map_err(|err| format!("failed to initialize federation: {}", err))?;
    let blocks = federation
        .verify_chain()
        .await
        .map_err(|err| format!("ledger verification failed: {}", err))?;
    let model = federation.global_model();
    info!(
        "coordinator ready with {} verified blocks, global model {} of version {}",
        blocks, model.hash, model.version
    );

    let mut supervision = time::interval(SUPERVISION_INTERVAL);
    loop {
        tokio::select! {
            _ = supervision.tick() => {
                for round in federation.expire_overdue_rounds() {
                    warn!("round {} failed after exceeding its deadline", round);
                }
            }
            _ = signal::ctrl_c() => {
                warn!("shutting down: interrupted");
                return Ok(());
            }
        }
    }
}
