use dotenvy::dotenv;
use log::{error, info};
use std::sync::Arc;

use inboxserver::config::AppConfig;
use inboxserver::credits::authority::CreditService;
use inboxserver::credits::gate::ActionGate;
use inboxserver::credits::pg::PgLedger;
use inboxserver::scheduler::{PgScheduleStore, SchedulerService};
use inboxserver::shared::utils::create_conn;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env()?;

    let pool = match create_conn() {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create database pool: {}", e);
            return Err(anyhow::anyhow!("database pool creation failed: {}", e));
        }
    };

    let ledger = Arc::new(PgLedger::new(pool.clone()));
    let credits = Arc::new(CreditService::new(ledger));
    let gate = Arc::new(ActionGate::new(Arc::clone(&credits)));
    let store = Arc::new(PgScheduleStore::new(pool.clone()));

    info!(
        "Starting scheduler against {}:{}/{}",
        config.database.server, config.database.port, config.database.database
    );

    // Email capabilities are injected by the hosting web layer when this
    // crate is embedded; the standalone daemon runs the jobs that need none
    // (monthly resets, follow-up retry bookkeeping).
    let scheduler = SchedulerService::new(store, credits, gate, config.scheduler.clone())?;
    scheduler.spawn().await?;
    Ok(())
}
