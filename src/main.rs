use std::sync::Arc;

use leasemq::{Config, Queue, SqliteStore};

const USAGE: &str = "usage: leasemq <queue> [stats|clean]";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    leasemq::telemetry::init()?;

    let mut args = std::env::args().skip(1);
    let name = args.next().ok_or_else(|| eyre::eyre!(USAGE))?;
    let command = args.next().unwrap_or_else(|| "stats".to_owned());

    let config = Config::load()?;

    let store = SqliteStore::connect_with(&config).await?;

    let queue = Queue::builder()
        .store(Arc::new(store))
        .name(name)
        .visibility(config.visibility())
        .delay(config.delay())
        .max_retries(config.max_retries)
        .build()?;

    queue.create_indexes().await?;

    match command.as_str() {
        "stats" => {
            let stats = queue.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "clean" => {
            let removed = queue.clean().await?;
            tracing::info!(queue = queue.name(), removed, "purged acknowledged messages");
        }
        other => eyre::bail!("unknown command {other:?}; {USAGE}"),
    }

    Ok(())
}
