use std::env;

use media_offload_core::domains::queue::types::QueueName;
use media_offload_core::{globals, OffloadConfig};

const DEFAULT_DATABASE_URL: &str = "sqlite:offload.sqlite?mode=rwc";
const HEAD_ENTRIES: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    let database_url = env::var("OFFLOAD_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

    media_offload_core::initialize(&database_url, OffloadConfig::from_env()).await?;

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("tick") => {
            let queue: QueueName = args
                .get(1)
                .map(|s| s.parse::<QueueName>())
                .transpose()?
                .unwrap_or(QueueName::Optimization);
            let report = media_offload_core::run_tick(queue).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some("test-connections") => {
            let report = globals::get_orchestrator()?.test_connections().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some("reinitialize") => {
            let queue: QueueName = args.get(1).map(String::as_str).unwrap_or("optimization").parse()?;
            let added = globals::get_orchestrator()?.reinitialize_queue(queue).await?;
            println!("Re-queued {} path(s) for {}", added, queue);
        }
        _ => print_status().await?,
    }
    Ok(())
}

async fn print_status() -> Result<(), Box<dyn std::error::Error>> {
    let services = globals::get_services()?;

    println!("Offload status");
    println!("==============");
    println!("Uploads: {}", services.config.uploads_dir.display());
    println!(
        "Optimization API: {}",
        if services.config.optimization_credentials().is_ok() { "configured" } else { "not configured" }
    );
    println!(
        "Remote storage: {}",
        if services.config.storage_credentials().is_ok() { "configured" } else { "not configured" }
    );

    for name in QueueName::ALL {
        let queue = services.queue(name);
        println!("\n{} queue: {} entries", name, queue.size().await?);
        for entry in queue.get_entries(HEAD_ENTRIES).await? {
            println!("  {} (retries: {})", entry.path, entry.retry_count);
        }
    }

    let optimization = services.eligibility.get_optimization_stats().await?;
    let migration = services.eligibility.get_migration_stats().await?;
    println!("\nOptimization funnel: {}", serde_json::to_string(&optimization)?);
    println!("Migration funnel:    {}", serde_json::to_string(&migration)?);
    Ok(())
}
