use anyhow::Context;
use fabric_bank_gateway::events::CsvStreamSink;
use fabric_bank_gateway::identity::{IdentityManager, LocalCertificateAuthority};
use fabric_bank_gateway::metrics::GatewayMetrics;
use fabric_bank_gateway::network::SimulatedFabricNetwork;
use fabric_bank_gateway::{BankContract, GatewayConfig, LedgerService, TransferRequest};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::{Duration, Instant, sleep};

const DEMO_SECRET: &str = "adminpw";

fn transfer(from: &str, to_bank: &str, to: &str, amount: Decimal) -> TransferRequest {
    TransferRequest {
        from_account: from.to_string(),
        to_bank_id: to_bank.to_string(),
        to_account: to.to_string(),
        amount,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = GatewayConfig::load(&path).with_context(|| format!("loading {}", path))?;

    println!();
    println!("╔═══════════════════════════════════════════════════════╗");
    println!("║          Fabric Bank Gateway (simulated network)      ║");
    println!("╚═══════════════════════════════════════════════════════╝");
    println!();
    println!("  → org {} ({})", config.org, config.msp_id());
    println!(
        "  → channel {} / chaincode {} on {} peers",
        config.channel.channel_name,
        config.channel.chaincode_name,
        config.channel.peers.len()
    );
    println!(
        "  → {} events to stream {} keyed by {}\n",
        config.event_name, config.stream_name, config.partition_key_field
    );

    let ca = Arc::new(LocalCertificateAuthority::new(&config.org, config.msp_id()));
    ca.add_user(&config.username, DEMO_SECRET).await;
    let identities = IdentityManager::new().with_authority(ca);
    identities
        .add_credentials(&config.username, &config.org, DEMO_SECRET)
        .await;

    let network = Arc::new(SimulatedFabricNetwork::new());
    let stream = Arc::new(CsvStreamSink::new(&config.stream_dir).context("opening stream sink")?);
    let metrics = Arc::new(GatewayMetrics::new());
    let service = Arc::new(LedgerService::new(
        config.clone(),
        Arc::new(identities),
        network,
        stream.clone(),
        metrics.clone(),
    )?);

    let pipeline = service
        .start_event_pipeline(
            &config.channel.channel_name,
            &config.channel.chaincode_name,
            &config.event_name,
        )
        .await?;

    let bank = BankContract::new(service.clone());
    let admin = service.identity(&config.username, &config.org).await?;

    bank.create_account(admin.clone(), "Alice", "A100", Decimal::new(500, 0), "USD")
        .await?;
    bank.create_account(admin.clone(), "Bob", "A200", Decimal::new(300, 0), "USD")
        .await?;

    let transfers = [
        transfer("A100", "BANK2", "B200", Decimal::new(5000, 2)),
        transfer("A200", "BANK3", "C300", Decimal::new(2500, 2)),
        transfer("A100", "BANK1", "A200", Decimal::new(1000, 2)),
    ];
    for request in &transfers {
        let result = bank.transfer(admin.clone(), request).await?;
        println!(
            "✓ transfer {} → {}/{} of {} committed in block {:?}",
            request.from_account,
            request.to_bank_id,
            request.to_account,
            request.amount,
            result.block_number
        );
    }

    match bank
        .transfer(admin.clone(), &transfer("A200", "BANK2", "B200", Decimal::new(1_000_000, 0)))
        .await
    {
        Ok(_) => println!("✗ overdraft unexpectedly committed"),
        Err(e) => println!("✓ overdraft refused: {}", e),
    }

    let account = bank.query_account(admin.clone(), "A100").await?;
    println!("\nAccount A100: {}", account);
    let history = bank.transaction_history(admin, "A100").await?;
    println!("A100 history: {} entries", history.len());

    // Let the forwarder catch up before stopping.
    let deadline = Instant::now() + Duration::from_secs(5);
    while metrics.snapshot().records_forwarded < transfers.len() as u64
        && Instant::now() < deadline
    {
        sleep(Duration::from_millis(20)).await;
    }

    let health = service.health().await;
    for (key, state) in &health.pipelines {
        println!("Pipeline {}: {}", key, state);
    }
    service.stop_event_pipeline(&pipeline).await;
    println!(
        "Records written to {}",
        stream.path_for(&config.stream_name).display()
    );

    let snapshot = metrics.snapshot();
    snapshot.print_report();
    match snapshot.save_to_csv(&config.metrics_csv) {
        Ok(_) => println!("✓ Metrics saved to {}", config.metrics_csv),
        Err(e) => println!("✗ Error saving {}: {}", config.metrics_csv, e),
    }

    service.shutdown().await;
    Ok(())
}
