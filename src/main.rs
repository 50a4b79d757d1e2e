use simulation::{simulate, simulate_scaling};
use tracing_subscriber::EnvFilter;
pub mod simulation;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main());
    Ok(())
}

async fn async_main() {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            REPLICATION SIMULATIONS                          ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let runs = [
        // Small, reliable network
        (3, 2, 200, 0.0),
        // Small, flaky network
        (3, 2, 200, 0.1),
        // Medium scale
        (8, 3, 1000, 0.05),
    ];
    for (devices, clouds, steps, fault_rate) in runs {
        match simulate(devices, clouds, steps, fault_rate).await {
            Ok(stats) => stats.print(),
            Err(error) => {
                eprintln!("\n✗ Simulation failed: {}", error);
                return;
            }
        }
    }

    if let Err(error) = simulate_scaling(12, 4).await {
        eprintln!("\n✗ Scaling analysis failed: {}", error);
        return;
    }

    println!("\n✓ All simulations completed successfully!");
}
