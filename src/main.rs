//! Sector master - Main entry point.

use sector::cli::{Cli, Commands};
use sector::config::SectorConfig;
use sector::topology::{StaticTopology, Topology};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => SectorConfig::from_file(path)?,
        None => SectorConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }

    match cli.command {
        Commands::Run {
            bind_addr,
            min_disk_space,
            seed,
            json_logs,
        } => {
            if let Some(addr) = bind_addr {
                config.master.bind_addr = addr.parse()?;
            }
            if let Some(min) = min_disk_space {
                config.registry.min_disk_space = min;
            }
            if seed.is_some() {
                config.registry.rng_seed = seed;
            }
            config.observability.json_logs |= json_logs;

            sector::run(config).await?;
        }

        Commands::CheckConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Lookup { ips } => {
            let topology = StaticTopology::from_config(&config.topology)?;
            for ip in ips {
                let path: Vec<String> =
                    topology.lookup(&ip).iter().map(|id| id.to_string()).collect();
                println!("{}\t/{}", ip, path.join("/"));
            }
        }

        Commands::Version => {
            println!("Sector master v{}", env!("CARGO_PKG_VERSION"));
            println!("Slave registry and replica placement for the Sector file system");
        }
    }

    Ok(())
}
