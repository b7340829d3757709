//! Configuration check command.

use clap::Args;
use std::path::PathBuf;

use leasepool::pool::Pool;
use leasepool::vm::backend::SharedResources;

/// Validate configuration and print a summary.
#[derive(Args, Debug)]
pub struct CheckCmd {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl CheckCmd {
    /// Execute the check command.
    pub fn run(self) -> leasepool::Result<()> {
        let config = super::load_config(self.config.as_ref())?;

        let pool = Pool::from_config(&config, &SharedResources::new(config.command_timeout))?;

        let devices = pool.list_devices(&config.admin_user);
        let leased = devices.iter().filter(|d| d.available == "false").count();

        println!("Configuration OK");
        println!("  listen:       {}", config.listen);
        println!("  context root: /{}", config.context_root);
        println!("  data dir:     {}", config.data_dir.display());
        println!("  hypervisors:  {}", pool.adapter_count());
        for binding in &config.hypervisors {
            println!("    {:<16} {}", binding.name, binding.backend.kind());
        }
        println!("  devices:      {} ({} leased)", devices.len(), leased);
        println!(
            "  leases:       expire after {}, swept every {}",
            humantime::format_duration(config.lease.max_duration),
            humantime::format_duration(config.lease.sweep_interval)
        );
        Ok(())
    }
}
