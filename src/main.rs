//! `blebridged`: serves the BLE bridge over stdin and stdout.
//!
//! Requests are read one JSON object per line from stdin; replies and
//! stream events are written the same way to stdout. Logs go to stderr.

use blebridge::{Bridge, bluetooth::BluezFactory, config::Config, error::Result, host};
use log::info;
use tokio::{io::BufReader, select, signal};

#[tokio::main]
async fn main() -> Result<()> {
   // Load configuration
   let config = Config::load()?;

   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_filter))
      .init();

   info!("Starting BLE bridge...");

   let bridge = Bridge::spawn(BluezFactory::new(&config), &config);
   let input = BufReader::new(tokio::io::stdin());

   select! {
      served = host::serve(bridge, input, tokio::io::stdout()) => {
         served?;
         info!("Input closed, shutting down BLE bridge...");
      }
      _ = signal::ctrl_c() => {
         info!("Shutting down BLE bridge...");
      }
   }

   Ok(())
}
