use rubin_atdome_engine::{config::DomeConfig, mock_controller::run_mock_controller};

use std::{env, error::Error};

/// Run the mock dome controller.
///
/// An optional argument names a TOML configuration file; only its port is
/// used.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = match env::args().nth(1) {
        Some(path) => DomeConfig::from_file(path)?,
        None => DomeConfig::default(),
    };

    run_mock_controller(config.port).await?;

    Ok(())
}
