use log::{error, info};
use matter_emu::configuration::config::{CommandLine, Config};
use matter_emu::controller::controller_handler::Controller;

#[tokio::main]
async fn main() {
    // https://docs.rs/env_logger/latest/env_logger/
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_target(false)
        .init();

    println!(
        "
==============================================================================
         matter-emu v{}: emulated smart-home devices for commissioning
==============================================================================
",
        env!("CARGO_PKG_VERSION")
    );

    info!("Importing configuration");

    // Get command-line arguments
    let args = CommandLine::from_args();

    let mut config = match Config::from_file(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to import configuration from file: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_overrides(&args);

    info!("Configuration imported successfully");

    let mut controller = match Controller::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!("Unable to create a controller instance: {}, exiting...", e);
            std::process::exit(1);
        }
    };

    let result = tokio::spawn(async move {
        info!("Spawning the controller");
        controller.run().await
    });

    match result.await {
        Ok(Ok(())) => info!("Bye"),
        Ok(Err(e)) => {
            error!("Error occured in the controller process: {}, exiting...", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Error joining at the end of execution: {}", e);
            std::process::exit(1);
        }
    }
}
