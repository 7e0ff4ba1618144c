//! Process entrypoint: tracing, configuration (file + environment, no
//! CLI flags), component wiring, and exit codes.

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    #[cfg(not(feature = "transport-opcua"))]
    {
        error!(
            message = "Built without the transport-opcua feature; no field transport available."
        );
        std::process::exit(exitcode::UNAVAILABLE);
    }

    #[cfg(feature = "transport-opcua")]
    run().await;
}

#[cfg(feature = "transport-opcua")]
async fn run() {
    use std::sync::Arc;

    use opcua_bridge::sinks::influxdb::client::InfluxHttpClient;
    use opcua_bridge::sources::opcua::adapter::{OpcuaConnector, PkiIdentity};
    use opcua_bridge::{app, config};

    let config_path = std::env::var(config::CONFIG_PATH_ENV)
        .unwrap_or_else(|_| config::DEFAULT_CONFIG_PATH.to_owned());
    let config = match config::load(&config_path) {
        Ok(config) => config,
        Err(error) => {
            error!(message = "Configuration is invalid.", path = %config_path, %error);
            std::process::exit(exitcode::CONFIG);
        }
    };
    info!(
        message = "Configuration loaded.",
        path = %config_path,
        enterprise = %config.enterprise_name,
        version = %config.version
    );

    let sink = match InfluxHttpClient::from_env() {
        Ok(sink) => Arc::new(sink),
        Err(error) => {
            error!(message = "Remote store credentials missing or invalid.", %error);
            std::process::exit(exitcode::CONFIG);
        }
    };

    let pki_dir = std::path::PathBuf::from("pki");
    let connector = Arc::new(OpcuaConnector::new(pki_dir.clone()));
    let identity = Arc::new(PkiIdentity::new(pki_dir));

    if let Err(error) = app::run(config, connector, identity, sink).await {
        error!(message = "Fatal startup failure.", %error);
        std::process::exit(exitcode::UNAVAILABLE);
    }
}
