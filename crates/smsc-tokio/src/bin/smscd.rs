use std::time::Duration;

use smsc_core::{AtConfig, Config, ConnectorConfig, ConnectorKind, EmiConfig};
use smsc_tokio::Daemon;
use tracing::{error, info};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::ERROR.into())
                .with_env_var("SMSC_LOG")
                .from_env_lossy(),
        )
        .init();

    let mut modem = AtConfig::serial("/dev/ttyUSB0");
    modem.keepalive = Some(Duration::from_secs(60));
    modem.sim_buffering = true;

    let mut emi = EmiConfig::new("127.0.0.1", 5000);
    emi.receive_port = Some(5001);
    emi.username = Some("kannel".to_owned());
    emi.password = Some("secret".to_owned());
    emi.keepalive = Some(Duration::from_secs(120));
    emi.idle_timeout = Some(Duration::from_secs(300));

    let config = Config {
        connectors: [
            ("modem".to_owned(), ConnectorConfig::new(ConnectorKind::At(modem))),
            ("smsc".to_owned(), ConnectorConfig::new(ConnectorKind::Emi(emi))),
        ]
        .into(),
        dlr_storage: Default::default(),
    };

    let daemon = Daemon::new(config);
    let handles = daemon.run().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    daemon.shutdown(true).await;
    for result in handles.join_all().await {
        if let Err(e) = result {
            error!("connector error: {e}");
        }
    }

    Ok(())
}
