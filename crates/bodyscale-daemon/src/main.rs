//! # bodyscale-daemon
//!
//! Waits for the scale to advertise, connects, collects one session's worth
//! of records and submits the report, forever.
//!
//! ## Running
//!
//! ```bash
//! # Development, against the mock transport
//! cargo run --package bodyscale-daemon --no-default-features --features mock-bluetooth
//!
//! # Production (on Raspberry Pi)
//! BODYSCALE_CONFIG=/etc/bodyscale/config.toml ./bodyscale-daemon
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

#[cfg(not(any(feature = "bluetooth", feature = "mock-bluetooth")))]
compile_error!("bodyscale-daemon needs the `bluetooth` or `mock-bluetooth` feature");

use anyhow::Context;
use bodyscale_core::{
    default_config_path, init_radio_mode, BleAdapter, Config, ScaleError, ScanController,
    ScanTarget, SessionContext, SessionOrchestrator,
};
use bodyscale_daemon::{logging, service, sink};
use tracing::{error, info, warn};

#[cfg(feature = "bluetooth")]
async fn open_adapter() -> bodyscale_core::Result<bodyscale_core::BluezAdapter> {
    Ok(bodyscale_core::BluezAdapter::open().await?)
}

#[cfg(all(not(feature = "bluetooth"), feature = "mock-bluetooth"))]
async fn open_adapter() -> bodyscale_core::Result<bodyscale_core::MockAdapter> {
    warn!("Built without BlueZ support, using the mock transport");
    Ok(bodyscale_core::MockAdapter::new())
}

async fn serve<A: BleAdapter>(adapter: A, config: Config) -> bodyscale_core::Result<()> {
    let profile = config.scale.profile();
    let target = ScanTarget {
        name: config.scale.name.clone(),
        address: config.scale.address.clone(),
        address_type: profile.address_type,
    };
    let orchestrator = SessionOrchestrator::new(SessionContext::from_config(&config));
    let sink = sink::from_config(&config.sink)?;
    let controller = ScanController::new(adapter, target, config.session);

    tokio::select! {
        () = service::run(controller, orchestrator, sink) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "Could not wait for the shutdown signal");
            }
            info!("Shutdown requested");
        }
    }
    Ok(())
}

async fn start(config: Config) -> bodyscale_core::Result<()> {
    if config.radio.enabled {
        init_radio_mode(&config.radio.enable_command).await?;
    } else {
        warn!("Radio initialisation disabled");
    }

    let adapter = open_adapter().await?;
    serve(adapter, config).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = default_config_path();
    let config = Config::load(&config_path)
        .map_err(ScaleError::from)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    logging::init(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        scale = %config.scale.address,
        model = %config.scale.model,
        "Starting bodyscale-daemon"
    );

    start(config).await.map_err(|err| {
        error!(
            code = err.error_code(),
            bluetooth = err.is_bluetooth_error(),
            fatal = err.is_fatal(),
            error = %err,
            "bodyscale-daemon stopped"
        );
        anyhow::Error::from(err)
    })
}
