use clap::Parser;
use tracing::info;

use routeros_fwban::cli::Cli;
use routeros_fwban::config::Config;
use routeros_fwban::device::{distribute_bans, Device};
use routeros_fwban::intake::{self, Matcher};
use routeros_fwban::prometheus::Prometheus;
use routeros_fwban::tracing_setup::{get_subscriber, init_subscriber};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber(String::from("routeros-fwban"), String::from("info"));
    init_subscriber(subscriber);

    let args = Cli::parse();
    let mut config = Config::load(&args.config)?;
    config.merge_cli(&args);
    let matcher = Matcher::new(&config.regexps)?;

    // Connect and reconcile every enabled device; a failure here aborts
    // startup rather than running against unknown device state.
    let mut devices = Vec::new();
    for (name, device_config) in &config.devices {
        if device_config.disabled {
            info!(device = %name, "definition disabled, skipping");
            continue;
        }
        let device = Device::connect(name.clone(), device_config, config.settings.autodelete).await?;
        devices.push(device);
    }

    // Every device starts out with at least the union of known dynamic bans.
    distribute_bans(&devices).await?;

    let metrics = Prometheus::new(config.settings.metrics_addr).serve();
    let intake = intake::run(
        config.settings.port,
        matcher,
        devices,
        config.settings.blocktime.into(),
        config.settings.comment.clone(),
    );

    let mut task_set = tokio::task::JoinSet::new();
    task_set.spawn(intake);
    task_set.spawn(async { Ok(metrics.await?) });

    while let Some(res) = task_set.join_next().await {
        res??;
    }

    info!("Exit!");

    Ok(())
}
