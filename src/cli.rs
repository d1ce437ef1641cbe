use std::path::PathBuf;

use clap::Parser;

use crate::duration::RosDuration;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(
        short,
        long,
        env = "FWBAN_CONFIG",
        default_value = "/etc/routeros-fwban.toml"
    )]
    pub config: PathBuf,

    /// Override the syslog listen port from the config file.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the dynamic ban duration, e.g. `24h` or `1h30m`.
    #[arg(short, long)]
    pub blocktime: Option<RosDuration>,

    /// Override automatic deletion of expired dynamic entries.
    #[arg(long)]
    pub autodelete: Option<bool>,
}
