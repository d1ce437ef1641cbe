use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use regex::Regex;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::banlist::parse_prefix;
use crate::device::Device;
use crate::metrics::DEVICE_ERRORS;

/// Compiled log-line matchers. Each pattern must expose a named capture
/// group `IP` carrying the offending address or prefix.
#[derive(Debug)]
pub struct Matcher {
    regexps: Vec<Regex>,
}

impl Matcher {
    pub fn new(patterns: &[String]) -> Result<Self, anyhow::Error> {
        let mut regexps = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let re =
                Regex::new(pattern).with_context(|| format!("invalid regexp `{pattern}`"))?;
            if !re.capture_names().flatten().any(|name| name == "IP") {
                bail!("invalid regexp `{pattern}`: missing named group IP");
            }
            regexps.push(re);
        }
        Ok(Self { regexps })
    }

    /// First matching pattern wins, mirroring the config file order.
    pub fn extract<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.regexps.iter().find_map(|re| {
            re.captures(line)
                .and_then(|caps| caps.name("IP"))
                .map(|m| m.as_str())
        })
    }
}

/// Receives syslog datagrams and pushes every extracted offender to all
/// devices with the configured block time. A failed add is logged and
/// scoped to its device; the other devices still get the ban.
pub async fn run(
    port: u16,
    matcher: Matcher,
    devices: Vec<Arc<Device>>,
    blocktime: Duration,
    comment: Option<String>,
) -> Result<(), anyhow::Error> {
    let socket = UdpSocket::bind(format!("[::]:{port}"))
        .await
        .with_context(|| format!("binding syslog listener on port {port}"))?;
    info!(port, "listening for syslog messages");

    let mut buf = [0u8; 4096];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let line = String::from_utf8_lossy(&buf[..len]);
        let Some(matched) = matcher.extract(&line) else {
            continue;
        };
        let Some(net) = parse_prefix(matched) else {
            warn!(matched, "extracted address does not parse");
            continue;
        };
        debug!(%net, %peer, "detected offender");
        for device in &devices {
            if let Err(err) = device.add_ip(net, Some(blocktime), comment.as_deref()).await {
                error!(device = %device.name, %net, error = %err, "failed to ban offender");
                DEVICE_ERRORS.with_label_values(&[&device.name]).inc();
            }
        }
    }
}
