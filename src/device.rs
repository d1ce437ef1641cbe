use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::banlist::{parse_prefix, BanEntry, Dynlist, Policy};
use crate::config::DeviceConfig;
use crate::duration::{format_duration, parse_duration};
use crate::error::DeviceError;
use crate::metrics::{DEVICE_ERRORS, DYNAMIC_BANS};
use crate::routeros_api::{AddressFamily, AddressListRecord, RouterosApi, RouterosClient};

/// Poll interval while the dynlist is empty.
const IDLE_POLL: Duration = Duration::from_secs(3600);
/// Pause after a failed expiry delete, so a sick device is not hammered.
const EXPIRE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// One managed device: the API session, the immutable ban policy and the
/// live mirror of dynamic entries currently on its banlist.
pub struct Device {
    pub name: String,
    client: RouterosClient,
    banlist: String,
    policy: Policy,
    dynlist: RwLock<Dynlist>,
    /// Serializes remote add/remove calls and their dynlist writes, so a
    /// caller cannot race the expiry scheduler over the same entry.
    mutation: tokio::sync::Mutex<()>,
    notify: StdMutex<Option<mpsc::Sender<()>>>,
    scheduler: StdMutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Connects, resolves list imports, reconciles the device's banlist
    /// with the configured policy and starts the expiry scheduler. Any
    /// failure here is unrecoverable: the instance must not run against a
    /// device in unknown state.
    pub async fn connect(
        name: String,
        config: &DeviceConfig,
        autodelete: bool,
    ) -> Result<Arc<Self>, anyhow::Error> {
        let client = RouterosClient::new(
            config.base_url()?,
            config.user.clone(),
            config.passwd.clone(),
        );
        let identity = client
            .identity()
            .await
            .with_context(|| format!("{name}: connecting to {}", config.address))?;
        info!(device = %name, identity = %identity, "connected");

        let whitelist = resolve_list(&client, &config.whitelist, &config.banlist, &name).await?;
        let blacklist = resolve_list(&client, &config.blacklist, &config.banlist, &name).await?;
        let policy = Policy::new(whitelist, blacklist)
            .with_context(|| format!("{name}: invalid whitelist/blacklist"))?;

        let device = Arc::new(Self {
            name,
            client,
            banlist: config.banlist.clone(),
            policy,
            dynlist: RwLock::new(Dynlist::default()),
            mutation: tokio::sync::Mutex::new(()),
            notify: StdMutex::new(None),
            scheduler: StdMutex::new(None),
        });

        device.reconcile().await.with_context(|| {
            format!("{}: reconciling banlist {}", device.name, device.banlist)
        })?;

        if autodelete {
            device.start_scheduler();
        }
        Ok(device)
    }

    /// Merges the configured policy with the device's current banlist
    /// contents. Afterwards the device holds exactly the non-whitelisted
    /// permanent blacklist plus the still-valid dynamic entries, and the
    /// dynlist mirrors the latter.
    async fn reconcile(&self) -> Result<(), DeviceError> {
        let fetched = self.fetch_banlist().await?;

        // Index the permanent blacklist by canonical prefix. Entries found
        // on the device are taken out of the map; the leftovers are pushed
        // at the end.
        let mut blackmap: HashMap<String, IpNet> = self
            .policy
            .blacklist_nets()
            .iter()
            .map(|net| (net.to_string(), *net))
            .collect();

        let mut dynamic = Vec::new();
        for entry in fetched {
            let key = entry.net.to_string();
            if self.policy.is_whitelisted(entry.net.addr()) {
                // Whitelisted entries must never remain banned.
                info!(device = %self.name, %entry, "deleting whitelisted banlist entry");
                self.del_entry(&entry).await?;
                continue;
            }
            match entry.expires {
                None => {
                    if blackmap.remove(&key).is_none() {
                        info!(device = %self.name, %entry, "deleting unwanted permanent entry");
                        self.del_entry(&entry).await?;
                    }
                }
                Some(_) => {
                    if blackmap.contains_key(&key) {
                        // Re-added as a permanent entry below; a dynamic
                        // entry must not shadow a policy entry.
                        info!(device = %self.name, %entry, "deleting dynamic entry shadowing the blacklist");
                        self.del_entry(&entry).await?;
                    } else {
                        dynamic.push(entry);
                    }
                }
            }
        }

        // Whatever is left in the map is missing on the device.
        for net in blackmap.into_values() {
            self.add_ip(net, None, None).await?;
        }

        let count = dynamic.len();
        *self.dynlist.write().expect("dynlist lock") = Dynlist::from(dynamic);
        DYNAMIC_BANS
            .with_label_values(&[&self.name])
            .set(count as i64);
        info!(device = %self.name, dynamic = count, "banlist reconciled");
        Ok(())
    }

    async fn fetch_banlist(&self) -> Result<Vec<BanEntry>, DeviceError> {
        let records = self.client.address_list(&self.banlist).await?;
        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(entry) = entry_from_record(record)? {
                entries.push(entry);
            }
        }
        // Permanent entries (no expiry) sort first.
        entries.sort_by_key(|e| e.expires);
        Ok(entries)
    }

    /// Adds a prefix to the device's banlist. `duration` of `None` means a
    /// permanent entry and skips the whitelist/blacklist/dynlist checks —
    /// conflicts were settled when the configuration was read. Dynamic
    /// entries are checked against all three lists first; an already
    /// covered prefix is a successful no-op, as is the device reporting a
    /// duplicate.
    pub async fn add_ip(
        &self,
        net: IpNet,
        duration: Option<Duration>,
        comment: Option<&str>,
    ) -> Result<(), DeviceError> {
        let _guard = self.mutation.lock().await;

        if duration.is_some() {
            let addr = net.addr();
            if self.policy.is_whitelisted(addr) {
                info!(device = %self.name, %net, "on the admin whitelist, skipped");
                return Ok(());
            }
            if self.policy.is_blacklisted(addr) {
                info!(device = %self.name, %net, "on the admin blacklist, skipped");
                return Ok(());
            }
            if self.dynlist.read().expect("dynlist lock").covers(addr) {
                debug!(device = %self.name, %net, "already on the dynamic banlist, skipped");
                return Ok(());
            }
        }

        let timeout = duration.map(format_duration);
        let id = match self
            .client
            .add_address(
                AddressFamily::from(&net),
                &net.to_string(),
                &self.banlist,
                timeout.as_deref(),
                comment,
            )
            .await
        {
            Ok(id) => id,
            Err(DeviceError::Duplicate) => {
                debug!(device = %self.name, %net, "device already has the entry");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if let Some(duration) = duration {
            let mut list = self.dynlist.write().expect("dynlist lock");
            list.insert(BanEntry {
                net,
                expires: Some(expiry_after(duration)),
                id,
            });
            DYNAMIC_BANS
                .with_label_values(&[&self.name])
                .set(list.len() as i64);
            drop(list);
            self.notify_scheduler();
        }
        Ok(())
    }

    /// Removes an entry from the device by its row id. On success the
    /// dynlist head is popped if it was this entry; deletes are only ever
    /// issued for the head or for entries outside the dynlist.
    pub async fn del_entry(&self, entry: &BanEntry) -> Result<(), DeviceError> {
        let _guard = self.mutation.lock().await;

        debug!(device = %self.name, %entry, "removing banlist entry");
        self.client
            .remove_address(AddressFamily::from(&entry.net), &entry.id)
            .await?;

        let mut list = self.dynlist.write().expect("dynlist lock");
        list.pop_if_head(&entry.id);
        DYNAMIC_BANS
            .with_label_values(&[&self.name])
            .set(list.len() as i64);
        Ok(())
    }

    /// Snapshot of the dynamic bans currently mirrored for this device.
    pub fn dynamic_entries(&self) -> Vec<BanEntry> {
        self.dynlist
            .read()
            .expect("dynlist lock")
            .entries()
            .to_vec()
    }

    /// Stops the expiry scheduler and waits for it to wind down. There is
    /// no wire session to tear down; in-flight calls are bounded by their
    /// own deadlines.
    pub async fn close(&self) {
        self.notify.lock().expect("notify lock").take();
        let handle = self.scheduler.lock().expect("scheduler lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn start_scheduler(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel(1);
        *self.notify.lock().expect("notify lock") = Some(tx);
        let device = Arc::clone(self);
        let handle = tokio::spawn(async move { device.expire_loop(rx).await });
        *self.scheduler.lock().expect("scheduler lock") = Some(handle);
    }

    /// Single-lookahead priority queue over the dynlist: sleep until the
    /// head expires, delete it, recompute. A notification means the head
    /// may have changed; recompute without deleting. A closed channel
    /// stops the task.
    async fn expire_loop(self: Arc<Self>, mut rx: mpsc::Receiver<()>) {
        loop {
            let head = self.dynlist.read().expect("dynlist lock").head().cloned();
            let wake = match head.as_ref().and_then(|e| e.expires) {
                Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => {
                    debug!(device = %self.name, "no dynlist entries to expire, retry in an hour");
                    IDLE_POLL
                }
            };
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(()) => debug!(device = %self.name, "received new data indication"),
                    None => {
                        debug!(device = %self.name, "stopping expiry scheduler");
                        return;
                    }
                },
                _ = tokio::time::sleep(wake) => {
                    if let Some(entry) = head {
                        debug!(device = %self.name, %entry, "expiring dynlist entry");
                        if let Err(err) = self.del_entry(&entry).await {
                            error!(device = %self.name, error = %err, "failed to expire banlist entry");
                            DEVICE_ERRORS.with_label_values(&[&self.name]).inc();
                            tokio::time::sleep(EXPIRE_RETRY_DELAY).await;
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking wakeup for the scheduler. A full slot is dropped: the
    /// scheduler re-derives its wake time from the dynlist on every pass,
    /// so a lost notification delays at most one cycle.
    fn notify_scheduler(&self) {
        let notify = self.notify.lock().expect("notify lock");
        if let Some(tx) = notify.as_ref() {
            match tx.try_send(()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(())) => {
                    warn!(device = %self.name, "scheduler notification slot full, dropped");
                }
                Err(mpsc::error::TrySendError::Closed(())) => {
                    debug!(device = %self.name, "scheduler not running");
                }
            }
        }
    }
}

/// Resolves configured list entries into prefixes. `@name` imports the
/// contents of that address-list from the device; importing the managed
/// banlist itself would be circular and is skipped.
async fn resolve_list(
    client: &RouterosClient,
    entries: &[String],
    banlist: &str,
    device: &str,
) -> Result<Vec<IpNet>, anyhow::Error> {
    let mut nets = Vec::new();
    for raw in entries {
        if let Some(import) = raw.strip_prefix('@') {
            if import == banlist {
                info!(device, list = import, "skipping import of the managed banlist");
                continue;
            }
            let records = client
                .address_list(import)
                .await
                .with_context(|| format!("{device}: importing address-list {import}"))?;
            nets.extend(records.iter().filter_map(|r| parse_prefix(&r.address)));
        } else {
            let net = parse_prefix(raw)
                .ok_or_else(|| crate::error::ConfigError::BadPrefix(raw.clone()))
                .with_context(|| format!("{device}: whitelist/blacklist entry"))?;
            nets.push(net);
        }
    }
    Ok(nets)
}

fn entry_from_record(record: &AddressListRecord) -> Result<Option<BanEntry>, DeviceError> {
    let Some(net) = parse_prefix(&record.address) else {
        warn!(address = %record.address, "skipping unparsable address-list entry");
        return Ok(None);
    };
    let expires = if record.is_dynamic() {
        let timeout = record
            .timeout
            .as_deref()
            .ok_or(DeviceError::MissingField("timeout"))?;
        let remaining = parse_duration(timeout)
            .map_err(|_| DeviceError::InvalidTimeout(timeout.to_string()))?;
        Some(expiry_after(remaining))
    } else {
        None
    };
    let id = record.id.clone().ok_or(DeviceError::MissingField(".id"))?;
    Ok(Some(BanEntry { net, expires, id }))
}

fn expiry_after(duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Best-effort startup convergence across devices: afterwards every device
/// carries at least the union of all currently known dynamic bans. Devices
/// may still diverge later; there is no steady-state repair loop.
pub async fn distribute_bans(devices: &[Arc<Device>]) -> Result<(), DeviceError> {
    let mut merged: HashMap<String, BanEntry> = HashMap::new();
    for device in devices {
        for entry in device.dynamic_entries() {
            merged.entry(entry.net.to_string()).or_insert(entry);
        }
    }
    for device in devices {
        let have: HashSet<String> = device
            .dynamic_entries()
            .iter()
            .map(|e| e.net.to_string())
            .collect();
        for (key, entry) in &merged {
            if have.contains(key) {
                continue;
            }
            let Some(expires) = entry.expires else {
                continue;
            };
            let Ok(remaining) = (expires - Utc::now()).to_std() else {
                continue;
            };
            if remaining < Duration::from_secs(1) {
                // About to expire; a sub-second timeout would format as 0s,
                // which the device reads as permanent.
                continue;
            }
            device.add_ip(entry.net, Some(remaining), None).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Mock, Server, ServerGuard};
    use serde_json::json;

    use super::*;

    fn client_for(server: &Server) -> RouterosClient {
        let url = format!("http://{}", server.host_with_port());
        RouterosClient::new(url.parse().unwrap(), "api".into(), "secret".into())
    }

    fn test_device(server: &Server, whitelist: &[&str], blacklist: &[&str]) -> Arc<Device> {
        let whitelist = whitelist.iter().map(|s| parse_prefix(s).unwrap()).collect();
        let blacklist = blacklist.iter().map(|s| parse_prefix(s).unwrap()).collect();
        Arc::new(Device {
            name: "test".to_string(),
            client: client_for(server),
            banlist: "blacklist".to_string(),
            policy: Policy::new(whitelist, blacklist).unwrap(),
            dynlist: RwLock::new(Dynlist::default()),
            mutation: tokio::sync::Mutex::new(()),
            notify: StdMutex::new(None),
            scheduler: StdMutex::new(None),
        })
    }

    fn mock_list(
        server: &mut ServerGuard,
        family: &str,
        list: &str,
        body: serde_json::Value,
    ) -> Mock {
        server
            .mock("GET", format!("/rest/{family}/firewall/address-list").as_str())
            .match_query(Matcher::UrlEncoded("list".into(), list.into()))
            .with_status(200)
            .with_body(body.to_string())
            .create()
    }

    fn dyn_entry(net: &str, id: &str, in_secs: i64) -> BanEntry {
        BanEntry {
            net: net.parse().unwrap(),
            expires: Some(Utc::now() + chrono::Duration::seconds(in_secs)),
            id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn reconciliation_leaves_converged_device_untouched() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &["10.0.0.0/24"]);

        let v4 = mock_list(
            &mut server,
            "ip",
            "blacklist",
            json!([
                {".id": "*1", "address": "10.0.0.0/24", "dynamic": "false", "list": "blacklist"},
                {".id": "*2", "address": "203.0.113.5", "dynamic": "true", "timeout": "1h", "list": "blacklist"},
            ]),
        );
        let v6 = mock_list(&mut server, "ipv6", "blacklist", json!([]));
        let no_add = server.mock("PUT", Matcher::Any).expect(0).create();
        let no_del = server.mock("DELETE", Matcher::Any).expect(0).create();

        device.reconcile().await.unwrap();

        v4.assert();
        v6.assert();
        no_add.assert();
        no_del.assert();

        let entries = device.dynamic_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].net.to_string(), "203.0.113.5/32");
        assert_eq!(entries[0].id, "*2");
        let remaining = (entries[0].expires.unwrap() - Utc::now()).num_seconds();
        assert!((3590..=3600).contains(&remaining), "remaining={remaining}");
    }

    #[tokio::test]
    async fn reconciliation_repairs_diverged_device() {
        let mut server = Server::new_async().await;
        let device = test_device(
            &server,
            &["192.168.0.0/16"],
            &["10.0.0.0/24", "203.0.113.0/24"],
        );

        let v4 = mock_list(
            &mut server,
            "ip",
            "blacklist",
            json!([
                // Whitelisted: must be deleted.
                {".id": "*1", "address": "192.168.1.1", "dynamic": "false", "list": "blacklist"},
                // Stale permanent entry not on the blacklist: deleted.
                {".id": "*2", "address": "198.18.0.0/15", "dynamic": "false", "list": "blacklist"},
                // Dynamic entry shadowing a blacklist prefix: deleted and
                // re-added as permanent.
                {".id": "*3", "address": "10.0.0.0/24", "dynamic": "true", "timeout": "5m", "list": "blacklist"},
            ]),
        );
        let v6 = mock_list(&mut server, "ipv6", "blacklist", json!([]));

        let del1 = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*1")
            .with_status(204)
            .expect(1)
            .create();
        let del2 = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*2")
            .with_status(204)
            .expect(1)
            .create();
        let del3 = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*3")
            .with_status(204)
            .expect(1)
            .create();
        // Both 10.0.0.0/24 and the missing 203.0.113.0/24 get pushed back
        // as permanent entries.
        let add = server
            .mock("PUT", "/rest/ip/firewall/address-list")
            .with_status(201)
            .with_body(json!({".id": "*9"}).to_string())
            .expect(2)
            .create();

        device.reconcile().await.unwrap();

        v4.assert();
        v6.assert();
        del1.assert();
        del2.assert();
        del3.assert();
        add.assert();
        assert!(device.dynamic_entries().is_empty());
    }

    #[tokio::test]
    async fn reconciliation_fails_on_remote_error() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &[]);

        let v4 = server
            .mock("GET", "/rest/ip/firewall/address-list")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create();

        let err = device.reconcile().await.unwrap_err();
        assert!(matches!(err, DeviceError::Api { status: 500, .. }), "{err}");
        v4.assert();
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &[]);

        let add = server
            .mock("PUT", "/rest/ip/firewall/address-list")
            .match_body(Matcher::Json(json!({
                "address": "198.51.100.9/32",
                "list": "blacklist",
                "timeout": "1h",
            })))
            .with_status(201)
            .with_body(json!({".id": "*A"}).to_string())
            .expect(1)
            .create();

        let net: IpNet = "198.51.100.9/32".parse().unwrap();
        device
            .add_ip(net, Some(Duration::from_secs(3600)), None)
            .await
            .unwrap();
        // Second add is covered by the dynlist and never reaches the device.
        device
            .add_ip(net, Some(Duration::from_secs(3600)), None)
            .await
            .unwrap();

        add.assert();
        let entries = device.dynamic_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "*A");
    }

    #[tokio::test]
    async fn whitelisted_add_never_reaches_the_device() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &["198.51.100.0/24"], &["203.0.113.0/24"]);

        let no_add = server.mock("PUT", Matcher::Any).expect(0).create();

        device
            .add_ip(
                "198.51.100.9/32".parse().unwrap(),
                Some(Duration::from_secs(60)),
                None,
            )
            .await
            .unwrap();
        // Blacklist-covered prefixes are equally a no-op: already banned.
        device
            .add_ip(
                "203.0.113.9/32".parse().unwrap(),
                Some(Duration::from_secs(60)),
                None,
            )
            .await
            .unwrap();

        no_add.assert();
        assert!(device.dynamic_entries().is_empty());
    }

    #[tokio::test]
    async fn permanent_add_bypasses_checks() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &["198.51.100.0/24"], &[]);

        let add = server
            .mock("PUT", "/rest/ip/firewall/address-list")
            .match_body(Matcher::Json(json!({
                "address": "198.51.100.0/24",
                "list": "blacklist",
            })))
            .with_status(201)
            .with_body(json!({".id": "*B"}).to_string())
            .expect(1)
            .create();

        device
            .add_ip("198.51.100.0/24".parse().unwrap(), None, None)
            .await
            .unwrap();

        add.assert();
        // Permanent entries are not mirrored in the dynlist.
        assert!(device.dynamic_entries().is_empty());
    }

    #[tokio::test]
    async fn remote_duplicate_is_success() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &[]);

        let add = server
            .mock("PUT", "/rest/ip/firewall/address-list")
            .with_status(400)
            .with_body(
                json!({"error": 400, "message": "Bad Request", "detail": "failure: already have such entry"})
                    .to_string(),
            )
            .expect(1)
            .create();

        device
            .add_ip(
                "198.51.100.9/32".parse().unwrap(),
                Some(Duration::from_secs(60)),
                None,
            )
            .await
            .unwrap();

        add.assert();
        // No row id came back, so nothing entered the dynlist.
        assert!(device.dynamic_entries().is_empty());
    }

    #[tokio::test]
    async fn add_without_row_id_is_an_error() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &[]);

        server
            .mock("PUT", "/rest/ip/firewall/address-list")
            .with_status(201)
            .with_body("{}")
            .create();

        let err = device
            .add_ip(
                "198.51.100.9/32".parse().unwrap(),
                Some(Duration::from_secs(60)),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::MissingField(".id")), "{err}");
        assert!(device.dynamic_entries().is_empty());
    }

    #[tokio::test]
    async fn delete_pops_only_the_head() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &[]);

        let head = dyn_entry("10.0.0.1/32", "*1", 100);
        {
            let mut list = device.dynlist.write().unwrap();
            list.insert(head.clone());
            list.insert(dyn_entry("10.0.0.2/32", "*2", 200));
        }

        // A straggler outside the dynlist, e.g. found during reconciliation.
        let straggler = BanEntry {
            net: "192.0.2.1/32".parse().unwrap(),
            expires: None,
            id: "*9".to_string(),
        };
        let del9 = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*9")
            .with_status(204)
            .expect(1)
            .create();
        device.del_entry(&straggler).await.unwrap();
        del9.assert();
        assert_eq!(device.dynamic_entries().len(), 2);

        let del1 = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*1")
            .with_status(204)
            .expect(1)
            .create();
        device.del_entry(&head).await.unwrap();
        del1.assert();
        let entries = device.dynamic_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "*2");
    }

    #[tokio::test]
    async fn scheduler_expires_only_the_due_head() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &[]);
        {
            let mut list = device.dynlist.write().unwrap();
            list.insert(dyn_entry("10.0.0.1/32", "*1", 1));
            list.insert(dyn_entry("10.0.0.2/32", "*2", 3600));
        }

        let del1 = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*1")
            .with_status(204)
            .expect(1)
            .create();
        let del2 = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*2")
            .expect(0)
            .create();

        device.start_scheduler();
        tokio::time::sleep(Duration::from_secs(2)).await;

        del1.assert();
        del2.assert();
        let entries = device.dynamic_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "*2");

        device.close().await;
    }

    #[tokio::test]
    async fn added_ban_expires_end_to_end() {
        let mut server = Server::new_async().await;
        let device = test_device(&server, &[], &[]);

        let add = server
            .mock("PUT", "/rest/ip/firewall/address-list")
            .with_status(201)
            .with_body(json!({".id": "*7"}).to_string())
            .expect(1)
            .create();
        let del = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*7")
            .with_status(204)
            .expect(1)
            .create();

        // Starts idle: the scheduler is parked on its hourly poll until the
        // add notification arrives.
        device.start_scheduler();
        device
            .add_ip(
                "198.51.100.9/32".parse().unwrap(),
                Some(Duration::from_secs(1)),
                Some("test ban"),
            )
            .await
            .unwrap();
        assert_eq!(device.dynamic_entries().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;

        add.assert();
        del.assert();
        assert!(device.dynamic_entries().is_empty());

        device.close().await;
    }

    #[tokio::test]
    async fn connect_imports_lists_and_reconciles() {
        let mut server = Server::new_async().await;

        let identity = server
            .mock("GET", "/rest/system/identity")
            .with_status(200)
            .with_body(json!({"name": "gw"}).to_string())
            .create();
        let import_v4 = mock_list(
            &mut server,
            "ip",
            "trusted",
            json!([{".id": "*5", "address": "192.168.0.0/16", "dynamic": "false", "list": "trusted"}]),
        );
        let import_v6 = mock_list(&mut server, "ipv6", "trusted", json!([]));
        let banlist_v4 = mock_list(
            &mut server,
            "ip",
            "blacklist",
            json!([{".id": "*1", "address": "192.168.5.5", "dynamic": "true", "timeout": "3m", "list": "blacklist"}]),
        );
        let banlist_v6 = mock_list(&mut server, "ipv6", "blacklist", json!([]));
        let del = server
            .mock("DELETE", "/rest/ip/firewall/address-list/*1")
            .with_status(204)
            .expect(1)
            .create();

        let config = DeviceConfig {
            disabled: false,
            address: server.host_with_port(),
            user: "api".to_string(),
            passwd: "secret".to_string(),
            use_tls: false,
            banlist: "blacklist".to_string(),
            // The managed banlist import is skipped, not fetched.
            whitelist: vec!["@trusted".to_string(), "@blacklist".to_string()],
            blacklist: vec![],
        };

        let device = Device::connect("gw".to_string(), &config, false)
            .await
            .unwrap();

        identity.assert();
        import_v4.assert();
        import_v6.assert();
        banlist_v4.assert();
        banlist_v6.assert();
        del.assert();
        assert!(device.dynamic_entries().is_empty());
        assert!(device.policy.is_whitelisted("192.168.5.5".parse().unwrap()));
    }

    #[tokio::test]
    async fn distribute_pushes_missing_bans_to_other_devices() {
        let mut server_a = Server::new_async().await;
        let mut server_b = Server::new_async().await;
        let device_a = test_device(&server_a, &[], &[]);
        let device_b = test_device(&server_b, &[], &[]);

        device_a
            .dynlist
            .write()
            .unwrap()
            .insert(dyn_entry("203.0.113.5/32", "*1", 3600));

        let no_add_a = server_a.mock("PUT", Matcher::Any).expect(0).create();
        let add_b = server_b
            .mock("PUT", "/rest/ip/firewall/address-list")
            .with_status(201)
            .with_body(json!({".id": "*3"}).to_string())
            .expect(1)
            .create();

        distribute_bans(&[device_a.clone(), device_b.clone()])
            .await
            .unwrap();

        no_add_a.assert();
        add_b.assert();
        assert_eq!(device_b.dynamic_entries().len(), 1);
        assert_eq!(device_a.dynamic_entries().len(), 1);
    }
}
