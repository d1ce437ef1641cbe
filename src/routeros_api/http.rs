use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::metrics::DEVICE_REQUESTS;
use crate::USER_AGENT;

use super::interface::RouterosApi;
use super::types::{
    AddAddressRequest, AddAddressResponse, AddressFamily, AddressListRecord, ApiErrorBody,
    IdentityResponse,
};
use crate::error::DeviceError;

/// Queries answer from the router's config tree and come back fast;
/// mutations may stall on config commits, so they get more slack.
const QUERY_DEADLINE: Duration = Duration::from_secs(5);
const MUTATION_DEADLINE: Duration = Duration::from_secs(30);

/// RouterOS REST API client. Routers ship self-signed certificates, so
/// certificate validation is off.
#[derive(Debug)]
pub struct RouterosClient {
    client: Client,
    host: Url,
    user: String,
    passwd: String,
}

impl RouterosClient {
    pub fn new(host: Url, user: String, passwd: String) -> Self {
        let client = Client::builder()
            .timeout(MUTATION_DEADLINE)
            .connect_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .user_agent(USER_AGENT)
            .build()
            .expect("failed to build client");
        Self {
            client,
            host,
            user,
            passwd,
        }
    }

    fn url(&self, path: &str) -> Url {
        self.host.join(path).expect("invalid url")
    }

    fn list_url(&self, family: AddressFamily) -> Url {
        self.url(&format!("/rest/{}/firewall/address-list", family.path_segment()))
    }

    fn host_label(&self) -> &str {
        self.host.host_str().unwrap_or("unknown")
    }

    async fn execute(
        &self,
        req: RequestBuilder,
        deadline: Duration,
    ) -> Result<reqwest::Response, DeviceError> {
        let resp = req
            .basic_auth(&self.user, Some(&self.passwd))
            .timeout(deadline)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(api_error(status, body))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        deadline: Duration,
    ) -> Result<T, DeviceError> {
        Ok(self.execute(req, deadline).await?.json().await?)
    }
}

fn api_error(status: StatusCode, body: String) -> DeviceError {
    let detail = serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .and_then(|b| b.detail.or(b.message))
        .unwrap_or(body);
    // The router rejects an add for an existing address with
    // "failure: already have such entry".
    if detail.contains("already have") {
        DeviceError::Duplicate
    } else {
        DeviceError::Api {
            status: status.as_u16(),
            detail,
        }
    }
}

impl RouterosApi for RouterosClient {
    #[instrument(skip(self))]
    async fn identity(&self) -> Result<String, DeviceError> {
        let req = self.client.get(self.url("/rest/system/identity"));
        let resp: IdentityResponse = self.fetch(req, QUERY_DEADLINE).await?;
        DEVICE_REQUESTS
            .with_label_values(&[self.host_label(), "identity"])
            .inc();
        Ok(resp.name)
    }

    #[instrument(skip(self))]
    async fn address_list(&self, list: &str) -> Result<Vec<AddressListRecord>, DeviceError> {
        let ipv4 = self.fetch::<Vec<AddressListRecord>>(
            self.client
                .get(self.list_url(AddressFamily::V4))
                .query(&[("list", list)]),
            QUERY_DEADLINE,
        );
        let ipv6 = self.fetch::<Vec<AddressListRecord>>(
            self.client
                .get(self.list_url(AddressFamily::V6))
                .query(&[("list", list)]),
            QUERY_DEADLINE,
        );

        DEVICE_REQUESTS
            .with_label_values(&[self.host_label(), "address-list"])
            .inc_by(2);

        let (ipv4, ipv6) = futures_util::join!(ipv4, ipv6);
        let mut records = ipv4?;
        records.append(&mut ipv6?);
        Ok(records)
    }

    #[instrument(skip(self, comment))]
    async fn add_address(
        &self,
        family: AddressFamily,
        address: &str,
        list: &str,
        timeout: Option<&str>,
        comment: Option<&str>,
    ) -> Result<String, DeviceError> {
        let payload = AddAddressRequest {
            address: address.to_string(),
            list,
            timeout,
            comment,
        };
        let req = self.client.put(self.list_url(family)).json(&payload);
        let resp: AddAddressResponse = self.fetch(req, MUTATION_DEADLINE).await?;
        DEVICE_REQUESTS
            .with_label_values(&[self.host_label(), "add"])
            .inc();
        resp.id.ok_or(DeviceError::MissingField(".id"))
    }

    #[instrument(skip(self))]
    async fn remove_address(&self, family: AddressFamily, id: &str) -> Result<(), DeviceError> {
        let url = self.url(&format!(
            "/rest/{}/firewall/address-list/{}",
            family.path_segment(),
            id
        ));
        self.execute(self.client.delete(url), MUTATION_DEADLINE)
            .await?;
        DEVICE_REQUESTS
            .with_label_values(&[self.host_label(), "remove"])
            .inc();
        Ok(())
    }
}
