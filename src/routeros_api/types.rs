use std::fmt;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// RouterOS keeps v4 and v6 firewall state in separate command namespaces;
/// the family picks the `/rest/ip/...` vs `/rest/ipv6/...` path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::V4 => "ip",
            Self::V6 => "ipv6",
        }
    }
}

impl From<&IpNet> for AddressFamily {
    fn from(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// One row of `/rest/{ip,ipv6}/firewall/address-list`. REST hands every
/// value back as a string, booleans included.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddressListRecord {
    #[serde(rename = ".id")]
    pub id: Option<String>,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<String>,
    /// Remaining relative timeout, present on dynamic entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl AddressListRecord {
    pub fn is_dynamic(&self) -> bool {
        self.dynamic.as_deref() == Some("true")
    }
}

#[derive(Debug, Serialize)]
pub struct AddAddressRequest<'a> {
    pub address: String,
    pub list: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct AddAddressResponse {
    #[serde(rename = ".id")]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IdentityResponse {
    pub name: String,
}

/// Error payload shape: `{"error": 400, "message": "...", "detail": "..."}`.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    pub message: Option<String>,
    pub detail: Option<String>,
}
