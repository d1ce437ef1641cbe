use super::types::{AddressFamily, AddressListRecord};
use crate::error::DeviceError;

/// The operations the engine needs from a device. Queries return both
/// address families merged; adds return the device-assigned row id needed
/// for later removal.
#[allow(async_fn_in_trait)]
pub trait RouterosApi {
    async fn identity(&self) -> Result<String, DeviceError>;

    async fn address_list(&self, list: &str) -> Result<Vec<AddressListRecord>, DeviceError>;

    async fn add_address(
        &self,
        family: AddressFamily,
        address: &str,
        list: &str,
        timeout: Option<&str>,
        comment: Option<&str>,
    ) -> Result<String, DeviceError>;

    async fn remove_address(&self, family: AddressFamily, id: &str) -> Result<(), DeviceError>;
}
