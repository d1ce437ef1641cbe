mod http;
mod interface;
mod types;

pub use http::RouterosClient;
pub use interface::RouterosApi;
pub use types::{AddressFamily, AddressListRecord};
