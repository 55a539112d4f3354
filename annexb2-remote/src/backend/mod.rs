pub mod b2;

use std::sync::Arc;

use annexb2_common::{StoreConnector, StoreError};

use self::b2::B2Connector;

/// The connector used in production: B2's public authorization endpoint,
/// or the one named by `B2_AUTHORIZE_URL` when set.
pub fn default_connector() -> Result<Arc<dyn StoreConnector>, StoreError> {
    let connector = match crate::config::process_env("B2_AUTHORIZE_URL") {
        Some(url) => B2Connector::with_authorize_url(url)?,
        None => B2Connector::new()?,
    };
    Ok(Arc::new(connector))
}
