//! HTTP client construction.

use std::time::Duration;

use reqwest::Client;

use crate::options::TransferOptions;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the client for one session. Certificate relaxation applies to
/// this client only, never globally.
pub(crate) fn build(options: &TransferOptions) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if options.trust_all_hosts {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build()
}
