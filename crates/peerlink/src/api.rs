use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::debug;

use crate::config::PeerOptions;
use crate::error::SignalingError;

/// `{http|https}://host:port{path}{key}/id?ts=<millis><random>`
pub fn id_url(options: &PeerOptions) -> String {
    let scheme = if options.secure { "https" } else { "http" };
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    let salt: u32 = rand::thread_rng().r#gen();
    format!(
        "{scheme}://{}:{}{}{}/id?ts={millis}{salt}",
        options.host,
        options.port,
        options.normalized_path(),
        options.key
    )
}

/// Ask the signaling server to assign an identity.
pub async fn retrieve_id(
    client: &reqwest::Client,
    options: &PeerOptions,
) -> Result<String, SignalingError> {
    let url = id_url(options);
    debug!(target: "peerlink::api", %url, "requesting identity");
    let response = client.get(&url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(SignalingError::Status(status.as_u16()));
    }
    let id = response.text().await?;
    Ok(id.trim().to_string())
}
