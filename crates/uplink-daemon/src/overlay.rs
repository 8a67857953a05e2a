/// Overlay-network route lookup.
///
/// Interfaces published by an overlay service carry their network id in
/// the adapter name, e.g. `ZeroTier One [8056c2e21c000001]`. For those,
/// probing the overlay's default gateway says more about the path than a
/// fixed internet target does. The engine only ever asks one question of
/// the overlay service, and runs fine without it.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[async_trait]
pub trait OverlayRoutes: Send + Sync {
    /// The default-route gateway of the given overlay network, if one is
    /// configured on it.
    async fn default_gateway(&self, network_id: &str) -> Option<Ipv4Addr>;
}

/// Extract a bracketed 16-digit hex network id from an interface name.
pub fn overlay_network_id(name: &str) -> Option<&str> {
    let start = name.find('[')? + 1;
    let rest = &name[start..];
    let end = rest.find(']')?;
    let id = &rest[..end];
    if id.len() == 16 && id.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(id)
    } else {
        None
    }
}

/// Client for the ZeroTier One local JSON API.
pub struct ZeroTierApi {
    base_url: String,
    auth_token: String,
    http: reqwest::Client,
}

impl ZeroTierApi {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            auth_token: auth_token.into(),
            http,
        }
    }
}

#[async_trait]
impl OverlayRoutes for ZeroTierApi {
    async fn default_gateway(&self, network_id: &str) -> Option<Ipv4Addr> {
        let url = format!("{}/network/{}", self.base_url, network_id);
        let resp = match self
            .http
            .get(&url)
            .header("X-ZT1-Auth", &self.auth_token)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                debug!(network_id, error = %e, "Overlay API request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!(network_id, status = %resp.status(), "Overlay API rejected request");
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;

        // The default route is the one targeting 0.0.0.0/0 with a `via` hop
        let routes = body["routes"].as_array()?;
        routes.iter().find_map(|route| {
            if route["target"].as_str()? != "0.0.0.0/0" {
                return None;
            }
            route["via"].as_str()?.parse().ok()
        })
    }
}
