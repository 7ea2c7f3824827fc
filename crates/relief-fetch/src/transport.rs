//! Network access for tile downloads.

use crate::config::FetchConfig;
use crate::Result;
use relief_dem::{Resolution, TileId};
use tracing::debug;

/// One tile request against one source.
#[derive(Debug, Clone, Copy)]
pub struct TileRequest<'a> {
    /// Source being queried.
    pub source_id: &'a str,
    /// Tile being fetched.
    pub tile: TileId,
    /// Resolution class requested.
    pub resolution: Resolution,
    /// Fully rendered URL. May embed credentials; never log it.
    pub url: &'a str,
}

/// Classified result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportResponse {
    /// Payload bytes from a successful response.
    Body(Vec<u8>),
    /// The source definitively has no data for this tile.
    NotFound,
    /// Auth or quota rejection.
    Rejected {
        /// HTTP status.
        status: u16,
    },
    /// Anything else: timeouts, connection errors, server errors.
    Failed {
        /// HTTP status, if a response arrived.
        status: Option<u16>,
        /// Description.
        reason: String,
    },
}

/// Performs one blocking request per call.
pub trait TileTransport: Send + Sync {
    /// Fetch a tile. Implementations must bound the call with a timeout.
    fn get(&self, request: &TileRequest<'_>) -> TransportResponse;
}

/// Map a non-success HTTP status to a response class.
pub fn classify_status(status: u16) -> TransportResponse {
    match status {
        404 | 410 => TransportResponse::NotFound,
        401 | 403 | 429 => TransportResponse::Rejected { status },
        _ => TransportResponse::Failed {
            status: Some(status),
            reason: format!("HTTP {status}"),
        },
    }
}

/// `reqwest` blocking transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a client with the configured timeout and user agent.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

impl TileTransport for HttpTransport {
    fn get(&self, request: &TileRequest<'_>) -> TransportResponse {
        let response = match self.client.get(request.url).send() {
            Ok(response) => response,
            Err(e) => {
                // reqwest errors carry the URL; strip it before reporting
                let reason = e.without_url().to_string();
                debug!(source = request.source_id, tile = %request.tile, %reason, "Request failed");
                return TransportResponse::Failed {
                    status: None,
                    reason,
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            return classify_status(status.as_u16());
        }

        match response.bytes() {
            Ok(bytes) => TransportResponse::Body(bytes.to_vec()),
            Err(e) => TransportResponse::Failed {
                status: Some(status.as_u16()),
                reason: e.without_url().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(404), TransportResponse::NotFound);
        assert_eq!(classify_status(429), TransportResponse::Rejected { status: 429 });
        assert_eq!(classify_status(401), TransportResponse::Rejected { status: 401 });
        assert!(matches!(
            classify_status(503),
            TransportResponse::Failed { status: Some(503), .. }
        ));
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new(&FetchConfig::default()).is_ok());
    }
}
