//! HTTP client for the node API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | overlay | `GET {debug}/addresses` |
//! | ping | `POST {debug}/pingpong/{overlay}` |
//! | has_content | `GET {debug}/chunks/{address}` (200 / 404) |
//! | upload_content | `POST {api}/bytes` with `swarm-pin` header |
//! | download_content | `GET {api}/bytes/{address}` |
//! | download_chunk | `GET {api}/chunks/{address}` |
//! | pin / unpin | `POST` / `DELETE {api}/pin/chunks/{address}` |
//! | upload_signed_chunk | `POST {api}/soc/{owner}/{id}?sig={signature}` |

use std::time::Duration;

use async_trait::async_trait;
use hive_common::Address;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::error::NodeError;
use crate::node::{Endpoint, NodeApi, Overlay};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ReferenceResponse {
    reference: Address,
}

#[derive(Debug, Deserialize)]
struct AddressesResponse {
    overlay: Overlay,
}

#[derive(Debug, Deserialize)]
struct PongResponse {
    rtt: String,
}

#[derive(Clone)]
pub struct BeeClient {
    name: String,
    endpoint: Endpoint,
    client: Client,
}

impl BeeClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: Endpoint,
        timeout: Duration,
    ) -> Result<Self, NodeError> {
        let name = name.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NodeError::Network {
                node: name.clone(),
                message: format!("building http client: {}", e),
            })?;
        Ok(BeeClient {
            name,
            endpoint,
            client,
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.api_url.trim_end_matches('/'), path)
    }

    fn debug_api(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.debug_api_url.trim_end_matches('/'),
            path
        )
    }

    fn transport_error(&self, e: reqwest::Error) -> NodeError {
        if e.is_timeout() {
            NodeError::Timeout {
                node: self.name.clone(),
            }
        } else if e.is_decode() {
            NodeError::InvalidResponse {
                node: self.name.clone(),
                message: e.to_string(),
            }
        } else {
            NodeError::Network {
                node: self.name.clone(),
                message: e.to_string(),
            }
        }
    }

    async fn status_error(&self, resp: Response) -> NodeError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        NodeError::Api {
            node: self.name.clone(),
            status,
            body,
        }
    }

    async fn expect_success(&self, resp: Response) -> Result<Response, NodeError> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(self.status_error(resp).await)
        }
    }

    async fn bytes_or_not_found(
        &self,
        url: String,
        address: &Address,
    ) -> Result<Vec<u8>, NodeError> {
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(NodeError::ContentNotFound {
                node: self.name.clone(),
                address: *address,
            });
        }
        let resp = self.expect_success(resp).await?;
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl NodeApi for BeeClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn overlay(&self) -> Result<Overlay, NodeError> {
        let resp = self
            .client
            .get(self.debug_api("addresses"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = self.expect_success(resp).await?;
        let body = resp
            .json::<AddressesResponse>()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(body.overlay)
    }

    async fn ping(&self, peer: &Overlay) -> Result<Duration, NodeError> {
        let resp = self
            .client
            .post(self.debug_api(&format!("pingpong/{}", peer)))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = self.expect_success(resp).await?;
        let pong = resp
            .json::<PongResponse>()
            .await
            .map_err(|e| self.transport_error(e))?;
        parse_go_duration(&pong.rtt).ok_or_else(|| NodeError::InvalidResponse {
            node: self.name.clone(),
            message: format!("unparseable rtt {:?}", pong.rtt),
        })
    }

    async fn upload_content(&self, data: &[u8], pin: bool) -> Result<Address, NodeError> {
        let resp = self
            .client
            .post(self.api("bytes"))
            .header("content-type", "application/octet-stream")
            .header("swarm-pin", if pin { "true" } else { "false" })
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = self.expect_success(resp).await?;
        let r = resp
            .json::<ReferenceResponse>()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(r.reference)
    }

    async fn download_content(&self, address: &Address) -> Result<Vec<u8>, NodeError> {
        self.bytes_or_not_found(self.api(&format!("bytes/{}", address)), address)
            .await
    }

    async fn download_chunk(&self, address: &Address) -> Result<Vec<u8>, NodeError> {
        self.bytes_or_not_found(self.api(&format!("chunks/{}", address)), address)
            .await
    }

    async fn pin_content(&self, address: &Address) -> Result<(), NodeError> {
        let resp = self
            .client
            .post(self.api(&format!("pin/chunks/{}", address)))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(NodeError::ContentNotFound {
                node: self.name.clone(),
                address: *address,
            });
        }
        self.expect_success(resp).await.map(|_| ())
    }

    async fn unpin_content(&self, address: &Address) -> Result<(), NodeError> {
        let resp = self
            .client
            .delete(self.api(&format!("pin/chunks/{}", address)))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(NodeError::ContentNotFound {
                node: self.name.clone(),
                address: *address,
            });
        }
        self.expect_success(resp).await.map(|_| ())
    }

    async fn has_content(&self, address: &Address) -> Result<bool, NodeError> {
        let resp = self
            .client
            .get(self.debug_api(&format!("chunks/{}", address)))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(self.status_error(resp).await),
        }
    }

    async fn upload_signed_chunk(
        &self,
        owner: &str,
        id: &str,
        signature: &str,
        data: &[u8],
    ) -> Result<Address, NodeError> {
        let resp = self
            .client
            .post(self.api(&format!("soc/{}/{}", owner, id)))
            .query(&[("sig", signature)])
            .header("content-type", "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let resp = self.expect_success(resp).await?;
        let r = resp
            .json::<ReferenceResponse>()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(r.reference)
    }
}

/// Parse a Go `time.Duration` string such as `"1.5ms"`, `"850µs"` or
/// `"1m2.5s"`.
pub fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let value: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total_nanos += value * scale;
    }

    Some(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration("1.5ms"), Some(Duration::from_micros(1500)));
        assert_eq!(parse_go_duration("850µs"), Some(Duration::from_micros(850)));
        assert_eq!(parse_go_duration("12us"), Some(Duration::from_micros(12)));
        assert_eq!(parse_go_duration("3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_go_duration("1m2.5s"), Some(Duration::from_millis(62_500)));
        assert_eq!(parse_go_duration("250ns"), Some(Duration::from_nanos(250)));
        assert_eq!(parse_go_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_go_duration(""), None);
        assert_eq!(parse_go_duration("ms"), None);
        assert_eq!(parse_go_duration("5 parsecs"), None);
    }

    #[test]
    fn test_urls_tolerate_trailing_slash() {
        let client = BeeClient::new(
            "bee-0",
            Endpoint {
                api_url: "http://bee-0:1633/".into(),
                debug_api_url: "http://bee-0:1635".into(),
            },
            DEFAULT_REQUEST_TIMEOUT,
        )
        .expect("client");
        assert_eq!(client.api("bytes"), "http://bee-0:1633/bytes");
        assert_eq!(client.debug_api("addresses"), "http://bee-0:1635/addresses");
    }
}
