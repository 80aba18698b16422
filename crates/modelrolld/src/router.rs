//! Traffic router that pushes weight splits to an external routing layer.
//!
//! Each split is POSTed as JSON to the configured endpoint:
//!
//! ```json
//! {"service":"ranker","stable_version":"v1","candidate_version":"v2",
//!  "stable_weight":75,"candidate_weight":25}
//! ```
//!
//! Any 2xx is an acknowledgement. 4xx means the routing layer refused the
//! split; 5xx and transport failures are treated as unavailability.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use http::{Method, Uri};
use serde::Serialize;
use tracing::debug;

use modelroll_core::{duration_ms, RolloutTarget, TrafficSplit};
use modelroll_rollout::{AdapterError, TrafficRouter};

use crate::transport::{self, TransportError};

#[derive(Debug, Serialize)]
struct WeightUpdate<'a> {
    service: &'a str,
    stable_version: &'a str,
    candidate_version: &'a str,
    stable_weight: u8,
    candidate_weight: u8,
}

#[derive(Debug, Clone)]
pub struct HttpTrafficRouter {
    address: String,
    path: String,
    timeout: Duration,
}

impl HttpTrafficRouter {
    /// `endpoint` must be an `http://host:port/path` URL.
    pub fn new(endpoint: &str, timeout: Duration) -> anyhow::Result<Self> {
        let uri: Uri = endpoint
            .parse()
            .with_context(|| format!("invalid router endpoint `{endpoint}`"))?;
        if uri.scheme_str() != Some("http") {
            bail!("router endpoint `{endpoint}` must use http://");
        }
        let Some(authority) = uri.authority() else {
            bail!("router endpoint `{endpoint}` has no host");
        };
        let address = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        let path = uri
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            address,
            path,
            timeout,
        })
    }
}

#[async_trait]
impl TrafficRouter for HttpTrafficRouter {
    async fn set_weights(
        &self,
        target: &RolloutTarget,
        split: TrafficSplit,
    ) -> Result<(), AdapterError> {
        let update = WeightUpdate {
            service: &target.service,
            stable_version: &target.stable_version,
            candidate_version: &target.candidate_version,
            stable_weight: split.stable,
            candidate_weight: split.candidate,
        };
        let body = serde_json::to_vec(&update).map_err(|e| AdapterError::Rejected(e.to_string()))?;

        match transport::request(Method::POST, &self.address, &self.path, Some(body), self.timeout)
            .await
        {
            Ok((status, _)) if status.is_success() => {
                debug!(
                    service = %target.service,
                    candidate_weight = split.candidate,
                    %status,
                    "routing layer acknowledged split"
                );
                Ok(())
            }
            Ok((status, body)) if status.is_client_error() => Err(AdapterError::Rejected(format!(
                "{status}: {}",
                String::from_utf8_lossy(&body).trim()
            ))),
            Ok((status, body)) => Err(AdapterError::Unavailable(format!(
                "{status}: {}",
                String::from_utf8_lossy(&body).trim()
            ))),
            Err(TransportError::Timeout(after)) => Err(AdapterError::Timeout {
                operation: "set_weights",
                after_ms: duration_ms(after),
            }),
            Err(e) => Err(AdapterError::Unavailable(e.to_string())),
        }
    }
}
