//! Cluster member discovery.

use crate::config::CommunicationConfig;
use crate::error::CommError;
use crate::pool::ClusterPool;
use dbwire_protocol::{
    ContentCodec, ContentSerde, ContentType, HostDescription, Method, Request, Response,
    ACCEPT_HEADER,
};
use serde::Deserialize;

/// Administrative path listing live cluster members.
pub const ENDPOINTS_PATH: &str = "/_api/cluster/endpoints";

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    endpoint: String,
}

/// Builds the endpoint listing request.
pub fn endpoints_request(admin_database: &str, content_type: ContentType) -> Request {
    Request::new(admin_database, Method::Get, ENDPOINTS_PATH)
        .with_header(ACCEPT_HEADER, content_type.identifier())
}

/// Parses an endpoint listing into hosts, in server order without duplicates.
pub fn parse_endpoints(
    codec: &ContentSerde,
    response: &Response,
) -> Result<Vec<HostDescription>, CommError> {
    if !response.is_success() {
        return Err(CommError::TopologyUnavailable(format!(
            "endpoint listing returned status {}",
            response.status
        )));
    }

    let entries: Vec<EndpointEntry> = codec
        .deserialize_at_path(&response.body, "/endpoints")
        .map_err(|e| CommError::TopologyUnavailable(e.to_string()))?;

    let mut hosts = Vec::with_capacity(entries.len());
    for entry in entries {
        let host = HostDescription::parse_endpoint(&entry.endpoint)
            .map_err(|e| CommError::TopologyUnavailable(e.to_string()))?;
        if !hosts.contains(&host) {
            hosts.push(host);
        }
    }

    if hosts.is_empty() {
        return Err(CommError::TopologyUnavailable(
            "endpoint listing is empty".to_string(),
        ));
    }
    Ok(hosts)
}

/// Asks the cluster for its current members.
pub async fn fetch_endpoints(
    cluster: &ClusterPool,
    config: &CommunicationConfig,
    codec: &ContentSerde,
) -> Result<Vec<HostDescription>, CommError> {
    let request = endpoints_request(config.admin_database(), codec.content_type());
    let lease = cluster.acquire().await?;
    tracing::debug!("Fetching cluster endpoints from {}", lease.host());
    let response = lease.send(&request).await?;
    parse_endpoints(codec, &response)
}
