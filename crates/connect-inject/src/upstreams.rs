//! Upstream annotation parsing
//!
//! Entries are comma separated. Each is either `<service>:<port>[:<datacenter>]`
//! or `prepared_query:<query>:<port>`; the port may name a container port.

use crate::annotations::{non_empty_annotation, port_value, ANNOTATION_UPSTREAMS};
use crate::error::InjectError;
use consul_client::{ConsulClientTrait, MeshGatewayMode, Upstream, UpstreamDestType};
use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

const PREPARED_QUERY: &str = "prepared_query";
const PROXY_CONFIG_GLOBAL: &str = "global";

/// Build the proxy's upstream list from the pod's upstream annotation.
///
/// Upstreams whose port resolves to nothing usable are dropped. A
/// cross-datacenter upstream additionally needs a global proxy-defaults
/// entry with a `local` or `remote` mesh gateway mode; the check is skipped
/// when Consul cannot be reached.
pub async fn process_upstreams(pod: &Pod, consul: &dyn ConsulClientTrait) -> Result<Vec<Upstream>, InjectError> {
    let Some(raw) = non_empty_annotation(pod, ANNOTATION_UPSTREAMS) else {
        return Ok(Vec::new());
    };

    let mut upstreams = Vec::new();
    for entry in raw.split(',') {
        let parts: Vec<&str> = entry.splitn(3, ':').map(str::trim).collect();
        if parts.len() < 2 {
            return Err(invalid(entry, "expected <service>:<port>[:<datacenter>]"));
        }

        let upstream = if parts[0] == PREPARED_QUERY {
            let Some(port) = parts.get(2) else {
                return Err(invalid(entry, "expected prepared_query:<query>:<port>"));
            };
            Upstream {
                destination_type: UpstreamDestType::PreparedQuery,
                destination_namespace: String::new(),
                destination_name: parts[1].to_string(),
                datacenter: String::new(),
                local_bind_port: port_value(pod, ANNOTATION_UPSTREAMS, port).unwrap_or(0),
            }
        } else {
            let datacenter = parts.get(2).map(|dc| (*dc).to_string()).unwrap_or_default();
            if !datacenter.is_empty() {
                check_mesh_gateway_mode(entry, consul).await?;
            }
            Upstream {
                destination_type: UpstreamDestType::Service,
                destination_namespace: String::new(),
                destination_name: parts[0].to_string(),
                datacenter,
                local_bind_port: port_value(pod, ANNOTATION_UPSTREAMS, parts[1]).unwrap_or(0),
            }
        };

        if upstream.local_bind_port > 0 {
            upstreams.push(upstream);
        }
    }
    Ok(upstreams)
}

async fn check_mesh_gateway_mode(entry: &str, consul: &dyn ConsulClientTrait) -> Result<(), InjectError> {
    match consul.proxy_defaults(PROXY_CONFIG_GLOBAL).await {
        Ok(config) => match config.mesh_gateway.mode {
            MeshGatewayMode::Local | MeshGatewayMode::Remote => Ok(()),
            _ => Err(invalid(
                entry,
                &format!(
                    "ProxyDefaults mesh gateway mode is neither {:?} nor {:?}",
                    MeshGatewayMode::Local.as_str(),
                    MeshGatewayMode::Remote.as_str()
                ),
            )),
        },
        Err(e) if e.is_not_found() => Err(invalid(
            entry,
            "there is no ProxyDefaults config to set mesh gateway mode",
        )),
        Err(e) => {
            // Advisory only: a Consul hiccup must not block registration
            warn!("Could not check mesh gateway mode for upstream {}: {}", entry, e);
            Ok(())
        }
    }
}

fn invalid(entry: &str, reason: &str) -> InjectError {
    InjectError::InvalidUpstream {
        upstream: entry.to_string(),
        reason: reason.to_string(),
    }
}
