//! Cluster node discovery and control-host locality.

use crate::error::{DeployError, Result};
use crate::runner::{CommandRunner, Invocation};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// InternalIP reported by the kubelet.
    pub address: Option<String>,
    /// Hostname reported by the kubelet, when it differs from the node name.
    pub hostname: Option<String>,
    /// True when this node is the control host kship runs on.
    pub local: bool,
}

impl Node {
    /// Address used to reach the node over ssh.
    pub fn reach_address(&self) -> Option<&str> {
        self.address.as_deref()
    }
}

// ---------------------------------------------------------------------------
// LocalHost
// ---------------------------------------------------------------------------

/// Identity of the control host, used to decide node locality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalHost {
    pub hostname: Option<String>,
    pub addresses: Vec<String>,
}

impl LocalHost {
    /// Ask the OS for hostname and addresses (`hostname`, `hostname -I`).
    /// Lookup failures leave the corresponding field empty.
    pub fn detect(runner: &dyn CommandRunner, extra_addresses: &[String]) -> Self {
        let hostname = runner
            .run(&Invocation::new("hostname"))
            .ok()
            .filter(|o| o.success())
            .map(|o| o.stdout.trim().to_string())
            .filter(|h| !h.is_empty());

        let mut addresses: Vec<String> = runner
            .run(&Invocation::new("hostname").arg("-I"))
            .ok()
            .filter(|o| o.success())
            .map(|o| o.stdout.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        for extra in extra_addresses {
            if !addresses.contains(extra) {
                addresses.push(extra.clone());
            }
        }

        tracing::debug!(?hostname, ?addresses, "local host identity");
        Self {
            hostname,
            addresses,
        }
    }

    pub fn is_local(&self, name: &str, hostname: Option<&str>, address: Option<&str>) -> bool {
        if let Some(me) = &self.hostname {
            let same = |other: &str| {
                other.eq_ignore_ascii_case(me) || short_name(other).eq_ignore_ascii_case(short_name(me))
            };
            if same(name) || hostname.is_some_and(same) {
                return true;
            }
        }
        match address {
            Some(addr) => {
                self.addresses.iter().any(|a| a == addr)
                    || addr.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
            }
            None => false,
        }
    }
}

fn short_name(host: &str) -> &str {
    host.split('.').next().unwrap_or(host)
}

// ---------------------------------------------------------------------------
// kubectl node list parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeItem>,
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    metadata: NodeMetadata,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct NodeMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    addresses: Vec<NodeAddress>,
}

#[derive(Debug, Deserialize)]
struct NodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

fn address_of(status: &NodeStatus, kind: &str) -> Option<String> {
    status
        .addresses
        .iter()
        .find(|a| a.kind == kind)
        .map(|a| a.address.clone())
}

/// Parse `kubectl get nodes -o json`, preserving control-plane order.
pub fn parse_node_list(json: &str, local: &LocalHost) -> Result<Vec<Node>> {
    let list: NodeList = serde_json::from_str(json)
        .map_err(|e| DeployError::ClusterUnreachable(format!("unparsable node list: {e}")))?;
    Ok(list
        .items
        .into_iter()
        .map(|item| {
            let address = address_of(&item.status, "InternalIP");
            let hostname =
                address_of(&item.status, "Hostname").filter(|h| *h != item.metadata.name);
            let is_local =
                local.is_local(&item.metadata.name, hostname.as_deref(), address.as_deref());
            Node {
                name: item.metadata.name,
                address,
                hostname,
                local: is_local,
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// NodeEnumerator
// ---------------------------------------------------------------------------

pub struct NodeEnumerator<'a> {
    runner: &'a dyn CommandRunner,
    local: LocalHost,
}

impl<'a> NodeEnumerator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, local: LocalHost) -> Self {
        Self { runner, local }
    }

    /// Every cluster node in control-plane order. Any failure of the query is
    /// `ClusterUnreachable`; there is no partial enumeration.
    pub fn list(&self) -> Result<Vec<Node>> {
        let inv = Invocation::new("kubectl").args(["get", "nodes", "-o", "json"]);
        let out = self.runner.run(&inv).map_err(|e| {
            DeployError::ClusterUnreachable(format!("cannot run kubectl: {e}"))
        })?;
        if !out.success() {
            return Err(DeployError::ClusterUnreachable(out.failure_reason()));
        }
        let nodes = parse_node_list(&out.stdout, &self.local)?;
        tracing::info!(
            count = nodes.len(),
            local = nodes.iter().filter(|n| n.local).count(),
            "enumerated cluster nodes"
        );
        Ok(nodes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
