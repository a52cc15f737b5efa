use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const EIP_FINALIZER_BASE: &str = "openelb.kubesphere.io";

/// Per-node finalizer. Each agent blocks deletion of a pool until it has
/// withdrawn the routes it advertised for it.
pub fn node_finalizer(node_name: &str) -> String {
    format!("{EIP_FINALIZER_BASE}/{node_name}")
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "network.kubesphere.io", version = "v1alpha2", kind = "Eip")]
#[kube(status = "EipStatus")]
#[kube(
    printcolumn = r#"{"name":"ADDRESS", "type":"string", "description":"Address range of the pool", "jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"ENABLE", "type":"boolean", "description":"Whether the address is valid", "jsonPath":".status.enable"}"#,
    printcolumn = r#"{"name":"OCCUPIED", "type":"boolean", "description":"Whether any address is bound", "jsonPath":".status.occupied"}"#,
    printcolumn = r#"{"name":"AGE", "type":"date", "description":"Date from created", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EipSpec {
    // single address, CIDR or first-last
    pub address: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EipStatus {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub occupied: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports_usage: Vec<i32>,
}

impl Eip {
    pub fn is_enabled(&self) -> bool {
        self.status.as_ref().map(|s| s.enable).unwrap_or(false)
    }

    pub fn is_occupied(&self) -> bool {
        self.status.as_ref().map(|s| s.occupied).unwrap_or(false)
    }
}
