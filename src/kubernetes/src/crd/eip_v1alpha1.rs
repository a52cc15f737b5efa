use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Legacy schema. Only served so that clusters still storing v1alpha1 objects
// can be migrated; nothing reconciles it.
#[derive(CustomResource, Debug, Serialize, Deserialize, Default, Clone, JsonSchema)]
#[kube(group = "network.kubesphere.io", version = "v1alpha1", kind = "Eip")]
#[kube(status = "EipStatus")]
#[serde(rename_all = "camelCase")]
pub struct EipSpec {
    pub address: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EipStatus {
    pub enable: Option<bool>,
    pub ports_usage: Option<Vec<i32>>,
}
