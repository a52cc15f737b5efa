use std::net::IpAddr;

use k8s_openapi::api::core::v1::Node;
use kube::{Resource, ResourceExt};

pub fn get_namespaced_name<T: Resource<DynamicType = ()>>(resource: &T) -> String {
    match resource.namespace() {
        Some(ns) => format!("{ns}/{}", resource.name_any()),
        None => resource.name_any(),
    }
}

/// The address a node is routable on: its first reported address.
pub fn first_node_address(node: &Node) -> Option<IpAddr> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addrs| addrs.first())
        .and_then(|addr| addr.address.parse().ok())
}
