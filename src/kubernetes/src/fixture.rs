// #[cfg(test)]
pub mod reconciler {
    use std::{collections::BTreeMap, sync::Arc};

    use assert_json_diff::assert_json_include;
    use http::{Request, Response};
    use hyper::{body::to_bytes, Body};
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointSubset, Endpoints, Node, NodeAddress, NodeStatus, Service,
        ServicePort, ServiceSpec,
    };
    use kube::{
        core::ObjectMeta,
        discovery::ApiResource,
        Client, Resource, ResourceExt,
    };
    use prometheus::Registry;
    use serde::Serialize;

    use elbd_ipam::pool::PoolRegistry;
    use elbd_mock::speaker::MockSpeaker;

    use crate::{
        controller::{
            context::{Context, ContextWith, LbComponent},
            error::Error,
            metrics::Metrics,
            reconciler::service_watcher::{
                PORTER_ANNOTATION_KEY, PORTER_ANNOTATION_VALUE, SERVICE_FINALIZER,
            },
            requeue::RequeueTable,
            selector::DefaultSelector,
        },
        crd::eip::{Eip, EipSpec, EipStatus},
    };

    const CRD_GROUP: &str = "network.kubesphere.io";

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(pub ApiServerHandle);

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl<T: Clone> ContextWith<T> {
        pub fn test(component: T) -> (Arc<Self>, ApiServerVerifier, Registry) {
            let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let mock_client = Client::new(mock_service, "default");
            let registry = Registry::default();
            let ctx = Context {
                client: mock_client,
                metrics: Metrics::default().register(&registry).unwrap(),
                diagnostics: Arc::default(),
                interval: 30,
                requeue: Arc::new(RequeueTable::new()),
            };
            let ctx_with = Self {
                inner: ctx,
                component,
            };
            (Arc::new(ctx_with), ApiServerVerifier(handle), registry)
        }
    }

    impl ApiServerVerifier {
        /// Accepts the event the reconciler records and checks its reason and type.
        pub async fn handle_event(mut self, reason: &str, type_: &str) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::POST);
            assert!(
                request
                    .uri()
                    .to_string()
                    .starts_with("/apis/events.k8s.io/v1/namespaces/"),
                "unexpected event uri {}",
                request.uri()
            );
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let event: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid event from runtime");
            assert_json_include!(
                actual: event,
                expected: serde_json::json!({"reason": reason, "type": type_})
            );
            send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
            Ok(self)
        }

        /// Like `handle_event`, and also checks the kind of the object the
        /// event is recorded on.
        pub async fn handle_event_on(
            mut self,
            kind: &str,
            reason: &str,
            type_: &str,
        ) -> Result<Self, Error> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::POST);
            let req_body = to_bytes(request.into_body()).await.unwrap();
            let event: serde_json::Value =
                serde_json::from_slice(&req_body).expect("valid event from runtime");
            assert_json_include!(
                actual: event,
                expected: serde_json::json!({"reason": reason, "type": type_, "regarding": {"kind": kind}})
            );
            send.send_response(Response::builder().body(Body::from(req_body)).unwrap());
            Ok(self)
        }
    }

    pub fn test_component(speaker: MockSpeaker, node_name: Option<&str>) -> LbComponent {
        LbComponent {
            registry: PoolRegistry::new(),
            speaker: Arc::new(speaker),
            selector: Arc::new(DefaultSelector),
            node_name: node_name.map(String::from),
        }
    }

    fn base_uri<T: Resource<DynamicType = ()>>() -> String {
        let api_resource = ApiResource::erase::<T>(&());
        if api_resource.group.is_empty() {
            format!("/api/{}", api_resource.api_version)
        } else {
            format!("/apis/{}", api_resource.api_version)
        }
    }

    pub fn get_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        match res.namespace() {
            Some(ns) => {
                format!(
                    "{}/namespaces/{}/{}/{}",
                    base_uri::<T>(),
                    ns,
                    api_resource.plural,
                    res.name_any()
                )
            }
            None => {
                format!(
                    "{}/{}/{}",
                    base_uri::<T>(),
                    api_resource.plural,
                    res.name_any()
                )
            }
        }
    }

    pub fn post_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        list_uri(res)
    }

    pub fn put_uri<T: Resource<DynamicType = ()>>(res: &T, subresource: Option<&str>) -> String {
        match subresource {
            Some(s) => format!("{}/{s}?", get_uri(res)),
            None => format!("{}?", get_uri(res)),
        }
    }

    fn list_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        match res.namespace() {
            Some(ns) => {
                format!(
                    "{}/namespaces/{}/{}?",
                    base_uri::<T>(),
                    ns,
                    api_resource.plural,
                )
            }
            None => {
                format!("{}/{}?", base_uri::<T>(), api_resource.plural,)
            }
        }
    }

    fn patch_uri<T: Resource<DynamicType = ()>>(res: &T, subresource: Option<&str>) -> String {
        put_uri(res, subresource)
    }

    pub fn assert_resource_request<T: Resource<DynamicType = ()>>(
        request: &Request<Body>,
        res: &T,
        subresource: Option<&str>,
        list: bool,
        label_selector: Option<String>,
        method: http::Method,
    ) {
        assert_eq!(request.method(), method);
        let uri = match method {
            http::Method::GET => {
                if list {
                    list_uri(res)
                } else {
                    get_uri(res)
                }
            }
            http::Method::POST => post_uri(res),
            http::Method::PUT => put_uri(res, subresource),
            http::Method::PATCH => patch_uri(res, subresource),
            _ => panic!("unimplemented method"),
        };
        let uri = if let Some(selector) = label_selector {
            format!("{uri}{}", selector)
        } else {
            uri
        };
        assert_eq!(request.uri().to_string(), uri);
    }

    pub fn api_server_response_not_found<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        let (group_kind, details) = if api_resource.group.eq(CRD_GROUP) {
            (
                format!("{}.{}", api_resource.plural, api_resource.group),
                format!(r#""group": "{}","#, api_resource.group),
            )
        } else {
            (api_resource.plural.clone(), String::new())
        };
        format!(
            r#"{{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {{}},
  "status": "Failure",
  "message": "{} \"{}\" not found",
  "reason": "NotFound",
  "details": {{
    "name": "{}",
    {}
    "kind": "{}"
  }},
  "code": 404
}}"#,
            group_kind,
            res.name_any(),
            res.name_any(),
            details,
            api_resource.plural,
        )
    }

    pub fn api_server_response_resource<T: Resource<DynamicType = ()> + Serialize>(
        res: &T,
    ) -> Vec<u8> {
        serde_json::to_vec(res).unwrap()
    }

    pub fn test_svc() -> Service {
        test_svc_with_name("svc-1")
    }

    pub fn test_svc_with_name(name: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some("1".to_string()),
                finalizers: Some(vec![SERVICE_FINALIZER.to_string()]),
                annotations: Some(BTreeMap::from([(
                    PORTER_ANNOTATION_KEY.to_string(),
                    PORTER_ANNOTATION_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                ports: Some(vec![ServicePort {
                    port: 80,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Endpoints whose first subset is backed by pods on `nodes`.
    pub fn test_eps(name: &str, nodes: &[&str]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    nodes
                        .iter()
                        .enumerate()
                        .map(|(i, node)| EndpointAddress {
                            ip: format!("10.244.{}.10", i + 1),
                            node_name: Some(node.to_string()),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        }
    }

    pub fn test_eip(name: &str, address: &str) -> Eip {
        Eip {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: EipSpec {
                address: address.to_string(),
            },
            status: Some(EipStatus {
                enable: true,
                occupied: false,
                ports_usage: vec![],
            }),
        }
    }

    pub fn test_node(name: &str, addr: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        type_: "InternalIP".to_string(),
                        address: addr.to_string(),
                    },
                    NodeAddress {
                        type_: "Hostname".to_string(),
                        address: name.to_string(),
                    },
                ]),
                ..Default::default()
            }),
        }
    }

    /// Nodes `n1`, `n2` and `n3` on `10.0.0.1` to `10.0.0.3`.
    pub fn test_node_list() -> Vec<Node> {
        vec![
            test_node("n1", "10.0.0.1"),
            test_node("n2", "10.0.0.2"),
            test_node("n3", "10.0.0.3"),
        ]
    }
}

pub async fn test_trace() {
    let _ = elbd_trace::init::prepare_tracing(elbd_trace::init::TraceConfig {
        level: "info".to_string(),
        format: String::new(),
        file: None,
    });
}
