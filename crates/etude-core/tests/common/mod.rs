//! Shared helpers for the integration suites: a host bound to an
//! ephemeral loopback port, driven by the engine's own client.

use std::rc::Rc;

use etude_core::{WebConfig, WebHost};

pub async fn start_host(value: serde_json::Value) -> Rc<WebHost> {
    let config = WebConfig::from_value(value).expect("config");
    let host = WebHost::new(config).expect("host");
    host.listen().await.expect("listen");
    host
}

pub fn base_url(host: &WebHost) -> String {
    let addr = host.local_addr().expect("bound address");
    format!("http://127.0.0.1:{}", addr.port())
}
