use std::sync::Arc;

use salvo::prelude::*;
use serde::Serialize;

use crate::bridge::QqBridge;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BridgeStatus {
    pub relay_connected: bool,
    pub qq_uin: Option<String>,
    pub portals: usize,
}

/// Always 200 while the appservice is serving; the body says whether the QQ
/// side is usable.
#[handler]
pub async fn health_endpoint(depot: &mut Depot, res: &mut Response) {
    let status = depot
        .obtain::<Arc<QqBridge>>()
        .map(|bridge| bridge.status())
        .ok();
    res.status_code(StatusCode::OK);
    res.render(Json(serde_json::json!({
        "status": if status.as_ref().is_some_and(|s| s.relay_connected) { "ok" } else { "degraded" },
        "bridge": status,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })));
}
