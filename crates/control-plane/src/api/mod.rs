//! HTTP surface: agent endpoints, admin endpoints, and the two
//! WebSocket upgrades.

pub mod admin;
pub mod agent;
pub mod error;
pub mod guard;

use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::channels::ws;
use crate::state::AppState;

/// Build the full API router.
///
/// Admin routes enforce the `X-Admin-Token` header via the
/// [`guard::AdminGuard`] extractor; agent routes authenticate per
/// request (registration is open, config/heartbeat verify node
/// identity, the WS upgrades check their own credentials).
pub fn router() -> Router<AppState> {
    Router::new()
        // Health probe (public, no auth)
        .route("/api/v1/health", get(health))
        // Agent HTTP surface
        .route("/api/v1/agent/register", post(agent::register))
        .route("/api/v1/agent/config", get(agent::get_config))
        .route("/api/v1/agent/heartbeat", post(agent::heartbeat))
        // Push channels
        .route("/api/v1/ws/hub", get(ws::hub_ws))
        .route("/api/v1/ws/agent/:hostname", get(ws::agent_ws))
        // Admin: nodes
        .route("/api/v1/admin/nodes", get(admin::nodes::list))
        .route("/api/v1/admin/nodes/:id", get(admin::nodes::get))
        .route("/api/v1/admin/nodes/:id", delete(admin::nodes::delete))
        .route("/api/v1/admin/nodes/:id/approve", post(admin::nodes::approve))
        .route("/api/v1/admin/nodes/:id/suspend", post(admin::nodes::suspend))
        .route("/api/v1/admin/nodes/:id/resume", post(admin::nodes::resume))
        .route("/api/v1/admin/nodes/:id/revoke", post(admin::nodes::revoke))
        // Admin: rich access policies
        .route("/api/v1/admin/policies", get(admin::policies::list))
        .route("/api/v1/admin/policies", post(admin::policies::create))
        .route("/api/v1/admin/policies/:id", get(admin::policies::get))
        .route("/api/v1/admin/policies/:id", put(admin::policies::update))
        .route("/api/v1/admin/policies/:id", delete(admin::policies::delete))
        // Admin: legacy role-pair ACL rules
        .route("/api/v1/admin/acl-policies", get(admin::policies::list_acl))
        .route("/api/v1/admin/acl-policies", post(admin::policies::create_acl))
        .route("/api/v1/admin/acl-policies/:id", get(admin::policies::get_acl))
        .route("/api/v1/admin/acl-policies/:id", put(admin::policies::update_acl))
        .route("/api/v1/admin/acl-policies/:id", delete(admin::policies::delete_acl))
        // Admin: templates & evaluation
        .route("/api/v1/admin/templates", get(admin::policies::list_templates))
        .route(
            "/api/v1/admin/templates/:key/instantiate",
            post(admin::policies::instantiate_template),
        )
        .route("/api/v1/admin/access/evaluate", post(admin::policies::evaluate))
        // Admin: users
        .route("/api/v1/admin/users", get(admin::users::list))
        .route("/api/v1/admin/users", post(admin::users::create))
        .route("/api/v1/admin/users/:id", get(admin::users::get))
        .route("/api/v1/admin/users/:id", put(admin::users::update))
        .route("/api/v1/admin/users/:id", delete(admin::users::delete))
        // Admin: groups & memberships
        .route("/api/v1/admin/groups", get(admin::groups::list))
        .route("/api/v1/admin/groups", post(admin::groups::create))
        .route("/api/v1/admin/groups/:id", get(admin::groups::get))
        .route("/api/v1/admin/groups/:id", put(admin::groups::update))
        .route("/api/v1/admin/groups/:id", delete(admin::groups::delete))
        .route("/api/v1/admin/groups/:id/members", get(admin::groups::list_members))
        .route("/api/v1/admin/groups/:id/members", post(admin::groups::add_member))
        .route(
            "/api/v1/admin/groups/:id/members/bulk",
            post(admin::groups::bulk_add_members),
        )
        .route(
            "/api/v1/admin/groups/:id/members/:user_id",
            delete(admin::groups::remove_member),
        )
        // Admin: integrity
        .route("/api/v1/admin/integrity/trust", get(admin::integrity::trust_scores))
        .route(
            "/api/v1/admin/integrity/global-hash",
            put(admin::integrity::set_global_hash),
        )
        .route(
            "/api/v1/admin/integrity/known-hashes",
            post(admin::integrity::register_known_hash),
        )
        .route("/api/v1/admin/integrity/:node_id", get(admin::integrity::report))
        .route(
            "/api/v1/admin/integrity/:node_id/approve",
            post(admin::integrity::approve),
        )
        .route(
            "/api/v1/admin/integrity/:node_id/expected-hash",
            put(admin::integrity::set_expected_hash),
        )
        // Admin: hub & connected agents
        .route("/api/v1/admin/hub/status", get(admin::hub::status))
        .route("/api/v1/admin/hub/sync", post(admin::hub::sync))
        .route("/api/v1/admin/hub/peers", get(admin::hub::peers))
        .route("/api/v1/admin/hub/peer-stats", get(admin::hub::peer_stats))
        .route("/api/v1/admin/hub/restart", post(admin::hub::restart))
        .route("/api/v1/admin/agents", get(admin::hub::agents))
        // Admin: observability
        .route("/api/v1/admin/stats", get(admin::network::stats))
        .route("/api/v1/admin/allocations", get(admin::network::allocations))
        .route("/api/v1/admin/events", get(admin::network::events))
        .route("/api/v1/admin/audit", get(admin::network::audit))
}

async fn health() -> axum::response::Json<serde_json::Value> {
    axum::response::Json(serde_json::json!({
        "status": "ok",
        "service": "netwarden-control-plane",
    }))
}
