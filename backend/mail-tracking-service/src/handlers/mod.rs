/// HTTP handlers for the mail tracking service
pub mod messages;
pub mod outbound;
pub mod webhooks;

pub use outbound::{InternalApiKey, INTERNAL_API_KEY_HEADER};
pub use webhooks::verify_basic_auth;

use actix_web::web;

/// Every route of the service except `/health` and `/metrics`
pub fn configure(cfg: &mut web::ServiceConfig) {
    webhooks::register_routes(cfg);
    outbound::register_routes(cfg);
    messages::register_routes(cfg);
}
