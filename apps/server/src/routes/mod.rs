use actix_web::web::ServiceConfig;

pub mod health;
pub mod status;

/// Register every route of the server
pub fn routes(cfg: &mut ServiceConfig) {
    cfg.service(health::health_route).service(status::status_route);
}
