use actix_web::web;

pub mod api;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(api::list_namespaces)
        .service(api::create_namespace);
}
