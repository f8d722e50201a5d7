//! The management surface: reserve private namespaces, inspect them, and
//! reach the registry endpoints without going through the proxy.

use crate::catalog::{self, Namespace};
use crate::errors::{ApiError, CatalogError};
use crate::router::{dispatch, RegistryRequest, ResponseSink};
use crate::CoreContext;
use actix_web::http::StatusCode;
use actix_web::{get, post, web, HttpRequest, HttpResponse};

pub type ApiResponse = Result<HttpResponse, ApiError>;

#[get("/private-packages")]
pub(crate) async fn list_namespaces(ctx: web::Data<CoreContext>) -> ApiResponse {
    let namespaces = ctx.catalog.ns_list()?;
    Ok(HttpResponse::Ok().json(namespaces))
}

#[post("/private-packages")]
pub(crate) async fn create_namespace(
    ctx: web::Data<CoreContext>,
    body: web::Json<Namespace>,
) -> ApiResponse {
    if !catalog::valid_name(&body.name) {
        return Err(ApiError::BadRequest("Invalid namespace.".to_string()));
    }
    let ns = ctx.catalog.ns_create(&body.name).map_err(|e| match e {
        CatalogError::Duplicate(_) => ApiError::Conflict("Namespace already exists.".to_string()),
        other => ApiError::from(other),
    })?;
    Ok(HttpResponse::Created().json(ns))
}

/// Catch-all that feeds the pure registry router. A fallthrough (404 with
/// no body) surfaces as a plain 404 here; there is no upstream to defer to
/// on the management listener.
pub(crate) async fn registry(
    req: HttpRequest,
    body: web::Bytes,
    ctx: web::Data<CoreContext>,
) -> HttpResponse {
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok());
    let mut sink = ResponseSink::new();
    dispatch(
        ctx.get_ref(),
        &RegistryRequest {
            method: req.method().as_str(),
            path: req.path(),
            query: req.query_string(),
            content_type,
            body: &body,
        },
        &mut sink,
    );
    match sink.synthesize() {
        Some(resp) => {
            let status =
                StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut builder = HttpResponse::build(status);
            builder.content_type(resp.content_type.as_str());
            for (name, value) in &resp.headers {
                builder.header(name.as_str(), value.as_str());
            }
            builder.body(resp.body)
        }
        None => HttpResponse::NotFound().finish(),
    }
}

#[cfg(test)]
mod tests {
    use crate::test_helpers;
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App};

    #[actix_rt::test]
    async fn test_namespace_lifecycle() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());

        let mut app = test::init_service(
            App::new()
                .app_data(web::Data::from(ctx.clone()))
                .configure(crate::handlers::configure_routes)
                .default_service(web::route().to(crate::handlers::api::registry)),
        )
        .await;

        // Nothing reserved yet.
        let req = test::TestRequest::get().uri("/private-packages").to_request();
        let resp: serde_json::Value = test::read_response_json(&mut app, req).await;
        assert_eq!(serde_json::json!([]), resp);

        // Reserve one.
        let req = test::TestRequest::post()
            .uri("/private-packages")
            .set_json(&serde_json::json!({"name": "acme/widgets"}))
            .to_request();
        let resp = test::call_service(&mut app, req).await;
        assert_eq!(StatusCode::CREATED, resp.status());

        // Re-posting is a conflict.
        let req = test::TestRequest::post()
            .uri("/private-packages")
            .set_json(&serde_json::json!({"name": "acme/widgets"}))
            .to_request();
        let resp = test::call_service(&mut app, req).await;
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());

        let req = test::TestRequest::get().uri("/private-packages").to_request();
        let resp: serde_json::Value = test::read_response_json(&mut app, req).await;
        assert_eq!(serde_json::json!([{"name": "acme/widgets"}]), resp);
    }

    #[actix_rt::test]
    async fn test_create_namespace_rejects_bad_names() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());

        let mut app = test::init_service(
            App::new()
                .app_data(web::Data::from(ctx.clone()))
                .configure(crate::handlers::configure_routes)
                .default_service(web::route().to(crate::handlers::api::registry)),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/private-packages")
            .set_json(&serde_json::json!({"name": "bad name"}))
            .to_request();
        let resp = test::call_service(&mut app, req).await;
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());
    }

    #[actix_rt::test]
    async fn test_registry_surface_is_reachable() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.insert("elm/core", "1.0.0", false).unwrap();

        let mut app = test::init_service(
            App::new()
                .app_data(web::Data::from(ctx.clone()))
                .configure(crate::handlers::configure_routes)
                .default_service(web::route().to(crate::handlers::api::registry)),
        )
        .await;

        let req = test::TestRequest::get().uri("/all-packages").to_request();
        let resp: serde_json::Value = test::read_response_json(&mut app, req).await;
        assert_eq!(serde_json::json!({"elm/core": ["1.0.0"]}), resp);
    }

    #[actix_rt::test]
    async fn test_unknown_route_is_404() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());

        let mut app = test::init_service(
            App::new()
                .app_data(web::Data::from(ctx.clone()))
                .configure(crate::handlers::configure_routes)
                .default_service(web::route().to(crate::handlers::api::registry)),
        )
        .await;

        let req = test::TestRequest::get().uri("/nope").to_request();
        let resp = test::call_service(&mut app, req).await;
        assert_eq!(StatusCode::NOT_FOUND, resp.status());
    }

    #[actix_rt::test]
    async fn test_register_over_http() {
        let root = test_helpers::data_root();
        let ctx = test_helpers::test_context(root.path());
        ctx.catalog.ns_create("acme/widgets").unwrap();

        let mut app = test::init_service(
            App::new()
                .app_data(web::Data::from(ctx.clone()))
                .configure(crate::handlers::configure_routes)
                .default_service(web::route().to(crate::handlers::api::registry)),
        )
        .await;

        let (content_type, body) = test_helpers::multipart_body(&[
            ("elm.json", br#"{"name":"acme/widgets"}"#),
            ("github-hash", b"deadbeef"),
        ]);
        let req = test::TestRequest::post()
            .uri("/register?name=acme/widgets&version=1.2.3")
            .header("Content-Type", content_type.as_str())
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&mut app, req).await;
        assert_eq!(StatusCode::CREATED, resp.status());

        // The new version is visible through the read surface.
        let req = test::TestRequest::get()
            .uri("/packages/acme/widgets/1.2.3/endpoint.json")
            .to_request();
        let resp: serde_json::Value = test::read_response_json(&mut app, req).await;
        assert_eq!(
            serde_json::json!({
                "url": "https://github.com/acme/widgets/zipball/1.2.3/",
                "hash": "deadbeef",
            }),
            resp
        );
    }
}
