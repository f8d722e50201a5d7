use actix_web::{middleware, web, App, HttpServer};
use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

mod catalog;
mod cli;
mod errors;
mod handlers;
mod ingest;
mod mitm;
mod proxy;
mod router;
mod settings;
mod storage;
mod sync;
#[cfg(test)]
mod test_helpers;

use catalog::Catalog;
use settings::Settings;
use storage::ArtifactStore;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Shared handles every subsystem works against: the catalog index, the
/// artifact tree, the upstream HTTP client, and the parsed settings. Built
/// once at boot and passed around behind an `Arc`.
pub struct CoreContext {
    pub settings: Settings,
    pub catalog: Catalog,
    pub store: ArtifactStore,
    pub upstream: reqwest::Client,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let opt = cli::parse_args();
    let settings = Settings::load(&opt.config)?;
    env_logger::Builder::new()
        .filter_level(settings.log_level()?)
        .init();

    let ca_cert = fs::read_to_string("./ca.crt").context("reading ./ca.crt")?;
    let ca_key = fs::read_to_string("./ca.key").context("reading ./ca.key")?;
    let authority =
        Arc::new(mitm::CertAuthority::load(&ca_cert, &ca_key).context("loading CA key pair")?);

    fs::create_dir_all(settings.package_root()).context("creating storage directories")?;
    let catalog = Catalog::open(settings.database_path()).context("opening catalog index")?;
    let store = ArtifactStore::new(settings.package_root());
    let upstream = reqwest::Client::builder()
        .timeout(UPSTREAM_TIMEOUT)
        .build()
        .context("building upstream client")?;

    let ctx = Arc::new(CoreContext {
        settings: settings.clone(),
        catalog,
        store,
        upstream,
    });

    log::info!("initializing catalog mirror");
    sync::run_once(&ctx).await.context("initial catalog sync")?;

    let proxy_listener = TcpListener::bind(&settings.services.proxy)
        .await
        .with_context(|| format!("binding proxy listener on {}", settings.services.proxy))?;
    log::info!("starting proxy server on {}", settings.services.proxy);

    let (sync_stop, sync_stop_rx) = oneshot::channel();
    let (proxy_stop, proxy_stop_rx) = oneshot::channel();
    actix_rt::spawn(sync::worker(ctx.clone(), sync_stop_rx));
    actix_rt::spawn(proxy::run(
        ctx.clone(),
        authority,
        proxy_listener,
        proxy_stop_rx,
    ));

    log::info!("starting API server on {}", settings.services.api);
    let data = web::Data::from(ctx.clone());
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(data.clone())
            .app_data(web::PayloadConfig::new(MAX_UPLOAD_BYTES))
            .configure(handlers::configure_routes)
            .default_service(web::route().to(handlers::api::registry))
    })
    .bind(&settings.services.api)?
    .shutdown_timeout(10)
    .run()
    .await?;

    // The API server has drained; stop the background tasks and exit.
    let _ = sync_stop.send(());
    let _ = proxy_stop.send(());
    log::info!("shutdown complete");
    Ok(())
}
