#![warn(clippy::all, clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use tracing::info;

mod error;
mod routes;

use error::AppError;
use logger::init_tracing;
use modelwatch::orchestrator::SnapshotService;
use modelwatch::pool::open_pool;
use modelwatch::{Config, Orchestrator};

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    init_tracing();

    let config = Config::load(None::<&str>)?;
    let addr: SocketAddr = config.server.bind.parse()?;

    let pool = open_pool(&config.database.path, config.database.max_connections).await?;
    let mut orchestrator = Orchestrator::new(config, pool).await?;
    orchestrator.spawn_background();

    let result = run_server(addr, orchestrator.snapshots()).await;
    orchestrator.shutdown().await;
    result
}

async fn run_server(addr: SocketAddr, snapshots: Arc<SnapshotService>) -> Result<(), AppError> {
    info!("Listening on {}", addr);
    let snapshots = web::Data::from(snapshots);

    HttpServer::new(move || App::new().app_data(snapshots.clone()).configure(routes::routes))
        .bind(addr)?
        .run()
        .await?;

    Ok(())
}
