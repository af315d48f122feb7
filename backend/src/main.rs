mod appstate;
mod availability;
mod config;
mod controller;
mod error;
mod locks;
mod model;
mod plugins;
mod seed;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use appstate::AppState;
use config::Config;
use controller::Routes;
use error::Error;
use model::database::Database;
use plugins::{
    bookings::Booking, checkout::Checkout, listings::Listing, payments::Payment, users::User,
};

pub(crate) fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .add_routes::<User>()
        .add_routes::<Listing>()
        .add_routes::<Booking>()
        .add_routes::<Payment>()
        .add_routes::<Checkout>()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn create_listener(addr: SocketAddr) -> Result<TcpListener, Error> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) => Err(Error::SocketBind(format!("{addr}: {err}"))),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let db = Database::new_with_filename(&config.database_file)
        .await?
        .initialise_all()
        .await?;
    if config.seed_demo_data {
        seed::demo(&db).await?;
    }

    let listener = create_listener(config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        database = %config.database_file,
        min_stay = config.stay.min_stay,
        max_stay = config.stay.max_stay,
        auto_approve = config.auto_approve_on_payment,
        "serving stayhub"
    );
    let app = create_router(AppState::new(db, config));
    axum::serve(listener, app)
        .await
        .map_err(|err| Error::Serve(err.to_string()))
}
