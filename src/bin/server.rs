use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use warp::{self, Filter};

use retro_rooms::bridge::{Bridge, LoggingBridge};
use retro_rooms::config::ServerConfig;
use retro_rooms::core::session::create_session_registry;
use retro_rooms::core::store::{ChatStore, StoreOptions};
use retro_rooms::handlers::{handle_rejection, poll_routes, run_socket_server, ws_route, PollContext};
use retro_rooms::profanity::WordListFilter;

fn exit_with(message: &str, err: impl std::fmt::Display) -> ! {
    error!("{}: {}", message, err);
    std::process::exit(1);
}

fn parse_addr(host: &str, port: u16) -> SocketAddr {
    match format!("{}:{}", host, port).parse() {
        Ok(addr) => addr,
        Err(e) => exit_with("Failed to parse server address", e),
    }
}

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    };

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => exit_with("Invalid configuration", e),
    };
    info!(
        "Configuration: host={}, http_port={}, socket_port={}",
        config.host, config.http_port, config.socket_port
    );

    let rooms = match config.load_rooms() {
        Ok(rooms) => rooms,
        Err(e) => exit_with("Failed to load rooms", e),
    };

    let filter = match WordListFilter::from_files(
        config.censored_words_file.as_deref(),
        config.blocked_words_file.as_deref(),
    ) {
        Ok(filter) => filter,
        Err(e) => exit_with("Failed to load word lists", e),
    };

    let store = Arc::new(ChatStore::new(
        &rooms,
        StoreOptions::from_config(&config),
        Arc::new(filter),
    ));
    info!("Loaded {} rooms", store.rooms().len());

    let sessions = create_session_registry();

    // Background maintenance
    store.clone().start_stale_sweeper(config.sweep_interval);
    sessions
        .clone()
        .start_cleanup_task(store.clone(), config.session_cleanup_interval);
    store
        .flood_control()
        .clone()
        .start_cleanup_task(config.session_cleanup_interval);

    if store.rooms().iter().any(|room| room.is_bridged()) {
        let bridge = Arc::new(Bridge::new(store.clone(), Arc::new(LoggingBridge)));
        bridge.start_relay();
    }

    // Raw socket clients
    let socket_addr = parse_addr(&config.host, config.socket_port);
    let socket_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = run_socket_server(socket_store, socket_addr).await {
            error!("Socket server stopped: {}", e);
        }
    });

    let poll = PollContext::new(store.clone(), sessions, config.poll_timeout)
        .trust_proxy_headers(config.trust_proxy_headers);

    // Create health check route
    let health_route = warp::path("health").map(|| "OK");

    let routes = ws_route(store, config.trust_proxy_headers)
        .or(poll_routes(poll))
        .or(health_route)
        .recover(handle_rejection);

    let addr = parse_addr(&config.host, config.http_port);
    info!("Starting Retro Rooms HTTP server on {}", addr);
    warp::serve(routes).run(addr).await;
}
