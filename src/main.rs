use axum::{Router, Server, http::HeaderValue, middleware::from_fn};
use runner_broker::broker;
use runner_broker::config::Config;
use tower_http::cors::{Any, CorsLayer};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    runner_broker::init_tracing(&config);

    let cors = if config.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    // Broker state and background timers
    let state = broker::create_broker_state(config.clone());
    let broker = state.broker.clone();
    broker.start_background_tasks().await;

    let app = Router::new()
        .merge(broker::create_broker_routes().with_state(state))
        .layer(cors)
        .layer(from_fn(runner_broker::middleware::logger::logger));

    let addr = match config.server_address().parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid server address {}: {}", config.server_address(), e);
            std::process::exit(1);
        }
    };

    tracing::info!("Broker listening on http://{}", addr);
    tracing::info!("Browser WebSocket endpoint: ws://{}/ws", addr);
    tracing::info!("Runner WebSocket endpoint:  ws://{}/ws/runner", addr);

    let server = Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        });

    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
    }

    broker.shutdown().await;
}
