mod config;
mod error;
mod pipeline;
mod routes;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use config::AppConfig;
use pipeline::registry::ClassRegistry;
use pipeline::Pipeline;
use routes::{configure_routes, AppState};
use std::env;
use std::io::{Error, ErrorKind};
use std::sync::Arc;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("Failed to load configuration: {}", e);
        Error::new(ErrorKind::InvalidInput, e.to_string())
    })?;
    let config = Arc::new(config);

    let registry = ClassRegistry::load(&config.registry.path).map_err(|e| {
        log::error!("Failed to load class registry: {}", e);
        Error::new(ErrorKind::InvalidData, e.to_string())
    })?;
    let registry = Arc::new(registry);
    log::info!("Loaded {} lesion classes", registry.len());

    let pipeline = match Pipeline::load(&config, registry.clone()) {
        Ok(pipeline) => {
            log::info!(
                "Model {} ready ({})",
                pipeline.model_version(),
                config.model.path.display()
            );
            Ok(Arc::new(pipeline))
        }
        Err(e) if config.server.serve_without_model => {
            log::warn!("Serving without a model: {}", e);
            Err(e)
        }
        Err(e) => {
            log::error!("Failed to load model at startup: {}", e);
            return Err(Error::other(format!("Model loading failed: {}", e)));
        }
    };

    let state = web::Data::new(AppState::new(pipeline, registry, config.clone()));
    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!("Starting server on {}", bind_address);

    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(state.clone())
            .configure(configure_routes)
    });
    if let Some(workers) = config.server.workers {
        server = server.workers(workers);
    }
    server.bind(&bind_address)?.run().await
}
