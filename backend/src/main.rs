use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use backend::config::AppConfig;
use backend::history::HistoryRepository;
use backend::model::ConvNet;
use backend::pipeline::Pipeline;
use backend::routes::{OWNER_HEADER, configure_routes};
use backend::storage::UploadStore;
use std::env;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    let classifier = ConvNet::load_adapter(&config.model.path).map_err(|e| {
        log::error!(
            "Failed to load model from {}: {}",
            config.model.path.display(),
            e
        );
        std::io::Error::other(format!("Model loading failed: {}", e))
    })?;
    log::info!(
        "Loaded model '{}' (GradCAM layer '{}', input {}px)",
        classifier.name(),
        classifier.target_layer(),
        classifier.input_spec().size
    );
    let pipeline = Pipeline::new(classifier).with_alpha(config.overlay.alpha);

    let store = UploadStore::new(&config.storage.root, config.storage.max_upload_bytes);
    store.ensure_dirs().map_err(|e| {
        log::error!("Failed to prepare {}: {}", config.storage.root.display(), e);
        std::io::Error::other(format!("Storage setup failed: {}", e))
    })?;
    let history = HistoryRepository::new();
    let upload_root = config.storage.root.clone();

    let bind_address = config.bind_address();
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .allowed_header(OWNER_HEADER)
                    .expose_headers(vec![actix_web::http::header::CONTENT_DISPOSITION])
                    .max_age(3600),
            )
            .app_data(web::Data::new(pipeline.clone()))
            .app_data(web::Data::new(store.clone()))
            .app_data(web::Data::new(history.clone()))
            .configure(|cfg| configure_routes(cfg, upload_root.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}
