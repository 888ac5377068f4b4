mod classifier;
mod config;
mod decoders;
mod error;
mod formats;
mod orchestrator;
mod routes;
mod temp;
mod validator;

#[cfg(test)]
mod test_support;

use actix_web::{HttpServer, web};
use classifier::Classifier;
use config::ServerConfig;
use orchestrator::Orchestrator;
use routes::build_app;
use std::sync::Arc;
use validator::ImageValidator;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = ServerConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::other(e.to_string())
    })?;

    let classifier = Arc::new(Classifier::initialize(&config.model));
    let info = classifier.model_info();
    log::info!(
        "Classifier state: {} (runtime: {}, {} classes)",
        info.state,
        info.runtime,
        info.num_classes
    );
    if let Some(message) = &info.message {
        log::warn!("{}", message);
    }

    let orchestrator = Orchestrator::new(
        classifier,
        ImageValidator::new(config.validation_limits()),
        config.upload_dir.clone(),
    )
    .inspect_err(|e| {
        log::error!(
            "Failed to create upload folder {}: {}",
            config.upload_dir.display(),
            e
        )
    })?;
    log::info!("Upload folder: {}", orchestrator.upload_dir().display());

    let bind_address = config.bind_address();
    let orchestrator = web::Data::new(orchestrator);
    let config = web::Data::new(config);

    log::info!("Starting plankton recognition server at http://{}", bind_address);
    HttpServer::new(move || build_app(orchestrator.clone(), config.clone()))
        .bind(bind_address)?
        .run()
        .await
}
