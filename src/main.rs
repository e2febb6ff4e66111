use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use xvision::auth::IdentityVerifier;
use xvision::classifier::{FractureClassifier, OnnxClassifier};
use xvision::config::Config;
use xvision::detector::{OnnxYoloDetector, RegionDetector};
use xvision::handlers::{self, UploadLimits};
use xvision::persistence::SqlitePredictionStore;
use xvision::report::ChatCompletionsReporter;
use xvision::storage::FsBlobStore;
use xvision::Orchestrator;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let classifier = FractureClassifier::new(OnnxClassifier::load(&config.classifier_model)?);
    let detector = RegionDetector::new(
        OnnxYoloDetector::load(&config.detector_model)?,
        &config.temp_dir,
    );
    let reporter = ChatCompletionsReporter::new(config.report.clone())?;
    let blobs = FsBlobStore::new(&config.upload_dir, "uploads");
    let records = SqlitePredictionStore::connect(&config.database_url).await?;

    if config.report.api_key.is_none() {
        tracing::warn!("no report API key configured");
    }
    if config.tokens.is_empty() {
        tracing::warn!("no API tokens configured, every prediction request will be rejected");
    }

    let orchestrator = web::Data::new(
        Orchestrator::new(
            Arc::new(classifier),
            Arc::new(detector),
            Arc::new(reporter),
            Arc::new(blobs),
            Arc::new(records),
        )
        .with_max_concurrency(config.max_concurrent_predictions)
        .with_report_failure(config.report_failure),
    );
    let verifier: web::Data<dyn IdentityVerifier> =
        web::Data::from(Arc::new(config.tokens.clone()) as Arc<dyn IdentityVerifier>);
    let limits = web::Data::new(UploadLimits {
        max_bytes: config.max_upload_bytes,
    });
    let origins = config.allowed_origins.clone();

    tracing::info!("Server running at http://{}", config.bind_addr);

    HttpServer::new(move || {
        let cors = origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allow_any_method()
            .allow_any_header()
            .supports_credentials();

        App::new()
            .wrap(cors)
            .app_data(orchestrator.clone())
            .app_data(verifier.clone())
            .app_data(limits.clone())
            .configure(handlers::configure)
    })
    .bind(&config.bind_addr)?
    .run()
    .await?;

    Ok(())
}
