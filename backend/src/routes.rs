use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::body::MessageBody;
use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
use actix_web::middleware::Logger;
use actix_web::{App, Error, HttpRequest, HttpResponse, http::header, web};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{StreamExt, TryStreamExt};
use shared::{
    Base64PredictResponse, Base64Request, ClassesResponse, PredictResponse, ServerInfo,
    ServiceStatus, SizeLimits, StatusResponse,
};
use std::time::Instant;

use crate::classifier::UnavailableCause;
use crate::config::ServerConfig;
use crate::error::{ApiError, ENDPOINTS, InputError};
use crate::formats;
use crate::orchestrator::Orchestrator;
use crate::temp::sanitize_filename;

pub fn build_app(
    orchestrator: web::Data<Orchestrator>,
    config: web::Data<ServerConfig>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = Error,
        InitError = (),
    >,
> {
    let json_limit = config.max_content_length;
    App::new()
        .wrap(Logger::default())
        .wrap(
            Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
                .max_age(3600),
        )
        .app_data(orchestrator)
        .app_data(config)
        .configure(|cfg| configure_routes(cfg, json_limit))
        .default_service(web::to(not_found))
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, json_limit: usize) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(json_limit)
            .error_handler(|err, _req| ApiError::from_json_payload(err).into()),
    )
    .service(
        web::resource("/")
            .route(web::get().to(index))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/status")
            .route(web::get().to(status))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/classes")
            .route(web::get().to(classes))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/predict")
            .route(web::post().to(predict_file))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/predict_base64")
            .route(web::post().to(predict_base64))
            .default_service(web::to(method_not_allowed)),
    );
}

async fn index(orchestrator: web::Data<Orchestrator>) -> HttpResponse {
    let classes: String = orchestrator
        .classifier()
        .classes()
        .iter()
        .map(|class| format!("<li>{class}</li>"))
        .collect();
    let endpoints: String = [
        ("GET", "/", "This page"),
        ("GET", "/status", "Server and model status"),
        ("POST", "/predict", "Classify an image sent as multipart field <code>file</code>"),
        (
            "POST",
            "/predict_base64",
            "Classify an image sent as JSON <code>{\"image\": \"&lt;base64&gt;\"}</code>",
        ),
        ("GET", "/classes", "Classes the model can identify"),
    ]
    .iter()
    .map(|(method, path, what)| format!("<li><b>{method}</b> <code>{path}</code>: {what}</li>"))
    .collect();

    let page = format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"UTF-8\">\
         <title>Plankton Recognition API</title></head>\n<body>\n\
         <h1>Plankton Recognition API</h1>\n<h2>Endpoints</h2>\n<ul>{endpoints}</ul>\n\
         <h2>Supported classes</h2>\n<ul>{classes}</ul>\n\
         <h2>Example</h2>\n<pre><code>curl -X POST -F \"file=@plankton.jpg\" \
         http://localhost:5000/predict</code></pre>\n</body>\n</html>\n"
    );
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(page)
}

fn server_info(config: &ServerConfig) -> ServerInfo {
    ServerInfo {
        server_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        upload_folder: config.upload_dir.display().to_string(),
        max_file_size: format!(
            "{:.1}MB",
            config.max_content_length as f64 / (1024.0 * 1024.0)
        ),
        allowed_extensions: formats::allowed_extensions(),
        image_size_limits: SizeLimits {
            min: format!("{0}x{0}px", config.min_dimension),
            max: format!("{0}x{0}px", config.max_dimension),
        },
    }
}

async fn status(
    orchestrator: web::Data<Orchestrator>,
    config: web::Data<ServerConfig>,
) -> HttpResponse {
    let classifier = orchestrator.classifier();
    let (status, message) = match classifier.unavailable_cause() {
        None => (ServiceStatus::Online, "Plankton recognition server active"),
        Some(UnavailableCause::NotInstalled) => (
            ServiceStatus::Limited,
            "Server active, but the inference runtime is not available",
        ),
        Some(UnavailableCause::InitFailed) => {
            (ServiceStatus::Error, "Plankton classifier not initialized")
        }
    };
    let endpoints = ENDPOINTS
        .iter()
        .filter(|path| status == ServiceStatus::Online || !path.starts_with("/predict"))
        .map(|path| path.to_string())
        .collect();

    let body = StatusResponse {
        status,
        message: message.to_string(),
        model_info: classifier.model_info(),
        server_info: server_info(&config),
        pytorch_available: classifier.runtime_present(),
        endpoints,
    };
    match status {
        ServiceStatus::Error => HttpResponse::InternalServerError().json(body),
        _ => HttpResponse::Ok().json(body),
    }
}

async fn classes(orchestrator: web::Data<Orchestrator>) -> HttpResponse {
    let classifier = orchestrator.classifier();
    let classes = classifier.classes();
    if !classifier.is_available() {
        log::warn!("Class list requested without an available classifier");
    }
    HttpResponse::Ok().json(ClassesResponse {
        num_classes: classes.len(),
        classes,
        pytorch_available: classifier.runtime_present(),
        classifier_initialized: classifier.is_available(),
    })
}

/// Reads the `file` field of a multipart body, enforcing the size ceiling
/// while streaming.
async fn read_file_field(
    mut payload: Multipart,
    max_bytes: u64,
) -> Result<Option<(String, Vec<u8>)>, ApiError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| InputError::MalformedMultipart(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        // a part without a filename parameter is a plain form value, not an upload
        let Some(filename) = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string)
        else {
            continue;
        };

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk.map_err(|e| InputError::MalformedMultipart(e.to_string()))?;
            if (image_data.len() + data.len()) as u64 > max_bytes {
                return Err(ApiError::PayloadTooLarge {
                    size: None,
                    max: max_bytes,
                });
            }
            image_data.extend_from_slice(&data);
        }
        return Ok(Some((filename, image_data)));
    }
    Ok(None)
}

fn is_multipart(req: &HttpRequest) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().starts_with("multipart/form-data"))
}

fn elapsed_secs(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0
}

async fn predict_file(
    req: HttpRequest,
    orchestrator: web::Data<Orchestrator>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let start = Instant::now();
    orchestrator.ensure_available()?;

    if !is_multipart(&req) {
        return Err(InputError::NoFile.into());
    }
    let (filename, image_data) = read_file_field(payload, orchestrator.max_upload_bytes())
        .await?
        .ok_or(InputError::NoFile)?;
    if filename.is_empty() {
        return Err(InputError::EmptyFilename.into());
    }
    if !formats::is_allowed_file(&filename) {
        return Err(InputError::DisallowedType { filename }.into());
    }

    let filename = sanitize_filename(&filename);
    let worker = orchestrator.clone();
    let name = filename.clone();
    let classified = web::block(move || worker.classify(&name, &image_data)).await??;

    log::info!(
        "Prediction succeeded for {}: {} ({:.2})",
        filename,
        classified.prediction.predicted_class,
        classified.prediction.confidence
    );
    Ok(HttpResponse::Ok().json(PredictResponse {
        success: true,
        filename,
        prediction: classified.prediction,
        processing_time: elapsed_secs(start),
    }))
}

/// Accepts raw base64 or a `data:<mime>;base64,` URI.
fn decode_base64(encoded: &str) -> Result<Vec<u8>, InputError> {
    let data = encoded
        .split_once(',')
        .map(|(_, data)| data)
        .unwrap_or(encoded);
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(cleaned)
        .map_err(|_| InputError::InvalidBase64)
}

async fn predict_base64(
    orchestrator: web::Data<Orchestrator>,
    body: web::Json<Base64Request>,
) -> Result<HttpResponse, ApiError> {
    let start = Instant::now();
    orchestrator.ensure_available()?;

    let encoded = body.into_inner().image.ok_or(InputError::MissingImageField)?;
    if encoded.trim().is_empty() {
        return Err(InputError::EmptyBase64.into());
    }
    let image_data = decode_base64(&encoded)?;

    let max = orchestrator.max_upload_bytes();
    if image_data.len() as u64 > max {
        return Err(ApiError::PayloadTooLarge {
            size: Some(image_data.len() as u64),
            max,
        });
    }

    let extension = formats::sniff(&image_data)
        .ok_or(InputError::NotAnImage)?
        .extension();

    let worker = orchestrator.clone();
    let classified = web::block(move || {
        worker.classify(&format!("base64_upload.{extension}"), &image_data)
    })
    .await??;

    log::info!(
        "Base64 prediction succeeded: {} ({:.2})",
        classified.prediction.predicted_class,
        classified.prediction.confidence
    );
    Ok(HttpResponse::Ok().json(Base64PredictResponse {
        success: true,
        prediction: classified.prediction,
        processing_time: elapsed_secs(start),
        image_info: classified.image_info,
    }))
}

async fn not_found(req: HttpRequest) -> Result<HttpResponse, ApiError> {
    Err(ApiError::NotFound {
        path: req.path().to_string(),
    })
}

async fn method_not_allowed(req: HttpRequest) -> Result<HttpResponse, ApiError> {
    Err(ApiError::MethodNotAllowed {
        method: req.method().to_string(),
        path: req.path().to_string(),
    })
}
