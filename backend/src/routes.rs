use actix_multipart::{Multipart, MultipartError};
use actix_web::{web, HttpResponse};
use futures::{StreamExt, TryStreamExt};
use log::{debug, error, info, warn};
use shared::{AboutResponse, ErrorResponse, HealthResponse};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::pipeline::registry::ClassRegistry;
use crate::pipeline::{Pipeline, Upload};

/// Process-wide state handed to every handler. Nothing in it is mutated
/// after startup.
pub struct AppState {
    pipeline: Result<Arc<Pipeline>, PipelineError>,
    registry: Arc<ClassRegistry>,
    config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        pipeline: Result<Arc<Pipeline>, PipelineError>,
        registry: Arc<ClassRegistry>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            pipeline,
            registry,
            config,
        }
    }

    fn pipeline(&self) -> Result<Arc<Pipeline>, PipelineError> {
        self.pipeline.clone()
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/predict").route(web::post().to(handle_predict)))
        .service(web::resource("/class_info/{class_id}").route(web::get().to(class_info)))
        .service(web::resource("/api/classes").route(web::get().to(list_classes)))
        .service(web::resource("/api/health").route(web::get().to(health_check)))
        .service(web::resource("/api/about").route(web::get().to(about)));
}

fn error_response(request_id: Uuid, err: &PipelineError) -> HttpResponse {
    match err {
        PipelineError::InvalidInput(_) => {
            warn!("[{}] Rejected upload: {}", request_id, err)
        }
        _ => error!("[{}] Prediction failed: {}", request_id, err),
    }
    HttpResponse::build(err.status_code()).json(ErrorResponse::new(err.user_message()))
}

fn mime_from_extension(file_name: &str) -> Option<&'static str> {
    let extension = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Part content type, falling back to the file extension when the client
/// sent none or a generic one.
fn resolve_mime(content_type: Option<&str>, file_name: Option<&str>) -> Option<String> {
    match content_type {
        Some(ct) if !ct.eq_ignore_ascii_case("application/octet-stream") => Some(ct.to_string()),
        _ => file_name
            .and_then(mime_from_extension)
            .map(str::to_string),
    }
}

fn malformed_upload(err: MultipartError) -> PipelineError {
    debug!("Malformed multipart body: {}", err);
    PipelineError::InvalidInput("No file uploaded".into())
}

/// Reads the `file` part, aborting as soon as it grows past `max_bytes`.
async fn read_upload(payload: &mut Multipart, max_bytes: usize) -> Result<Upload, PipelineError> {
    while let Some(mut field) = payload.try_next().await.map_err(malformed_upload)? {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        if file_name.as_deref().is_some_and(str::is_empty) {
            return Err(PipelineError::InvalidInput("No file selected".into()));
        }
        let content_type = field.content_type().map(|m| m.essence_str().to_string());

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk.map_err(malformed_upload)?;
            if bytes.len() + data.len() > max_bytes {
                return Err(PipelineError::InvalidInput(format!(
                    "File too large. Maximum size is {} MB.",
                    max_bytes / (1024 * 1024)
                )));
            }
            bytes.extend_from_slice(&data);
        }
        if bytes.is_empty() {
            return Err(PipelineError::InvalidInput("No file selected".into()));
        }

        let mime = resolve_mime(content_type.as_deref(), file_name.as_deref()).ok_or_else(|| {
            PipelineError::InvalidInput("Invalid file type. Please upload an image.".into())
        })?;
        return Ok(Upload {
            bytes,
            mime,
            file_name,
        });
    }
    Err(PipelineError::InvalidInput("No file uploaded".into()))
}

async fn handle_predict(state: web::Data<AppState>, mut payload: Multipart) -> HttpResponse {
    let request_id = Uuid::new_v4();

    let pipeline = match state.pipeline() {
        Ok(pipeline) => pipeline,
        Err(e) => return error_response(request_id, &e),
    };

    let upload = match read_upload(&mut payload, state.config.upload.max_bytes).await {
        Ok(upload) => upload,
        Err(e) => return error_response(request_id, &e),
    };
    info!(
        "[{}] Received {} ({} bytes, {})",
        request_id,
        upload.file_name.as_deref().unwrap_or("<unnamed>"),
        upload.bytes.len(),
        upload.mime
    );

    // If the client disconnects, this future is dropped and the blocking
    // result is discarded with it.
    let outcome = web::block(move || pipeline.predict(&upload)).await;
    match outcome {
        Ok(Ok(result)) => {
            info!(
                "[{}] Responding with {} ({})",
                request_id,
                result.class_info.abbr,
                result.confidence()
            );
            HttpResponse::Ok().json(result.into_response())
        }
        Ok(Err(e)) => error_response(request_id, &e),
        Err(e) => error_response(
            request_id,
            &PipelineError::Internal(format!("blocking task failed: {}", e)),
        ),
    }
}

async fn class_info(state: web::Data<AppState>, path: web::Path<usize>) -> HttpResponse {
    let class_id = path.into_inner();
    match state.registry.get(class_id) {
        Some(info) => HttpResponse::Ok().json(info),
        None => HttpResponse::NotFound().json(ErrorResponse::new("Invalid class ID")),
    }
}

async fn list_classes(state: web::Data<AppState>) -> HttpResponse {
    let classes: Vec<_> = state.registry.iter().collect();
    HttpResponse::Ok().json(classes)
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    match state.pipeline() {
        Ok(pipeline) => HttpResponse::Ok().json(HealthResponse {
            status: "healthy".into(),
            model_loaded: true,
            model_version: Some(pipeline.model_version().to_string()),
        }),
        Err(_) => HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "unhealthy".into(),
            model_loaded: false,
            model_version: None,
        }),
    }
}

async fn about(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    HttpResponse::Ok().json(AboutResponse {
        title: config.about.title.clone(),
        description: config.about.description.clone(),
        model: config.model.architecture.clone(),
        model_version: config.model.version.clone(),
        preprocessing_version: config.model.preprocessing.version.clone(),
        dataset: config.about.dataset.clone(),
        accuracy: config.about.accuracy.clone(),
        sensitivity: config.about.sensitivity.clone(),
        classes: state.registry.len(),
    })
}
