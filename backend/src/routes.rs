use std::path::{Path, PathBuf};

use actix_files::Files;
use actix_multipart::Multipart;
use actix_web::http::{StatusCode, header};
use actix_web::{FromRequest, HttpRequest, HttpResponse, ResponseError, web};
use chrono::Utc;
use futures::future::{Ready, ready};
use futures::{StreamExt, TryStreamExt};
use shared::{ErrorResponse, HistoryEntry, PredictionResponse};
use uuid::Uuid;

use crate::history::{HistoryError, HistoryRepository, PredictionRecord};
use crate::pipeline::{AnalysisRequest, ImageKind, Pipeline, PipelineError, RawImage};
use crate::report::ReportDocument;
use crate::storage::{StorageError, UploadStore};

pub const OWNER_HEADER: &str = "X-User-Id";
const UPLOAD_FIELD: &str = "file";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing X-User-Id header")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    UnsupportedMediaType(String),
    #[error("Prediction not found")]
    NotFound,
    #[error("Access denied")]
    Forbidden,
    #[error("Internal server error")]
    Internal(String),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let ApiError::Internal(detail) = self {
            log::error!("Request failed: {}", detail);
        }
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UnsupportedFormat(_) => ApiError::UnsupportedMediaType(err.to_string()),
            PipelineError::DecodeError(_) => ApiError::BadRequest(err.to_string()),
            PipelineError::InferenceFailure(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::FileTooLarge => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::NotFound => ApiError::NotFound,
            HistoryError::Forbidden => ApiError::Forbidden,
        }
    }
}

/// Opaque caller identifier taken from the `X-User-Id` header.
#[derive(Debug, Clone)]
pub struct RequestOwner(pub String);

impl FromRequest for RequestOwner {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut actix_web::dev::Payload) -> Self::Future {
        let owner = req
            .headers()
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match owner {
            Some(owner) => ready(Ok(RequestOwner(owner.to_string()))),
            None => {
                log::warn!("Rejected request to {} without {}", req.path(), OWNER_HEADER);
                ready(Err(ApiError::Unauthorized))
            }
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, upload_root: PathBuf) {
    cfg.service(web::resource("/api/predict").route(web::post().to(predict)))
        .service(web::resource("/api/predictions/{id}").route(web::get().to(get_prediction)))
        .service(web::resource("/api/history").route(web::get().to(list_history)))
        .service(web::resource("/api/reports/{id}").route(web::get().to(download_report)))
        .service(Files::new("/uploads", upload_root));
}

fn to_response(record: &PredictionRecord, store: &UploadStore) -> PredictionResponse {
    let url = |path: &Path| {
        store
            .public_url(path)
            .unwrap_or_else(|| path.display().to_string())
    };
    PredictionResponse {
        id: record.id,
        prediction_class: record.prediction_class,
        confidence: record.confidence(),
        confidence_cancer: record.confidence_cancer,
        confidence_normal: record.confidence_normal,
        original_image_url: url(record.original_image_path.as_path()),
        heatmap_image_url: url(record.heatmap_image_path.as_path()),
        created_at: record.created_at.to_rfc3339(),
    }
}

/// Reads the `file` field, enforcing the upload limit while streaming.
async fn read_upload(
    payload: &mut Multipart,
    store: &UploadStore,
) -> Result<(Vec<u8>, ImageKind), ApiError> {
    while let Some(mut field) = payload
        .try_next()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let extension = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_string();
        let kind = ImageKind::from_tag(&extension)?;

        let mut image_data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| ApiError::BadRequest(format!("Upload interrupted: {}", e)))?;
            image_data.extend_from_slice(&chunk);
            store.validate_image_size(&image_data)?;
        }
        if image_data.is_empty() {
            return Err(ApiError::BadRequest("Uploaded file is empty".into()));
        }
        return Ok((image_data, kind));
    }
    Err(ApiError::BadRequest(format!("No '{}' field in upload", UPLOAD_FIELD)))
}

async fn predict(
    owner: RequestOwner,
    pipeline: web::Data<Pipeline>,
    store: web::Data<UploadStore>,
    history: web::Data<HistoryRepository>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let (image_data, kind) = read_upload(&mut payload, &store).await?;
    log::info!("Received {} byte {:?} upload from {}", image_data.len(), kind, owner.0);

    let worker_store = store.clone();
    let (analysis, files) = web::block(move || -> Result<_, ApiError> {
        let request = AnalysisRequest {
            owner: owner.0,
            image: RawImage::with_kind(image_data, kind),
        };
        let analysis = pipeline.analyze(request)?;
        let files = worker_store.save_analysis(
            &analysis.owner,
            &analysis.image,
            analysis.prediction.overlay(),
            analysis.prediction.created_at(),
        )?;
        Ok((analysis, files))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Analysis worker failed: {}", e)))??;

    let record = PredictionRecord::from_prediction(analysis.owner, &analysis.prediction, files);
    let record = history.insert(record).await;
    log::info!(
        "Prediction {}: {} ({:.4})",
        record.id,
        record.prediction_class,
        record.confidence()
    );
    Ok(HttpResponse::Ok().json(to_response(&record, &store)))
}

async fn get_prediction(
    owner: RequestOwner,
    path: web::Path<Uuid>,
    store: web::Data<UploadStore>,
    history: web::Data<HistoryRepository>,
) -> Result<HttpResponse, ApiError> {
    let record = history.get_for_owner(path.into_inner(), &owner.0).await?;
    Ok(HttpResponse::Ok().json(to_response(&record, &store)))
}

async fn list_history(
    owner: RequestOwner,
    history: web::Data<HistoryRepository>,
) -> Result<HttpResponse, ApiError> {
    let entries: Vec<HistoryEntry> = history
        .list_for_owner(&owner.0)
        .await
        .iter()
        .map(PredictionRecord::to_history_entry)
        .collect();
    Ok(HttpResponse::Ok().json(entries))
}

async fn download_report(
    owner: RequestOwner,
    path: web::Path<Uuid>,
    store: web::Data<UploadStore>,
    history: web::Data<HistoryRepository>,
) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    // Held until the report is attached so a prediction never gets two.
    let _generating = history.report_guard().await;
    let record = history.get_for_owner(id, &owner.0).await?;

    let worker_store = store.clone();
    let (markdown, generated) = web::block(move || -> Result<(String, Option<PathBuf>), ApiError> {
        if let Some(existing) = record.report_path.as_deref().filter(|p| p.exists()) {
            return Ok((worker_store.load_report(existing)?, None));
        }
        let generated_at = Utc::now();
        let markdown = ReportDocument::build(&record, generated_at).render_markdown();
        let report_path = worker_store.report_path(&record.owner, record.id, generated_at);
        worker_store.save_report(&report_path, &markdown)?;
        Ok((markdown, Some(report_path)))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("Report worker failed: {}", e)))??;

    if let Some(report_path) = generated {
        log::info!("Generated report {} for prediction {}", report_path.display(), id);
        history.attach_report(id, report_path).await?;
    }

    Ok(HttpResponse::Ok()
        .content_type("text/markdown; charset=utf-8")
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"bone_cancer_report_{}.md\"", id),
        ))
        .body(markdown))
}
