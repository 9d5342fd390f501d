//! HTTP surface
//!
//! Handlers stay thin: identity comes from the `User` header, bodies are
//! raw bytes or small JSON documents, and every domain decision lives in
//! a service. Errors render as `{"error": ...}` with the status mapped
//! by the error type.

use actix_web::{web, HttpRequest, HttpResponse};
use bytes::BytesMut;
use futures::StreamExt;
use log::debug;
use serde::Deserialize;
use serde_json::json;

use crate::app_state::AppState;
use crate::blob::{verify_token, BlobError, BlobUri};
use crate::db::StageInsert;
use crate::error::{Error, Result};
use crate::service::UserContext;

/// GET /health
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// POST /upload/{category}/{filename} with the file as the raw body
pub async fn upload(
    path: web::Path<(String, String)>,
    mut payload: web::Payload,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let (category, filename) = path.into_inner();
    debug!("Upload request: category={}, filename={}", category, filename);

    // abort the stream as soon as the cap is crossed instead of buffering
    // the whole oversized body
    let cap = app_state.config.server.max_payload_size as usize;
    let mut bytes = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|e| Error::Validation {
            message: format!("could not read upload body: {}", e),
        })?;
        if bytes.len() + chunk.len() > cap {
            return Err(Error::Validation {
                message: "File too large. Max size is 10MB.".to_string(),
            });
        }
        bytes.extend_from_slice(&chunk);
    }

    let file = app_state
        .file_service
        .upload(user.user_id, &category, &filename, &bytes)
        .await?;
    Ok(HttpResponse::Created().json(json!({
        "message": "Upload saved",
        "file_id": file.id,
        "filename": file.filename,
        "category": file.category,
    })))
}

/// GET /files
pub async fn list_files(req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let listing = app_state.file_service.list_files(user.user_id)?;
    Ok(HttpResponse::Ok().json(listing))
}

/// GET /fasta-files
pub async fn fasta_files(req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let files = app_state.file_service.fasta_files(user.user_id)?;
    Ok(HttpResponse::Ok().json(files))
}

/// GET /analyses
pub async fn fasta_analyses(
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let analyses = app_state.file_service.fasta_analyses(user.user_id)?;
    Ok(HttpResponse::Ok().json(analyses))
}

/// GET /fastq-files
pub async fn fastq_analyses(
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let analyses = app_state.file_service.fastq_analyses(user.user_id)?;
    Ok(HttpResponse::Ok().json(analyses))
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeFastaRequest {
    pub file_id: i64,
}

/// POST /analyze-fasta
pub async fn analyze_fasta(
    body: web::Json<AnalyzeFastaRequest>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let (_, summary) = app_state
        .stage_runner
        .analyze_fasta(user.user_id, body.file_id)
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "message": "Analysis complete",
        "result": { "sequence_count": summary.sequence_count },
    })))
}

#[derive(Debug, Deserialize)]
pub struct RunPcrRequest {
    pub primer_file_id: i64,
    pub reference_file_id: i64,
    pub name: String,
    pub cycle_count: i64,
}

/// POST /run-pcr
pub async fn run_pcr(
    body: web::Json<RunPcrRequest>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let outcome = app_state
        .stage_runner
        .run_pcr(
            user.user_id,
            body.primer_file_id,
            body.reference_file_id,
            &body.name,
            body.cycle_count,
        )
        .await?;

    match outcome {
        StageInsert::Created(analysis) => {
            let file = app_state
                .repository
                .get_file(analysis.output_file_id)?
                .ok_or_else(|| Error::Storage {
                    message: format!("output file {} missing after insert", analysis.output_file_id),
                })?;
            let path = file.locator.clone();
            Ok(HttpResponse::Created().json(json!({
                "message": "PCR files created successfully",
                "pcr_analysis_name": analysis.name,
                "file": file,
                "path": path,
            })))
        }
        StageInsert::AlreadyExists(analysis) => Ok(HttpResponse::Ok().json(json!({
            "message": "PCR already exists",
            "result": analysis,
            "files": [
                { "id": analysis.primer_file_id, "filename": analysis.primer_filename },
                { "id": analysis.reference_file_id, "filename": analysis.reference_filename },
            ],
        }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateFastqRequest {
    pub pcr_file_id: i64,
    pub sample_name: String,
    pub analysis_name: String,
    pub sequence_count: i64,
}

/// POST /create-fastq
pub async fn create_fastq(
    body: web::Json<CreateFastqRequest>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let outcome = app_state
        .stage_runner
        .run_fastq(
            user.user_id,
            body.pcr_file_id,
            &body.sample_name,
            &body.analysis_name,
            body.sequence_count,
        )
        .await?;

    match outcome {
        StageInsert::Created(analysis) => {
            let mut files = Vec::with_capacity(2);
            for file_id in [analysis.r1_file_id, analysis.r2_file_id] {
                files.push(app_state.repository.get_file(file_id)?.ok_or_else(|| {
                    Error::Storage {
                        message: format!("output file {} missing after insert", file_id),
                    }
                })?);
            }
            let paths = json!({ "r1": files[0].locator, "r2": files[1].locator });
            Ok(HttpResponse::Created().json(json!({
                "message": "FASTQ files created successfully",
                "sample_name": analysis.sample_name,
                "files": files,
                "paths": paths,
            })))
        }
        StageInsert::AlreadyExists(analysis) => Ok(HttpResponse::Ok().json(json!({
            "message": "Analysis already exists",
            "result": analysis,
            "files": [
                { "id": analysis.r1_file_id, "filename": analysis.r1_filename },
                { "id": analysis.r2_file_id, "filename": analysis.r2_filename },
            ],
        }))),
    }
}

/// GET /download/{file_id}
pub async fn download(
    path: web::Path<i64>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    let url = app_state
        .file_service
        .download_url(user.user_id, path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "url": url })))
}

/// DELETE /files/{file_id}
pub async fn delete_file(
    path: web::Path<i64>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    app_state
        .deletion_service
        .delete_file(user.user_id, path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "message": "file deleted successfully" })))
}

/// DELETE /fastq-analyses/{analysis_id}
pub async fn delete_fastq_analysis(
    path: web::Path<i64>,
    req: HttpRequest,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    app_state
        .deletion_service
        .delete_fastq_analysis(user.user_id, path.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true })))
}

/// POST /session
///
/// Marks the start of a user session and kicks off a background sweep of
/// that user's files. The response never waits on the sweep.
pub async fn session(req: HttpRequest, app_state: web::Data<AppState>) -> Result<HttpResponse> {
    let user = UserContext::from_request(&req)?;
    app_state.reconcile_worker.clone().spawn_user_sweep(user.user_id);
    Ok(HttpResponse::Ok().json(json!({ "message": "Session recorded" })))
}

#[derive(Debug, Deserialize)]
pub struct BlobQuery {
    pub expires: i64,
    pub signature: String,
    #[serde(default)]
    pub filename: Option<String>,
}

/// GET /blobs/{bucket}/{key} carrying presign query parameters
///
/// Serves objects for presigned URLs handed out by the local backend.
/// The signature covers bucket, key and expiry; anything stale or
/// tampered with is refused before the store is touched.
pub async fn serve_blob(
    path: web::Path<(String, String)>,
    query: web::Query<BlobQuery>,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let (bucket, key) = path.into_inner();
    let uri = BlobUri::new(&bucket, &key);

    let now = chrono::Utc::now().timestamp();
    let secret = &app_state.config.blob.signing_secret;
    if !verify_token(secret, &uri, query.expires, &query.signature, now) {
        return Ok(
            HttpResponse::Forbidden().json(json!({ "error": "invalid or expired signature" }))
        );
    }

    let data = app_state.blob_store.get(&uri).await.map_err(|e| match e {
        BlobError::NotFound => Error::NotFound,
        other => Error::from(other),
    })?;
    let filename = query
        .filename
        .clone()
        .unwrap_or_else(|| key.rsplit('/').next().unwrap_or("download").to_string());
    Ok(HttpResponse::Ok()
        .content_type("application/octet-stream")
        .insert_header((
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", filename),
        ))
        .body(data))
}

/// Mount every route on the app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/upload/{category}/{filename}", web::post().to(upload))
        .route("/files", web::get().to(list_files))
        .route("/fasta-files", web::get().to(fasta_files))
        .route("/fastq-files", web::get().to(fastq_analyses))
        .route("/analyses", web::get().to(fasta_analyses))
        .route("/analyze-fasta", web::post().to(analyze_fasta))
        .route("/run-pcr", web::post().to(run_pcr))
        .route("/create-fastq", web::post().to(create_fastq))
        .route("/download/{file_id}", web::get().to(download))
        .route("/files/{file_id}", web::delete().to(delete_file))
        .route("/fastq-analyses/{analysis_id}", web::delete().to(delete_fastq_analysis))
        .route("/session", web::post().to(session))
        .route("/blobs/{bucket}/{key:.*}", web::get().to(serve_blob));
}
