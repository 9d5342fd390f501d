//! Stage orchestration
//!
//! Each stage resolves its inputs, consults the repository for a result
//! already recorded under the stage's idempotency key, and only then
//! invokes the collaborator. Successful runs persist output file rows and
//! the analysis row in one repository transaction; a lost insert race is
//! folded into the already-exists success path and the loser's freshly
//! written blobs are discarded best-effort.

use std::sync::Arc;

use log::{info, warn};

use crate::blob::{BlobStore, Locator, URI_SCHEME};
use crate::config::{BlobConfig, PipelineConfig};
use crate::db::{
    ArtifactRepository, FastaAnalysis, FastqAnalysis, FileRecord, NewFastqResult, NewPcrResult,
    NewStageFile, PcrAnalysis, StageInsert,
};
use crate::error::{Error, Result};
use crate::pipeline::{
    parse_stage_json, sanitize_stage_name, Collaborator, FastaSummary, FastqPayload, PcrPayload,
};

/// Executes pipeline stages and persists their results
pub struct StageRunner {
    repository: Arc<ArtifactRepository>,
    blob_store: Arc<dyn BlobStore>,
    collaborator: Collaborator,
    fasta_script: String,
    pcr_script: String,
    fastq_script: String,
    bucket: String,
}

impl StageRunner {
    pub fn new(
        repository: Arc<ArtifactRepository>,
        blob_store: Arc<dyn BlobStore>,
        pipeline: &PipelineConfig,
        blob: &BlobConfig,
    ) -> Self {
        Self {
            repository,
            blob_store,
            collaborator: Collaborator::new(pipeline),
            fasta_script: pipeline.fasta_script.clone(),
            pcr_script: pipeline.pcr_script.clone(),
            fastq_script: pipeline.fastq_script.clone(),
            bucket: blob.bucket.clone(),
        }
    }

    /// Count the sequences in an owned FASTA-format file and persist the
    /// summary. Re-running refreshes the stored summary in place.
    pub async fn analyze_fasta(
        &self,
        user_id: i64,
        file_id: i64,
    ) -> Result<(FastaAnalysis, FastaSummary)> {
        let file = self
            .repository
            .find_live_file(user_id, file_id)?
            .ok_or(Error::NotFound)?;
        if !file.category.is_fasta() {
            return Err(Error::Validation {
                message: format!("File {} is not a FASTA file", file.filename),
            });
        }

        let stdout = self
            .collaborator
            .run("fasta", &self.fasta_script, &[file.locator.clone()])
            .await?;
        let summary: FastaSummary = parse_stage_json("fasta", &stdout)?;

        let result = format!("Found {} sequences.", summary.sequence_count);
        let analysis = self
            .repository
            .upsert_fasta_analysis(user_id, file_id, &result)?;
        Ok((analysis, summary))
    }

    /// Run the PCR generation stage under the idempotency key
    /// (user, primer, reference, sanitized name, cycle count).
    pub async fn run_pcr(
        &self,
        user_id: i64,
        primer_file_id: i64,
        reference_file_id: i64,
        name: &str,
        cycle_count: i64,
    ) -> Result<StageInsert<PcrAnalysis>> {
        if cycle_count <= 0 {
            return Err(Error::Validation {
                message: "cycle_count must be a positive integer".to_string(),
            });
        }
        let run_name = sanitize_stage_name(name);
        if run_name.is_empty() {
            return Err(Error::Validation {
                message: "name contains no usable characters".to_string(),
            });
        }
        let (primer, reference) =
            self.resolve_input_pair(user_id, primer_file_id, reference_file_id)?;

        if let Some(existing) = self.repository.find_pcr_analysis_by_key(
            user_id,
            primer_file_id,
            reference_file_id,
            &run_name,
            cycle_count,
        )? {
            info!(
                "PCR run {} already recorded for user {}, skipping collaborator",
                run_name, user_id
            );
            return Ok(StageInsert::AlreadyExists(existing));
        }

        let args = vec![
            "--primer_path".to_string(),
            primer.locator.clone(),
            "--reference_path".to_string(),
            reference.locator.clone(),
            "--output_prefix".to_string(),
            self.stage_prefix(user_id, "pcr"),
            "--pcr_analysis_name".to_string(),
            run_name.clone(),
            "--cycle_count".to_string(),
            cycle_count.to_string(),
        ];
        let stdout = self.collaborator.run("pcr", &self.pcr_script, &args).await?;
        let payload: PcrPayload = parse_stage_json("pcr", &stdout)?;
        if payload.status != "success" {
            return Err(declared_failure("pcr", &payload.status, payload.error));
        }
        let pcr_path = payload.pcr_path.ok_or_else(|| Error::CollaboratorFailed {
            stage: "pcr".to_string(),
            message: "success payload missing pcr_path".to_string(),
        })?;

        let recorded = self.repository.record_pcr_result(
            user_id,
            NewPcrResult {
                primer_file_id,
                reference_file_id,
                name: run_name,
                cycle_count,
                primer_filename: primer.filename,
                reference_filename: reference.filename,
                output: stage_output_file("pcr", &pcr_path)?,
                result: stdout,
            },
        )?;
        if !recorded.is_created() {
            // a concurrent identical run won the key; drop this run's blob
            self.discard_orphans(&[pcr_path]).await;
        }
        Ok(recorded)
    }

    /// Run the FASTQ generation stage under the idempotency key
    /// (user, sanitized sample name, analysis name, sequence count, source
    /// file).
    pub async fn run_fastq(
        &self,
        user_id: i64,
        pcr_file_id: i64,
        sample_name: &str,
        analysis_name: &str,
        sequence_count: i64,
    ) -> Result<StageInsert<FastqAnalysis>> {
        if sequence_count <= 0 {
            return Err(Error::Validation {
                message: "sequence_count must be a positive integer".to_string(),
            });
        }
        let sample = sanitize_stage_name(sample_name);
        if sample.is_empty() {
            return Err(Error::Validation {
                message: "sample_name contains no usable characters".to_string(),
            });
        }
        if analysis_name.is_empty() {
            return Err(Error::Validation {
                message: "analysis_name must not be empty".to_string(),
            });
        }

        let pcr_file = self
            .repository
            .find_live_file(user_id, pcr_file_id)?
            .ok_or(Error::NotFound)?;
        if !pcr_file.category.is_fasta() {
            return Err(Error::Validation {
                message: format!("File {} is not a FASTA file", pcr_file.filename),
            });
        }

        if let Some(existing) = self.repository.find_fastq_analysis_by_key(
            user_id,
            pcr_file_id,
            &sample,
            analysis_name,
            sequence_count,
        )? {
            info!(
                "FASTQ run {} already recorded for user {}, skipping collaborator",
                analysis_name, user_id
            );
            return Ok(StageInsert::AlreadyExists(existing));
        }

        let args = vec![
            "--pcr_path".to_string(),
            pcr_file.locator.clone(),
            "--output_prefix".to_string(),
            self.stage_prefix(user_id, "fastq"),
            "--sample_name".to_string(),
            sample.clone(),
            "--sequence_count".to_string(),
            sequence_count.to_string(),
        ];
        let stdout = self
            .collaborator
            .run("fastq", &self.fastq_script, &args)
            .await?;
        let payload: FastqPayload = parse_stage_json("fastq", &stdout)?;
        if payload.status != "success" {
            return Err(declared_failure("fastq", &payload.status, payload.error));
        }
        let (r1_path, r2_path) = match (payload.r1_path, payload.r2_path) {
            (Some(r1), Some(r2)) => (r1, r2),
            _ => {
                return Err(Error::CollaboratorFailed {
                    stage: "fastq".to_string(),
                    message: "success payload missing r1_path/r2_path".to_string(),
                });
            }
        };

        let recorded = self.repository.record_fastq_result(
            user_id,
            NewFastqResult {
                pcr_file_id,
                analysis_name: analysis_name.to_string(),
                sample_name: sample,
                sequence_count,
                pcr_filename: pcr_file.filename,
                r1: stage_output_file("fastq", &r1_path)?,
                r2: stage_output_file("fastq", &r2_path)?,
                result: stdout,
            },
        )?;
        if !recorded.is_created() {
            self.discard_orphans(&[r1_path, r2_path]).await;
        }
        Ok(recorded)
    }

    fn resolve_input_pair(
        &self,
        user_id: i64,
        primer_file_id: i64,
        reference_file_id: i64,
    ) -> Result<(FileRecord, FileRecord)> {
        let primer = self.repository.find_live_file(user_id, primer_file_id)?;
        let reference = self.repository.find_live_file(user_id, reference_file_id)?;
        match (primer, reference) {
            (Some(primer), Some(reference)) => Ok((primer, reference)),
            _ => Err(Error::NotFound),
        }
    }

    /// Prefix under which a stage writes its outputs
    fn stage_prefix(&self, user_id: i64, stage: &str) -> String {
        format!("{}{}/{}/{}", URI_SCHEME, self.bucket, user_id, stage)
    }

    /// Best-effort removal of blobs written by the losing side of an insert
    /// race. Failures are logged; the winner's rows are unaffected.
    async fn discard_orphans(&self, locators: &[String]) {
        for locator in locators {
            match Locator::parse(locator) {
                Ok(Locator::Uri(uri)) => {
                    if let Err(e) = self.blob_store.delete(&uri).await {
                        warn!("Could not discard orphaned blob {}: {}", locator, e);
                    }
                }
                Ok(Locator::LegacyPath(path)) => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Could not discard orphaned file {}: {}", locator, e);
                        }
                    }
                }
                Err(e) => warn!("Could not discard orphaned output {}: {}", locator, e),
            }
        }
    }
}

fn declared_failure(stage: &str, status: &str, error: Option<String>) -> Error {
    warn!("{} collaborator declared status {}", stage, status);
    Error::CollaboratorFailed {
        stage: stage.to_string(),
        message: error.unwrap_or_else(|| "Unknown failure".to_string()),
    }
}

/// Build the output file row for a collaborator-reported path
fn stage_output_file(stage: &str, locator: &str) -> Result<NewStageFile> {
    let filename = locator.rsplit('/').next().unwrap_or_default();
    if filename.is_empty() {
        return Err(Error::CollaboratorFailed {
            stage: stage.to_string(),
            message: format!("output path {:?} has no filename", locator),
        });
    }
    Ok(NewStageFile {
        filename: filename.to_string(),
        locator: locator.to_string(),
    })
}
