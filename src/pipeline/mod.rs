//! Pipeline Stage Runner
//!
//! Executes the three analysis stage kinds (FASTA sequence counting, PCR
//! amplicon generation, FASTQ read simulation) against out-of-process
//! collaborator scripts and persists their results through the artifact
//! repository. Stage identity comes from per-kind idempotency keys; an
//! already-recorded run is returned without invoking the collaborator
//! again.

pub mod collaborator;
pub mod runner;

pub use collaborator::Collaborator;
pub use runner::StageRunner;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Parsed FASTA-analysis collaborator output
#[derive(Debug, Clone, Deserialize)]
pub struct FastaSummary {
    pub sequence_count: u64,
}

/// Status envelope printed by the PCR generation script
#[derive(Debug, Clone, Deserialize)]
pub struct PcrPayload {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub pcr_path: Option<String>,
}

/// Status envelope printed by the FASTQ generation script
#[derive(Debug, Clone, Deserialize)]
pub struct FastqPayload {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub r1_path: Option<String>,
    #[serde(default)]
    pub r2_path: Option<String>,
}

/// Parse the single JSON document a collaborator prints to stdout
pub(crate) fn parse_stage_json<T>(stage: &str, stdout: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(Error::CollaboratorFailed {
            stage: stage.to_string(),
            message: "no output produced".to_string(),
        });
    }
    serde_json::from_str(trimmed).map_err(|e| Error::CollaboratorFailed {
        stage: stage.to_string(),
        message: format!("unparseable output: {}", e),
    })
}

/// Sanitize a user-supplied run or sample name.
///
/// One trailing FASTQ-style extension is removed, then every character
/// outside `[A-Za-z0-9_-]`. The sanitized form is the name's identity:
/// differently punctuated inputs that collapse to the same string name the
/// same artifact.
pub fn sanitize_stage_name(raw: &str) -> String {
    strip_fastq_extension(raw)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

fn strip_fastq_extension(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for suffix in [".fastq.gz", ".fq.gz", ".fastq", ".fq"] {
        if lower.ends_with(suffix) {
            return &name[..name.len() - suffix.len()];
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_extension_then_punctuation() {
        assert_eq!(sanitize_stage_name("sample.fastq"), "sample");
        assert_eq!(sanitize_stage_name("sample.FASTQ.GZ"), "sample");
        assert_eq!(sanitize_stage_name("sample.fq"), "sample");
        assert_eq!(sanitize_stage_name("sample.fq.gz"), "sample");
        assert_eq!(sanitize_stage_name("run 1!"), "run1");
        assert_eq!(sanitize_stage_name("my-run_2"), "my-run_2");
    }

    #[test]
    fn test_sanitize_strips_only_one_extension() {
        // the second suffix loses its dot to the character filter instead
        assert_eq!(sanitize_stage_name("a.fastq.fastq"), "afastq");
    }

    #[test]
    fn test_sanitize_can_empty_a_name() {
        assert_eq!(sanitize_stage_name("..."), "");
        assert_eq!(sanitize_stage_name(".fastq"), "");
    }

    #[test]
    fn test_differently_punctuated_names_collide() {
        assert_eq!(sanitize_stage_name("run-7"), sanitize_stage_name("run-7!"));
        assert_eq!(sanitize_stage_name("my run"), sanitize_stage_name("my.run"));
    }

    #[test]
    fn test_parse_stage_json_accepts_surrounding_whitespace() {
        let summary: FastaSummary =
            parse_stage_json("fasta", "  {\"sequence_count\": 12}\n").unwrap();
        assert_eq!(summary.sequence_count, 12);
    }

    #[test]
    fn test_parse_stage_json_rejects_garbage_and_empty() {
        let garbage = parse_stage_json::<FastaSummary>("fasta", "Traceback (most recent call)");
        assert!(matches!(garbage, Err(Error::CollaboratorFailed { .. })));

        let empty = parse_stage_json::<FastaSummary>("fasta", "   \n");
        assert!(matches!(empty, Err(Error::CollaboratorFailed { .. })));
    }

    #[test]
    fn test_generation_payload_shapes() {
        let ok: PcrPayload = parse_stage_json(
            "pcr",
            r#"{"status": "success", "pcr_path": "vault://b/1/pcr/run1.fasta"}"#,
        )
        .unwrap();
        assert_eq!(ok.status, "success");
        assert_eq!(ok.pcr_path.as_deref(), Some("vault://b/1/pcr/run1.fasta"));

        let failed: FastqPayload = parse_stage_json(
            "fastq",
            r#"{"status": "fail_main", "error": "boom", "r1_path": null, "r2_path": null}"#,
        )
        .unwrap();
        assert_eq!(failed.status, "fail_main");
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert!(failed.r1_path.is_none());
    }
}
