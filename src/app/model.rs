use serde::{Deserialize, Serialize};

use crate::pipeline::{GenerationPreferences, Stage};

/// One deck generation request. Transient: it lives for the duration of
/// the job it describes and is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDeckRequest {
    pub section_id: String,
    #[serde(default)]
    pub section_name: String,
    /// Empty means every page in the section.
    #[serde(default)]
    pub page_ids: Vec<String>,
    #[serde(default)]
    pub preferences: GenerationPreferences,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: Stage,
    pub progress: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_count: Option<usize>,
}

/// Terminal event of a job stream. `complete` is always true; clients
/// key on it to stop listening.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub complete: bool,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deck_name: Option<String>,
    pub total_cards: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn success(deck_name: String, file_name: &str, total_cards: usize) -> Self {
        Self {
            complete: true,
            success: true,
            download_url: Some(format!("/download/{file_name}")),
            deck_name: Some(deck_name),
            total_cards,
            error: None,
        }
    }

    pub fn failure(message: String) -> Self {
        Self {
            complete: true,
            success: false,
            download_url: None,
            deck_name: None,
            total_cards: 0,
            error: Some(message),
        }
    }
}

/// Everything a progress consumer can receive. Serialized untagged so
/// the wire shape matches what event-stream clients expect: progress
/// frames carry `stage`, the terminal frame carries `complete`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobEvent {
    Progress(ProgressEvent),
    Terminal(JobOutcome),
}
