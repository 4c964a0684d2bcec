use thiserror::Error;

/// Failure taxonomy of the deck pipeline.
///
/// Page-scoped variants (`AuthRequired`, `SourceFetch`, `ModelCall`) are
/// caught at the page boundary by the job runner; only `Assembly` ends a
/// job in error. Malformed model output is never an error: the coercer
/// always yields a usable value.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("authentication required: {reason}")]
    AuthRequired { reason: String },

    #[error("fetch from notes source failed: {url}: {cause}")]
    SourceFetch { url: String, cause: anyhow::Error },

    #[error("content model call failed: {detail}")]
    ModelCall { detail: String },

    #[error("deck assembly failed: {0}")]
    Assembly(anyhow::Error),
}

impl PipelineError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::AuthRequired {
            reason: reason.into(),
        }
    }

    pub fn source_fetch(url: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::SourceFetch {
            url: url.into(),
            cause,
        }
    }

    pub fn model_call(detail: impl Into<String>, cause: Option<anyhow::Error>) -> Self {
        let mut detail = detail.into();
        if let Some(cause) = cause {
            detail = format!("{detail}: {cause:#}");
        }
        Self::ModelCall { detail }
    }
}
