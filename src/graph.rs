use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::auth::TokenProvider;
use crate::error::PipelineError;

pub const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionInfo {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub id: String,
    #[serde(default = "PageInfo::default_title")]
    pub title: String,
    #[serde(default, rename = "lastModifiedDateTime")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl PageInfo {
    fn default_title() -> String {
        "Untitled".to_string()
    }
}

/// Read access to the notebook backing a deck job. The pipeline only ever
/// lists pages, pulls page markup and downloads referenced binaries, so
/// stub implementations stay small.
#[async_trait::async_trait]
pub trait NotesSource: Send + Sync {
    async fn list_notebooks(&self) -> Result<Vec<NotebookInfo>, PipelineError>;
    async fn list_sections(&self, notebook_id: &str) -> Result<Vec<SectionInfo>, PipelineError>;
    async fn list_pages(&self, section_id: &str) -> Result<Vec<PageInfo>, PipelineError>;
    async fn page_html(&self, page_id: &str) -> Result<String, PipelineError>;
    async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Microsoft Graph implementation. Collection endpoints are drained across
/// `@odata.nextLink` pages before any result is returned.
pub struct GraphNotesSource {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

impl GraphNotesSource {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, PipelineError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| PipelineError::source_fetch(url, err.into()))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(PipelineError::auth(format!(
                "notes source rejected the token ({status})"
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::source_fetch(
                url,
                anyhow::anyhow!("unexpected status {status}"),
            ));
        }
        Ok(response)
    }

    async fn get_all<T: serde::de::DeserializeOwned>(
        &self,
        first_url: String,
    ) -> Result<Vec<T>, PipelineError> {
        let mut items = Vec::new();
        let mut next = Some(first_url);
        while let Some(url) = next {
            let response = self.get(&url).await?;
            let page: Collection<T> = response
                .json()
                .await
                .map_err(|err| PipelineError::source_fetch(&url, err.into()))?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }
}

#[async_trait::async_trait]
impl NotesSource for GraphNotesSource {
    async fn list_notebooks(&self) -> Result<Vec<NotebookInfo>, PipelineError> {
        let url = format!(
            "{}/me/onenote/notebooks?$select=id,displayName&$orderby=displayName",
            self.base_url
        );
        self.get_all(url).await
    }

    async fn list_sections(&self, notebook_id: &str) -> Result<Vec<SectionInfo>, PipelineError> {
        let url = format!(
            "{}/me/onenote/notebooks/{}/sections?$select=id,displayName&$orderby=displayName",
            self.base_url, notebook_id
        );
        self.get_all(url).await
    }

    async fn list_pages(&self, section_id: &str) -> Result<Vec<PageInfo>, PipelineError> {
        let url = format!(
            "{}/me/onenote/sections/{}/pages?$select=id,title,lastModifiedDateTime&$orderby=lastModifiedDateTime desc&$top=100",
            self.base_url, section_id
        );
        let pages = self.get_all(url).await?;
        tracing::debug!(section_id, count = pages.len(), "listed section pages");
        Ok(pages)
    }

    async fn page_html(&self, page_id: &str) -> Result<String, PipelineError> {
        let url = format!("{}/me/onenote/pages/{}/content", self.base_url, page_id);
        let response = self.get(&url).await?;
        response
            .text()
            .await
            .map_err(|err| PipelineError::source_fetch(&url, err.into()))
    }

    async fn fetch_binary(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self.get(url).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| PipelineError::source_fetch(url, err.into()))?;
        Ok(bytes.to_vec())
    }
}
