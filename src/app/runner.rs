use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;

use crate::app::model::{JobEvent, JobOutcome, ProgressEvent, StartDeckRequest};
use crate::cards::Flashcard;
use crate::deck;
use crate::error::PipelineError;
use crate::gemini::ContentModel;
use crate::graph::{NotesSource, PageInfo};
use crate::pipeline::{PagePipeline, Stage};
use crate::store::DeckStore;

/// Wall-clock ceiling for packaging; a deck that takes longer than this
/// to zip is treated as an assembly fault.
const ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Drives one deck job end to end: strictly sequential pages, per-page
/// error containment, progress into an event channel, exactly one
/// terminal event. Consumers (SSE writer, CLI logger) only ever read the
/// channel; they never influence the job.
pub struct JobRunner {
    source: Arc<dyn NotesSource>,
    model: Arc<dyn ContentModel>,
    deck_store: DeckStore,
    work_root: PathBuf,
}

impl JobRunner {
    pub fn new(
        source: Arc<dyn NotesSource>,
        model: Arc<dyn ContentModel>,
        deck_store: DeckStore,
        work_root: PathBuf,
    ) -> Self {
        Self {
            source,
            model,
            deck_store,
            work_root,
        }
    }

    pub async fn run(&self, request: StartDeckRequest, events: UnboundedSender<JobEvent>) {
        let job_id = uuid::Uuid::new_v4().to_string();
        let work_dir = self.work_root.join("jobs").join(&job_id);
        tracing::info!(job_id, section_id = %request.section_id, "deck job started");

        let outcome = match self.try_run(&request, &work_dir, &events).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(job_id, ?err, "deck job failed");
                JobOutcome::failure(format!("{err:#}"))
            }
        };

        if work_dir.exists()
            && let Err(err) = tokio::fs::remove_dir_all(&work_dir).await
        {
            tracing::warn!(job_id, ?err, "job work dir cleanup failed");
        }

        // Receivers may be gone (dropped stream client); the job still ran
        // to completion and the deck stays downloadable.
        let _ = events.send(JobEvent::Terminal(outcome));
    }

    async fn try_run(
        &self,
        request: &StartDeckRequest,
        work_dir: &Path,
        events: &UnboundedSender<JobEvent>,
    ) -> anyhow::Result<JobOutcome> {
        let media_dir = work_dir.join("media");
        tokio::fs::create_dir_all(&media_dir)
            .await
            .with_context(|| format!("create media dir: {}", media_dir.display()))?;

        let listed = self
            .source
            .list_pages(&request.section_id)
            .await
            .context("list section pages")?;
        let pages = select_pages(listed, &request.page_ids);
        if pages.is_empty() {
            anyhow::bail!("section has no pages to process");
        }

        let pipeline = PagePipeline::new(
            Arc::clone(&self.source),
            Arc::clone(&self.model),
            request.preferences.clone(),
            media_dir.clone(),
        );

        let mut tracker = ProgressTracker::new(pages.len());
        let mut all_cards: Vec<Flashcard> = Vec::new();
        for (index, page) in pages.iter().enumerate() {
            let mut on_stage = |stage: Stage, message: String| {
                let progress = tracker.percent(index, stage.fraction());
                let _ = events.send(JobEvent::Progress(ProgressEvent {
                    stage,
                    progress,
                    message,
                    card_count: None,
                }));
            };
            match pipeline.run_page(page, &mut on_stage).await {
                Ok(cards) => {
                    let progress = tracker.percent(index, Stage::PageComplete.fraction());
                    let _ = events.send(JobEvent::Progress(ProgressEvent {
                        stage: Stage::PageComplete,
                        progress,
                        message: format!("Finished \"{}\"", page.title),
                        card_count: Some(cards.len()),
                    }));
                    all_cards.extend(cards);
                }
                Err(err) => {
                    tracing::warn!(page_id = %page.id, ?err, "page failed, continuing");
                    let progress = tracker.percent(index, Stage::PageError.fraction());
                    let _ = events.send(JobEvent::Progress(ProgressEvent {
                        stage: Stage::PageError,
                        progress,
                        message: page_error_message(&page.title, &err),
                        card_count: Some(0),
                    }));
                }
            }
        }

        if all_cards.is_empty() {
            tracing::warn!("no cards came out of the selected pages, packaging an empty deck");
        }

        let deck_name = deck_name_for(request);
        let total_cards = all_cards.len();
        let name = deck_name.clone();
        let assembly_media_dir = media_dir.clone();
        let assembled = tokio::time::timeout(
            ASSEMBLY_TIMEOUT,
            tokio::task::spawn_blocking(move || {
                deck::assemble(&name, all_cards, &assembly_media_dir, Utc::now())
            }),
        )
        .await
        .map_err(|_| PipelineError::Assembly(anyhow::anyhow!("deck assembly timed out")))?
        .context("join assembly task")?
        .map_err(PipelineError::Assembly)?;

        self.deck_store
            .save(&assembled.file_name, &assembled.bytes)
            .await
            .map_err(PipelineError::Assembly)?;

        tracing::info!(
            deck = %assembled.file_name,
            total_cards,
            cloze = assembled.stats.cloze,
            standard = assembled.stats.standard,
            media = assembled.stats.media_files,
            "deck assembled"
        );
        Ok(JobOutcome::success(
            deck_name,
            &assembled.file_name,
            total_cards,
        ))
    }
}

/// Resolves the requested page ids against the section listing, keeping
/// the request's order. An id the listing does not know is still
/// processed under a placeholder title. An empty request means the whole
/// section in listing order.
fn select_pages(listed: Vec<PageInfo>, requested: &[String]) -> Vec<PageInfo> {
    if requested.is_empty() {
        return listed;
    }
    requested
        .iter()
        .map(|id| {
            listed
                .iter()
                .find(|page| &page.id == id)
                .cloned()
                .unwrap_or_else(|| PageInfo {
                    id: id.clone(),
                    title: "Untitled".to_string(),
                    last_modified: None,
                })
        })
        .collect()
}

fn deck_name_for(request: &StartDeckRequest) -> String {
    let base = if request.section_name.trim().is_empty() {
        "OneNote Deck"
    } else {
        request.section_name.trim()
    };
    format!("{} {}", base, Utc::now().format("%Y-%m-%d"))
}

fn page_error_message(title: &str, err: &PipelineError) -> String {
    match err {
        PipelineError::AuthRequired { reason } => {
            format!("Skipped \"{title}\": authentication required ({reason})")
        }
        _ => format!("Skipped \"{title}\": {err}"),
    }
}

/// Progress is `(pages completed + sub-stage fraction) / total pages`,
/// clamped to never decrease across consecutive events of one job.
struct ProgressTracker {
    total: usize,
    last: u32,
}

impl ProgressTracker {
    fn new(total: usize) -> Self {
        Self {
            total: total.max(1),
            last: 0,
        }
    }

    fn percent(&mut self, pages_done: usize, fraction: f64) -> u32 {
        let raw = (pages_done as f64 + fraction) / self.total as f64 * 100.0;
        let raw = raw.clamp(0.0, 100.0).round() as u32;
        self.last = self.last.max(raw);
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_never_decreases() {
        let mut tracker = ProgressTracker::new(2);
        let a = tracker.percent(0, 0.7);
        let b = tracker.percent(0, 1.0);
        let c = tracker.percent(1, 0.05);
        let d = tracker.percent(1, 1.0);
        assert!(a <= b && b <= c && c <= d);
        assert_eq!(d, 100);
        // A later event computing a smaller raw value is clamped up.
        assert_eq!(tracker.percent(0, 0.0), 100);
    }

    #[test]
    fn selection_preserves_request_order_and_tolerates_unknown_ids() {
        let listed = vec![
            PageInfo {
                id: "a".to_string(),
                title: "A".to_string(),
                last_modified: None,
            },
            PageInfo {
                id: "b".to_string(),
                title: "B".to_string(),
                last_modified: None,
            },
        ];
        let pages = select_pages(listed.clone(), &["b".to_string(), "ghost".to_string()]);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].title, "B");
        assert_eq!(pages[1].title, "Untitled");
        assert_eq!(select_pages(listed, &[]).len(), 2);
    }
}
