use std::collections::HashMap;
use std::io::Read as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use deckify::apkg::DeckManifest;
use deckify::app::model::{JobEvent, JobOutcome, StartDeckRequest};
use deckify::app::runner::JobRunner;
use deckify::error::PipelineError;
use deckify::gemini::{ContentModel, InlineImage};
use deckify::graph::{NotebookInfo, NotesSource, PageInfo, SectionInfo};
use deckify::pipeline::GenerationPreferences;
use deckify::store::DeckStore;

static CELL_PNG: &[u8] = &[
    137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4, 0,
    0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3, 1,
    128, 110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
];

struct StubSource {
    pages: Vec<PageInfo>,
    html: HashMap<String, String>,
}

#[async_trait::async_trait]
impl NotesSource for StubSource {
    async fn list_notebooks(&self) -> Result<Vec<NotebookInfo>, PipelineError> {
        Ok(Vec::new())
    }

    async fn list_sections(&self, _notebook_id: &str) -> Result<Vec<SectionInfo>, PipelineError> {
        Ok(Vec::new())
    }

    async fn list_pages(&self, _section_id: &str) -> Result<Vec<PageInfo>, PipelineError> {
        Ok(self.pages.clone())
    }

    async fn page_html(&self, page_id: &str) -> Result<String, PipelineError> {
        self.html
            .get(page_id)
            .cloned()
            .ok_or_else(|| PipelineError::source_fetch(page_id, anyhow::anyhow!("no such page")))
    }

    async fn fetch_binary(&self, _url: &str) -> Result<Vec<u8>, PipelineError> {
        Ok(CELL_PNG.to_vec())
    }
}

/// Answers concept map, image analysis and flashcard prompts for the
/// "Alpha" page; every model call mentioning "Beta" fails.
struct StubModel {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ContentModel for StubModel {
    async fn generate(
        &self,
        prompt: &str,
        image: Option<&InlineImage>,
    ) -> Result<String, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("Beta") {
            return Err(PipelineError::model_call("model API error (503)", None));
        }
        if image.is_some() {
            return Ok(
                "A labeled diagram of a cell.\n- What organelle produces ATP?".to_string(),
            );
        }
        if prompt.contains("concept map") {
            return Ok(r#"```json
{"title": "Cells", "concepts": [{"id": "mito", "name": "Mitochondria", "description": "Makes ATP"}], "relationships": []}
```"#
                .to_string());
        }
        // Flashcards: fenced, with one untyped card to exercise derivation.
        Ok(r#"Here are your cards:
```json
[
  {"type": "cloze", "question": "The [cloze:mitochondria] make ATP", "relatedImages": ["image_1.png"]},
  {"question": "What does the nucleus store?", "answer": "DNA", "notes": "Chromatin lives here."},
  {"question": "Mitochondria is the Powerhouse of the Cell."}
]
```"#
            .to_string())
    }
}

fn alpha_beta_request() -> StartDeckRequest {
    StartDeckRequest {
        section_id: "sec1".to_string(),
        section_name: "Biology".to_string(),
        page_ids: Vec::new(),
        preferences: GenerationPreferences::default(),
    }
}

fn stub_runner(decks: &std::path::Path, work: &std::path::Path) -> JobRunner {
    let source = Arc::new(StubSource {
        pages: vec![
            PageInfo {
                id: "p1".to_string(),
                title: "Alpha".to_string(),
                last_modified: None,
            },
            PageInfo {
                id: "p2".to_string(),
                title: "Beta".to_string(),
                last_modified: None,
            },
        ],
        html: HashMap::from([
            (
                "p1".to_string(),
                "<h1>Cells</h1><p>The cell is the basic unit.</p>\
                 <img src=\"https://notes/cell\" alt=\"cell diagram\">"
                    .to_string(),
            ),
            ("p2".to_string(), "<p>Beta content.</p>".to_string()),
        ]),
    });
    let model = Arc::new(StubModel {
        calls: AtomicUsize::new(0),
    });
    JobRunner::new(
        source,
        model,
        DeckStore::new(decks),
        work.to_path_buf(),
    )
}

async fn run_job(runner: &JobRunner, request: StartDeckRequest) -> Vec<JobEvent> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    runner.run(request, tx).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn terminal(events: &[JobEvent]) -> &JobOutcome {
    let terminals: Vec<&JobOutcome> = events
        .iter()
        .filter_map(|event| match event {
            JobEvent::Terminal(outcome) => Some(outcome),
            JobEvent::Progress(_) => None,
        })
        .collect();
    assert_eq!(terminals.len(), 1, "exactly one terminal event");
    terminals[0]
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_page_contributes_zero_cards_but_job_succeeds() {
    let decks = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let runner = stub_runner(decks.path(), work.path());

    let events = run_job(&runner, alpha_beta_request()).await;

    let outcome = terminal(&events);
    assert!(outcome.success);
    assert_eq!(outcome.total_cards, 3);
    assert!(outcome.download_url.as_deref().unwrap().starts_with("/download/"));
    assert!(outcome.deck_name.as_deref().unwrap().starts_with("Biology"));

    // Page 2 failed but was contained.
    let saw_page_error = events.iter().any(|event| {
        matches!(event, JobEvent::Progress(p) if serde_json::to_value(p).unwrap()["stage"] == "page_error")
    });
    assert!(saw_page_error);

    // Work dir is cleaned on the success path.
    assert!(!work.path().join("jobs").exists() || std::fs::read_dir(work.path().join("jobs")).unwrap().next().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_is_monotone_and_ends_at_the_terminal_event() {
    let decks = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let runner = stub_runner(decks.path(), work.path());

    let events = run_job(&runner, alpha_beta_request()).await;

    let mut last = 0;
    for event in &events {
        if let JobEvent::Progress(progress) = event {
            assert!(progress.progress >= last, "progress went backwards");
            last = progress.progress;
        }
    }
    assert!(last > 0);
    assert!(matches!(events.last(), Some(JobEvent::Terminal(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn packaged_deck_carries_cards_and_deduplicated_media() {
    let decks = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let runner = stub_runner(decks.path(), work.path());

    let events = run_job(&runner, alpha_beta_request()).await;
    let outcome = terminal(&events);
    let file_name = outcome
        .download_url
        .as_deref()
        .unwrap()
        .trim_start_matches("/download/")
        .to_string();

    let bytes = std::fs::read(decks.path().join(&file_name)).unwrap();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut raw = Vec::new();
    archive
        .by_name("deck.json")
        .unwrap()
        .read_to_end(&mut raw)
        .unwrap();
    let manifest: DeckManifest = serde_json::from_slice(&raw).unwrap();

    assert_eq!(manifest.cards.len(), 3);
    // The downloaded image appears exactly once even though the cloze
    // card references it both in its notes and in relatedImages.
    assert_eq!(manifest.media, vec!["image_1.png".to_string()]);

    // Untyped card with question only became cloze with a synthesized
    // marker around the first mid-sentence capitalized word.
    let cloze_texts: Vec<&str> = manifest
        .cards
        .iter()
        .filter(|card| card.model == "Cloze")
        .map(|card| card.fields[0].as_str())
        .collect();
    assert!(cloze_texts
        .iter()
        .any(|text| text.contains("the {{c1::Powerhouse}} of")));
    assert!(cloze_texts
        .iter()
        .any(|text| text.contains("{{c1::mitochondria}}")));

    // Provenance tag from the page title.
    assert!(manifest.cards.iter().all(|card| card.tags.contains("alpha")));
}

#[tokio::test(flavor = "multi_thread")]
async fn card_limit_caps_each_page() {
    let decks = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let runner = stub_runner(decks.path(), work.path());

    let mut request = alpha_beta_request();
    request.preferences.max_cards_per_page = 2;
    let events = run_job(&runner, request).await;
    assert_eq!(terminal(&events).total_cards, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn job_with_no_cards_packages_an_empty_deck() {
    struct GarbageModel;

    #[async_trait::async_trait]
    impl ContentModel for GarbageModel {
        async fn generate(
            &self,
            _prompt: &str,
            _image: Option<&InlineImage>,
        ) -> Result<String, PipelineError> {
            Ok("I am unable to help with that.".to_string())
        }
    }

    let decks = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let source = Arc::new(StubSource {
        pages: vec![PageInfo {
            id: "p1".to_string(),
            title: "Alpha".to_string(),
            last_modified: None,
        }],
        html: HashMap::from([("p1".to_string(), "<p>words</p>".to_string())]),
    });
    let runner = JobRunner::new(
        source,
        Arc::new(GarbageModel),
        DeckStore::new(decks.path()),
        work.path().to_path_buf(),
    );

    let events = run_job(&runner, alpha_beta_request()).await;
    let outcome = terminal(&events);
    // Empty output is not a job failure; the packaged deck just has no
    // cards in it.
    assert!(outcome.success);
    assert_eq!(outcome.total_cards, 0);
    let file_name = outcome
        .download_url
        .as_deref()
        .unwrap()
        .trim_start_matches("/download/")
        .to_string();
    let bytes = std::fs::read(decks.path().join(&file_name)).unwrap();
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
    let mut raw = Vec::new();
    archive
        .by_name("deck.json")
        .unwrap()
        .read_to_end(&mut raw)
        .unwrap();
    let manifest: DeckManifest = serde_json::from_slice(&raw).unwrap();
    assert!(manifest.cards.is_empty());
    assert!(!work.path().join("jobs").exists() || std::fs::read_dir(work.path().join("jobs")).unwrap().next().is_none());
}
