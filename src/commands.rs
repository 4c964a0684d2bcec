use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;

use crate::app::model::{JobEvent, JobOutcome, StartDeckRequest};
use crate::app::runner::JobRunner;
use crate::auth::EnvTokenProvider;
use crate::cli::{GenerateArgs, NotebooksArgs, SectionsArgs};
use crate::gemini::GeminiClient;
use crate::graph::{GraphNotesSource, NotesSource};
use crate::store::DeckStore;

pub const TOKEN_ENV_VAR: &str = "GRAPH_ACCESS_TOKEN";

fn notes_source(base_url: &str) -> GraphNotesSource {
    let tokens = Arc::new(EnvTokenProvider::new(TOKEN_ENV_VAR));
    GraphNotesSource::new(reqwest::Client::new(), base_url, tokens)
}

/// Runs one deck job from the terminal, logging progress as it streams.
pub async fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let tokens = Arc::new(EnvTokenProvider::new(TOKEN_ENV_VAR));
    let source = Arc::new(GraphNotesSource::new(
        http.clone(),
        &args.graph_base_url,
        tokens,
    ));
    let model = Arc::new(GeminiClient::from_env(http).context("configure content model")?);
    let deck_store = DeckStore::new(&args.out);
    let runner = JobRunner::new(source, model, deck_store, PathBuf::from(&args.work_dir));

    let request = StartDeckRequest {
        section_id: args.section_id.clone(),
        section_name: args.section_name.clone(),
        page_ids: args.page_ids.clone(),
        preferences: args.preferences(),
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let consumer = tokio::spawn(async move {
        let mut outcome: Option<JobOutcome> = None;
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::Progress(progress) => {
                    tracing::info!(progress = progress.progress, "{}", progress.message);
                }
                JobEvent::Terminal(terminal) => outcome = Some(terminal),
            }
        }
        outcome
    });

    runner.run(request, tx).await;
    let outcome = consumer
        .await
        .context("join progress consumer")?
        .context("job ended without a terminal event")?;

    if !outcome.success {
        anyhow::bail!(
            "deck generation failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    let deck_name = outcome.deck_name.unwrap_or_default();
    println!(
        "{} ({} cards) -> {}/{}",
        deck_name,
        outcome.total_cards,
        args.out,
        outcome
            .download_url
            .unwrap_or_default()
            .trim_start_matches("/download/"),
    );
    Ok(())
}

pub async fn notebooks(args: NotebooksArgs) -> anyhow::Result<()> {
    let source = notes_source(&args.graph_base_url);
    let notebooks = source.list_notebooks().await.context("list notebooks")?;
    for notebook in notebooks {
        println!("{}\t{}", notebook.id, notebook.display_name);
    }
    Ok(())
}

pub async fn sections(args: SectionsArgs) -> anyhow::Result<()> {
    let source = notes_source(&args.graph_base_url);
    let sections = source
        .list_sections(&args.notebook_id)
        .await
        .context("list sections")?;
    for section in sections {
        println!("{}\t{}", section.id, section.display_name);
    }
    Ok(())
}
