use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cards::{Flashcard, normalize_page_tag};
use crate::coerce;
use crate::concept_map::ConceptMap;
use crate::error::PipelineError;
use crate::extract::{self, ExtractedImage};
use crate::gemini::{ContentModel, InlineImage, mime_type_for_file};
use crate::graph::{NotesSource, PageInfo};

/// Word budget for any single payload handed to the content model.
/// Applied per call, silently.
pub const MAX_PROMPT_WORDS: usize = 6000;

const MAX_POTENTIAL_QUESTIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CardComplexity {
    Basic,
    #[default]
    Standard,
    Advanced,
}

/// Per-job knobs for which stages run and how the model is instructed.
/// Read-only for the duration of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationPreferences {
    pub enable_cloze: bool,
    pub enable_standard: bool,
    pub enable_process: bool,
    pub enable_concept_map: bool,
    /// 0 means unlimited.
    pub max_cards_per_page: usize,
    pub card_complexity: CardComplexity,
    pub process_images: bool,
    pub generate_concept_maps: bool,
    pub use_original_text: bool,
    pub include_metadata: bool,
}

impl Default for GenerationPreferences {
    fn default() -> Self {
        Self {
            enable_cloze: true,
            enable_standard: true,
            enable_process: false,
            enable_concept_map: true,
            max_cards_per_page: 0,
            card_complexity: CardComplexity::Standard,
            process_images: true,
            generate_concept_maps: true,
            use_original_text: false,
            include_metadata: true,
        }
    }
}

/// Progress stages emitted per page, always in this order. `PageComplete`
/// and `PageError` close a page; the runner, not the pipeline, emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loading,
    Extracting,
    ProcessingImages,
    GeneratingMap,
    CreatingCards,
    PageComplete,
    PageError,
}

impl Stage {
    /// Fraction of a page's work done when this stage begins. Feeds the
    /// monotone progress computation in the runner.
    pub fn fraction(self) -> f64 {
        match self {
            Stage::Loading => 0.05,
            Stage::Extracting => 0.2,
            Stage::ProcessingImages => 0.4,
            Stage::GeneratingMap => 0.55,
            Stage::CreatingCards => 0.7,
            Stage::PageComplete | Stage::PageError => 1.0,
        }
    }
}

/// One job's view of its collaborators plus the scratch space images are
/// downloaded into. Built per job, passed around explicitly.
pub struct PagePipeline {
    source: Arc<dyn NotesSource>,
    model: Arc<dyn ContentModel>,
    preferences: GenerationPreferences,
    media_dir: PathBuf,
}

impl PagePipeline {
    pub fn new(
        source: Arc<dyn NotesSource>,
        model: Arc<dyn ContentModel>,
        preferences: GenerationPreferences,
        media_dir: PathBuf,
    ) -> Self {
        Self {
            source,
            model,
            preferences,
            media_dir,
        }
    }

    pub fn preferences(&self) -> &GenerationPreferences {
        &self.preferences
    }

    /// Runs the full stage sequence for one page and returns its cards.
    /// `on_stage` fires as each stage begins. Any error is the caller's
    /// to contain; a failed page must not fail the job.
    pub async fn run_page(
        &self,
        page: &PageInfo,
        on_stage: &mut (dyn FnMut(Stage, String) + Send),
    ) -> Result<Vec<Flashcard>, PipelineError> {
        on_stage(Stage::Loading, format!("Loading \"{}\"", page.title));
        let html = self.source.page_html(&page.id).await?;

        on_stage(Stage::Extracting, format!("Extracting \"{}\"", page.title));
        let content = extract::extract(&html);
        let mut images =
            extract::fetch_images(self.source.as_ref(), content.images, &self.media_dir).await;

        if self.preferences.process_images && !images.is_empty() {
            on_stage(
                Stage::ProcessingImages,
                format!("Analyzing {} image(s)", images.len()),
            );
            self.analyze_images(&page.title, &mut images).await;
        }

        let map = if self.preferences.generate_concept_maps && !content.text.trim().is_empty() {
            on_stage(Stage::GeneratingMap, "Building concept map".to_string());
            let prompt = concept_map_prompt(&page.title, &content.text);
            let raw = self.model.generate(&prompt, None).await?;
            coerce::concept_map_from_response(&raw)
        } else {
            ConceptMap::default()
        };

        on_stage(Stage::CreatingCards, format!("Creating cards for \"{}\"", page.title));
        let prompt = flashcards_prompt(&page.title, &content.text, &map, &images, &self.preferences);
        let raw = self.model.generate(&prompt, None).await?;
        let mut cards: Vec<Flashcard> = coerce::flashcards_from_response(&raw)
            .into_iter()
            .filter_map(Flashcard::from_raw)
            .collect();

        self.enhance_cards(&mut cards, &map, &images, page);
        if self.preferences.max_cards_per_page > 0 {
            cards.truncate(self.preferences.max_cards_per_page);
        }
        tracing::info!(page_id = %page.id, count = cards.len(), "page produced cards");
        Ok(cards)
    }

    /// Sends each downloaded image to the model. A failed analysis keeps
    /// the image with a placeholder so later stages see a uniform shape.
    async fn analyze_images(&self, page_title: &str, images: &mut [ExtractedImage]) {
        for image in images.iter_mut() {
            let Some(path) = image.path.clone() else {
                continue;
            };
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(err) => {
                    tracing::warn!(path = %path.display(), ?err, "read image for analysis failed");
                    continue;
                }
            };
            let inline = InlineImage {
                mime_type: mime_type_for_file(&image.file_name).to_string(),
                data,
            };
            let prompt = image_prompt(page_title, &image.alt_text, &image.context);
            match self.model.generate(&prompt, Some(&inline)).await {
                Ok(analysis) => {
                    image.potential_questions = scan_potential_questions(&analysis);
                    image.analysis = Some(analysis);
                }
                Err(err) => {
                    tracing::warn!(file = %image.file_name, ?err, "image analysis failed");
                    image.analysis = Some("(image could not be analyzed)".to_string());
                }
            }
        }
    }

    /// Post-generation enrichment: concept context and related images go
    /// into notes, provenance goes into tags. Model-given card order is
    /// preserved.
    fn enhance_cards(
        &self,
        cards: &mut [Flashcard],
        map: &ConceptMap,
        images: &[ExtractedImage],
        page: &PageInfo,
    ) {
        let page_tag = normalize_page_tag(&page.title);
        for card in cards.iter_mut() {
            let concept = map.find_main_concept(card);
            if let Some(concept) = concept {
                let focused = map.render_focused(concept);
                if !focused.is_empty() {
                    card.notes.push_str("\n\n### Concept Context\n");
                    card.notes.push_str(&focused);
                }
            }

            let mut related = Vec::new();
            for image in images {
                let Some(path) = &image.path else { continue };
                let named = card
                    .related_images
                    .iter()
                    .any(|name| name == &image.file_name || path.ends_with(name));
                let via_concept = concept.is_some_and(|c| {
                    image
                        .analysis
                        .as_deref()
                        .is_some_and(|a| a.to_ascii_lowercase().contains(&c.name.to_ascii_lowercase()))
                });
                if named || via_concept {
                    related.push((image, path.to_string_lossy().to_string()));
                }
            }
            if !related.is_empty() {
                card.notes.push_str("\n\n## Related Images\n");
                for (image, path) in &related {
                    card.notes.push_str("![");
                    card.notes.push_str(&image.alt_text);
                    card.notes.push_str("](");
                    card.notes.push_str(path);
                    card.notes.push_str(")\n");
                }
                card.related_images = related.into_iter().map(|(_, path)| path).collect();
            } else {
                card.related_images.clear();
            }

            if self.preferences.include_metadata {
                card.notes.push_str("\n\n<small>Source: ");
                card.notes.push_str(&page.title);
                card.notes.push_str("</small>");
            }
            if !page_tag.is_empty() {
                card.tags.push(page_tag.clone());
            }
            card.source_page_title = page.title.clone();
            card.source_page_id = page.id.clone();
        }
    }
}

/// Cuts `text` after `max_words` whitespace-separated words, keeping the
/// original formatting of what remains.
pub fn truncate_words(text: &str, max_words: usize) -> &str {
    let mut words = 0;
    let mut in_word = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
            if words > max_words {
                return text[..idx].trim_end();
            }
        }
    }
    text
}

fn concept_map_prompt(title: &str, text: &str) -> String {
    let text = truncate_words(text, MAX_PROMPT_WORDS);
    format!(
        "Build a concept map from these study notes.\n\
         Page title: {title}\n\n\
         Notes:\n{text}\n\n\
         Return one JSON object and nothing else:\n\
         {{\"title\": \"...\", \"concepts\": [{{\"id\": \"...\", \"name\": \"...\", \"description\": \"...\"}}], \
         \"relationships\": [{{\"source\": \"...\", \"target\": \"...\", \"label\": \"...\"}}]}}\n\
         Hard rules:\n\
         - 5 to 12 concepts; ids are short lowercase slugs, unique.\n\
         - relationship source and target must be listed concept ids.\n\
         - descriptions are one sentence."
    )
}

fn image_prompt(page_title: &str, alt_text: &str, context: &str) -> String {
    format!(
        "This image comes from study notes titled \"{page_title}\".\n\
         Alt text: {alt_text}\n\
         Surrounding text: {context}\n\n\
         Describe what the image teaches in 2-3 sentences, then list up to \
         {MAX_POTENTIAL_QUESTIONS} study questions it could answer, one per \
         line, each starting with \"- \" and ending with \"?\"."
    )
}

fn flashcards_prompt(
    title: &str,
    text: &str,
    map: &ConceptMap,
    images: &[ExtractedImage],
    preferences: &GenerationPreferences,
) -> String {
    let text = truncate_words(text, MAX_PROMPT_WORDS);

    let mut kinds = Vec::new();
    if preferences.enable_cloze {
        kinds.push("\"cloze\" (fill-in-the-blank; mark the hidden term as [cloze:TERM])");
    }
    if preferences.enable_standard {
        kinds.push("\"standard\" (question and answer)");
    }
    if preferences.enable_process {
        kinds.push("\"standard\" cards walking through a process step by step");
    }
    if kinds.is_empty() {
        kinds.push("\"standard\" (question and answer)");
    }

    let complexity = match preferences.card_complexity {
        CardComplexity::Basic => "Keep cards simple: one fact each, short answers.",
        CardComplexity::Standard => "Mix recall cards with a few that connect two ideas.",
        CardComplexity::Advanced => {
            "Prefer cards that test relationships, causes and comparisons over bare recall."
        }
    };

    let mut prompt = format!(
        "Create flashcards from these study notes.\n\
         Page title: {title}\n\n\
         Notes:\n{text}\n"
    );
    if !map.is_empty() {
        prompt.push_str("\nConcept map of the page:\n");
        prompt.push_str(&map.render_overview());
    }
    let analyzed: Vec<&ExtractedImage> = images.iter().filter(|i| i.analysis.is_some()).collect();
    if !analyzed.is_empty() {
        prompt.push_str("\nImages on the page:\n");
        for image in analyzed {
            prompt.push_str("- ");
            prompt.push_str(&image.file_name);
            if let Some(analysis) = &image.analysis {
                prompt.push_str(": ");
                prompt.push_str(truncate_words(analysis, 120));
            }
            prompt.push('\n');
            for question in &image.potential_questions {
                prompt.push_str("  - ");
                prompt.push_str(question);
                prompt.push('\n');
            }
        }
    }
    prompt.push_str(&format!(
        "\nReturn one JSON array and nothing else. Each element:\n\
         {{\"type\": \"cloze\"|\"standard\", \"question\": \"...\", \"answer\": \"...\", \
         \"notes\": \"...\", \"relatedConcepts\": [\"concept id\"], \"relatedImages\": [\"file name\"]}}\n\
         Hard rules:\n\
         - allowed card kinds: {}.\n\
         - {complexity}\n",
        kinds.join(", "),
    ));
    if preferences.use_original_text {
        prompt.push_str("- quote the note's original wording where possible.\n");
    }
    if preferences.max_cards_per_page > 0 {
        prompt.push_str(&format!(
            "- at most {} cards.\n",
            preferences.max_cards_per_page
        ));
    }
    prompt
}

fn scan_potential_questions(analysis: &str) -> Vec<String> {
    let mut questions = Vec::new();
    for line in analysis.lines() {
        let line = line.trim();
        let body = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .or_else(|| strip_number_prefix(line))
            .unwrap_or(line)
            .trim();
        if body.ends_with('?') && body.len() > 1 {
            questions.push(body.to_string());
            if questions.len() == MAX_POTENTIAL_QUESTIONS {
                break;
            }
        }
    }
    questions
}

fn strip_number_prefix(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))
}
