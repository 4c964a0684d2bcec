use clap::{Args, Parser, Subcommand};

use crate::pipeline::{CardComplexity, GenerationPreferences};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate a deck from a notebook section.
    Generate(GenerateArgs),
    /// List the notebooks the token grants access to.
    Notebooks(NotebooksArgs),
    /// List the sections of a notebook.
    Sections(SectionsArgs),
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Section id to convert.
    #[arg(long)]
    pub section_id: String,

    /// Section name used in the deck title.
    #[arg(long, default_value = "")]
    pub section_name: String,

    /// Page ids to include (repeatable). Omit for every page.
    #[arg(long = "page-id")]
    pub page_ids: Vec<String>,

    /// Directory packaged decks are written to.
    #[arg(long, default_value = "decks")]
    pub out: String,

    /// Scratch directory for per-job media.
    #[arg(long, default_value = ".deckify-work")]
    pub work_dir: String,

    /// Notes API base URL.
    #[arg(long, default_value = crate::graph::DEFAULT_BASE_URL)]
    pub graph_base_url: String,

    /// Skip cloze cards.
    #[arg(long)]
    pub no_cloze: bool,

    /// Skip question/answer cards.
    #[arg(long)]
    pub no_standard: bool,

    /// Ask for step-by-step process cards as well.
    #[arg(long)]
    pub process_cards: bool,

    /// Skip concept map generation.
    #[arg(long)]
    pub no_concept_map: bool,

    /// Skip image download and analysis.
    #[arg(long)]
    pub no_images: bool,

    /// Cap cards per page (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub max_cards_per_page: usize,

    /// How demanding the cards should be.
    #[arg(long, value_enum, default_value_t = CardComplexity::Standard)]
    pub complexity: CardComplexity,

    /// Quote the notes' original wording in cards.
    #[arg(long)]
    pub use_original_text: bool,

    /// Leave source page metadata out of card notes.
    #[arg(long)]
    pub no_metadata: bool,
}

impl GenerateArgs {
    pub fn preferences(&self) -> GenerationPreferences {
        GenerationPreferences {
            enable_cloze: !self.no_cloze,
            enable_standard: !self.no_standard,
            enable_process: self.process_cards,
            enable_concept_map: !self.no_concept_map,
            max_cards_per_page: self.max_cards_per_page,
            card_complexity: self.complexity,
            process_images: !self.no_images,
            generate_concept_maps: !self.no_concept_map,
            use_original_text: self.use_original_text,
            include_metadata: !self.no_metadata,
        }
    }
}

#[derive(Debug, Args)]
pub struct NotebooksArgs {
    /// Notes API base URL.
    #[arg(long, default_value = crate::graph::DEFAULT_BASE_URL)]
    pub graph_base_url: String,
}

#[derive(Debug, Args)]
pub struct SectionsArgs {
    /// Notebook id to list sections for.
    #[arg(long)]
    pub notebook_id: String,

    /// Notes API base URL.
    #[arg(long, default_value = crate::graph::DEFAULT_BASE_URL)]
    pub graph_base_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_flags_map_onto_preferences() {
        let cli = Cli::try_parse_from([
            "deckify",
            "generate",
            "--section-id",
            "s1",
            "--no-cloze",
            "--max-cards-per-page",
            "5",
            "--complexity",
            "advanced",
        ])
        .unwrap();
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let prefs = args.preferences();
        assert!(!prefs.enable_cloze);
        assert!(prefs.enable_standard);
        assert_eq!(prefs.max_cards_per_page, 5);
        assert_eq!(prefs.card_complexity, CardComplexity::Advanced);
    }
}
