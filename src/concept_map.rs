use serde::{Deserialize, Serialize};

use crate::cards::{CardContent, Flashcard};

/// Concept graph for one page. `ConceptMap::default()` is the neutral
/// value used when map generation is disabled or the model output could
/// not be coerced; every consumer treats it the same as a real empty map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptMap {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub concepts: Vec<Concept>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub source: String,
    pub target: String,
    #[serde(default, alias = "type")]
    pub label: String,
}

impl ConceptMap {
    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty() && self.relationships.is_empty()
    }

    /// Looks a concept up by id, falling back to a case-insensitive name
    /// match. The model references concepts by id in cards but by name in
    /// prose, so both keys are accepted.
    pub fn resolve(&self, key: &str) -> Option<&Concept> {
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        self.concepts
            .iter()
            .find(|c| c.id == key)
            .or_else(|| {
                self.concepts
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(key))
            })
    }

    /// Markdown summary of the whole map. Relationships whose endpoints do
    /// not resolve to a listed concept are left out rather than rendered
    /// half-broken.
    pub fn render_overview(&self) -> String {
        let mut out = String::new();
        if let Some(title) = &self.title {
            out.push_str("### ");
            out.push_str(title);
            out.push('\n');
        }
        for concept in &self.concepts {
            out.push_str("- **");
            out.push_str(&concept.name);
            out.push_str("**");
            if !concept.description.is_empty() {
                out.push_str(": ");
                out.push_str(&concept.description);
            }
            out.push('\n');
        }
        for rel in &self.relationships {
            let (Some(source), Some(target)) = (self.resolve(&rel.source), self.resolve(&rel.target))
            else {
                continue;
            };
            out.push_str("- ");
            out.push_str(&source.name);
            if rel.label.is_empty() {
                out.push_str(" -> ");
            } else {
                out.push_str(" -");
                out.push_str(&rel.label);
                out.push_str("-> ");
            }
            out.push_str(&target.name);
            out.push('\n');
        }
        out
    }

    /// Markdown summary centered on one concept: its description and the
    /// resolvable relationships it takes part in.
    pub fn render_focused(&self, concept: &Concept) -> String {
        let mut out = String::new();
        out.push_str("**");
        out.push_str(&concept.name);
        out.push_str("**");
        if !concept.description.is_empty() {
            out.push_str(": ");
            out.push_str(&concept.description);
        }
        out.push('\n');
        for rel in &self.relationships {
            let (Some(source), Some(target)) = (self.resolve(&rel.source), self.resolve(&rel.target))
            else {
                continue;
            };
            if source.id != concept.id && target.id != concept.id {
                continue;
            }
            out.push_str("- ");
            out.push_str(&source.name);
            if rel.label.is_empty() {
                out.push_str(" -> ");
            } else {
                out.push_str(" -");
                out.push_str(&rel.label);
                out.push_str("-> ");
            }
            out.push_str(&target.name);
            out.push('\n');
        }
        out
    }

    /// Picks the concept a card is about. Order: the card's own first
    /// concept reference, then a whole-word name match against a standard
    /// card's question, then a substring name match against a cloze card's
    /// text. No match means no enrichment for that card.
    pub fn find_main_concept(&self, card: &Flashcard) -> Option<&Concept> {
        if let Some(key) = card.related_concepts.first()
            && let Some(concept) = self.resolve(key)
        {
            return Some(concept);
        }
        match &card.content {
            CardContent::Standard { question, .. } => self
                .concepts
                .iter()
                .find(|c| contains_word(question, &c.name)),
            CardContent::Cloze { text } => {
                let lower = text.to_ascii_lowercase();
                self.concepts
                    .iter()
                    .find(|c| lower.contains(&c.name.to_ascii_lowercase()))
            }
        }
    }

    /// Associates an analyzed image with a concept by name mention in the
    /// analysis text.
    pub fn concept_for_analysis(&self, analysis: &str) -> Option<&Concept> {
        let lower = analysis.to_ascii_lowercase();
        self.concepts
            .iter()
            .find(|c| !c.name.is_empty() && lower.contains(&c.name.to_ascii_lowercase()))
    }
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let haystack = haystack.to_ascii_lowercase();
    let needle = needle.to_ascii_lowercase();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(&needle) {
        let start = from + pos;
        let end = start + needle.len();
        let before_ok = start == 0
            || !haystack[..start]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_alphanumeric());
        let after_ok = end == haystack.len()
            || !haystack[end..]
                .chars()
                .next()
                .is_some_and(|c| c.is_alphanumeric());
        if before_ok && after_ok {
            return true;
        }
        from = end;
    }
    false
}
