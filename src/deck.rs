use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::apkg::{BASIC_MODEL, CLOZE_MODEL, CardRecord, DeckPackage};
use crate::cards::{CardContent, Flashcard};

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeckStats {
    pub total: usize,
    pub cloze: usize,
    pub standard: usize,
    pub media_files: usize,
}

#[derive(Debug)]
pub struct AssembledDeck {
    pub deck_name: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub stats: DeckStats,
}

/// Builds the packaged deck from the accumulated cards. Runs on a
/// blocking thread: it reads media files and writes the zip container.
///
/// Media handling: every image reference across card notes and
/// `related_images` is collected once (deduplicated on the original
/// reference string), resolved against `media_dir` by file name, and
/// packed a single time. References to files that no longer exist are
/// dropped from the package but the card text keeps its rewritten name.
pub fn assemble(
    deck_name: &str,
    cards: Vec<Flashcard>,
    media_dir: &Path,
    now: DateTime<Utc>,
) -> anyhow::Result<AssembledDeck> {
    let mut package = DeckPackage::new(deck_name);
    let mut stats = DeckStats::default();

    let mut seen_refs = HashSet::new();
    let mut packed_names = HashSet::new();
    for card in &cards {
        for reference in media_references(card) {
            if !seen_refs.insert(reference.clone()) {
                continue;
            }
            let file_name = base_file_name(&reference);
            if file_name.is_empty() || !packed_names.insert(file_name.to_string()) {
                continue;
            }
            let path = media_dir.join(file_name);
            match std::fs::read(&path) {
                Ok(bytes) => package.add_media(file_name, bytes),
                Err(err) => {
                    tracing::debug!(reference, ?err, "media file unavailable, dropped");
                    packed_names.remove(file_name);
                }
            }
        }
    }
    stats.media_files = packed_names.len();

    for card in cards {
        let record = card_record(card);
        if record.model == CLOZE_MODEL {
            stats.cloze += 1;
        } else {
            stats.standard += 1;
        }
        stats.total += 1;
        package.add_card(record);
    }

    let bytes = package.finalize().context("finalize deck package")?;
    Ok(AssembledDeck {
        deck_name: deck_name.to_string(),
        file_name: deck_file_name(deck_name, now),
        bytes,
        stats,
    })
}

/// Maps one flashcard onto a deck note. A card typed standard whose text
/// still carries `{{c..}}` markers is re-derived as cloze so importers do
/// not render literal markers on a front side.
fn card_record(card: Flashcard) -> CardRecord {
    let notes = rewrite_media_references(&card.notes);
    let tags = card.tags.join(" ");
    match card.content {
        CardContent::Cloze { text } => CardRecord {
            model: CLOZE_MODEL.to_string(),
            fields: vec![rewrite_media_references(&text), notes],
            tags,
        },
        CardContent::Standard { question, answer } => {
            if question.contains("{{c") || answer.contains("{{c") {
                let text = if question.contains("{{c") { question } else { answer };
                return CardRecord {
                    model: CLOZE_MODEL.to_string(),
                    fields: vec![rewrite_media_references(&text), notes],
                    tags,
                };
            }
            let mut back = rewrite_media_references(&answer);
            if !notes.is_empty() {
                back.push_str("<hr>");
                back.push_str(&notes);
            }
            CardRecord {
                model: BASIC_MODEL.to_string(),
                fields: vec![rewrite_media_references(&question), back],
                tags,
            }
        }
    }
}

fn media_references(card: &Flashcard) -> Vec<String> {
    let mut refs = scan_media_references(&card.notes);
    if let CardContent::Standard { answer, .. } = &card.content {
        refs.extend(scan_media_references(answer));
    }
    refs.extend(card.related_images.iter().cloned());
    refs
}

/// Collects image references from markdown `![..](path)` links and
/// `<img src="..">` tags.
pub fn scan_media_references(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("![") {
        let after = &rest[start..];
        let Some(open) = after.find("](") else {
            rest = &rest[start + 2..];
            continue;
        };
        let Some(close) = after[open + 2..].find(')') else {
            rest = &rest[start + 2..];
            continue;
        };
        let target = after[open + 2..open + 2 + close].trim();
        if !target.is_empty() {
            refs.push(target.to_string());
        }
        rest = &after[open + 2 + close..];
    }
    rest = text;
    while let Some(start) = rest.find("<img") {
        let after = &rest[start..];
        let Some(src) = after.find("src=\"") else {
            rest = &rest[start + 4..];
            continue;
        };
        let value_start = src + "src=\"".len();
        let Some(end) = after[value_start..].find('"') else {
            break;
        };
        let target = after[value_start..value_start + end].trim();
        if !target.is_empty() {
            refs.push(target.to_string());
        }
        rest = &after[value_start + end..];
    }
    refs
}

/// Rewrites every media reference in `text` to its bare file name, the
/// form the packaged deck stores media under. Applying the rewrite to
/// already-rewritten text changes nothing.
pub fn rewrite_media_references(text: &str) -> String {
    let mut out = text.to_string();
    for reference in scan_media_references(text) {
        let file_name = base_file_name(&reference);
        if !file_name.is_empty() && file_name != reference {
            out = out.replace(&reference, file_name);
        }
    }
    out
}

fn base_file_name(reference: &str) -> &str {
    reference
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(reference)
}

/// `{sanitized name}_{millis}.apkg`; two runs for the same deck differ
/// only in the timestamp.
pub fn deck_file_name(deck_name: &str, now: DateTime<Utc>) -> String {
    let sanitized = crate::cards::normalize_page_tag(deck_name);
    let base = if sanitized.is_empty() { "deck" } else { &sanitized };
    format!("{}_{}.apkg", base, now.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read as _};

    use super::*;
    use crate::apkg::DeckManifest;
    use crate::cards::RawFlashcard;

    fn card(question: &str, answer: &str, notes: &str, related_images: Vec<String>) -> Flashcard {
        let mut card = Flashcard::from_raw(RawFlashcard {
            question: Some(question.to_string()),
            answer: Some(answer.to_string()),
            notes: Some(notes.to_string()),
            ..RawFlashcard::default()
        })
        .unwrap();
        card.related_images = related_images;
        card
    }

    fn manifest(deck: &AssembledDeck) -> DeckManifest {
        let mut archive = zip::ZipArchive::new(Cursor::new(deck.bytes.clone())).unwrap();
        let mut entry = archive.by_name("deck.json").unwrap();
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw).unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn shared_media_is_packed_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cell.png"), b"png").unwrap();
        let cards = vec![
            card("Q1?", "A1", "![cell](/tmp/job/media/cell.png)", Vec::new()),
            card("Q2?", "A2", "", vec!["/tmp/job/media/cell.png".to_string()]),
            card("Q3?", "A3", "<img src=\"cell.png\">", Vec::new()),
        ];
        let deck = assemble("Biology", cards, dir.path(), Utc::now()).unwrap();
        assert_eq!(deck.stats.media_files, 1);
        assert_eq!(manifest(&deck).media, vec!["cell.png".to_string()]);
    }

    #[test]
    fn missing_media_is_dropped_silently() {
        let dir = tempfile::tempdir().unwrap();
        let cards = vec![card("Q?", "A", "![gone](media/gone.png)", Vec::new())];
        let deck = assemble("Biology", cards, dir.path(), Utc::now()).unwrap();
        assert_eq!(deck.stats.media_files, 0);
        assert_eq!(deck.stats.total, 1);
    }

    #[test]
    fn notes_references_are_rewritten_to_file_names() {
        let rewritten = rewrite_media_references("see ![d](/a/b/d.png) and <img src=\"/a/b/e.png\">");
        assert_eq!(rewritten, "see ![d](d.png) and <img src=\"e.png\">");
        assert_eq!(rewrite_media_references(&rewritten), rewritten);
    }

    #[test]
    fn standard_card_with_markers_is_rederived_as_cloze() {
        let cards = vec![card("The {{c1::nucleus}} stores DNA", "yes", "", Vec::new())];
        let dir = tempfile::tempdir().unwrap();
        let deck = assemble("Biology", cards, dir.path(), Utc::now()).unwrap();
        let manifest = manifest(&deck);
        assert_eq!(manifest.cards[0].model, CLOZE_MODEL);
        assert_eq!(deck.stats.cloze, 1);
        assert_eq!(deck.stats.standard, 0);
    }

    #[test]
    fn standard_back_joins_answer_and_notes() {
        let cards = vec![card("Q?", "A", "extra detail", Vec::new())];
        let dir = tempfile::tempdir().unwrap();
        let deck = assemble("Biology", cards, dir.path(), Utc::now()).unwrap();
        let manifest = manifest(&deck);
        assert_eq!(manifest.cards[0].model, BASIC_MODEL);
        assert_eq!(manifest.cards[0].fields[1], "A<hr>extra detail");
    }

    #[test]
    fn deck_file_names_share_a_sanitized_stem() {
        let now = Utc::now();
        let name = deck_file_name("Chapter 1: Intro!", now);
        assert!(name.starts_with("chapter_1_intro_"));
        assert!(name.ends_with(".apkg"));
        assert_eq!(deck_file_name("Chapter 1: Intro!", now), name);
    }
}
