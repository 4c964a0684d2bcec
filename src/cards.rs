use serde::{Deserialize, Serialize};

/// A flashcard as the model emits it, before any validation. Every field
/// is optional so a partially filled object still deserializes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFlashcard {
    #[serde(rename = "type")]
    pub card_type: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub related_concepts: Vec<String>,
    #[serde(default)]
    pub related_images: Vec<String>,
}

/// Card content after type derivation. Standard cards carry a
/// question/answer pair; cloze cards carry a single text with
/// `{{c1::..}}` markers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardContent {
    Cloze { text: String },
    Standard { question: String, answer: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Flashcard {
    #[serde(flatten)]
    pub content: CardContent,
    pub notes: String,
    pub related_concepts: Vec<String>,
    pub related_images: Vec<String>,
    pub tags: Vec<String>,
    pub source_page_title: String,
    pub source_page_id: String,
}

impl Flashcard {
    /// Derives a typed card from raw model output. The explicit `type`
    /// field wins; otherwise the card is standard exactly when both
    /// question and answer are non-empty, cloze in every other case.
    /// Returns `None` only when the raw card has no text at all.
    pub fn from_raw(raw: RawFlashcard) -> Option<Self> {
        let question = non_empty(raw.question);
        let answer = non_empty(raw.answer);
        let text = non_empty(raw.text);

        let declared = raw
            .card_type
            .as_deref()
            .map(|value| value.trim().to_ascii_lowercase());
        let is_standard = match declared.as_deref() {
            Some("standard") | Some("basic") => true,
            Some("cloze") => false,
            _ => question.is_some() && answer.is_some(),
        };

        let content = if is_standard {
            CardContent::Standard {
                question: question?,
                answer: answer.unwrap_or_default(),
            }
        } else {
            let body = text.or(question)?;
            CardContent::Cloze {
                text: normalize_cloze_text(&body),
            }
        };

        Some(Self {
            content,
            notes: non_empty(raw.notes).unwrap_or_default(),
            related_concepts: raw.related_concepts,
            related_images: raw.related_images,
            tags: Vec::new(),
            source_page_title: String::new(),
            source_page_id: String::new(),
        })
    }

    pub fn is_cloze(&self) -> bool {
        matches!(self.content, CardContent::Cloze { .. })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Rewrites `[cloze:TERM]` shorthand to `{{c1::TERM}}` and guarantees the
/// result carries at least one cloze marker. When the model produced none,
/// one is synthesized around the first mid-sentence capitalized word of
/// three or more letters, falling back to the first double-quoted phrase.
/// Text with no candidate is returned unchanged.
pub fn normalize_cloze_text(text: &str) -> String {
    let rewritten = rewrite_cloze_shorthand(text);
    if rewritten.contains("{{c") {
        return rewritten;
    }
    if let Some(out) = wrap_capitalized_word(&rewritten) {
        return out;
    }
    if let Some(out) = wrap_quoted_phrase(&rewritten) {
        return out;
    }
    rewritten
}

fn rewrite_cloze_shorthand(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[cloze:") {
        let after = &rest[start + "[cloze:".len()..];
        let Some(end) = after.find(']') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str("{{c1::");
        out.push_str(&after[..end]);
        out.push_str("}}");
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn wrap_capitalized_word(text: &str) -> Option<String> {
    let mut sentence_start = true;
    let mut chars = text.char_indices().peekable();
    while let Some((idx, ch)) = chars.next() {
        if ch.is_alphabetic() {
            let word_end = text[idx..]
                .find(|c: char| !c.is_alphanumeric())
                .map(|off| idx + off)
                .unwrap_or(text.len());
            let word = &text[idx..word_end];
            if !sentence_start && ch.is_uppercase() && word.chars().count() >= 3 {
                let mut out = String::with_capacity(text.len() + 8);
                out.push_str(&text[..idx]);
                out.push_str("{{c1::");
                out.push_str(word);
                out.push_str("}}");
                out.push_str(&text[word_end..]);
                return Some(out);
            }
            sentence_start = false;
            while let Some((next_idx, _)) = chars.peek() {
                if *next_idx < word_end {
                    chars.next();
                } else {
                    break;
                }
            }
        } else if matches!(ch, '.' | '!' | '?') {
            sentence_start = true;
        }
    }
    None
}

fn wrap_quoted_phrase(text: &str) -> Option<String> {
    let open = text.find('"')?;
    let close = open + 1 + text[open + 1..].find('"')?;
    let inner = &text[open + 1..close];
    if inner.trim().is_empty() {
        return None;
    }
    let mut out = String::with_capacity(text.len() + 8);
    out.push_str(&text[..open + 1]);
    out.push_str("{{c1::");
    out.push_str(inner);
    out.push_str("}}");
    out.push_str(&text[close..]);
    Some(out)
}

/// Normalizes a page title into a deck tag: lowercase, every run of
/// non-alphanumeric characters collapses to a single underscore, no
/// leading or trailing underscore.
pub fn normalize_page_tag(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}
