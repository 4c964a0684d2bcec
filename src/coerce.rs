use crate::cards::RawFlashcard;
use crate::concept_map::ConceptMap;

/// Expected top-level JSON shape of a model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    Array,
}

impl Shape {
    fn open(self) -> char {
        match self {
            Shape::Object => '{',
            Shape::Array => '[',
        }
    }

    fn close(self) -> char {
        match self {
            Shape::Object => '}',
            Shape::Array => ']',
        }
    }
}

/// Pulls the first parseable JSON value of the expected shape out of free
/// text. Tries fenced code blocks first, then the first balanced bracketed
/// substring, then the trimmed text itself. Total: any input that carries
/// no such value yields `None`, never an error.
pub fn extract_json(text: &str, shape: Shape) -> Option<String> {
    for block in fenced_blocks(text) {
        if let Some(found) = balanced_candidate(block, shape) {
            return Some(found);
        }
    }
    if let Some(found) = balanced_candidate(text, shape) {
        return Some(found);
    }
    let trimmed = text.trim();
    if trimmed.starts_with(shape.open()) && parses(trimmed) {
        return Some(trimmed.to_string());
    }
    None
}

/// Coerces a raw model response into a concept map. Malformed output maps
/// to the empty value.
pub fn concept_map_from_response(raw: &str) -> ConceptMap {
    let Some(json) = extract_json(raw, Shape::Object) else {
        return ConceptMap::default();
    };
    serde_json::from_str(&json).unwrap_or_default()
}

/// Coerces a raw model response into a list of raw flashcards. Accepts a
/// bare array or an object wrapping one under `flashcards` or `cards`;
/// elements that do not deserialize are dropped. Malformed output maps to
/// the empty list.
pub fn flashcards_from_response(raw: &str) -> Vec<RawFlashcard> {
    let array = extract_json(raw, Shape::Array)
        .and_then(|json| serde_json::from_str::<Vec<serde_json::Value>>(&json).ok())
        .or_else(|| wrapped_card_array(raw));
    let Some(values) = array else {
        return Vec::new();
    };
    values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

fn wrapped_card_array(raw: &str) -> Option<Vec<serde_json::Value>> {
    let json = extract_json(raw, Shape::Object)?;
    let mut object: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&json).ok()?;
    for key in ["flashcards", "cards"] {
        if let Some(serde_json::Value::Array(values)) = object.remove(key) {
            return Some(values);
        }
    }
    None
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

/// Scans for the first balanced `{..}` or `[..]` substring, tracking
/// string literals and escapes, and keeps it only if it parses as JSON.
fn balanced_candidate(text: &str, shape: Shape) -> Option<String> {
    let start = text.find(shape.open())?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            c if in_string => {
                let _ = c;
            }
            c if c == shape.open() => depth += 1,
            c if c == shape.close() => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let candidate = &text[start..start + idx + ch.len_utf8()];
                    if parses(candidate) {
                        return Some(candidate.to_string());
                    }
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

fn parses(candidate: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(candidate).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_is_preferred() {
        let raw = "Here you go:\n```json\n{\"concepts\": []}\n```\ntrailing {bad";
        assert_eq!(extract_json(raw, Shape::Object).unwrap(), "{\"concepts\": []}");
    }

    #[test]
    fn bare_array_in_prose() {
        let raw = "Sure! [{\"question\": \"Q?\"}] hope this helps";
        assert_eq!(
            extract_json(raw, Shape::Array).unwrap(),
            "[{\"question\": \"Q?\"}]"
        );
    }

    #[test]
    fn brackets_inside_strings_do_not_confuse_the_scan() {
        let raw = "{\"name\": \"a } b\", \"n\": 1}";
        assert_eq!(extract_json(raw, Shape::Object).unwrap(), raw);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(extract_json("no json here", Shape::Object).is_none());
        assert!(extract_json("{broken", Shape::Object).is_none());
        assert!(extract_json("", Shape::Array).is_none());
    }

    #[test]
    fn malformed_map_coerces_to_empty() {
        let map = concept_map_from_response("I could not produce a map, sorry.");
        assert!(map.is_empty());
    }

    #[test]
    fn map_parses_through_fence() {
        let raw = "```json\n{\"concepts\":[{\"id\":\"a\",\"name\":\"A\"}],\"relationships\":[]}\n```";
        let map = concept_map_from_response(raw);
        assert_eq!(map.concepts.len(), 1);
        assert_eq!(map.concepts[0].name, "A");
    }

    #[test]
    fn cards_accept_wrapped_object() {
        let raw = "{\"flashcards\": [{\"question\": \"Q?\", \"answer\": \"A\"}]}";
        let cards = flashcards_from_response(raw);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].question.as_deref(), Some("Q?"));
    }

    #[test]
    fn undeserializable_elements_are_dropped() {
        let raw = "[{\"question\": \"Q?\"}, 42, \"text\"]";
        let cards = flashcards_from_response(raw);
        assert_eq!(cards.len(), 1);
    }

    #[test]
    fn malformed_cards_coerce_to_empty_list() {
        assert!(flashcards_from_response("nope").is_empty());
    }
}
