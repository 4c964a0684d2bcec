use std::path::{Path, PathBuf};

use scraper::{ElementRef, Html, Selector};

use crate::graph::NotesSource;

/// Where an extracted image's bytes live before download.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// Resource URL on the notes source, fetched with auth.
    Remote(String),
    /// Inline markup (ink drawings exported as SVG).
    Inline(String),
}

#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub file_name: String,
    pub source: ImageSource,
    pub alt_text: String,
    pub context: String,
    /// Filled by the image analysis stage.
    pub analysis: Option<String>,
    pub potential_questions: Vec<String>,
    /// Local path once the image has been saved into the job media dir.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct PageContent {
    pub text: String,
    pub images: Vec<ExtractedImage>,
}

/// Extracts study text and image references from page markup. Headings
/// come out as `### ` lines, list items as `- ` lines, paragraphs as
/// plain blocks. Never fails: when structured extraction produces nothing
/// usable the markup is reduced to bare text with no images.
pub fn extract(html: &str) -> PageContent {
    if let Some(content) = extract_structured(html)
        && (!content.text.trim().is_empty() || !content.images.is_empty())
    {
        return content;
    }
    PageContent {
        text: strip_tags(html),
        images: Vec::new(),
    }
}

fn extract_structured(html: &str) -> Option<PageContent> {
    let document = Html::parse_document(html);
    let blocks = Selector::parse("h1, h2, h3, h4, h5, h6, p, li").ok()?;
    let images = Selector::parse("img").ok()?;
    let drawings = Selector::parse("svg").ok()?;
    let captions = Selector::parse("figcaption").ok()?;

    let mut text = String::new();
    for element in document.select(&blocks) {
        if is_nested_paragraph(element) {
            continue;
        }
        let value = element_text(element);
        if value.is_empty() {
            continue;
        }
        match element.value().name() {
            "p" => {
                text.push_str(&value);
                text.push_str("\n\n");
            }
            "li" => {
                text.push_str("- ");
                text.push_str(&value);
                text.push('\n');
            }
            _ => {
                text.push_str("### ");
                text.push_str(&value);
                text.push_str("\n\n");
            }
        }
    }

    let mut out = Vec::new();
    for (idx, element) in document.select(&images).enumerate() {
        let Some(url) = element
            .value()
            .attr("data-fullres-src")
            .or_else(|| element.value().attr("src"))
        else {
            continue;
        };
        let alt_text = element.value().attr("alt").unwrap_or_default().to_string();
        let mut context = element
            .parent()
            .and_then(ElementRef::wrap)
            .map(element_text)
            .unwrap_or_default();
        if let Some(caption) = document.select(&captions).next() {
            let caption = element_text(caption);
            if !caption.is_empty() && !context.contains(&caption) {
                if !context.is_empty() {
                    context.push(' ');
                }
                context.push_str(&caption);
            }
        }
        truncate_at_boundary(&mut context, 200);
        out.push(ExtractedImage {
            file_name: format!("image_{}.png", idx + 1),
            source: ImageSource::Remote(url.to_string()),
            alt_text,
            context,
            analysis: None,
            potential_questions: Vec::new(),
            path: None,
        });
    }
    for (idx, element) in document.select(&drawings).enumerate() {
        out.push(ExtractedImage {
            file_name: format!("drawing_{}.svg", idx + 1),
            source: ImageSource::Inline(element.html()),
            alt_text: "ink drawing".to_string(),
            context: String::new(),
            analysis: None,
            potential_questions: Vec::new(),
            path: None,
        });
    }

    Some(PageContent { text, images: out })
}

fn truncate_at_boundary(value: &mut String, max: usize) {
    if value.len() <= max {
        return;
    }
    let mut cut = max;
    while cut > 0 && !value.is_char_boundary(cut) {
        cut -= 1;
    }
    value.truncate(cut);
}

/// `li` contents render once; a `p` nested inside a list item would
/// otherwise be emitted twice.
fn is_nested_paragraph(element: ElementRef<'_>) -> bool {
    if element.value().name() != "p" {
        return false;
    }
    let mut node = element.parent();
    while let Some(current) = node {
        if let Some(parent) = ElementRef::wrap(current)
            && parent.value().name() == "li"
        {
            return true;
        }
        node = current.parent();
    }
    false
}

fn element_text(element: ElementRef<'_>) -> String {
    let mut value = String::new();
    for piece in element.text() {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        if !value.is_empty() {
            value.push(' ');
        }
        value.push_str(piece);
    }
    value
}

/// Last-resort extraction: drop every tag, decode the handful of entities
/// the notes markup actually uses.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    let decoded = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Downloads every extracted image into `media_dir`, rewriting each image
/// to point at its local file. A failed download drops that image with a
/// warning and the page continues.
pub async fn fetch_images(
    source: &dyn NotesSource,
    images: Vec<ExtractedImage>,
    media_dir: &Path,
) -> Vec<ExtractedImage> {
    let mut saved = Vec::with_capacity(images.len());
    for mut image in images {
        let bytes = match &image.source {
            ImageSource::Remote(url) => match source.fetch_binary(url).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(url = %url, ?err, "image download failed, skipping");
                    continue;
                }
            },
            ImageSource::Inline(markup) => markup.clone().into_bytes(),
        };
        let path = media_dir.join(&image.file_name);
        if let Err(err) = tokio::fs::write(&path, &bytes).await {
            tracing::warn!(path = %path.display(), ?err, "write image failed, skipping");
            continue;
        }
        image.path = Some(path);
        saved.push(image);
    }
    saved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_lists_and_paragraphs() {
        let html = "<html><body><h1>Cells</h1><p>Basic unit.</p><ul><li>Nucleus</li><li>Membrane</li></ul></body></html>";
        let content = extract(html);
        assert_eq!(
            content.text,
            "### Cells\n\nBasic unit.\n\n- Nucleus\n- Membrane\n"
        );
        assert!(content.images.is_empty());
    }

    #[test]
    fn nested_paragraph_in_list_item_renders_once() {
        let content = extract("<ul><li><p>Only once</p></li></ul>");
        assert_eq!(content.text, "- Only once\n");
    }

    #[test]
    fn images_prefer_fullres_source() {
        let html =
            "<p>intro</p><img src=\"small\" data-fullres-src=\"https://x/full\" alt=\"diagram\">";
        let content = extract(html);
        assert_eq!(content.images.len(), 1);
        assert_eq!(
            content.images[0].source,
            ImageSource::Remote("https://x/full".to_string())
        );
        assert_eq!(content.images[0].alt_text, "diagram");
        assert_eq!(content.images[0].file_name, "image_1.png");
    }

    #[test]
    fn ink_drawings_become_svg_media() {
        let content = extract("<p>drawn</p><svg><path d=\"M0 0\"/></svg>");
        assert_eq!(content.images.len(), 1);
        assert_eq!(content.images[0].file_name, "drawing_1.svg");
        assert!(matches!(content.images[0].source, ImageSource::Inline(_)));
    }

    #[test]
    fn image_only_page_keeps_its_images() {
        let content = extract("<html><body><img src=\"https://x/scan\" alt=\"notes photo\"></body></html>");
        assert!(content.text.trim().is_empty());
        assert_eq!(content.images.len(), 1);
        assert_eq!(
            content.images[0].source,
            ImageSource::Remote("https://x/scan".to_string())
        );
    }

    #[test]
    fn drawing_only_page_keeps_its_drawing() {
        let content = extract("<svg><path d=\"M0 0\"/></svg>");
        assert_eq!(content.images.len(), 1);
        assert_eq!(content.images[0].file_name, "drawing_1.svg");
    }

    #[test]
    fn tagless_fallback_for_degenerate_markup() {
        let content = extract("plain&nbsp;words &amp; more");
        assert_eq!(content.text, "plain words & more");
    }

    #[test]
    fn strip_tags_flattens_whitespace() {
        assert_eq!(strip_tags("<div>a\n  b</div><span>c</span>"), "a b c");
    }
}
