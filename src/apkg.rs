use std::io::{Cursor, Write as _};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use zip::write::SimpleFileOptions;

/// Note model names the deck manifest uses. Importers map these onto
/// their own cloze and front/back templates.
pub const CLOZE_MODEL: &str = "Cloze";
pub const BASIC_MODEL: &str = "Basic";

/// One note in the packaged deck. Cloze records carry `{Text, Extra}`
/// fields, basic records `{Front, Back}`. Tags are a single
/// space-joined string, the form note importers expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRecord {
    pub model: String,
    pub fields: Vec<String>,
    pub tags: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeckManifest {
    pub deck_id: u64,
    pub name: String,
    pub generated_at: String,
    pub cards: Vec<CardRecord>,
    pub media: Vec<String>,
}

/// Builder for a packaged deck. The on-disk format is a zip container
/// with a `deck.json` manifest and a `media/` directory; the builder
/// interface is the stable boundary, the container layout is not.
pub struct DeckPackage {
    manifest: DeckManifest,
    media: Vec<(String, Vec<u8>)>,
}

impl DeckPackage {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            manifest: DeckManifest {
                deck_id: deck_id_for_name(&name),
                name,
                generated_at: chrono::Utc::now().to_rfc3339(),
                cards: Vec::new(),
                media: Vec::new(),
            },
            media: Vec::new(),
        }
    }

    pub fn add_card(&mut self, card: CardRecord) {
        self.manifest.cards.push(card);
    }

    pub fn add_media(&mut self, file_name: impl Into<String>, bytes: Vec<u8>) {
        let file_name = file_name.into();
        self.manifest.media.push(file_name.clone());
        self.media.push((file_name, bytes));
    }

    pub fn card_count(&self) -> usize {
        self.manifest.cards.len()
    }

    /// Writes the container and returns its bytes.
    pub fn finalize(self) -> anyhow::Result<Vec<u8>> {
        let cursor = Cursor::new(Vec::new());
        let mut zip = zip::ZipWriter::new(cursor);
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);

        let manifest =
            serde_json::to_vec_pretty(&self.manifest).context("serialize deck manifest")?;
        zip.start_file("deck.json", options)
            .context("deck start_file manifest")?;
        zip.write_all(&manifest).context("deck write manifest")?;

        for (file_name, bytes) in &self.media {
            zip.start_file(format!("media/{file_name}"), options)
                .with_context(|| format!("deck start_file media: {file_name}"))?;
            zip.write_all(bytes)
                .with_context(|| format!("deck write media: {file_name}"))?;
        }

        let cursor = zip.finish().context("finish deck container")?;
        Ok(cursor.into_inner())
    }
}

/// Stable deck id derived from the deck name, so regenerating a deck
/// updates it in place on import instead of creating a sibling.
pub fn deck_id_for_name(name: &str) -> u64 {
    let digest = sha2::Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    // Keep ids positive when importers store them in signed 64-bit columns.
    u64::from_be_bytes(bytes) >> 1
}

#[cfg(test)]
mod tests {
    use std::io::Read as _;

    use super::*;

    fn read_entry(bytes: &[u8], name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        let mut entry = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn manifest_round_trips_through_the_container() {
        let mut package = DeckPackage::new("Biology");
        package.add_card(CardRecord {
            model: CLOZE_MODEL.to_string(),
            fields: vec!["The {{c1::cell}}".to_string(), String::new()],
            tags: "biology".to_string(),
        });
        package.add_media("image_1.png", vec![1, 2, 3]);
        let bytes = package.finalize().unwrap();

        let manifest: DeckManifest =
            serde_json::from_slice(&read_entry(&bytes, "deck.json")).unwrap();
        assert_eq!(manifest.name, "Biology");
        assert_eq!(manifest.cards.len(), 1);
        assert_eq!(manifest.media, vec!["image_1.png".to_string()]);
        assert_eq!(read_entry(&bytes, "media/image_1.png"), vec![1, 2, 3]);
    }

    #[test]
    fn deck_ids_are_stable_and_distinct() {
        assert_eq!(deck_id_for_name("Biology"), deck_id_for_name("Biology"));
        assert_ne!(deck_id_for_name("Biology"), deck_id_for_name("Chemistry"));
        assert!(deck_id_for_name("Biology") <= i64::MAX as u64);
    }
}
