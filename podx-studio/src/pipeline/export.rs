//! Downloads of run artifacts: single files per export format, a zip
//! bundle of everything, and the Notion page link left by the upload.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::domain::{ExportFormat, StageKind};
use crate::{Error, Result};

/// A file ready to be sent to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub file_name: String,
    pub media_type: &'static str,
    pub bytes: Vec<u8>,
}

pub fn media_type(format: ExportFormat) -> &'static str {
    match format {
        ExportFormat::Txt => "text/plain",
        ExportFormat::Srt => "text/srt",
        ExportFormat::Vtt => "text/vtt",
        ExportFormat::Json => "application/json",
        ExportFormat::Md => "text/markdown",
        ExportFormat::Pdf => "application/pdf",
    }
}

fn is_notion_receipt(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase().contains("notion"))
        .unwrap_or(false)
}

/// Latest artifact written in `format`. The Notion receipt is not an export.
pub fn find_export(artifacts: &[(StageKind, PathBuf)], format: ExportFormat) -> Option<&Path> {
    artifacts
        .iter()
        .rev()
        .map(|(_, path)| path.as_path())
        .filter(|path| !is_notion_receipt(path))
        .find(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .and_then(|e| e.parse::<ExportFormat>().ok())
                == Some(format)
        })
}

/// Zip every existing file of `artifacts`, one `<stage>/<name>` entry each.
///
/// Blocking; run it on the blocking pool.
pub fn build_bundle(artifacts: &[(StageKind, PathBuf)]) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut cursor);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (stage, path) in artifacts {
        if !path.is_file() {
            debug!(path = %path.display(), "Skipping missing artifact in bundle");
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        let mut buf = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut buf)?;

        zip.start_file(format!("{}/{}", stage, name), options)
            .map_err(|e| Error::Other(format!("Failed to add zip entry: {}", e)))?;
        zip.write_all(&buf)?;
    }

    zip.finish()
        .map_err(|e| Error::Other(format!("Failed to finish zip: {}", e)))?;
    Ok(cursor.into_inner())
}

/// Page link recorded in the Notion upload receipt, if there is one.
///
/// The receipt is a JSON object with a `url` or `page_url` field.
pub async fn notion_page_url(artifacts: &[PathBuf]) -> Option<String> {
    for path in artifacts.iter().filter(|p| is_notion_receipt(p)) {
        let Ok(text) = tokio::fs::read_to_string(path).await else {
            continue;
        };
        let Ok(receipt) = serde_json::from_str::<serde_json::Value>(&text) else {
            debug!(path = %path.display(), "Notion receipt is not JSON");
            continue;
        };
        let url = ["url", "page_url"]
            .iter()
            .find_map(|key| receipt.get(*key).and_then(|v| v.as_str()))
            .filter(|url| !url.is_empty());
        if let Some(url) = url {
            return Some(url.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_find_export_prefers_latest_and_skips_receipt() {
        let artifacts = vec![
            (StageKind::Transcribe, PathBuf::from("/r/transcript.json")),
            (StageKind::Export, PathBuf::from("/r/episode.txt")),
            (StageKind::Export, PathBuf::from("/r/episode.final.json")),
            (StageKind::Export, PathBuf::from("/r/notion.json")),
        ];
        assert_eq!(
            find_export(&artifacts, ExportFormat::Json),
            Some(Path::new("/r/episode.final.json"))
        );
        assert_eq!(
            find_export(&artifacts, ExportFormat::Txt),
            Some(Path::new("/r/episode.txt"))
        );
        assert_eq!(find_export(&artifacts, ExportFormat::Srt), None);
    }

    #[test]
    fn test_bundle_contains_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("episode.txt");
        std::fs::write(&txt, "hello").unwrap();
        let artifacts = vec![
            (StageKind::Export, txt),
            (StageKind::Export, dir.path().join("gone.srt")),
        ];

        let bytes = build_bundle(&artifacts).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 1);

        let mut content = String::new();
        archive
            .by_name("export/episode.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn test_notion_page_url_from_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let receipt = dir.path().join("notion.json");
        std::fs::write(&receipt, r#"{"page_url": "https://notion.so/abc"}"#).unwrap();
        let other = dir.path().join("episode.json");
        std::fs::write(&other, r#"{"url": "https://example.com"}"#).unwrap();

        let url = notion_page_url(&[other.clone(), receipt]).await;
        assert_eq!(url.as_deref(), Some("https://notion.so/abc"));
        assert_eq!(notion_page_url(&[other]).await, None);
    }
}
