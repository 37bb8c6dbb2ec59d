use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Command,
};

use common::error::AppError;
use lopdf::Document;
use tracing::debug;

use super::ExtractionStrategy;

/// Text layer extraction that keeps reading order and line breaks.
pub struct PdfLayoutStrategy;

impl ExtractionStrategy for PdfLayoutStrategy {
    fn name(&self) -> &'static str {
        "pdf_layout"
    }

    fn extract(&self, path: &Path) -> Result<String, AppError> {
        let bytes = std::fs::read(path)?;
        let text = pdf_extract::extract_text_from_mem(&bytes)
            .map_err(|err| AppError::stage("extract", format!("pdf-extract: {err}")))?;
        Ok(tidy_lines(&text))
    }
}

/// Per page content stream text via `lopdf`. Survives some files the layout
/// extractor chokes on.
pub struct PdfRawStrategy;

impl ExtractionStrategy for PdfRawStrategy {
    fn name(&self) -> &'static str {
        "pdf_raw"
    }

    fn extract(&self, path: &Path) -> Result<String, AppError> {
        let document = Document::load(path)
            .map_err(|err| AppError::stage("extract", format!("lopdf: {err}")))?;
        let mut pages: Vec<u32> = document.get_pages().keys().copied().collect();
        pages.sort_unstable();

        let text = document
            .extract_text(&pages)
            .map_err(|err| AppError::stage("extract", format!("lopdf: {err}")))?;
        Ok(tidy_lines(&text))
    }
}

/// Renders pages with `pdftoppm` and reads them back with `tesseract`.
/// Both binaries must be on `PATH`; without them the strategy just fails.
pub struct PdfOcrStrategy {
    pub resolution: u32,
    pub language: String,
}

impl Default for PdfOcrStrategy {
    fn default() -> Self {
        Self {
            resolution: 300,
            language: "eng".to_string(),
        }
    }
}

impl ExtractionStrategy for PdfOcrStrategy {
    fn name(&self) -> &'static str {
        "pdf_ocr"
    }

    fn last_resort(&self) -> bool {
        true
    }

    fn extract(&self, path: &Path) -> Result<String, AppError> {
        let workdir = tempfile::tempdir()?;
        let prefix = workdir.path().join("page");

        run(Command::new("pdftoppm")
            .arg("-r")
            .arg(self.resolution.to_string())
            .arg("-png")
            .arg(path)
            .arg(&prefix))?;

        let mut pages: Vec<PathBuf> = std::fs::read_dir(workdir.path())?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|page| page.extension().is_some_and(|ext| ext == "png"))
            .collect();
        pages.sort();
        debug!(pages = pages.len(), "rendered pages for ocr");

        let mut text = String::new();
        for page in pages {
            let output = run(Command::new("tesseract")
                .arg(&page)
                .arg("stdout")
                .arg("-l")
                .arg(&self.language))?;
            text.push_str(&String::from_utf8_lossy(&output));
            text.push('\n');
        }

        Ok(tidy_lines(&text))
    }
}

fn run(command: &mut Command) -> Result<Vec<u8>, AppError> {
    let program = command.get_program().to_string_lossy().into_owned();
    let output = command.output().map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            AppError::stage("extract", format!("{program} is not installed"))
        } else {
            AppError::Io(err)
        }
    })?;

    if !output.status.success() {
        return Err(AppError::stage(
            "extract",
            format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    Ok(output.stdout)
}

/// Trims trailing whitespace and collapses runs of blank lines to one.
fn tidy_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.replace('\r', "").lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tidy_lines_collapses_blank_runs() {
        let raw = "SEC. 1. SHORT TITLE.  \r\n\n\n\nThis Act may be cited as the Example Act.\n\n";
        assert_eq!(
            tidy_lines(raw),
            "SEC. 1. SHORT TITLE.\n\nThis Act may be cited as the Example Act."
        );
    }

    #[test]
    fn garbage_is_rejected_by_both_text_layers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"this is not a pdf").expect("write");

        assert!(PdfLayoutStrategy.extract(&path).is_err());
        assert!(PdfRawStrategy.extract(&path).is_err());
    }
}
