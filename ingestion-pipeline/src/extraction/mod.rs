mod markup;
mod pdf;

pub use markup::{HtmlStrategy, PlainTextStrategy};
pub use pdf::{PdfLayoutStrategy, PdfOcrStrategy, PdfRawStrategy};

use std::{collections::HashMap, path::Path, sync::Arc};

use common::error::AppError;
use tracing::{debug, info, warn};

/// Results shorter than this (after trimming) do not count as extracted text.
pub const MIN_USEFUL_CHARS: usize = 20;

/// One way of turning a file into text. Implementations are blocking and are
/// run on the CPU pool.
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Expensive strategies only run when nothing before them produced
    /// useful text.
    fn last_resort(&self) -> bool {
        false
    }

    fn extract(&self, path: &Path) -> Result<String, AppError>;
}

/// Picks strategies by file extension and keeps the longest useful result.
#[derive(Clone)]
pub struct TextExtractor {
    by_extension: HashMap<String, Vec<Arc<dyn ExtractionStrategy>>>,
    fallback: Vec<Arc<dyn ExtractionStrategy>>,
}

impl Default for TextExtractor {
    fn default() -> Self {
        let plain: Arc<dyn ExtractionStrategy> = Arc::new(PlainTextStrategy);
        let pdf: Vec<Arc<dyn ExtractionStrategy>> = vec![
            Arc::new(PdfLayoutStrategy),
            Arc::new(PdfRawStrategy),
            Arc::new(PdfOcrStrategy::default()),
        ];
        let html: Vec<Arc<dyn ExtractionStrategy>> = vec![Arc::new(HtmlStrategy)];

        let mut extractor = Self::empty().with_strategies("pdf", pdf);
        for ext in ["html", "htm", "xhtml"] {
            extractor.register(ext, html.clone());
        }
        for ext in ["txt", "md", "xml", "json", "csv"] {
            extractor.register(ext, vec![Arc::clone(&plain)]);
        }
        extractor
    }
}

impl TextExtractor {
    /// No extension mappings; everything goes through the plain text reader.
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
            fallback: vec![Arc::new(PlainTextStrategy)],
        }
    }

    pub fn register(&mut self, extension: &str, strategies: Vec<Arc<dyn ExtractionStrategy>>) {
        self.by_extension
            .insert(extension.to_ascii_lowercase(), strategies);
    }

    #[must_use]
    pub fn with_strategies(
        mut self,
        extension: &str,
        strategies: Vec<Arc<dyn ExtractionStrategy>>,
    ) -> Self {
        self.register(extension, strategies);
        self
    }

    pub fn strategies_for(&self, path: &Path) -> &[Arc<dyn ExtractionStrategy>] {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.by_extension.get(&ext.to_ascii_lowercase()))
            .unwrap_or(&self.fallback)
    }

    /// Runs every applicable strategy and returns the longest useful text.
    /// If no strategy reaches [`MIN_USEFUL_CHARS`], the longest short result
    /// is returned instead. Fails only when no strategy produced any text.
    pub fn extract(&self, path: &Path) -> Result<String, AppError> {
        let mut best: Option<(&'static str, String, usize)> = None;
        let mut short: Option<(String, usize)> = None;
        let mut failures = Vec::new();

        for strategy in self.strategies_for(path) {
            if strategy.last_resort() && best.is_some() {
                debug!(strategy = strategy.name(), "skipping last resort strategy");
                continue;
            }

            match strategy.extract(path) {
                Ok(text) => {
                    let text = text.trim().to_string();
                    let chars = text.chars().count();
                    debug!(strategy = strategy.name(), chars, "extraction strategy finished");

                    if chars >= MIN_USEFUL_CHARS {
                        if best.as_ref().map_or(true, |(_, _, len)| chars > *len) {
                            best = Some((strategy.name(), text, chars));
                        }
                    } else if chars > 0 && short.as_ref().map_or(true, |(_, len)| chars > *len) {
                        short = Some((text, chars));
                    }
                }
                Err(err) => {
                    debug!(strategy = strategy.name(), error = %err, "extraction strategy failed");
                    failures.push(format!("{}: {err}", strategy.name()));
                }
            }
        }

        if let Some((name, text, chars)) = best {
            info!(file = %path.display(), strategy = name, chars, "text extracted");
            return Ok(text);
        }
        if let Some((text, chars)) = short {
            warn!(file = %path.display(), chars, "only trivial text could be extracted");
            return Ok(text);
        }

        let detail = if failures.is_empty() {
            "no text found".to_string()
        } else {
            failures.join("; ")
        };
        Err(AppError::stage(
            "extract",
            format!("{}: {detail}", path.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Fixed {
        name: &'static str,
        output: Result<String, &'static str>,
        last_resort: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn text(name: &'static str, chars: usize) -> Arc<dyn ExtractionStrategy> {
            Arc::new(Self {
                name,
                output: Ok("x".repeat(chars)),
                last_resort: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(name: &'static str) -> Arc<dyn ExtractionStrategy> {
            Arc::new(Self {
                name,
                output: Err("broken xref table"),
                last_resort: false,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ExtractionStrategy for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn last_resort(&self) -> bool {
            self.last_resort
        }

        fn extract(&self, _path: &Path) -> Result<String, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.output
                .clone()
                .map_err(|msg| AppError::stage("extract", msg))
        }
    }

    #[test]
    fn longest_result_wins_over_first_success() {
        let extractor = TextExtractor::empty()
            .with_strategies("pdf", vec![Fixed::text("a", 50), Fixed::text("b", 5_000)]);

        let text = extractor.extract(Path::new("scan.pdf")).expect("extract");
        assert_eq!(text.chars().count(), 5_000);
    }

    #[test]
    fn failing_strategies_are_skipped() {
        let extractor = TextExtractor::empty().with_strategies(
            "pdf",
            vec![Fixed::failing("layout"), Fixed::text("raw", 120)],
        );

        let text = extractor.extract(Path::new("a.PDF")).expect("extract");
        assert_eq!(text.len(), 120);
    }

    #[test]
    fn last_resort_only_runs_without_useful_text() {
        let ocr = Arc::new(Fixed {
            name: "ocr",
            output: Ok("y".repeat(300)),
            last_resort: true,
            calls: AtomicUsize::new(0),
        });

        let good = TextExtractor::empty().with_strategies(
            "pdf",
            vec![Fixed::text("layout", 100), Arc::clone(&ocr) as Arc<dyn ExtractionStrategy>],
        );
        assert_eq!(good.extract(Path::new("a.pdf")).expect("extract").len(), 100);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);

        let scanned = TextExtractor::empty().with_strategies(
            "pdf",
            vec![Fixed::text("layout", 3), Arc::clone(&ocr) as Arc<dyn ExtractionStrategy>],
        );
        assert_eq!(scanned.extract(Path::new("a.pdf")).expect("extract").len(), 300);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_strategy_failing_is_a_stage_error() {
        let extractor = TextExtractor::empty().with_strategies(
            "pdf",
            vec![Fixed::failing("layout"), Fixed::failing("raw")],
        );

        let err = extractor.extract(Path::new("bad.pdf")).unwrap_err();
        match err {
            AppError::PipelineStage { stage, message } => {
                assert_eq!(stage, "extract");
                assert!(message.contains("layout") && message.contains("raw"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_extensions_fall_back_to_plain_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notice.weird");
        std::fs::write(&path, "  Notice of proposed rulemaking for 40 CFR part 60.  ").expect("write");

        let text = TextExtractor::default().extract(&path).expect("extract");
        assert_eq!(text, "Notice of proposed rulemaking for 40 CFR part 60.");
    }

    #[test]
    fn empty_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.txt");
        std::fs::write(&path, "   \n").expect("write");

        assert!(TextExtractor::default().extract(&path).is_err());
    }
}
