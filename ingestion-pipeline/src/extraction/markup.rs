use std::path::Path;

use common::error::AppError;
use dom_smoothie::{Article, Readability, TextMode};

use super::ExtractionStrategy;

/// Readability pass over an HTML page, emitted as Markdown.
pub struct HtmlStrategy;

impl ExtractionStrategy for HtmlStrategy {
    fn name(&self) -> &'static str {
        "html_readability"
    }

    fn extract(&self, path: &Path) -> Result<String, AppError> {
        let raw = read_lossy(path)?;
        let config = dom_smoothie::Config {
            text_mode: TextMode::Markdown,
            ..Default::default()
        };

        let mut readability = Readability::new(raw, None, Some(config))
            .map_err(|err| AppError::stage("extract", format!("readability: {err}")))?;
        let article: Article = readability
            .parse()
            .map_err(|err| AppError::stage("extract", format!("readability: {err}")))?;

        Ok(article.text_content.into())
    }
}

/// Reads the file as UTF-8, replacing invalid sequences.
pub struct PlainTextStrategy;

impl ExtractionStrategy for PlainTextStrategy {
    fn name(&self) -> &'static str {
        "plain_text"
    }

    fn extract(&self, path: &Path) -> Result<String, AppError> {
        read_lossy(path)
    }
}

fn read_lossy(path: &Path) -> Result<String, AppError> {
    let bytes = std::fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head><title>Infrastructure Investment and Jobs Act</title></head>
  <body>
    <nav><a href="/">Home</a> | <a href="/bills">Bills</a> | <a href="/laws">Laws</a></nav>
    <article>
      <h1>Infrastructure Investment and Jobs Act</h1>
      <p>The Infrastructure Investment and Jobs Act was signed into law on November 15, 2021,
      authorizing $1.2 trillion for transportation, broadband, water and energy projects across
      the United States. The Department of Transportation administers most of the new highway
      and transit programs created by the Act.</p>
      <p>Funding is distributed to states through formula programs as well as competitive grants.
      Senator Jane Smith of Ohio described the measure as the largest federal investment in public
      works in decades, and the Congressional Budget Office published a detailed cost estimate.</p>
      <p>Implementation guidance continues to be issued by the relevant agencies, and several
      programs require states to submit multi-year plans before funds are released.</p>
    </article>
    <footer>Contact us | Privacy policy</footer>
  </body>
</html>"#;

    #[test]
    fn html_keeps_article_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("iija.html");
        std::fs::write(&path, PAGE).expect("write");

        let text = HtmlStrategy.extract(&path).expect("readability");
        assert!(text.contains("signed into law on November 15, 2021"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn plain_text_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("legacy.txt");
        std::fs::write(&path, b"Section 8\xff(a) contractors").expect("write");

        let text = PlainTextStrategy.extract(&path).expect("read");
        assert!(text.starts_with("Section 8"));
        assert!(text.ends_with("(a) contractors"));
    }
}
