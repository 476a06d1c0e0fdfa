//! PDF download and text extraction.
//!
//! PDFs bypass the browser entirely: a plain HTTP GET pulls the bytes and
//! text extraction runs on the blocking pool. The whole download + extract
//! sequence runs under its own timeout, separate from the browser navigation
//! timeout.

use crate::error::FetchError;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Fetches a PDF over HTTP and extracts its text.
#[derive(Clone)]
pub struct PdfExtractor {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl PdfExtractor {
    pub fn new(client: reqwest::Client, timeout_secs: u64) -> Self {
        Self {
            client,
            timeout_secs,
        }
    }

    /// Download the PDF at `url` and return its text content.
    pub async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let deadline = Duration::from_secs(self.timeout_secs);
        match timeout(deadline, self.fetch_inner(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout_secs,
            }),
        }
    }

    async fn fetch_inner(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Http {
                url: url.to_string(),
                message: err.to_string(),
            })?
            .error_for_status()
            .map_err(|err| FetchError::Http {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let bytes = response.bytes().await.map_err(|err| FetchError::Http {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        debug!(url, size = bytes.len(), "downloaded pdf");

        // Extraction is CPU-bound and the library is synchronous.
        let url_owned = url.to_string();
        let text = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes)
        })
        .await
        .map_err(|err| FetchError::PdfExtract {
            url: url_owned.clone(),
            message: format!("extraction task failed: {err}"),
        })?
        .map_err(|err| FetchError::PdfExtract {
            url: url_owned.clone(),
            message: err.to_string(),
        })?;

        let text = clean_extracted(&text);
        if text.is_empty() {
            return Err(FetchError::EmptyBody { url: url_owned });
        }
        Ok(text)
    }
}

/// Strip extraction artifacts: replacement characters from undecodable
/// glyphs and NUL bytes some producers embed.
fn clean_extracted(text: &str) -> String {
    text.replace('\u{fffd}', "?")
        .replace('\0', "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_extracted_replaces_undecodable_glyphs() {
        assert_eq!(
            clean_extracted("token \u{fffd} budget"),
            "token ? budget"
        );
    }

    #[test]
    fn clean_extracted_strips_nul_and_whitespace() {
        assert_eq!(clean_extracted("  body\0 text \n"), "body text");
    }

    #[test]
    fn clean_extracted_keeps_unicode_prose() {
        let prose = "Größenordnung des Kontextfensters: 128k Token.";
        assert_eq!(clean_extracted(prose), prose);
    }
}
