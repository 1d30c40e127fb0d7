//! URL helpers shared by the ingestion stages.

use url::Url;

/// Path extensions of downloads the pipeline cannot read as articles.
pub const FILE_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".zip", ".rar", ".7z", ".gz",
    ".tar", ".tgz", ".exe", ".msi", ".dmg", ".apk", ".iso",
];

/// Whether `url` points at a downloadable file rather than a page.
///
/// Only the path is inspected, case-insensitively; unparseable URLs are
/// not file URLs.
pub fn is_file_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let path = parsed.path().to_lowercase();
    FILE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
