//! Readable-text extraction from article HTML.
//!
//! Picks the most specific content container the page offers, then collects
//! the text of its block elements while skipping page chrome.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

/// Bodies shorter than this are treated as failed extractions.
pub const MIN_CONTENT_CHARS: usize = 100;

/// Content containers, most specific first.
const CONTAINER_SELECTORS: &[&str] = &[
    "article",
    "main",
    r#"[role="main"]"#,
    ".entry-content",
    ".post-content",
    ".article-body",
    "body",
];

/// Elements whose text never belongs to the article.
const CHROME_TAGS: &[&str] = &[
    "nav", "header", "footer", "aside", "script", "style", "noscript", "form", "figure",
];

static CONTAINERS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    CONTAINER_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});

static BLOCKS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("p, h1, h2, h3, h4, li, blockquote, pre").expect("block selector")
});

static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("title selector"));

/// Extract the readable text of an article page.
///
/// Returns `None` when nothing of at least [`MIN_CONTENT_CHARS`] survives.
pub fn extract_article_text(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);

    for selector in CONTAINERS.iter() {
        let Some(container) = doc.select(selector).next() else {
            continue;
        };
        let text = block_text(container);
        if text.chars().count() >= MIN_CONTENT_CHARS {
            return Some(text);
        }
    }
    None
}

/// Document `<title>`, whitespace-collapsed.
pub fn page_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    doc.select(&TITLE)
        .next()
        .map(|el| collapse(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

fn block_text(container: ElementRef<'_>) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    for block in container.select(&BLOCKS) {
        if in_chrome(block, container) || has_block_ancestor(block, container) {
            continue;
        }
        let text = collapse(&block.text().collect::<String>());
        if !text.is_empty() {
            paragraphs.push(text);
        }
    }
    paragraphs.join("\n\n")
}

/// Whether `el` sits inside a chrome element below `root`.
fn in_chrome(el: ElementRef<'_>, root: ElementRef<'_>) -> bool {
    ancestors_below(el, root).any(|a| CHROME_TAGS.contains(&a.value().name()))
}

/// Nested blocks (a `<p>` inside an `<li>`) are already covered by their parent.
fn has_block_ancestor(el: ElementRef<'_>, root: ElementRef<'_>) -> bool {
    ancestors_below(el, root).any(|a| BLOCKS.matches(&a))
}

fn ancestors_below<'a>(
    el: ElementRef<'a>,
    root: ElementRef<'a>,
) -> impl Iterator<Item = ElementRef<'a>> {
    el.ancestors()
        .take_while(move |node| *node != *root)
        .filter_map(ElementRef::wrap)
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
