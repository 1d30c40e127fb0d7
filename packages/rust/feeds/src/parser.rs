//! RSS 2.0 / Atom feed parser.
//!
//! Handles the subset of both formats the ingestion stage needs:
//! - RSS: `<item>` with `<title>`, `<link>`, `<pubDate>`, `<author>` or `<dc:creator>`
//! - Atom: `<entry>` with `<title>`, `<link href>`, `<published>`/`<updated>`,
//!   `<author><name>`
//!
//! Text content may be wrapped in CDATA and may carry XML entities.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use feedwatch_shared::{FeedwatchError, Result};
use regex::Regex;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One entry of a parsed feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub author: Option<String>,
    /// Publication date, falling back to the last-updated date.
    pub published: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Regex patterns (compiled once)
// ---------------------------------------------------------------------------

static RSS_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<item\b[^>]*>(.*?)</item>").expect("item regex"));

static ATOM_ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<entry\b[^>]*>(.*?)</entry>").expect("entry regex"));

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").expect("title regex"));

static RSS_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link>(.*?)</link>").expect("link regex"));

/// Atom `<link .../>` elements; attributes are inspected separately.
static ATOM_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<link\b([^>]*)/?>").expect("atom link regex"));

static HREF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\bhref\s*=\s*["']([^"']+)["']"#).expect("href regex"));

static REL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\brel\s*=\s*["']([^"']+)["']"#).expect("rel regex"));

static PUB_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(pubDate|published|dc:date)\b[^>]*>(.*?)</(?:pubDate|published|dc:date)>")
        .expect("pub date regex")
});

static UPDATED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<updated\b[^>]*>(.*?)</updated>").expect("updated regex"));

static AUTHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:dc:creator|author)\b[^>]*>(.*?)</(?:dc:creator|author)>")
        .expect("author regex")
});

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<name\b[^>]*>(.*?)</name>").expect("name regex"));

static CDATA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").expect("cdata regex"));

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag regex"));

static NUMERIC_ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("entity regex"));

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse an RSS or Atom document into entries, in document order.
///
/// Entries missing a title or link are dropped.
pub fn parse_feed(content: &str) -> Result<Vec<FeedEntry>> {
    let head = content.trim_start();
    if head.is_empty() {
        return Err(FeedwatchError::parse("feed is empty"));
    }

    let lower: String = head.chars().take(2048).collect::<String>().to_lowercase();
    let entries = if lower.contains("<rss") || lower.contains("<rdf:rdf") {
        RSS_ITEM_RE
            .captures_iter(content)
            .filter_map(|caps| parse_rss_item(&caps[1]))
            .collect()
    } else if lower.contains("<feed") {
        ATOM_ENTRY_RE
            .captures_iter(content)
            .filter_map(|caps| parse_atom_entry(&caps[1]))
            .collect()
    } else {
        return Err(FeedwatchError::parse(
            "document is neither an RSS nor an Atom feed",
        ));
    };

    Ok(entries)
}

fn parse_rss_item(block: &str) -> Option<FeedEntry> {
    let title = first_text(&TITLE_RE, block)?;
    let link = first_text(&RSS_LINK_RE, block)?;
    Some(FeedEntry {
        title,
        link,
        author: first_text(&AUTHOR_RE, block),
        published: entry_date(block),
    })
}

fn parse_atom_entry(block: &str) -> Option<FeedEntry> {
    let title = first_text(&TITLE_RE, block)?;
    let link = atom_link(block)?;
    let author = AUTHOR_RE
        .captures(block)
        .and_then(|caps| first_text(&NAME_RE, &caps[1]).or_else(|| clean_text(&caps[1])));
    Some(FeedEntry {
        title,
        link,
        author,
        published: entry_date(block),
    })
}

/// The `alternate` link, or the first link without a `rel`.
fn atom_link(block: &str) -> Option<String> {
    let mut fallback = None;
    for caps in ATOM_LINK_RE.captures_iter(block) {
        let attrs = &caps[1];
        let Some(href) = HREF_RE.captures(attrs).map(|c| decode_entities(&c[1])) else {
            continue;
        };
        match REL_RE.captures(attrs).map(|c| c[1].to_lowercase()) {
            Some(rel) if rel == "alternate" => return Some(href),
            None if fallback.is_none() => fallback = Some(href),
            _ => {}
        }
    }
    fallback
}

fn entry_date(block: &str) -> Option<DateTime<Utc>> {
    PUB_DATE_RE
        .captures(block)
        .and_then(|caps| clean_text(&caps[2]))
        .and_then(|s| parse_date(&s))
        .or_else(|| {
            first_text(&UPDATED_RE, block).and_then(|s| parse_date(&s))
        })
}

/// Parse RFC 2822 (RSS) or RFC 3339 (Atom) timestamps.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn first_text(re: &Regex, block: &str) -> Option<String> {
    re.captures(block).and_then(|caps| clean_text(&caps[1]))
}

/// Unwrap CDATA, strip markup, decode entities, collapse whitespace.
fn clean_text(raw: &str) -> Option<String> {
    let unwrapped = CDATA_RE.replace_all(raw, "$1");
    let stripped = TAG_RE.replace_all(&unwrapped, " ");
    let decoded = decode_entities(&stripped);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

fn decode_entities(s: &str) -> String {
    let numeric = NUMERIC_ENTITY_RE.replace_all(s, |caps: &regex::Captures<'_>| {
        let code = &caps[1];
        let value = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse().ok(),
        };
        value
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    numeric
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
<channel>
  <title>Security Blog</title>
  <link>https://blog.example.com/</link>
  <item>
    <title><![CDATA[Ransomware gang hits <b>hospital</b>]]></title>
    <link>https://blog.example.com/ransomware-hospital</link>
    <pubDate>Tue, 14 Oct 2025 09:30:00 +0000</pubDate>
    <dc:creator>Jane Doe</dc:creator>
  </item>
  <item>
    <title>Patch Tuesday &amp; friends</title>
    <link>https://blog.example.com/patch-tuesday</link>
  </item>
  <item>
    <title>No link here</title>
  </item>
</channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Schneier</title>
  <entry>
    <title type="html">Squid &#8220;Friday&#8221;</title>
    <link rel="replies" href="https://atom.example.com/squid#comments"/>
    <link rel="alternate" type="text/html" href="https://atom.example.com/squid"/>
    <author><name>Bruce</name></author>
    <updated>2025-10-10T21:00:00Z</updated>
  </entry>
  <entry>
    <title>Published wins</title>
    <link href="https://atom.example.com/published"/>
    <published>2025-10-09T08:00:00+02:00</published>
    <updated>2025-10-11T08:00:00Z</updated>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items() {
        let entries = parse_feed(RSS).unwrap();
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(first.title, "Ransomware gang hits hospital");
        assert_eq!(first.link, "https://blog.example.com/ransomware-hospital");
        assert_eq!(first.author.as_deref(), Some("Jane Doe"));
        assert_eq!(
            first.published.unwrap().to_rfc3339(),
            "2025-10-14T09:30:00+00:00"
        );

        assert_eq!(entries[1].title, "Patch Tuesday & friends");
        assert!(entries[1].published.is_none());
    }

    #[test]
    fn parses_atom_entries() {
        let entries = parse_feed(ATOM).unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].title, "Squid \u{201c}Friday\u{201d}");
        assert_eq!(entries[0].link, "https://atom.example.com/squid");
        assert_eq!(entries[0].author.as_deref(), Some("Bruce"));
        assert_eq!(
            entries[0].published.unwrap().to_rfc3339(),
            "2025-10-10T21:00:00+00:00"
        );

        assert_eq!(entries[1].link, "https://atom.example.com/published");
        assert_eq!(
            entries[1].published.unwrap().to_rfc3339(),
            "2025-10-09T06:00:00+00:00"
        );
    }

    #[test]
    fn rejects_non_feeds() {
        assert!(parse_feed("").is_err());
        assert!(parse_feed("<html><body>Hello</body></html>").is_err());
    }

    #[test]
    fn date_formats() {
        assert!(parse_date("Mon, 13 Oct 2025 12:00:00 GMT").is_some());
        assert!(parse_date("2025-10-13T12:00:00.123Z").is_some());
        assert!(parse_date("yesterday").is_none());
    }
}
