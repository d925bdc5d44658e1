//! Plain-text extraction from fetched pages and DuckDuckGo result parsing.

use percent_encoding::percent_decode_str;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

/// Elements whose whole subtree is dropped from extracted text.
const STRIP_TAGS: [&str; 8] = [
    "script", "style", "nav", "header", "footer", "aside", "noscript", "svg",
];

/// Elements whose body is raw text; a `<` inside them is not markup.  Their
/// content is dropped (the title is reported separately).
const RAW_TEXT_TAGS: [&str; 3] = ["script", "style", "title"];

/// One organic search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Strip markup from `html` and return at most `max_chars` characters of
/// whitespace-joined text.
///
/// Boilerplate blocks (`STRIP_TAGS`) and comments are removed entirely, every
/// other tag becomes a word break, common entities are decoded and runs of
/// whitespace collapse to a single space.
pub fn html_to_text(html: &str, max_chars: usize) -> String {
    let mut text = String::with_capacity(html.len().min(max_chars.saturating_mul(4)));
    let mut skip_depth: usize = 0;
    let mut rest = html;

    while let Some(lt) = rest.find('<') {
        if skip_depth == 0 {
            text.push_str(&rest[..lt]);
        }
        text.push(' ');
        rest = &rest[lt..];

        if let Some(after) = rest.strip_prefix("<!--") {
            rest = after.find("-->").map(|end| &after[end + 3..]).unwrap_or("");
            continue;
        }

        let Some(gt) = rest.find('>') else {
            // A stray '<' with no closing bracket is ordinary text.
            if skip_depth == 0 {
                text.push_str(rest);
            }
            rest = "";
            break;
        };
        let tag = &rest[1..gt];
        rest = &rest[gt + 1..];

        let is_close = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| !c.is_ascii_alphanumeric())
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        let self_closing = tag.ends_with('/');
        if !is_close && !self_closing && RAW_TEXT_TAGS.contains(&name.as_str()) {
            let closing = format!("</{name}");
            rest = match find_ignore_ascii_case(rest, &closing) {
                Some(pos) => {
                    let after = &rest[pos..];
                    after.find('>').map(|end| &after[end + 1..]).unwrap_or("")
                }
                None => "",
            };
            continue;
        }
        if STRIP_TAGS.contains(&name.as_str()) && !self_closing {
            if is_close {
                skip_depth = skip_depth.saturating_sub(1);
            } else {
                skip_depth += 1;
            }
        }
    }
    if skip_depth == 0 {
        text.push_str(rest);
    }

    let decoded = decode_entities(&text);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars)
}

fn find_ignore_ascii_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

fn decode_entities(text: &str) -> String {
    // `&amp;` last so `&amp;lt;` stays a literal `&lt;`.
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Character-based (not byte-based) truncation.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// The document `<title>`, whitespace-collapsed.  Empty when absent.
pub fn page_title(html: &str) -> String {
    let doc = Html::parse_document(html);
    let Ok(sel) = Selector::parse("title") else {
        return String::new();
    };
    doc.select(&sel)
        .next()
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

/// Parse a DuckDuckGo HTML results page into at most `max` hits.
pub fn parse_search_results(html: &str, max: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let (Ok(result_sel), Ok(link_sel), Ok(snippet_sel)) = (
        Selector::parse(".result"),
        Selector::parse("a.result__a"),
        Selector::parse(".result__snippet"),
    ) else {
        return Vec::new();
    };

    let mut hits: Vec<SearchHit> = Vec::new();
    for result in doc.select(&result_sel) {
        if hits.len() >= max {
            break;
        }
        let Some(link) = result.select(&link_sel).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let url = extract_ddg_url(href);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            continue;
        }
        if hits.iter().any(|h| h.url == url) {
            continue;
        }

        let title = collapse(link.text());
        let snippet = result
            .select(&snippet_sel)
            .next()
            .map(|el| collapse(el.text()))
            .unwrap_or_default();

        hits.push(SearchHit {
            title: if title.is_empty() { "No title".to_string() } else { title },
            url,
            snippet: if snippet.is_empty() { "No description".to_string() } else { snippet },
        });
    }
    hits
}

fn collapse<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// DDG wraps result URLs in redirect links; extract and decode the real URL.
pub fn extract_ddg_url(href: &str) -> String {
    if let Some(pos) = href.find("uddg=") {
        let start = pos + 5;
        let end = href[start..]
            .find('&')
            .map(|i| start + i)
            .unwrap_or(href.len());
        let encoded = &href[start..end];
        if !encoded.is_empty() {
            return percent_decode_str(encoded)
                .decode_utf8_lossy()
                .into_owned();
        }
    }
    href.to_string()
}
