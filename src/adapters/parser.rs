//! Plain-text extraction from rendered HTML.
//!
//! Scans the markup once, drops script/style content, breaks lines at block
//! elements and decodes common entities. The thumbnail comes from the
//! `og:image` (or `twitter:image`) meta tag.

use anyhow::Result;

use super::{ContentParser, ParsedContent};

/// Elements whose content is never readable text
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "svg", "head"];

/// Elements that start a new line
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "section",
    "article", "header", "footer", "blockquote", "pre", "table", "hr",
];

const THUMBNAIL_KEYS: &[&str] = &["og:image", "twitter:image"];

/// Tag-stripping HTML parser
#[derive(Debug, Clone)]
pub struct HtmlParser {
    /// Texts shorter than this count as unreadable
    min_text_chars: usize,
}

impl Default for HtmlParser {
    fn default() -> Self {
        Self { min_text_chars: 1 }
    }
}

impl HtmlParser {
    pub fn new(min_text_chars: usize) -> Self {
        Self {
            min_text_chars: min_text_chars.max(1),
        }
    }
}

impl ContentParser for HtmlParser {
    fn parse(&self, html: &str, link: &str) -> Result<ParsedContent> {
        let thumbnail_url = extract_thumbnail(html).map(|url| resolve_url(&url, link));
        let plain_text = html_to_text(main_region(html));

        if plain_text.chars().count() < self.min_text_chars {
            anyhow::bail!("No readable text found in {}", link);
        }

        Ok(ParsedContent {
            plain_text,
            thumbnail_url,
        })
    }
}

/// Prefer `<article>`, then `<body>`, then the whole document
fn main_region(html: &str) -> &str {
    let lower = html.to_ascii_lowercase();
    for element in ["article", "body"] {
        if let Some(start) = lower.find(&format!("<{}", element)) {
            let end = lower[start..]
                .find(&format!("</{}", element))
                .map(|e| start + e)
                .unwrap_or(html.len());
            return &html[start..end];
        }
    }
    html
}

fn tag_name(tag: &str) -> &str {
    let tag = tag.trim_start_matches('/');
    let end = tag
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(tag.len());
    &tag[..end]
}

/// Strip markup and return normalized text, one block per line
pub fn html_to_text(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let bytes = html.as_bytes();
    let mut out = String::with_capacity(html.len() / 2);
    let mut i = 0;

    while i < html.len() {
        if bytes[i] != b'<' {
            let next = html[i..].find('<').map(|n| i + n).unwrap_or(html.len());
            out.push_str(&decode_entities(&html[i..next]));
            i = next;
            continue;
        }

        if lower[i..].starts_with("<!--") {
            i = lower[i..]
                .find("-->")
                .map(|e| i + e + 3)
                .unwrap_or(html.len());
            continue;
        }

        let Some(end) = html[i..].find('>').map(|e| i + e) else {
            break;
        };
        let tag = &lower[i + 1..end];
        let name = tag_name(tag);

        if SKIPPED_ELEMENTS.contains(&name) && !tag.starts_with('/') && !tag.ends_with('/') {
            let close = format!("</{}", name);
            i = match lower[end..].find(&close) {
                Some(c) => {
                    let close_start = end + c;
                    lower[close_start..]
                        .find('>')
                        .map(|g| close_start + g + 1)
                        .unwrap_or(html.len())
                }
                None => html.len(),
            };
            continue;
        }

        if BLOCK_ELEMENTS.contains(&name) {
            out.push('\n');
        }
        i = end + 1;
    }

    out.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if let Some(end) = tail.find(';').filter(|&e| e <= 10) {
            if let Some(c) = decode_entity(&tail[1..end]) {
                out.push(c);
                rest = &tail[end + 1..];
                continue;
            }
        }

        out.push('&');
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse().ok().and_then(char::from_u32)
            } else {
                None
            }
        }
    }
}

fn extract_thumbnail(html: &str) -> Option<String> {
    let lower = html.to_ascii_lowercase();
    let mut offset = 0;

    while let Some(start) = lower[offset..].find("<meta").map(|s| offset + s) {
        let end = lower[start..]
            .find('>')
            .map(|e| start + e)
            .unwrap_or(html.len());
        let attrs = attributes(&html[start + 5..end]);

        let is_thumbnail = attrs.iter().any(|(key, value)| {
            (key == "property" || key == "name")
                && THUMBNAIL_KEYS.contains(&value.to_ascii_lowercase().as_str())
        });
        if is_thumbnail {
            if let Some((_, content)) = attrs.iter().find(|(key, _)| key == "content") {
                if !content.trim().is_empty() {
                    return Some(content.trim().to_string());
                }
            }
        }

        offset = end;
    }

    None
}

fn attributes(tag: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut rest = tag;

    while let Some(eq) = rest.find('=') {
        let key = rest[..eq]
            .trim()
            .rsplit(char::is_whitespace)
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        let after = rest[eq + 1..].trim_start();

        let (value, remaining) = match after.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let inner = &after[1..];
                match inner.find(quote) {
                    Some(close) => (&inner[..close], &inner[close + 1..]),
                    None => (inner, ""),
                }
            }
            _ => {
                let end = after
                    .find(char::is_whitespace)
                    .unwrap_or(after.len());
                (&after[..end], &after[end..])
            }
        };

        attrs.push((key, decode_entities(value)));
        rest = remaining;
    }

    attrs
}

/// Make a thumbnail URL absolute against the article link
fn resolve_url(url: &str, link: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }

    let Some(scheme_end) = link.find("://") else {
        return url.to_string();
    };

    if let Some(rest) = url.strip_prefix("//") {
        return format!("{}://{}", &link[..scheme_end], rest);
    }

    if url.starts_with('/') {
        let host_end = link[scheme_end + 3..]
            .find('/')
            .map(|p| scheme_end + 3 + p)
            .unwrap_or(link.len());
        return format!("{}{}", &link[..host_end], url);
    }

    url.to_string()
}
