//! Chapter source
//!
//! Fetches and parses NovelCool-style chapter pages. The narration pipeline
//! only consumes the shapes returned here; everything about the upstream
//! site (markup quirks, next/prev link conventions) stays in this module.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::info;
use url::Url;

use crate::error::SpeechError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

static CHAPTER_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Chapter|C)\s*(\d+)").expect("chapter number regex"));

/// A scraped chapter ready for narration.
#[derive(Debug, Clone)]
pub struct Chapter {
    pub title: String,
    pub paragraphs: Vec<String>,
    pub next_url: Option<String>,
    pub prev_url: Option<String>,
}

/// One entry of a novel's chapter index.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChapterLink {
    pub title: String,
    pub url: String,
}

pub struct ChapterSource {
    client: reqwest::Client,
}

impl Default for ChapterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChapterSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn fetch_html(&self, url: &str) -> Result<String, SpeechError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SpeechError::SourceUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SpeechError::SourceUnavailable(format!(
                "failed to fetch page: {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| SpeechError::SourceUnavailable(e.to_string()))
    }

    /// Fetch and parse one chapter page.
    pub async fn fetch_chapter(&self, url: &str) -> Result<Chapter, SpeechError> {
        let html = self.fetch_html(url).await?;
        let chapter = parse_chapter(&html, url)?;
        info!(
            "Scraped chapter \"{}\" ({} paragraphs)",
            chapter.title,
            chapter.paragraphs.len()
        );
        Ok(chapter)
    }

    /// Fetch a novel page and list its chapters, ordered by chapter number
    /// where one can be parsed from the link text.
    pub async fn fetch_index(&self, novel_url: &str) -> Result<Vec<ChapterLink>, SpeechError> {
        let html = self.fetch_html(novel_url).await?;
        Ok(parse_index(&html, novel_url))
    }
}

fn resolve(base: &str, href: &str) -> Option<String> {
    Url::parse(base)
        .ok()?
        .join(href)
        .ok()
        .map(|u| u.to_string())
}

fn parse_chapter(html: &str, url: &str) -> Result<Chapter, SpeechError> {
    let document = Html::parse_document(html);

    let h1 = Selector::parse("h1").expect("selector");
    let title_tag = Selector::parse("title").expect("selector");
    let title = document
        .select(&h1)
        .next()
        .map(|el| collapse_text(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .or_else(|| {
            document.select(&title_tag).next().map(|el| {
                let full = collapse_text(&el.text().collect::<String>());
                full.split(" - Novel Cool")
                    .next()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&full)
                    .to_string()
            })
        })
        .unwrap_or_else(|| "Unknown Chapter".to_string());

    // The chapter body lives under div.site-content > div.overflow-hidden in
    // the markup served to scripted clients; otherwise take the div with the
    // most paragraph children.
    let content = Selector::parse("div.site-content div.overflow-hidden").expect("selector");
    let any_div = Selector::parse("div").expect("selector");
    let p = Selector::parse("p").expect("selector");

    let container = document.select(&content).next().or_else(|| {
        document
            .select(&any_div)
            .max_by_key(|div| div.select(&p).count())
            .filter(|div| div.select(&p).count() > 0)
    });
    let Some(container) = container else {
        return Err(SpeechError::SourceUnavailable(
            "could not find chapter content container".to_string(),
        ));
    };

    let mut paragraphs = Vec::new();
    for para in container.select(&p) {
        let classes = para.value().attr("class").unwrap_or_default();
        let text = collapse_text(&para.text().collect::<String>());
        if text.is_empty() {
            continue;
        }
        if classes.contains("chapter-end-mark") || text.to_lowercase().trim() == "chapter end" {
            break;
        }
        paragraphs.push(text);
    }
    if paragraphs.is_empty() {
        paragraphs = container
            .text()
            .collect::<String>()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
    }

    let anchors = Selector::parse("a[href]").expect("selector");
    let mut next_url = None;
    let mut prev_url = None;
    for a in document.select(&anchors) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if !href.contains("/chapter/") {
            continue;
        }
        let text = collapse_text(&a.text().collect::<String>());
        if next_url.is_none() && text.contains("Next") {
            next_url = resolve(url, href);
        }
        if prev_url.is_none() && text.contains("Prev") {
            prev_url = resolve(url, href);
        }
        if next_url.is_some() && prev_url.is_some() {
            break;
        }
    }

    Ok(Chapter {
        title,
        paragraphs,
        next_url,
        prev_url,
    })
}

fn parse_index(html: &str, novel_url: &str) -> Vec<ChapterLink> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").expect("selector");

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();
    for a in document.select(&anchors) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if !href.contains("/chapter/") {
            continue;
        }
        let Some(abs_url) = resolve(novel_url, href) else {
            continue;
        };
        if !seen.insert(abs_url.clone()) {
            continue;
        }
        let title = collapse_text(&a.text().collect::<String>());
        if title.is_empty() {
            // Icon-only chapter links carry no usable title.
            continue;
        }
        links.push(ChapterLink { title, url: abs_url });
    }

    // Stable sort: numbered chapters in order, unnumbered ones at the end in
    // document order.
    links.sort_by_key(|link| chapter_number(&link.title).unwrap_or(u64::MAX));
    links
}

fn chapter_number(title: &str) -> Option<u64> {
    CHAPTER_NUMBER
        .captures(title)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn collapse_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAPTER_HTML: &str = r#"
        <html><head><title>Shadow Slave Chapter 15 - Novel Cool - Best site</title></head>
        <body>
          <h1>Chapter 15 - Into the Dark</h1>
          <div class="site-content">
            <div class="overflow-hidden">
              <p>First paragraph.</p>
              <p>  Second   paragraph with   spaces. </p>
              <p></p>
              <p class="chapter-end-mark">Chapter End</p>
              <p>Site junk after the end mark.</p>
            </div>
          </div>
          <a href="/chapter/shadow-slave-16/123">Next Chapter</a>
          <a href="/chapter/shadow-slave-14/121">Prev Chapter</a>
          <a href="/about">Next unrelated</a>
        </body></html>"#;

    #[test]
    fn test_parse_chapter_title_and_paragraphs() {
        let chapter = parse_chapter(CHAPTER_HTML, "https://example.com/chapter/shadow-slave-15/122").unwrap();
        assert_eq!(chapter.title, "Chapter 15 - Into the Dark");
        assert_eq!(
            chapter.paragraphs,
            vec!["First paragraph.", "Second paragraph with spaces."]
        );
    }

    #[test]
    fn test_parse_chapter_neighbor_links_absolute() {
        let chapter = parse_chapter(CHAPTER_HTML, "https://example.com/chapter/shadow-slave-15/122").unwrap();
        assert_eq!(
            chapter.next_url.as_deref(),
            Some("https://example.com/chapter/shadow-slave-16/123")
        );
        assert_eq!(
            chapter.prev_url.as_deref(),
            Some("https://example.com/chapter/shadow-slave-14/121")
        );
    }

    #[test]
    fn test_title_falls_back_to_title_tag() {
        let html = r#"<html><head><title>Shadow Slave Chapter 15 - Novel Cool - x</title></head>
            <body><div><p>Text.</p></div></body></html>"#;
        let chapter = parse_chapter(html, "https://example.com/c").unwrap();
        assert_eq!(chapter.title, "Shadow Slave Chapter 15");
    }

    #[test]
    fn test_content_falls_back_to_densest_div() {
        let html = r#"<html><body>
            <div><p>only one</p></div>
            <div id="body"><p>one</p><p>two</p><p>three</p></div>
        </body></html>"#;
        let chapter = parse_chapter(html, "https://example.com/c").unwrap();
        assert_eq!(chapter.paragraphs, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_pageless_html_is_source_error() {
        let err = parse_chapter("<html><body><span>nothing</span></body></html>", "https://e.com").unwrap_err();
        assert!(matches!(err, SpeechError::SourceUnavailable(_)));
    }

    #[test]
    fn test_index_sorted_by_chapter_number() {
        let html = r#"<html><body>
            <a href="/chapter/c3">Chapter 3</a>
            <a href="/chapter/c1">Chapter 1</a>
            <a href="/chapter/c10">Chapter 10</a>
            <a href="/chapter/c1">Chapter 1</a>
            <a href="/chapter/icon"></a>
            <a href="/other">Chapter 99</a>
        </body></html>"#;
        let links = parse_index(html, "https://example.com/novel");
        let titles: Vec<_> = links.iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, vec!["Chapter 1", "Chapter 3", "Chapter 10"]);
        assert_eq!(links[0].url, "https://example.com/chapter/c1");
    }
}
