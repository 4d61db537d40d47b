//! Small helpers over `scraper` shared by the extractors
//!
//! `scraper::Html` is not `Send`, so extractors parse inside synchronous
//! functions and only carry plain strings across awaits.

use scraper::{ElementRef, Selector};

/// Element text with runs of whitespace collapsed to single spaces
pub fn clean_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of the first element matching `css`, if it has any
pub fn select_first_text(scope: ElementRef<'_>, css: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    scope
        .select(&selector)
        .map(clean_text)
        .find(|text| !text.is_empty())
}

/// Texts of every element matching `css`, empty ones dropped
pub fn select_texts(scope: ElementRef<'_>, css: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(css) else {
        return Vec::new();
    };
    scope
        .select(&selector)
        .map(clean_text)
        .filter(|text| !text.is_empty())
        .collect()
}

/// Attribute `attr` of the first element matching `css` that carries it
pub fn select_attr(scope: ElementRef<'_>, css: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    scope
        .select(&selector)
        .find_map(|element| element.value().attr(attr))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Text of the first selector in `candidates` that matches anything
pub fn first_text_of(scope: ElementRef<'_>, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find_map(|css| select_first_text(scope, css))
}

/// Elements matching the first selector in `candidates` that matches anything
pub fn first_elements_of<'a>(scope: ElementRef<'a>, candidates: &[&str]) -> Vec<ElementRef<'a>> {
    for css in candidates {
        let Ok(selector) = Selector::parse(css) else {
            continue;
        };
        let found: Vec<_> = scope.select(&selector).collect();
        if !found.is_empty() {
            return found;
        }
    }
    Vec::new()
}
