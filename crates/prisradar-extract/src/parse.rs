//! Pure text-to-listing heuristics. No I/O happens here.

use std::collections::HashSet;
use std::sync::LazyLock;

use prisradar_core::{Condition, ScrapedListing};
use regex::Regex;

pub const MIN_PRICE: f64 = 100.0;
pub const MAX_PRICE: f64 = 1_000_000.0;

const TITLE_MIN_CHARS: usize = 10;
const TITLE_MAX_CHARS: usize = 200;

static PRICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<before>\d{1,3}(?:[ .\u{a0}]\d{3})+|\d+)(?:,-|,\d{2})?\s*(?:kr|nok)\b|\b(?:kr|nok)\.?\s*(?P<after>\d{1,3}(?:[ .\u{a0}]\d{3})+|\d+)",
    )
    .expect("price pattern compiles")
});

static CURRENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:kr|nok)\b").expect("currency pattern compiles"));

static MD_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("image pattern compiles"));

static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("link pattern compiles"));

static MD_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:#{1,6}\s*|>\s*|[-*+]\s+|\d+\.\s+)+").expect("prefix pattern compiles")
});

/// Where the parsed text came from.
#[derive(Debug, Clone)]
pub struct ListingSource<'a> {
    pub merchant_name: &'a str,
    pub condition: Condition,
    pub page_url: &'a str,
}

/// First acceptable price on the line, if any.
pub fn find_price(line: &str) -> Option<f64> {
    PRICE.captures_iter(line).find_map(|caps| {
        let digits: String = caps
            .name("before")
            .or_else(|| caps.name("after"))?
            .as_str()
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        let price = digits.parse::<f64>().ok()?;
        (price > MIN_PRICE && price < MAX_PRICE).then_some(price)
    })
}

/// Removes markdown decoration so titles compare as plain text.
pub fn strip_markdown(line: &str) -> String {
    let line = MD_IMAGE.replace_all(line.trim(), "");
    let line = MD_LINK.replace_all(&line, "$1");
    let line = MD_PREFIX.replace(line.trim(), "");
    line.replace("**", "").replace("__", "").trim().to_string()
}

fn is_title_candidate(line: &str) -> bool {
    let len = line.chars().count();
    len > TITLE_MIN_CHARS
        && len < TITLE_MAX_CHARS
        && !CURRENCY.is_match(line)
        && find_price(line).is_none()
}

/// Neighbour lines of `i` in search order: up to three above, closest first,
/// then up to two below.
fn title_window(i: usize, len: usize) -> impl Iterator<Item = usize> {
    let above = (i.saturating_sub(3)..i).rev();
    let below = (i + 1)..(i + 3).min(len);
    above.chain(below)
}

/// Scans `text` line by line for prices and pairs each with a nearby title.
///
/// Every listing gets `source.page_url`; see [`attach_listing_links`] for
/// marketplace pages that expose per-listing links.
pub fn parse_listings(text: &str, source: &ListingSource<'_>) -> Vec<ScrapedListing> {
    let lines: Vec<String> = text.lines().map(strip_markdown).collect();
    let mut listings = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(price) = find_price(line) else {
            continue;
        };
        let Some(title) = title_window(i, lines.len())
            .map(|j| &lines[j])
            .find(|candidate| is_title_candidate(candidate))
        else {
            continue;
        };
        listings.push(ScrapedListing {
            merchant_name: source.merchant_name.to_string(),
            price,
            condition: source.condition,
            url: source.page_url.to_string(),
            title: title.clone(),
        });
    }
    listings
}

pub fn is_listing_link(url: &str) -> bool {
    url.contains("/item/") || url.contains("finnkode=")
}

/// Zips per-listing links onto listings in document order. Listings beyond the
/// available links keep the page URL.
pub fn attach_listing_links(listings: &mut [ScrapedListing], links: &[String]) {
    let mut seen = HashSet::new();
    let unique = links
        .iter()
        .filter(|link| is_listing_link(link))
        .filter(|link| seen.insert(link.as_str()));
    for (listing, link) in listings.iter_mut().zip(unique) {
        listing.url = link.clone();
    }
}
