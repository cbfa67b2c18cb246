//! Reduces raw markup to the line-oriented text the price parser expects.

use scraper::{Html, Selector};
use url::Url;

const SKIPPED_ELEMENTS: [&str; 5] = ["script", "style", "noscript", "template", "svg"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageText {
    pub text: String,
    pub links: Vec<String>,
}

/// One line per non-empty text node plus every `<a href>` resolved against
/// `base_url`.
pub fn reduce_html(html: &str, base_url: &str) -> PageText {
    let document = Html::parse_document(html);

    let mut lines = Vec::new();
    for node in document.root_element().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let skipped = node
            .parent()
            .and_then(|parent| parent.value().as_element())
            .is_some_and(|element| SKIPPED_ELEMENTS.contains(&element.name()));
        if skipped {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }

    PageText {
        text: lines.join("\n"),
        links: extract_links(&document, base_url),
    }
}

fn extract_links(document: &Html, base_url: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base = Url::parse(base_url).ok();
    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| {
            !href.is_empty()
                && !href.starts_with('#')
                && !href.starts_with("javascript:")
                && !href.starts_with("mailto:")
        })
        .filter_map(|href| match &base {
            Some(base) => base.join(href).ok().map(String::from),
            None => Url::parse(href).ok().map(String::from),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<!doctype html>
<html>
  <head><title>Mobiltelefoner</title><style>.price { color: red }</style></head>
  <body>
    <script>window.__STATE__ = { price: "9 990 kr" };</script>
    <article>
      <h2><a href="/item/301">iPhone 15 128GB   svart</a></h2>
      <span class="price">8 990,-   kr</span>
    </article>
    <article>
      <h2><a href="https://www.finn.no/bap/forsale/ad.html?finnkode=302">iPhone 15 256GB blå</a></h2>
      <span class="price">10 490 kr</span>
    </article>
    <a href="#top">Til toppen</a>
    <a href="mailto:kundeservice@example.no">Kontakt</a>
  </body>
</html>"##;

    #[test]
    fn text_nodes_become_lines_without_script_content() {
        let page = reduce_html(PAGE, "https://www.finn.no/bap/forsale/search.html?q=iphone");
        let lines: Vec<&str> = page.text.lines().collect();
        assert!(lines.contains(&"iPhone 15 128GB svart"));
        assert!(lines.contains(&"8 990,- kr"));
        assert!(lines.contains(&"10 490 kr"));
        assert!(!page.text.contains("__STATE__"));
        assert!(!page.text.contains("color: red"));
    }

    #[test]
    fn links_are_resolved_and_filtered() {
        let page = reduce_html(PAGE, "https://www.finn.no/bap/forsale/search.html?q=iphone");
        assert_eq!(
            page.links,
            vec![
                "https://www.finn.no/item/301".to_string(),
                "https://www.finn.no/bap/forsale/ad.html?finnkode=302".to_string(),
            ]
        );
    }

    #[test]
    fn empty_markup_reduces_to_nothing() {
        let page = reduce_html("", "https://www.elkjop.no/");
        assert!(page.text.is_empty());
        assert!(page.links.is_empty());
    }
}
