use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::is_archive_href;

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

/// Serialized `<table>` subtrees that contain at least one archive link.
///
/// A matching table swallows any tables nested inside it, so no markup is
/// sent twice.
pub fn extract_candidate_tables(html: &str) -> Vec<String> {
    if html.trim().is_empty() {
        return Vec::new();
    }

    let document = Html::parse_document(html);
    let mut kept = HashSet::new();
    let mut tables = Vec::new();

    for table in document.select(&TABLE) {
        let nested = table.ancestors().any(|node| kept.contains(&node.id()));
        if nested || !has_archive_link(&table) {
            continue;
        }
        kept.insert(table.id());
        tables.push(table.html());
    }

    tables
}

fn has_archive_link(table: &ElementRef<'_>) -> bool {
    table
        .select(&ANCHOR)
        .filter_map(|a| a.value().attr("href"))
        .any(is_archive_href)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_tables_with_archive_links() {
        let html = r#"
            <html><body>
              <table id="nav"><tr><td><a href="/home">Home</a></td></tr></table>
              <table id="results">
                <tr><td>GO auction results 2024-2025</td>
                    <td><a href="https://x.eu/GO_2024-2025.ZIP">download</a></td></tr>
              </table>
              <p><a href="/loose.zip">outside any table</a></p>
            </body></html>"#;

        let tables = extract_candidate_tables(html);
        assert_eq!(tables.len(), 1);
        assert!(tables[0].starts_with("<table id=\"results\">"));
        assert!(tables[0].contains("GO_2024-2025.ZIP"));
    }

    #[test]
    fn nested_tables_are_not_duplicated() {
        let html = r#"<table id="outer"><tr><td>
                <table id="inner"><tr><td><a href="a.zip">a</a></td></tr></table>
            </td></tr></table>"#;
        let tables = extract_candidate_tables(html);
        assert_eq!(tables.len(), 1);
        assert!(tables[0].contains("id=\"outer\""));
    }

    #[test]
    fn empty_or_linkless_input_yields_nothing() {
        assert!(extract_candidate_tables("").is_empty());
        assert!(extract_candidate_tables("<table><tr><td>zip code</td></tr></table>").is_empty());
    }
}
