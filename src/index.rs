use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

use crate::error::TransportError;
use crate::fetcher::DocumentSource;

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{2}/\d{2}/\d{4}\b").unwrap());
static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static LINK_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// One (document, effective date) pair found on the index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    pub url: String,
    pub effective_date: NaiveDate,
}

/// One document to push through the pipeline, with every date it was listed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub url: String,
    pub dates: Vec<NaiveDate>,
}

impl WorkItem {
    /// Newest listing date; the bucket the document is stored under.
    pub fn bucket(&self) -> NaiveDate {
        self.dates.iter().max().copied().unwrap_or(NaiveDate::MIN)
    }
}

/// Fetch the index page as text.
pub async fn fetch_index(source: &dyn DocumentSource, url: &str) -> Result<String, TransportError> {
    info!("Fetching policy index: {}", url);
    let bytes = source.get(url).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Map every valid row date to the document links listed in that row.
///
/// A row counts when it carries at least one MM/DD/YYYY token and a link whose
/// path ends in `.{extension}`. The link is filed under every date in the row.
pub fn discover_links(html: &str, base: &Url, extension: &str) -> BTreeMap<NaiveDate, Vec<String>> {
    let document = Html::parse_document(html);
    let mut by_date: BTreeMap<NaiveDate, Vec<String>> = BTreeMap::new();
    let mut rows = 0usize;

    for row in document.select(&ROW_SEL) {
        let text = row.text().collect::<Vec<_>>().join(" ");
        let tokens: Vec<&str> = DATE_RE.find_iter(&text).map(|m| m.as_str()).collect();
        if tokens.is_empty() {
            continue;
        }

        let Some(href) = row
            .select(&LINK_SEL)
            .filter_map(|a| a.value().attr("href"))
            .find(|href| has_extension(href, extension))
        else {
            continue;
        };

        let url = match base.join(href.trim()) {
            Ok(u) => u.to_string(),
            Err(e) => {
                debug!(href, error = %e, "Skipping unresolvable link");
                continue;
            }
        };

        rows += 1;
        for token in tokens {
            let Ok(date) = NaiveDate::parse_from_str(token, "%m/%d/%Y") else {
                debug!(token, "Skipping malformed date");
                continue;
            };
            let urls = by_date.entry(date).or_default();
            if !urls.contains(&url) {
                urls.push(url.clone());
            }
        }
    }

    info!(
        "Index: {} matching rows, {} dates, {} links",
        rows,
        by_date.len(),
        by_date.values().map(Vec::len).sum::<usize>()
    );
    by_date
}

/// Keep only dates inside the inclusive range.
pub fn filter_range(
    by_date: &mut BTreeMap<NaiveDate, Vec<String>>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) {
    by_date.retain(|date, _| from.map_or(true, |f| *date >= f) && to.map_or(true, |t| *date <= t));
}

pub fn flatten(by_date: &BTreeMap<NaiveDate, Vec<String>>) -> Vec<DiscoveredLink> {
    by_date
        .iter()
        .flat_map(|(date, urls)| {
            urls.iter().map(move |url| DiscoveredLink {
                url: url.clone(),
                effective_date: *date,
            })
        })
        .collect()
}

/// Group the pairs by URL so each document is extracted once.
pub fn plan_work(by_date: &BTreeMap<NaiveDate, Vec<String>>) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for link in flatten(by_date) {
        match position.get(&link.url) {
            Some(&i) => items[i].dates.push(link.effective_date),
            None => {
                position.insert(link.url.clone(), items.len());
                items.push(WorkItem {
                    url: link.url,
                    dates: vec![link.effective_date],
                });
            }
        }
    }
    items
}

fn has_extension(href: &str, extension: &str) -> bool {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    path.to_ascii_lowercase()
        .ends_with(&format!(".{}", extension.trim_start_matches('.').to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://static.example.com").unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    const INDEX: &str = r#"
        <table>
          <tr><th>Policy</th><th>Effective</th><th>Revised</th></tr>
          <tr>
            <td><a href="/assets/policies/mm_0001_abortion.pdf">Abortion</a></td>
            <td>01/15/2024</td><td>03/01/2024</td>
          </tr>
          <tr>
            <td><a href="https://static.example.com/assets/policies/mm_0002_acne.pdf">Acne</a></td>
            <td>13/45/2024</td><td>02/10/2024</td>
          </tr>
          <tr>
            <td><a href="/assets/policies/mm_0003_notes.html">Notes</a></td>
            <td>01/15/2024</td>
          </tr>
          <tr>
            <td><a href="/assets/policies/mm_0004_undated.pdf">Undated</a></td>
            <td>Pending</td>
          </tr>
          <tr>
            <td><a href="/assets/policies/mm_0001_abortion.pdf">Abortion (reissue)</a></td>
            <td>02/10/2024</td>
          </tr>
          <tr>
            <td><a href="/assets/policies/mm_0001_abortion.pdf">Abortion</a></td>
            <td>01/15/2024</td>
          </tr>
        </table>"#;

    #[test]
    fn links_filed_under_every_row_date() {
        let map = discover_links(INDEX, &base(), "pdf");
        let abortion = "https://static.example.com/assets/policies/mm_0001_abortion.pdf";

        assert_eq!(map[&date(2024, 1, 15)], vec![abortion.to_string()]);
        assert!(map[&date(2024, 3, 1)].contains(&abortion.to_string()));
        assert!(map[&date(2024, 2, 10)].contains(&abortion.to_string()));
    }

    #[test]
    fn malformed_dates_never_become_keys() {
        let map = discover_links(INDEX, &base(), "pdf");
        assert_eq!(map.len(), 3);
        let acne = "https://static.example.com/assets/policies/mm_0002_acne.pdf".to_string();
        assert_eq!(map[&date(2024, 2, 10)].iter().filter(|u| **u == acne).count(), 1);
    }

    #[test]
    fn rows_without_date_or_document_link_ignored() {
        let map = discover_links(INDEX, &base(), "pdf");
        let all: Vec<&String> = map.values().flatten().collect();
        assert!(all.iter().all(|u| !u.contains("notes.html")));
        assert!(all.iter().all(|u| !u.contains("undated")));
    }

    #[test]
    fn date_glued_to_text_still_found() {
        let html = r#"<table><tr><td>Revised</td><td>06/30/2023</td><td><a href="x.PDF?v=2">x</a></td></tr></table>"#;
        let map = discover_links(html, &base(), "pdf");
        assert_eq!(map[&date(2023, 6, 30)], vec!["https://static.example.com/x.PDF?v=2".to_string()]);
    }

    #[test]
    fn range_filter_is_inclusive() {
        let mut map = discover_links(INDEX, &base(), "pdf");
        filter_range(&mut map, Some(date(2024, 2, 10)), Some(date(2024, 3, 1)));
        let keys: Vec<_> = map.keys().copied().collect();
        assert_eq!(keys, vec![date(2024, 2, 10), date(2024, 3, 1)]);
    }

    #[test]
    fn work_is_one_item_per_url() {
        let map = discover_links(INDEX, &base(), "pdf");
        let work = plan_work(&map);
        assert_eq!(work.len(), 2);
        let abortion = work.iter().find(|w| w.url.ends_with("mm_0001_abortion.pdf")).unwrap();
        assert_eq!(abortion.dates.len(), 3);
        assert_eq!(abortion.bucket(), date(2024, 3, 1));
        assert_eq!(flatten(&map).len(), 4);
    }
}
