//! HTML parsers for scraped proxy lists.
//!
//! Parsing is defensive throughout: malformed rows are skipped, never
//! surfaced. Callers get whatever subset of the table survived.

use scraper::{Html, Selector};
use tracing::debug;

use crate::proxy::{is_valid_host, AnonymityLevel, Proxy, ProxyMetadata, ProxyProtocol};

/// Upper bound on rows taken from a single page.
const MAX_ROWS: usize = 300;

/// Parse the shared free-proxy-list.net table layout, also used by
/// sslproxies.org and us-proxy.org. Columns: ip, port, country code,
/// country, anonymity, google, https, last checked.
pub fn parse_proxy_table(body: &str) -> Vec<Proxy> {
    let document = Html::parse_document(body);
    let row_selector = Selector::parse("table.table tbody tr").expect("static selector");
    let cell_selector = Selector::parse("td").expect("static selector");

    let mut proxies = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<_> = row.select(&cell_selector).collect();
        if cells.len() < 7 {
            continue;
        }

        let host = cell_text(&cells[0]);
        let port = match cell_text(&cells[1]).parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => continue,
        };
        if !is_valid_host(&host) {
            continue;
        }

        let https = cell_text(&cells[6]).eq_ignore_ascii_case("yes");
        let protocol = if https { ProxyProtocol::Https } else { ProxyProtocol::Http };

        let country = non_empty(cell_text(&cells[3]));
        let anonymity = AnonymityLevel::parse(&cell_text(&cells[4]));

        proxies.push(Proxy::new(host, port, protocol).with_metadata(ProxyMetadata {
            country,
            region: None,
            isp: None,
            anonymity,
        }));

        if proxies.len() >= MAX_ROWS {
            break;
        }
    }

    debug!(count = proxies.len(), "parsed proxy table");
    proxies
}

/// Parse the proxynova.com server list. The IP lives in an
/// `abbr[data-proxy]` attribute with the cell text as fallback.
pub fn parse_proxynova(body: &str) -> Vec<Proxy> {
    let document = Html::parse_document(body);
    let row_selector = Selector::parse("table#tbl_proxy_list tbody tr").expect("static selector");
    let cell_selector = Selector::parse("td").expect("static selector");
    let ip_selector = Selector::parse("abbr[data-proxy]").expect("static selector");

    let mut proxies = Vec::new();
    for row in document.select(&row_selector) {
        let cells: Vec<_> = row.select(&cell_selector).collect();
        if cells.len() < 7 {
            continue;
        }

        let host = match cells[0].select(&ip_selector).next() {
            Some(abbr) => abbr.value().attr("data-proxy").unwrap_or("").to_string(),
            None => cell_text(&cells[0]),
        };
        let port = match cell_text(&cells[1]).parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => continue,
        };
        if !is_valid_host(&host) {
            continue;
        }

        let country = non_empty(cell_text(&cells[5]));
        let anonymity = AnonymityLevel::parse(&cell_text(&cells[6]));

        proxies.push(Proxy::new(host, port, ProxyProtocol::Http).with_metadata(ProxyMetadata {
            country,
            region: None,
            isp: None,
            anonymity,
        }));

        if proxies.len() >= MAX_ROWS {
            break;
        }
    }

    debug!(count = proxies.len(), "parsed proxynova table");
    proxies
}

fn cell_text(cell: &scraper::ElementRef<'_>) -> String {
    cell.text().collect::<String>().trim().to_string()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"
        <table class="table">
          <tbody>
            <tr>
              <td>1.2.3.4</td><td>8080</td><td>US</td><td>United States</td>
              <td>elite proxy</td><td>no</td><td>yes</td><td>1 min ago</td>
            </tr>
            <tr>
              <td>not-an-ip!!</td><td>8080</td><td>DE</td><td>Germany</td>
              <td>anonymous</td><td>no</td><td>no</td><td>1 min ago</td>
            </tr>
            <tr>
              <td>5.6.7.8</td><td>bad</td><td>FR</td><td>France</td>
              <td>transparent</td><td>no</td><td>no</td><td>1 min ago</td>
            </tr>
            <tr>
              <td>9.9.9.9</td><td>3128</td><td>GB</td><td>United Kingdom</td>
              <td>anonymous</td><td>no</td><td>no</td><td>2 min ago</td>
            </tr>
          </tbody>
        </table>"#;

    #[test]
    fn test_parse_proxy_table_skips_bad_rows() {
        let proxies = parse_proxy_table(TABLE);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].host, "1.2.3.4");
        assert_eq!(proxies[0].protocol, ProxyProtocol::Https);
        assert_eq!(proxies[0].metadata.anonymity, Some(AnonymityLevel::Elite));
        assert_eq!(proxies[1].host, "9.9.9.9");
        assert_eq!(proxies[1].protocol, ProxyProtocol::Http);
    }

    #[test]
    fn test_parse_proxynova_abbr_ip() {
        let body = r#"
            <table id="tbl_proxy_list">
              <tbody>
                <tr>
                  <td><abbr data-proxy="10.0.0.1">decoy</abbr></td><td>3128</td>
                  <td>1 min</td><td>200</td><td>99%</td><td>Brazil</td><td>elite</td>
                </tr>
              </tbody>
            </table>"#;
        let proxies = parse_proxynova(body);
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0].host, "10.0.0.1");
        assert_eq!(proxies[0].port, 3128);
        assert_eq!(proxies[0].metadata.country.as_deref(), Some("Brazil"));
    }

    #[test]
    fn test_parse_empty_document() {
        assert!(parse_proxy_table("<html></html>").is_empty());
        assert!(parse_proxynova("<html></html>").is_empty());
    }
}
