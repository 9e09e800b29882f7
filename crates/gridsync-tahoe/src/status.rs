//! Grid status parsing
//!
//! Newer nodes answer `GET /?t=json` with a server list; older ones ignore
//! the parameter and return the HTML welcome page. [`parse_grid_status`]
//! tries the structured form first and falls back to scraping the page only
//! when the body is not valid JSON.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static CONNECTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Connected to <span>(.+?)</span>").expect("valid regex"));
static KNOWN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"of <span>(.+?)</span> known storage servers").expect("valid regex"));
static SPACE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""service-available-space">(.+?)</td>"#).expect("valid regex")
});
static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]*\.?[0-9]+)\s*([kKMGTPE]?)(i?)[bB]?$").expect("valid regex")
});

/// Connected/known server counts and the summed free space of connected servers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridStatus {
    pub servers_connected: u32,
    pub servers_known: u32,
    pub available_space: u64,
}

impl From<(u32, u32, u64)> for GridStatus {
    fn from((servers_connected, servers_known, available_space): (u32, u32, u64)) -> Self {
        Self {
            servers_connected,
            servers_known,
            available_space,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    servers: Option<Vec<ServerEntry>>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    #[serde(default)]
    connection_status: String,
    #[serde(default)]
    available_space: Option<serde_json::Value>,
}

/// Which tier produced a [`GridStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    Structured,
    WelcomePage,
}

/// Parse a status body, structured first, welcome page on JSON failure
pub fn parse_grid_status(body: &str) -> (GridStatus, StatusSource) {
    match parse_structured(body) {
        Ok(status) => (status, StatusSource::Structured),
        Err(_) => (parse_welcome_page(body), StatusSource::WelcomePage),
    }
}

/// Structured `?t=json` status
pub fn parse_structured(body: &str) -> Result<GridStatus, serde_json::Error> {
    let document: StatusDocument = serde_json::from_str(body)?;
    let mut status = GridStatus::default();
    if let Some(servers) = document.servers {
        status.servers_known = servers.len() as u32;
        for server in servers
            .iter()
            .filter(|s| s.connection_status.starts_with("Connected"))
        {
            status.servers_connected += 1;
            status.available_space += server
                .available_space
                .as_ref()
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
        }
    }
    Ok(status)
}

/// Scrape the legacy HTML welcome page
pub fn parse_welcome_page(html: &str) -> GridStatus {
    let capture_int = |re: &Regex| {
        re.captures(html)
            .and_then(|c| c[1].trim().parse::<u32>().ok())
            .unwrap_or(0)
    };
    let available_space = SPACE_RE
        .captures_iter(html)
        .filter_map(|c| dehumanized_size(&c[1]))
        .sum::<u64>();
    GridStatus {
        servers_connected: capture_int(&CONNECTED_RE),
        servers_known: capture_int(&KNOWN_RE),
        available_space,
    }
}

/// Parse a human-readable size such as `1kB`, `2.5 GiB`, `512`.
///
/// Units are binary multiples. `None` for anything unparseable, e.g. `N/A`.
pub fn dehumanized_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text.trim())?;
    let value: f64 = caps[1].parse().ok()?;
    let exponent = match caps[2].to_ascii_uppercase().as_str() {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => return None,
    };
    Some((value * 1024f64.powi(exponent)) as u64)
}
