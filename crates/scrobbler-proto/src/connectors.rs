//! Connector registry: resolves a page URL to the site adapter that handles it.
//!
//! Connectors are matched with WebExtension-style patterns
//! (`<scheme>://<host>/<path>`, `*` wildcards, `<all_urls>`), compiled to
//! anchored regexes once at load time.

use anyhow::Context;
use regex::Regex;
use std::path::Path;
use tracing::info;

use crate::protocol::ConnectorInfo;

struct Entry {
    connector: ConnectorInfo,
    patterns: Vec<Regex>,
}

pub struct ConnectorRegistry {
    entries: Vec<Entry>,
}

impl ConnectorRegistry {
    pub fn new(connectors: Vec<ConnectorInfo>) -> anyhow::Result<Self> {
        let mut entries = Vec::with_capacity(connectors.len());
        for connector in connectors {
            let patterns = connector
                .matches
                .iter()
                .map(|p| compile_pattern(p))
                .collect::<anyhow::Result<Vec<_>>>()
                .with_context(|| format!("connector '{}'", connector.id))?;
            entries.push(Entry {
                connector,
                patterns,
            });
        }
        Ok(Self { entries })
    }

    /// First connector (in registry order) with a pattern matching `url`.
    pub fn find_for_url(&self, url: &str) -> Option<&ConnectorInfo> {
        let url = url.split('#').next().unwrap_or(url);
        self.entries
            .iter()
            .find(|e| e.patterns.iter().any(|re| re.is_match(url)))
            .map(|e| &e.connector)
    }

    pub fn get(&self, id: &str) -> Option<&ConnectorInfo> {
        self.entries
            .iter()
            .map(|e| &e.connector)
            .find(|c| c.id == id)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &ConnectorInfo> {
        self.entries.iter().map(|e| &e.connector)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compile a single match pattern into an anchored regex.
pub fn compile_pattern(pattern: &str) -> anyhow::Result<Regex> {
    if pattern == "<all_urls>" {
        return Ok(Regex::new(r"^(?:https?|file|ftp)://.*$")?);
    }

    let (scheme, rest) = pattern
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("pattern '{}' has no scheme", pattern))?;
    let (host, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => anyhow::bail!("pattern '{}' has no path", pattern),
    };

    let scheme_re = match scheme {
        "*" => "https?".to_string(),
        s => regex::escape(s),
    };

    let host_re = if host == "*" {
        "[^/]*".to_string()
    } else if let Some(domain) = host.strip_prefix("*.") {
        format!(r"(?:[^/]*\.)?{}", regex::escape(domain))
    } else if host.contains('*') {
        anyhow::bail!("pattern '{}' has a misplaced host wildcard", pattern);
    } else {
        regex::escape(host)
    };

    let path_re = path
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");

    let full = format!(r"^{}://{}(?::\d+)?{}$", scheme_re, host_re, path_re);
    Ok(Regex::new(&full)?)
}

// ── TOML connector loader ─────────────────────────────────────────────────────

/// Matches the TOML `[[connector]]` table.
#[derive(Debug, serde::Deserialize)]
struct TomlConnectorFile {
    #[serde(default)]
    connector: Vec<TomlConnector>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlConnector {
    id: String,
    label: String,
    #[serde(default)]
    matches: Vec<String>,
    #[serde(default)]
    js: Option<String>,
}

pub fn parse_connectors_from_toml_str(content: &str) -> anyhow::Result<Vec<ConnectorInfo>> {
    let file: TomlConnectorFile = toml::from_str(content)?;
    let connectors = file
        .connector
        .into_iter()
        .map(|c| ConnectorInfo {
            id: c.id,
            label: c.label,
            matches: c.matches,
            js: c.js,
        })
        .collect();
    Ok(connectors)
}

pub fn load_connectors_from_toml(path: &Path) -> anyhow::Result<Vec<ConnectorInfo>> {
    let content = std::fs::read_to_string(path)?;
    parse_connectors_from_toml_str(&content)
}

/// Load the registry from `path`, or the built-in list when it doesn't exist.
pub fn load_registry(path: &Path) -> anyhow::Result<ConnectorRegistry> {
    let connectors = if path.exists() {
        let connectors = load_connectors_from_toml(path)
            .with_context(|| format!("reading {:?}", path))?;
        info!("Loaded {} connectors from {:?}", connectors.len(), path);
        connectors
    } else {
        let connectors = builtin_connectors();
        info!("Using {} built-in connectors", connectors.len());
        connectors
    };
    ConnectorRegistry::new(connectors)
}

pub fn builtin_connectors() -> Vec<ConnectorInfo> {
    let connector = |id: &str, label: &str, matches: &[&str]| ConnectorInfo {
        id: id.to_string(),
        label: label.to_string(),
        matches: matches.iter().map(|m| m.to_string()).collect(),
        js: Some(format!("connectors/{}.js", id)),
    };

    vec![
        connector(
            "youtube",
            "YouTube",
            &["*://www.youtube.com/*", "*://m.youtube.com/*"],
        ),
        connector("youtube-music", "YouTube Music", &["*://music.youtube.com/*"]),
        connector("soundcloud", "SoundCloud", &["*://soundcloud.com/*"]),
        connector("bandcamp", "Bandcamp", &["*://*.bandcamp.com/*"]),
        connector("spotify", "Spotify", &["*://open.spotify.com/*"]),
        connector("deezer", "Deezer", &["*://www.deezer.com/*"]),
        connector("nts-live", "NTS Live", &["*://www.nts.live/*"]),
    ]
}
