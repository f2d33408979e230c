//! robots.txt fetching, parsing and matching.
//!
//! The grammar and matching rules here are deliberately the simpler
//! "first entry whose agent substring-matches wins" semantics rather
//! than RFC 9309's longest-match precedence; see DESIGN.md for why
//! that source behavior is preserved rather than "fixed".

use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

const ROBOTS_ACCEPT_ENCODING: &str = "x-gzip,gzip,deflate";

const PATH_QUOTE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

fn quote_path(raw: &str) -> String {
    utf8_percent_encode(raw, PATH_QUOTE_SET).to_string()
}

fn unquote(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// A single `Allow:`/`Disallow:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLine {
    pub path: String,
    pub allow: bool,
}

impl RuleLine {
    fn new(raw_path: &str, allow: bool) -> Self {
        let (path, allow) = if raw_path.is_empty() && !allow {
            ("/".to_string(), true)
        } else {
            (quote_path(raw_path), allow)
        };
        RuleLine { path, allow }
    }

    fn applies_to(&self, path: &str) -> bool {
        self.path == "*" || path.starts_with(self.path.as_str())
    }
}

impl fmt::Display for RuleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.allow { "Allow" } else { "Disallow" };
        write!(f, "{kind}: {}", self.path)
    }
}

/// One or more user-agents and the rule lines that apply to them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    pub user_agents: Vec<String>,
    pub rules: Vec<RuleLine>,
    pub crawl_delay: u64,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.user_agents.is_empty() && self.rules.is_empty()
    }

    fn is_default(&self) -> bool {
        self.user_agents.iter().any(|a| a == "*")
    }

    fn applies_to(&self, agent: &str) -> bool {
        let agent = agent.to_lowercase();
        self.user_agents
            .iter()
            .any(|a| a == "*" || agent.contains(&a.to_lowercase()))
    }

    fn allowance(&self, path: &str) -> bool {
        for rule in &self.rules {
            if rule.applies_to(path) {
                return rule.allow;
            }
        }
        true
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines: Vec<String> = self
            .user_agents
            .iter()
            .map(|a| format!("User-agent: {a}"))
            .collect();
        if self.crawl_delay > 0 {
            lines.push(format!("Crawl-delay: {}", self.crawl_delay));
        }
        lines.extend(self.rules.iter().map(|r| r.to_string()));
        write!(f, "{}", lines.join("\n"))
    }
}

/// The outcome of fetching a robots.txt document, classified per the
/// event table: a successful `text/plain` 200 is parsed; everything
/// else resolves straight to `allow_all` or `disallow_all`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RobotsRecord {
    pub allow_all: bool,
    pub disallow_all: bool,
    pub entries: Vec<Entry>,
    pub default_entry: Option<Entry>,
}

impl RobotsRecord {
    pub fn allow_all() -> Self {
        RobotsRecord {
            allow_all: true,
            ..Default::default()
        }
    }

    pub fn disallow_all() -> Self {
        RobotsRecord {
            disallow_all: true,
            ..Default::default()
        }
    }

    fn add_entry(&mut self, entry: Entry) {
        if entry.is_empty() {
            return;
        }
        if entry.is_default() {
            self.default_entry = Some(entry);
        } else {
            self.entries.push(entry);
        }
    }

    /// Parse a robots.txt body line by line into entries and rules.
    pub fn parse(body: &str) -> Self {
        let mut record = RobotsRecord::default();
        // states: 0 = start, 1 = saw user-agent, 2 = saw a rule line
        let mut state = 0u8;
        let mut entry = Entry::default();

        for raw_line in body.lines() {
            let mut line = raw_line;
            if line.trim().is_empty() {
                match state {
                    1 => {
                        entry = Entry::default();
                        state = 0;
                    }
                    2 => {
                        record.add_entry(entry);
                        entry = Entry::default();
                        state = 0;
                    }
                    _ => {}
                }
            }
            if let Some(idx) = line.find('#') {
                line = &line[..idx];
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key_raw, value_raw)) = line.split_once(':') else {
                continue;
            };
            let key = key_raw.trim().to_lowercase();
            let value = unquote(value_raw.trim());

            match key.as_str() {
                "user-agent" => {
                    if state == 2 {
                        record.add_entry(entry);
                        entry = Entry::default();
                    }
                    entry.user_agents.push(value);
                    state = 1;
                }
                "disallow" if state != 0 => {
                    entry.rules.push(RuleLine::new(&value, false));
                    state = 2;
                }
                "allow" if state != 0 => {
                    entry.rules.push(RuleLine::new(&value, true));
                    state = 2;
                }
                "crawl-delay" if state != 0 => {
                    if let Ok(v) = value.parse::<i64>() {
                        entry.crawl_delay = v.max(0) as u64;
                        state = 2;
                    }
                }
                _ => {
                    // unrecognized key, or a rule line before any
                    // user-agent: logged and discarded per spec.
                }
            }
        }
        if state == 1 || state == 2 {
            record.add_entry(entry);
        }
        record
    }

    /// Decide whether `agent` may fetch `url` per §4.B matching rules.
    pub fn can_fetch(&self, agent: &str, url: &str) -> bool {
        if self.disallow_all {
            return false;
        }
        if self.allow_all {
            return true;
        }
        let path = Self::normalize_path(url);
        for entry in &self.entries {
            if entry.applies_to(agent) {
                return entry.allowance(&path);
            }
        }
        if let Some(default) = &self.default_entry {
            return default.allowance(&path);
        }
        true
    }

    /// First applying entry's crawl delay, else 0.
    pub fn get_crawldelay(&self, agent: &str) -> u64 {
        for entry in &self.entries {
            if entry.applies_to(agent) {
                return entry.crawl_delay;
            }
        }
        self.default_entry
            .as_ref()
            .map(|e| e.crawl_delay)
            .unwrap_or(0)
    }

    fn normalize_path(url: &str) -> String {
        let path = reqwest::Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_default();
        let decoded = unquote(&path);
        let quoted = quote_path(&decoded);
        if quoted.is_empty() {
            "/".to_string()
        } else {
            quoted
        }
    }
}

impl fmt::Display for RobotsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut blocks: Vec<String> = self.entries.iter().map(|e| e.to_string()).collect();
        if let Some(default) = &self.default_entry {
            blocks.push(default.to_string());
        }
        write!(f, "{}", blocks.join("\n\n"))
    }
}

/// Fetch and classify a robots.txt document. Network/HTTP errors other
/// than 401/403 resolve to `allow_all`, per the event table — robots.txt
/// absence must never make the crawler more strict than necessary.
pub async fn fetch(
    client: &reqwest::Client,
    robots_url: &str,
    user_agent: &str,
    credentials: Option<(&str, &str)>,
) -> RobotsRecord {
    let mut request = client
        .get(robots_url)
        .header(reqwest::header::USER_AGENT, user_agent)
        .header(reqwest::header::ACCEPT_ENCODING, ROBOTS_ACCEPT_ENCODING);
    if let Some((user, password)) = credentials {
        request = request.basic_auth(user, Some(password));
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(_) => return RobotsRecord::allow_all(),
    };

    match response.status().as_u16() {
        401 | 403 => RobotsRecord::disallow_all(),
        200 => {
            let is_text_plain = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_lowercase().starts_with("text/plain"))
                .unwrap_or(false);
            if !is_text_plain {
                return RobotsRecord::allow_all();
            }
            match response.text().await {
                Ok(body) => RobotsRecord::parse(&body),
                Err(_) => RobotsRecord::allow_all(),
            }
        }
        status if status >= 400 => RobotsRecord::allow_all(),
        _ => RobotsRecord::allow_all(),
    }
}
