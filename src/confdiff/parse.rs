use std::collections::HashMap;

/// One logical entry of a configuration text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLine {
    /// Canonical key, after alias resolution.
    pub key: String,
    pub value: String,
    /// 1-based line the entry starts on.
    pub line: usize,
}

/// Case-insensitive key table with alias resolution.
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    aliases: HashMap<String, String>,
    multi_value: HashMap<String, String>,
}

impl KeyTable {
    pub fn new(aliases: &HashMap<String, String>, multi_value: &[String]) -> Self {
        Self {
            aliases: aliases
                .iter()
                .map(|(alias, key)| (alias.to_ascii_lowercase(), key.clone()))
                .collect(),
            multi_value: multi_value
                .iter()
                .map(|k| (k.to_ascii_lowercase(), k.clone()))
                .collect(),
        }
    }

    /// Key used for comparison: lowercase, with aliases resolved.
    pub fn lookup_key(&self, key: &str) -> String {
        let lower = key.to_ascii_lowercase();
        match self.aliases.get(&lower) {
            Some(canonical) => canonical.to_ascii_lowercase(),
            None => lower,
        }
    }

    /// Preferred spelling of a key for display.
    pub fn display_key(&self, key: &str) -> String {
        let lower = key.to_ascii_lowercase();
        self.aliases
            .get(&lower)
            .or_else(|| self.multi_value.get(&lower))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// Whether the key may repeat and takes comma separated values.
    pub fn is_multi_value(&self, key: &str) -> bool {
        self.multi_value.contains_key(&self.lookup_key(key))
    }
}

/// Parse configuration text into entries, in order.
///
/// `#` starts a comment, tabs count as spaces and a trailing backslash
/// continues the entry on the next line.
pub fn parse_config(text: &str, keys: &KeyTable) -> Vec<ConfigLine> {
    let mut entries = Vec::new();
    let mut pending: Option<(String, usize)> = None;

    for (idx, raw) in text.lines().enumerate() {
        let content = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let content = content.replace('\t', " ");
        let trimmed = content.trim();

        let (continues, body) = match trimmed.strip_suffix('\\') {
            Some(body) => (true, body.trim_end()),
            None => (false, trimmed),
        };

        let (mut text, line) = match pending.take() {
            Some((mut acc, line)) => {
                if !body.is_empty() {
                    if !acc.is_empty() {
                        acc.push(' ');
                    }
                    acc.push_str(body);
                }
                (acc, line)
            }
            None => (body.to_string(), idx + 1),
        };

        if continues {
            pending = Some((text, line));
            continue;
        }

        text = text.trim().to_string();
        if text.is_empty() {
            continue;
        }
        entries.push(split_entry(&text, line, keys));
    }

    if let Some((text, line)) = pending {
        let text = text.trim();
        if !text.is_empty() {
            entries.push(split_entry(text, line, keys));
        }
    }

    entries
}

fn split_entry(text: &str, line: usize, keys: &KeyTable) -> ConfigLine {
    let (key, value) = match text.split_once(' ') {
        Some((k, v)) => (k, v.trim()),
        None => (text, ""),
    };
    // Collapse runs of whitespace the way the daemon reads them back.
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");

    ConfigLine {
        key: keys.display_key(key),
        value,
        line,
    }
}
