//! Compares the daemon's declared configuration file against the
//! configuration it is actually running with.

pub mod parse;
pub mod units;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

pub use parse::{parse_config, ConfigLine, KeyTable};

use crate::config::ConfDiffConfig;

/// How a configuration key compares between file and running daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Match,
    OverriddenInFile,
    Default,
    Invalid,
    Duplicate,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::OverriddenInFile => "overridden-in-file",
            Self::Default => "default",
            Self::Invalid => "invalid",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    pub key: String,
    pub live_value: Option<String>,
    pub file_value: Option<String>,
    pub classification: Classification,
    /// File line of the entry, absent for live-only keys.
    pub line: Option<usize>,
}

/// Result of one validation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub entries: Arc<[ConfigEntry]>,
    /// Whether the running configuration could be fetched.
    pub live_available: bool,
}

impl Default for ConfigView {
    fn default() -> Self {
        Self {
            entries: Arc::from(Vec::new()),
            live_available: false,
        }
    }
}

impl ConfigView {
    pub fn count(&self, classification: Classification) -> usize {
        self.entries
            .iter()
            .filter(|e| e.classification == classification)
            .count()
    }
}

/// Values of one key, normalized for comparison and as written for display.
struct Values {
    display_key: String,
    compare: Vec<String>,
    shown: String,
}

pub struct ConfigDiffer {
    keys: KeyTable,
}

impl ConfigDiffer {
    pub fn new(keys: KeyTable) -> Self {
        Self { keys }
    }

    pub fn from_config(cfg: &ConfDiffConfig) -> Self {
        Self::new(KeyTable::new(&cfg.aliases, &cfg.multi_value))
    }

    /// Classify every key present in either configuration. `live` is `None`
    /// when the running configuration could not be fetched, in which case
    /// every file entry is reported invalid.
    pub fn diff(&self, live: Option<&str>, file: &str) -> Vec<ConfigEntry> {
        let file_lines = parse_config(file, &self.keys);
        let live_values = live.map(|text| self.collect(&parse_config(text, &self.keys)));

        let mut entries = Vec::with_capacity(file_lines.len());
        let mut seen_in_file = HashSet::new();

        // Last occurrence of each single-value key, found scanning backwards.
        let mut effective = HashMap::new();
        for (idx, line) in file_lines.iter().enumerate().rev() {
            let key = self.keys.lookup_key(&line.key);
            if !self.keys.is_multi_value(&key) {
                effective.entry(key).or_insert(idx);
            }
        }

        let file_multi = self.collect(
            &file_lines
                .iter()
                .filter(|l| self.keys.is_multi_value(&l.key))
                .cloned()
                .collect::<Vec<_>>(),
        );

        for (idx, line) in file_lines.iter().enumerate() {
            let key = self.keys.lookup_key(&line.key);
            let live_entry = live_values.as_ref().and_then(|m| m.get(&key));
            let live_value = live_entry.map(|v| v.shown.clone());

            if self.keys.is_multi_value(&key) {
                // Repeated lines of a multi-value key form one entry at its
                // first line.
                if !seen_in_file.insert(key.clone()) {
                    continue;
                }
                let Some(values) = file_multi.get(&key) else {
                    continue;
                };
                entries.push(ConfigEntry {
                    key: values.display_key.clone(),
                    live_value,
                    file_value: Some(values.shown.clone()),
                    classification: classify(live_values.is_some(), live_entry, &values.compare),
                    line: Some(line.line),
                });
                continue;
            }

            seen_in_file.insert(key.clone());
            let classification = if effective.get(&key) != Some(&idx) {
                Classification::Duplicate
            } else {
                classify(
                    live_values.is_some(),
                    live_entry,
                    &[units::normalize(&line.value).0],
                )
            };

            entries.push(ConfigEntry {
                key: line.key.clone(),
                live_value,
                file_value: Some(line.value.clone()),
                classification,
                line: Some(line.line),
            });
        }

        if let Some(live_values) = live_values {
            for (key, values) in live_values {
                if seen_in_file.contains(&key) {
                    continue;
                }
                entries.push(ConfigEntry {
                    key: values.display_key,
                    live_value: Some(values.shown),
                    file_value: None,
                    classification: Classification::Default,
                    line: None,
                });
            }
        }

        entries
    }

    /// Produce the published view of one pass.
    pub fn view(&self, live: Option<&str>, file: &str) -> ConfigView {
        ConfigView {
            entries: self.diff(live, file).into(),
            live_available: live.is_some(),
        }
    }

    /// Fold parsed lines into per-key values, keyed by lookup key. Multi-value
    /// keys accumulate their comma separated values across lines; other keys
    /// keep their last value.
    fn collect(&self, lines: &[ConfigLine]) -> BTreeMap<String, Values> {
        let mut out: BTreeMap<String, Values> = BTreeMap::new();

        for line in lines {
            let key = self.keys.lookup_key(&line.key);
            if self.keys.is_multi_value(&key) {
                let entry = out.entry(key).or_insert_with(|| Values {
                    display_key: line.key.clone(),
                    compare: Vec::new(),
                    shown: String::new(),
                });
                for value in split_list(&line.value) {
                    entry.compare.push(units::normalize(value).0);
                    if !entry.shown.is_empty() {
                        entry.shown.push_str(", ");
                    }
                    entry.shown.push_str(value);
                }
            } else {
                out.insert(
                    key,
                    Values {
                        display_key: line.key.clone(),
                        compare: vec![units::normalize(&line.value).0],
                        shown: line.value.clone(),
                    },
                );
            }
        }

        out
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn classify(live_available: bool, live: Option<&Values>, file: &[String]) -> Classification {
    match live {
        _ if !live_available => Classification::Invalid,
        None => Classification::Invalid,
        Some(values) if values.compare == file => Classification::Match,
        Some(_) => Classification::OverriddenInFile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TORRC: &str = "\
# relay configuration
Nickname alpha
ORPort 9001
RelayBandwidthRate 5 MB
ExitPolicy accept *:80, \\
  accept *:443
ExitPolicy reject *:*
Nickname beta
BogusOption 1
";

    const LIVE: &str = "\
Nickname beta
ORPort 9050
RelayBandwidthRate 5242880
ExitPolicy accept *:80,accept *:443,reject *:*
ControlPort 9051
AvoidDiskWrites 1
";

    fn differ() -> ConfigDiffer {
        let cfg = ConfDiffConfig {
            aliases: HashMap::from([(
                "ControlListenAddress".to_string(),
                "ControlPort".to_string(),
            )]),
            multi_value: vec!["ExitPolicy".to_string()],
            ..ConfDiffConfig::default()
        };
        ConfigDiffer::from_config(&cfg)
    }

    fn find<'a>(entries: &'a [ConfigEntry], key: &str, line: Option<usize>) -> &'a ConfigEntry {
        entries
            .iter()
            .find(|e| e.key == key && (line.is_none() || e.line == line))
            .expect("entry present")
    }

    #[test]
    fn test_classifications() {
        let entries = differ().diff(Some(LIVE), TORRC);

        assert_eq!(find(&entries, "Nickname", Some(2)).classification, Classification::Duplicate);
        assert_eq!(find(&entries, "Nickname", Some(8)).classification, Classification::Match);
        assert_eq!(find(&entries, "ORPort", None).classification, Classification::OverriddenInFile);
        assert_eq!(
            find(&entries, "RelayBandwidthRate", None).classification,
            Classification::Match
        );
        assert_eq!(find(&entries, "ExitPolicy", None).classification, Classification::Match);
        assert_eq!(find(&entries, "BogusOption", None).classification, Classification::Invalid);
        assert_eq!(find(&entries, "ControlPort", None).classification, Classification::Default);
        assert_eq!(find(&entries, "AvoidDiskWrites", None).classification, Classification::Default);
    }

    #[test]
    fn test_ordering_file_then_sorted_live_only() {
        let entries = differ().diff(Some(LIVE), TORRC);
        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "Nickname",
                "ORPort",
                "RelayBandwidthRate",
                "ExitPolicy",
                "Nickname",
                "BogusOption",
                "AvoidDiskWrites",
                "ControlPort",
            ]
        );
        let exit = find(&entries, "ExitPolicy", None);
        assert_eq!(exit.line, Some(5));
        assert_eq!(exit.file_value.as_deref(), Some("accept *:80, accept *:443, reject *:*"));
    }

    #[test]
    fn test_multi_value_order_matters() {
        let live = "ExitPolicy reject *:*, accept *:80\n";
        let file = "ExitPolicy accept *:80\nExitPolicy reject *:*\n";
        let entries = differ().diff(Some(live), file);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].classification, Classification::OverriddenInFile);
    }

    #[test]
    fn test_keys_are_case_insensitive_with_aliases() {
        let live = "ControlPort 9051\n";
        let file = "controllistenaddress 9051\n";
        let entries = differ().diff(Some(live), file);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "ControlPort");
        assert_eq!(entries[0].classification, Classification::Match);
    }

    #[test]
    fn test_live_unavailable_marks_everything_invalid() {
        let view = differ().view(None, TORRC);
        assert!(!view.live_available);
        assert!(!view.entries.is_empty());
        assert!(view
            .entries
            .iter()
            .all(|e| e.classification == Classification::Invalid));
        assert!(view.entries.iter().all(|e| e.live_value.is_none()));
        assert_eq!(view.count(Classification::Invalid), view.entries.len());
    }

    #[test]
    fn test_diff_is_idempotent() {
        let d = differ();
        assert_eq!(d.diff(Some(LIVE), TORRC), d.diff(Some(LIVE), TORRC));
        assert_eq!(d.diff(None, TORRC), d.diff(None, TORRC));
    }

    #[test]
    fn test_empty_inputs() {
        assert!(differ().diff(Some(""), "").is_empty());
        assert!(differ().diff(None, "# only comments\n").is_empty());
    }
}
