use std::collections::VecDeque;

use regex::{Regex, RegexBuilder};

use super::entry::LogEvent;

/// Regex selection over normalized events, remembering recent choices.
#[derive(Debug, Clone)]
pub struct LogFilters {
    selected: Option<Regex>,
    recent: VecDeque<String>,
    max_filters: usize,
}

impl LogFilters {
    /// Create a filter set, pre-seeding the recent selections. Invalid
    /// initial patterns are skipped.
    pub fn new(initial: &[String], max_filters: usize) -> Self {
        let mut filters = Self {
            selected: None,
            recent: VecDeque::with_capacity(max_filters),
            max_filters: max_filters.max(1),
        };

        for pattern in initial.iter().rev() {
            if compile(pattern).is_ok() {
                filters.remember(pattern);
            }
        }

        filters
    }

    /// Select a pattern, or clear the selection with `None`. An invalid
    /// pattern leaves the current selection untouched.
    pub fn select(&mut self, pattern: Option<&str>) -> Result<(), regex::Error> {
        let Some(pattern) = pattern else {
            self.selected = None;
            return Ok(());
        };

        let regex = compile(pattern)?;
        self.remember(pattern);
        self.selected = Some(regex);
        Ok(())
    }

    fn remember(&mut self, pattern: &str) {
        self.recent.retain(|p| p != pattern);
        self.recent.push_front(pattern.to_string());
        self.recent.truncate(self.max_filters);
    }

    /// Currently selected pattern.
    pub fn selection(&self) -> Option<&str> {
        self.selected.as_ref().map(Regex::as_str)
    }

    /// Recently selected patterns, most recent first.
    pub fn latest_selections(&self) -> Vec<String> {
        self.recent.iter().cloned().collect()
    }

    /// Whether an event passes the selection. Multi-line messages are
    /// matched as a single unit.
    pub fn matches(&self, event: &LogEvent) -> bool {
        match &self.selected {
            Some(regex) => regex.is_match(&event.message),
            None => true,
        }
    }

    /// Events passing the selection, in order.
    pub fn apply<'a>(&'a self, events: &'a [LogEvent]) -> impl Iterator<Item = &'a LogEvent> + 'a {
        events.iter().filter(move |e| self.matches(e))
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).dot_matches_new_line(true).build()
}
