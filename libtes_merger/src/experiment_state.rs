// The experiment state file is written by the DAQ next to the channel files. Every time the
// acquisition changes state a row is appended:
//
// # unix time in nanoseconds, state label
// 1715170000000000000, START
// 1715170100000000000, CAL0
// 1715170400000000000, SCAN1
//
// A state lasts from its row until the next row. The file keeps growing during a day, so it
// is re-read whenever a new run is handled.
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::error::ExperimentStateError;

const ENTRIES_PER_LINE: usize = 2; // unixnano, label
const COMMENT_MARKER: &str = "#";

/// A half-open time interval `[start, stop)` in unix nanoseconds. `stop` is None for the
/// state that is currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInterval {
    pub start: u64,
    pub stop: Option<u64>,
}

impl StateInterval {
    pub fn contains(&self, unixnano: u64) -> bool {
        unixnano >= self.start && self.stop.map_or(true, |stop| unixnano < stop)
    }
}

/// All of the intervals belonging to one state label.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSelection {
    pub label: String,
    pub intervals: Vec<StateInterval>,
}

impl StateSelection {
    pub fn contains(&self, unixnano: u64) -> bool {
        self.intervals.iter().any(|iv| iv.contains(unixnano))
    }

    /// Boolean mask over a list of event timestamps
    pub fn mask(&self, unixnanos: &[u64]) -> Vec<bool> {
        unixnanos.iter().map(|t| self.contains(*t)).collect()
    }
}

/// The ordered list of state transitions for a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentStates {
    transitions: Vec<(u64, String)>,
}

impl ExperimentStates {
    /// Read an experiment state file from disk
    pub fn from_file(path: &Path) -> Result<Self, ExperimentStateError> {
        let mut contents = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut contents)?;
        Self::parse(&contents)
    }

    /// Parse the contents of an experiment state file
    pub fn parse(contents: &str) -> Result<Self, ExperimentStateError> {
        let mut states = ExperimentStates::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(COMMENT_MARKER) {
                continue;
            }
            let entries: Vec<&str> = line.split_terminator(',').map(str::trim).collect();
            if entries.len() != ENTRIES_PER_LINE || entries[1].is_empty() {
                return Err(ExperimentStateError::BadFileFormat(line.to_string()));
            }
            let unixnano: u64 = entries[0].parse()?;
            states.push(unixnano, entries[1])?;
        }
        Ok(states)
    }

    /// Append a transition. Transitions must arrive in time order.
    pub fn push(&mut self, unixnano: u64, label: &str) -> Result<(), ExperimentStateError> {
        if let Some((last, _)) = self.transitions.last() {
            if unixnano < *last {
                return Err(ExperimentStateError::OutOfOrder(unixnano));
            }
        }
        self.transitions.push((unixnano, label.to_string()));
        Ok(())
    }

    /// All of the labels in order of first appearance
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for (_, label) in self.transitions.iter() {
            if !labels.contains(&label.as_str()) {
                labels.push(label);
            }
        }
        labels
    }

    /// Get the time intervals for a state label.
    ///
    /// Fails if the label never occurs, so that a mistyped label is reported once for the
    /// run instead of once per channel.
    pub fn selection(&self, label: &str) -> Result<StateSelection, ExperimentStateError> {
        let mut intervals = Vec::new();
        for (idx, (start, name)) in self.transitions.iter().enumerate() {
            if name == label {
                let stop = self.transitions.get(idx + 1).map(|(t, _)| *t);
                intervals.push(StateInterval {
                    start: *start,
                    stop,
                });
            }
        }
        if intervals.is_empty() {
            return Err(ExperimentStateError::UnknownState(label.to_string()));
        }
        Ok(StateSelection {
            label: label.to_string(),
            intervals,
        })
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

/// Render a unix nanosecond timestamp for log messages
pub fn format_unixnano(unixnano: u64) -> String {
    match time::OffsetDateTime::from_unix_timestamp_nanos(unixnano as i128) {
        Ok(datetime) => datetime.to_string(),
        Err(_) => format!("{unixnano} ns"),
    }
}
