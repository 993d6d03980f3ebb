//! Textual crawl-state checkpoint.
//!
//! One record per line, whitespace-separated key/value pairs:
//!
//! ```text
//! root 100 objectid 12c offset 0 min_transid 0 max_transid a started 688df2a0 start_ts 2026-08-02-12-00-00
//! ```
//!
//! Numerics are hexadecimal on both sides. Blank lines are permitted.
//! Records whose `max_transid` is zero are omitted on write (the
//! crawler never opened a window). `u64::MAX` sentinels are repaired on
//! read with a warning: such values would otherwise create crawlers
//! that overflow their window arithmetic. The legacy key names
//! `gen_current`/`gen_next` are still accepted, and take precedence
//! over `min_transid`/`max_transid` when a record carries both.
//! `start_ts` is advisory and ignored by the reader.

use chrono::{Local, TimeZone};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use sweep_error::{Result, SweepError};
use sweep_types::{CrawlState, RootId};
use tracing::{debug, warn};

/// Fixed name of the checkpoint, relative to the daemon state directory.
pub const STATE_FILE_NAME: &str = "beescrawl.dat";

/// Sentinel repairs performed while parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub bad_min_transid: u64,
    pub bad_max_transid: u64,
}

impl RepairStats {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.bad_min_transid + self.bad_max_transid
    }
}

/// `YYYY-MM-DD-HH-MM-SS` in local time, for the advisory `start_ts`.
#[must_use]
pub fn format_timestamp(secs: u64) -> String {
    let secs = i64::try_from(secs).unwrap_or(0);
    match Local.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(ts) | chrono::LocalResult::Ambiguous(ts, _) => {
            ts.format("%Y-%m-%d-%H-%M-%S").to_string()
        }
        chrono::LocalResult::None => "1970-01-01-00-00-00".to_owned(),
    }
}

/// Render the records for `states`, skipping crawlers that never opened
/// a window.
#[must_use]
pub fn render_states<'a>(states: impl IntoIterator<Item = &'a CrawlState>) -> String {
    let mut out = String::new();
    for state in states {
        if state.max_transid == 0 {
            continue;
        }
        let _ = writeln!(
            out,
            "root {:x} objectid {:x} offset {:x} min_transid {:x} max_transid {:x} started {:x} start_ts {}",
            state.root.0,
            state.objectid,
            state.offset,
            state.min_transid,
            state.max_transid,
            state.started,
            format_timestamp(state.started),
        );
    }
    out
}

fn parse_hex(value: &str) -> Option<u64> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(value, 16).ok()
}

fn record_error(line: usize, detail: impl Into<String>) -> SweepError {
    SweepError::State {
        line,
        detail: detail.into(),
    }
}

/// Parse a whole state file. Structurally malformed records are errors;
/// impossible values are repaired and counted.
pub fn parse_states(data: &str) -> Result<(Vec<CrawlState>, RepairStats)> {
    let mut states = Vec::new();
    let mut repairs = RepairStats::default();

    for (index, raw_line) in data.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(target: "sweep::state", line_no, line, "read state record");

        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() % 2 != 0 {
            return Err(record_error(line_no, "odd token count"));
        }
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for pair in words.chunks_exact(2) {
            if fields.insert(pair[0], pair[1]).is_some() {
                return Err(record_error(line_no, format!("duplicate key '{}'", pair[0])));
            }
        }

        let numeric = |key: &str| -> Result<Option<u64>> {
            fields
                .get(key)
                .map(|value| {
                    parse_hex(value)
                        .ok_or_else(|| record_error(line_no, format!("bad value for '{key}'")))
                })
                .transpose()
        };
        let required = |key: &str| -> Result<u64> {
            numeric(key)?.ok_or_else(|| record_error(line_no, format!("missing key '{key}'")))
        };

        // The legacy key names win over the new ones when a record
        // somehow carries both.
        let mut state = CrawlState {
            root: RootId(required("root")?),
            objectid: required("objectid")?,
            offset: required("offset")?,
            min_transid: match numeric("gen_current")? {
                Some(value) => value,
                None => required("min_transid")?,
            },
            max_transid: match numeric("gen_next")? {
                Some(value) => value,
                None => required("max_transid")?,
            },
            started: numeric("started")?.unwrap_or_else(sweep_crawl::now_secs),
        };

        if state.min_transid == u64::MAX {
            warn!(
                target: "sweep::state",
                root = %state.root,
                "bad min_transid in state file, resetting to 0"
            );
            state.min_transid = 0;
            repairs.bad_min_transid += 1;
        }
        if state.max_transid == u64::MAX {
            warn!(
                target: "sweep::state",
                root = %state.root, min_transid = state.min_transid,
                "bad max_transid in state file, resetting to min_transid"
            );
            state.max_transid = state.min_transid;
            repairs.bad_max_transid += 1;
        }

        states.push(state);
    }

    Ok((states, repairs))
}

/// Write the state file atomically: temp file, fsync, rename.
pub fn save_to<'a>(dir: &Path, states: impl IntoIterator<Item = &'a CrawlState>) -> Result<()> {
    let body = render_states(states);
    let tmp_path = dir.join(format!("{STATE_FILE_NAME}.tmp"));
    let final_path = dir.join(STATE_FILE_NAME);

    {
        use std::io::Write as _;
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Load the state file from `dir`. A missing file is a clean cold
/// start, not an error.
pub fn load_from(dir: &Path) -> Result<Option<(Vec<CrawlState>, RepairStats)>> {
    let path = dir.join(STATE_FILE_NAME);
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    parse_states(&data).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(root: u64, objectid: u64, offset: u64, min: u64, max: u64, started: u64) -> CrawlState {
        CrawlState {
            root: RootId(root),
            objectid,
            offset,
            min_transid: min,
            max_transid: max,
            started,
        }
    }

    #[test]
    fn round_trips_one_record() {
        let original = state(256, 300, 4096, 5, 10, 1_700_000_000);
        let rendered = render_states([&original]);
        let (parsed, repairs) = parse_states(&rendered).unwrap();
        assert_eq!(parsed, vec![original]);
        assert_eq!(repairs.total(), 0);
    }

    #[test]
    fn numerics_are_hex() {
        let rendered = render_states([&state(256, 300, 0, 0, 10, 0)]);
        // 256 -> 100, 300 -> 12c, 10 -> a.
        assert!(rendered.contains("root 100 "), "{rendered}");
        assert!(rendered.contains("objectid 12c "), "{rendered}");
        assert!(rendered.contains("max_transid a "), "{rendered}");
    }

    #[test]
    fn window_never_opened_is_omitted() {
        let rendered = render_states([&state(256, 0, 0, 0, 0, 0)]);
        assert!(rendered.is_empty());
    }

    #[test]
    fn blank_lines_are_permitted() {
        let data = "\n\nroot 100 objectid 0 offset 0 min_transid 0 max_transid a\n\n";
        let (parsed, _) = parse_states(data).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].max_transid, 10);
    }

    #[test]
    fn legacy_keys_are_accepted() {
        let data = "root 100 objectid 0 offset 0 gen_current 5 gen_next a started 1\n";
        let (parsed, _) = parse_states(data).unwrap();
        assert_eq!(parsed[0].min_transid, 5);
        assert_eq!(parsed[0].max_transid, 10);
    }

    #[test]
    fn legacy_keys_win_over_new_names() {
        let data = "root 100 objectid 0 offset 0 gen_current 5 gen_next a \
                    min_transid 2 max_transid 3 started 1\n";
        let (parsed, _) = parse_states(data).unwrap();
        assert_eq!(parsed[0].min_transid, 5);
        assert_eq!(parsed[0].max_transid, 10);
    }

    #[test]
    fn sentinel_values_are_repaired() {
        let data = format!(
            "root 100 objectid 0 offset 0 min_transid {:x} max_transid {:x} started 1\n",
            u64::MAX,
            u64::MAX
        );
        let (parsed, repairs) = parse_states(&data).unwrap();
        assert_eq!(parsed[0].min_transid, 0);
        assert_eq!(parsed[0].max_transid, 0);
        assert_eq!(repairs.bad_min_transid, 1);
        assert_eq!(repairs.bad_max_transid, 1);
    }

    #[test]
    fn bad_max_resets_to_repaired_min() {
        let data = format!(
            "root 100 objectid 0 offset 0 min_transid 7 max_transid {:x} started 1\n",
            u64::MAX
        );
        let (parsed, repairs) = parse_states(&data).unwrap();
        assert_eq!(parsed[0].min_transid, 7);
        assert_eq!(parsed[0].max_transid, 7);
        assert_eq!(repairs.bad_min_transid, 0);
        assert_eq!(repairs.bad_max_transid, 1);
    }

    #[test]
    fn repaired_file_resaves_stably() {
        let data = format!(
            "root 100 objectid 0 offset 0 min_transid 7 max_transid {:x} started 1\n",
            u64::MAX
        );
        let (repaired, _) = parse_states(&data).unwrap();
        let rendered = render_states(&repaired);
        let (again, repairs) = parse_states(&rendered).unwrap();
        assert_eq!(repaired, again);
        assert_eq!(repairs.total(), 0);
    }

    #[test]
    fn malformed_records_are_errors() {
        assert!(parse_states("root 100 objectid\n").is_err());
        assert!(parse_states("root 100 root 100\n").is_err());
        assert!(parse_states("root zz\n").is_err());
        assert!(parse_states("objectid 0 offset 0 min_transid 0 max_transid a\n").is_err());
    }

    #[test]
    fn start_ts_is_ignored_on_read() {
        let data = "root 100 objectid 0 offset 0 min_transid 0 max_transid a start_ts 2026-08-02-12-00-00\n";
        let (parsed, _) = parse_states(data).unwrap();
        assert_eq!(parsed[0].root, RootId(256));
    }

    #[test]
    fn save_and_load_directory_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let states = vec![
            state(256, 300, 0, 0, 10, 77),
            state(257, 0, 0, 10, 12, 78),
        ];
        save_to(dir.path(), &states).unwrap();
        let (loaded, repairs) = load_from(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, states);
        assert_eq!(repairs.total(), 0);
    }

    #[test]
    fn missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_from(dir.path()).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn parse_inverts_render(
            root in 1_u64..1 << 48,
            objectid in 0_u64..u64::MAX - 1,
            offset in 0_u64..u64::MAX - 1,
            min in 0_u64..u64::MAX - 1,
            window in 1_u64..1 << 32,
            started in 0_u64..4_000_000_000,
        ) {
            let max = min.saturating_add(window).min(u64::MAX - 1);
            let original = state(root, objectid, offset, min, max, started);
            let (parsed, repairs) = parse_states(&render_states([&original])).unwrap();
            prop_assert_eq!(parsed, vec![original]);
            prop_assert_eq!(repairs.total(), 0);
        }
    }
}
