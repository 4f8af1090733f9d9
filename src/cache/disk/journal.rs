//! Journal codec
//!
//! ```text
//! imgload-disk-cache          <- magic
//! 1                           <- version
//! c <key> <originMillis> <ttlMillis>
//! m <key> <originMillis> <ttlMillis>
//! d <key>
//! ```
//!
//! Keys are percent-encoded so they never contain the field separator.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use super::{sanitize_key, DiskCacheEntry};
use crate::error::{Error, Result};

/// Journal file name inside the cache directory
pub const JOURNAL_FILE: &str = ".journal";

pub(crate) const MAGIC: &str = "imgload-disk-cache";
pub(crate) const VERSION: &str = "1";

/// Records before compaction kicks in, on top of twice the live count
pub(crate) const COMPACTION_SLACK: usize = 1000;

/// One journal record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Created {
        key: String,
        origin_ms: i64,
        ttl_ms: u64,
    },
    Modified {
        key: String,
        origin_ms: i64,
        ttl_ms: u64,
    },
    Deleted {
        key: String,
    },
}

impl JournalOp {
    /// Record for a freshly written entry
    pub fn written(entry: &DiskCacheEntry, existed: bool) -> Self {
        let key = entry.key.clone();
        let origin_ms = entry.origin.timestamp_millis();
        let ttl_ms = u64::try_from(entry.ttl.as_millis()).unwrap_or(u64::MAX);
        if existed {
            JournalOp::Modified {
                key,
                origin_ms,
                ttl_ms,
            }
        } else {
            JournalOp::Created {
                key,
                origin_ms,
                ttl_ms,
            }
        }
    }

    /// Get the record's key
    pub fn key(&self) -> &str {
        match self {
            JournalOp::Created { key, .. }
            | JournalOp::Modified { key, .. }
            | JournalOp::Deleted { key } => key,
        }
    }

    /// Encode as a single line without the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            JournalOp::Created {
                key,
                origin_ms,
                ttl_ms,
            } => format!("c {} {} {}", urlencoding::encode(key), origin_ms, ttl_ms),
            JournalOp::Modified {
                key,
                origin_ms,
                ttl_ms,
            } => format!("m {} {} {}", urlencoding::encode(key), origin_ms, ttl_ms),
            JournalOp::Deleted { key } => format!("d {}", urlencoding::encode(key)),
        }
    }

    /// Decode a single line
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split(' ');
        let op = fields.next().unwrap_or_default();
        let key = fields
            .next()
            .ok_or_else(|| Error::Journal(format!("missing key in record: {:?}", line)))?;
        let key = urlencoding::decode(key)
            .map_err(|e| Error::Journal(format!("bad key encoding in {:?}: {}", line, e)))?
            .into_owned();

        let mut timing = || -> Result<(i64, u64)> {
            let origin_ms = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| Error::Journal(format!("bad origin in record: {:?}", line)))?;
            let ttl_ms = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| Error::Journal(format!("bad ttl in record: {:?}", line)))?;
            Ok((origin_ms, ttl_ms))
        };

        let record = match op {
            "c" => {
                let (origin_ms, ttl_ms) = timing()?;
                JournalOp::Created {
                    key,
                    origin_ms,
                    ttl_ms,
                }
            }
            "m" => {
                let (origin_ms, ttl_ms) = timing()?;
                JournalOp::Modified {
                    key,
                    origin_ms,
                    ttl_ms,
                }
            }
            "d" => JournalOp::Deleted { key },
            other => {
                return Err(Error::Journal(format!("unknown record type {:?}", other)));
            }
        };

        if fields.next().is_some() {
            return Err(Error::Journal(format!("trailing fields in record: {:?}", line)));
        }
        Ok(record)
    }
}

/// Header lines written at the top of every journal
pub(crate) fn header() -> String {
    format!("{}\n{}\n", MAGIC, VERSION)
}

/// Parsed journal body
#[derive(Debug, Default)]
pub(crate) struct ParsedJournal {
    pub records: Vec<JournalOp>,
    /// Lines that could not be decoded (typically a torn final append)
    pub skipped: usize,
}

/// Validate the header and decode every record
///
/// A bad header is an error; undecodable record lines are counted and skipped.
pub(crate) fn parse(text: &str) -> Result<ParsedJournal> {
    let mut lines = text.lines();
    match (lines.next(), lines.next()) {
        (Some(MAGIC), Some(VERSION)) => {}
        (magic, version) => {
            return Err(Error::Journal(format!(
                "unexpected journal header {:?}/{:?}",
                magic, version
            )));
        }
    }

    let mut parsed = ParsedJournal::default();
    for line in lines.filter(|l| !l.is_empty()) {
        match JournalOp::parse(line) {
            Ok(record) => parsed.records.push(record),
            Err(_) => parsed.skipped += 1,
        }
    }
    Ok(parsed)
}

/// Rebuild the live entry set from records, in order
pub(crate) fn replay(records: &[JournalOp]) -> HashMap<String, DiskCacheEntry> {
    let mut entries = HashMap::new();
    for record in records {
        match record {
            JournalOp::Created {
                key,
                origin_ms,
                ttl_ms,
            }
            | JournalOp::Modified {
                key,
                origin_ms,
                ttl_ms,
            } => {
                let Some(origin) = Utc.timestamp_millis_opt(*origin_ms).single() else {
                    continue;
                };
                entries.insert(
                    key.clone(),
                    DiskCacheEntry {
                        key: key.clone(),
                        file_name: sanitize_key(key),
                        origin,
                        ttl: Duration::from_millis(*ttl_ms),
                    },
                );
            }
            JournalOp::Deleted { key } => {
                entries.remove(key);
            }
        }
    }
    entries
}

/// Whether a journal has grown enough to be rewritten
pub(crate) fn needs_compaction(records: usize, live: usize) -> bool {
    records > live.saturating_mul(2).saturating_add(COMPACTION_SLACK)
}

/// Full journal text holding one `c` record per live entry
pub(crate) fn compacted<'a>(entries: impl Iterator<Item = &'a DiskCacheEntry>) -> String {
    let mut text = header();
    for entry in entries {
        text.push_str(&JournalOp::written(entry, false).to_line());
        text.push('\n');
    }
    text
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_line_format() {
        let created = JournalOp::Created {
            key: "http://x/a b.png".into(),
            origin_ms: 1_700_000_000_000,
            ttl_ms: 60_000,
        };
        assert_eq!(
            created.to_line(),
            "c http%3A%2F%2Fx%2Fa%20b.png 1700000000000 60000"
        );
        assert_eq!(JournalOp::parse(&created.to_line()).unwrap(), created);

        let deleted = JournalOp::Deleted { key: "k".into() };
        assert_eq!(deleted.to_line(), "d k");
        assert_eq!(JournalOp::parse("d k").unwrap(), deleted);
    }

    #[test]
    fn test_parse_rejects_malformed_records() {
        assert_matches!(JournalOp::parse("x key"), Err(Error::Journal(_)));
        assert_matches!(JournalOp::parse("c key 12"), Err(Error::Journal(_)));
        assert_matches!(JournalOp::parse("c key abc 12"), Err(Error::Journal(_)));
        assert_matches!(JournalOp::parse("d"), Err(Error::Journal(_)));
        assert_matches!(JournalOp::parse("d key extra"), Err(Error::Journal(_)));
    }

    #[test]
    fn test_header_mismatch_is_error() {
        assert_matches!(parse(""), Err(Error::Journal(_)));
        assert_matches!(parse("other\n1\n"), Err(Error::Journal(_)));
        assert_matches!(parse(&format!("{}\n99\n", MAGIC)), Err(Error::Journal(_)));
        assert!(parse(&header()).unwrap().records.is_empty());
    }

    #[test]
    fn test_torn_tail_is_skipped() {
        let text = format!("{}c a 1 2\nd b\nc tor", header());
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_modify_overwrites_and_delete_removes() {
        let records = vec![
            JournalOp::Created {
                key: "a".into(),
                origin_ms: 1,
                ttl_ms: 10,
            },
            JournalOp::Modified {
                key: "a".into(),
                origin_ms: 5,
                ttl_ms: 20,
            },
            JournalOp::Created {
                key: "b".into(),
                origin_ms: 1,
                ttl_ms: 10,
            },
            JournalOp::Deleted { key: "b".into() },
            JournalOp::Deleted {
                key: "never".into(),
            },
        ];
        let live = replay(&records);
        assert_eq!(live.len(), 1);
        assert_eq!(live["a"].ttl, Duration::from_millis(20));
        assert_eq!(live["a"].origin.timestamp_millis(), 5);
    }

    #[test]
    fn test_compaction_threshold() {
        assert!(!needs_compaction(1000, 0));
        assert!(needs_compaction(1001, 0));
        assert!(!needs_compaction(1200, 100));
        assert!(needs_compaction(1201, 100));
    }

    #[test]
    fn test_compacted_round_trips() {
        let records = vec![
            JournalOp::Created {
                key: "a".into(),
                origin_ms: 1,
                ttl_ms: 10,
            },
            JournalOp::Created {
                key: "b".into(),
                origin_ms: 2,
                ttl_ms: 10,
            },
        ];
        let live = replay(&records);
        let text = compacted(live.values());
        let reparsed = parse(&text).unwrap();
        assert_eq!(replay(&reparsed.records), live);
    }

    proptest! {
        /// Property: N creates and M deletes of created keys leave N-M entries.
        #[test]
        fn prop_replay_counts_live_entries(
            created in 1usize..80,
            deleted in prop::collection::btree_set(0usize..80, 0..40),
        ) {
            let mut records: Vec<JournalOp> = (0..created)
                .map(|i| JournalOp::Created {
                    key: format!("key-{}", i),
                    origin_ms: i as i64,
                    ttl_ms: 1000,
                })
                .collect();
            let deleted: Vec<usize> = deleted.into_iter().filter(|i| *i < created).collect();
            for i in &deleted {
                records.push(JournalOp::Deleted { key: format!("key-{}", i) });
            }

            let text = records.iter().fold(header(), |mut text, r| {
                text.push_str(&r.to_line());
                text.push('\n');
                text
            });
            let parsed = parse(&text)?;
            prop_assert_eq!(parsed.skipped, 0);
            prop_assert_eq!(replay(&parsed.records).len(), created - deleted.len());
        }
    }
}
