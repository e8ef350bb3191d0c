//! Ad-segment filtering for media manifests
//!
//! Fragments of one program normally share their first packet's time base and
//! duration and the stream's frame size. [`AdFilter`] probes every fetched fragment,
//! takes the most common signature as canonical and comments out fragments that
//! deviate from it or whose content hash is a known ad.
//!
//! This is a heuristic. Legitimately mixed-resolution content can be misclassified.

mod blacklist;
mod fingerprint;

pub use blacklist::{AdBlacklist, JsonBlacklist, MemoryBlacklist, spawn_flush_task};
pub use fingerprint::{
    FfprobeProber, Fingerprint, FingerprintTuple, FragmentProber, content_hash,
};

use crate::error::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Prefix that turns a manifest line into a comment
pub const COMMENT_PREFIX: &str = "#";

/// Result of one filter pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Manifest lines with filtered fragment references commented out
    pub lines: Vec<String>,
    /// Indices (into `lines`) of the commented-out fragment references
    pub filtered: Vec<usize>,
}

#[derive(Debug)]
struct Entry {
    line: usize,
    hash: Option<String>,
    tuple: Option<FingerprintTuple>,
    filtered: bool,
}

impl Entry {
    fn parse_error(&self) -> bool {
        self.tuple.is_none()
    }
}

/// Fingerprint-based fragment filter
#[derive(Clone)]
pub struct AdFilter {
    prober: Arc<dyn FragmentProber>,
    blacklist: Option<Arc<dyn AdBlacklist>>,
    probe_workers: usize,
}

impl std::fmt::Debug for AdFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdFilter")
            .field("has_blacklist", &self.blacklist.is_some())
            .field("probe_workers", &self.probe_workers)
            .finish()
    }
}

impl AdFilter {
    /// Filter probing up to `probe_workers` fragments at once
    ///
    /// Without a blacklist classification is purely live.
    pub fn new(
        prober: Arc<dyn FragmentProber>,
        blacklist: Option<Arc<dyn AdBlacklist>>,
        probe_workers: usize,
    ) -> Self {
        Self {
            prober,
            blacklist,
            probe_workers: probe_workers.max(1),
        }
    }

    /// Classify the fragments of a media manifest
    ///
    /// `lines` are manifest lines whose fragment references point at already
    /// fetched local files. Tag lines pass through unchanged and ordering is kept.
    ///
    /// # Errors
    ///
    /// [`Error::FingerprintParse`] when no fragment could be fingerprinted, or when
    /// an unreadable fragment sits between readable program fragments.
    pub async fn filter_lines(
        &self,
        lines: &[String],
        cancel: &CancellationToken,
    ) -> Result<FilterOutcome> {
        let fragment_lines: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| is_fragment_line(line))
            .map(|(i, _)| i)
            .collect();
        if fragment_lines.is_empty() {
            return Ok(FilterOutcome {
                lines: lines.to_vec(),
                filtered: Vec::new(),
            });
        }

        let mut entries = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            entries = self.probe_all(lines, &fragment_lines) => entries,
        };

        let canonical = modal_tuple(&entries).ok_or_else(|| {
            Error::FingerprintParse("no fragment could be fingerprinted".to_string())
        })?;
        self.classify(&mut entries, canonical);
        settle_parse_errors(&mut entries)?;

        let mut out = lines.to_vec();
        let mut filtered = Vec::new();
        for entry in entries.iter().filter(|e| e.filtered) {
            out[entry.line] = format!("{}{}", COMMENT_PREFIX, out[entry.line]);
            filtered.push(entry.line);
        }
        if !filtered.is_empty() {
            tracing::info!(
                filtered = filtered.len(),
                fragments = fragment_lines.len(),
                "Filtered ad fragments"
            );
        }
        Ok(FilterOutcome {
            lines: out,
            filtered,
        })
    }

    async fn probe_all(&self, lines: &[String], fragment_lines: &[usize]) -> Vec<Entry> {
        futures::stream::iter(fragment_lines.iter().copied())
            .map(|line| {
                let prober = Arc::clone(&self.prober);
                let path = lines[line].trim().to_string();
                async move {
                    match prober.probe(Path::new(&path)).await {
                        Ok(fp) => Entry {
                            line,
                            hash: Some(fp.hash),
                            tuple: fp.tuple,
                            filtered: false,
                        },
                        Err(e) => {
                            tracing::debug!(path = %path, error = %e, "Fragment probe failed");
                            Entry {
                                line,
                                hash: None,
                                tuple: None,
                                filtered: false,
                            }
                        }
                    }
                }
            })
            .buffered(self.probe_workers)
            .collect()
            .await
    }

    fn classify(&self, entries: &mut [Entry], canonical: FingerprintTuple) {
        for entry in entries.iter_mut().filter(|e| !e.parse_error()) {
            let known = self.blacklist.as_ref().is_some_and(|bl| {
                entry.hash.as_deref().is_some_and(|h| bl.contains(h))
                    || bl.contains(&entry.line.to_string())
            });
            if known {
                entry.filtered = true;
                continue;
            }
            if entry.tuple != Some(canonical) {
                entry.filtered = true;
                if let (Some(bl), Some(hash)) = (self.blacklist.as_ref(), entry.hash.as_deref()) {
                    bl.add(hash);
                }
            }
        }
    }
}

/// Non-empty line that is not a tag or comment
pub(crate) fn is_fragment_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Most frequent signature among readable fragments; ties go to the first seen
fn modal_tuple(entries: &[Entry]) -> Option<FingerprintTuple> {
    let mut counts: HashMap<FingerprintTuple, (usize, usize)> = HashMap::new();
    for (order, tuple) in entries.iter().filter_map(|e| e.tuple).enumerate() {
        counts.entry(tuple).or_insert((0, order)).0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (ca, oa)), (_, (cb, ob))| ca.cmp(cb).then(ob.cmp(oa)))
        .map(|(tuple, _)| tuple)
}

/// Unreadable fragments are dropped when they bookend the program; elsewhere they
/// mean the manifest cannot be trusted.
fn settle_parse_errors(entries: &mut [Entry]) -> Result<()> {
    let mut kept = entries.iter().filter(|e| !e.filtered).map(|e| e.line);
    let first = kept.next();
    let last = kept.last().or(first);

    for entry in entries.iter_mut().filter(|e| e.parse_error()) {
        if Some(entry.line) == first || Some(entry.line) == last {
            tracing::warn!(line = entry.line, "Dropping unreadable fragment at stream edge");
            entry.filtered = true;
        } else {
            tracing::error!(line = entry.line, "Unreadable fragment inside program content");
            return Err(Error::FingerprintParse(format!(
                "unreadable fragment at manifest line {} is not at the start or end",
                entry.line
            )));
        }
    }
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const PROGRAM: FingerprintTuple = FingerprintTuple {
        time_base: 90000,
        duration: 3003,
        width: 1920,
        height: 1080,
    };
    const AD: FingerprintTuple = FingerprintTuple {
        time_base: 90000,
        duration: 3600,
        width: 1280,
        height: 720,
    };

    /// Prober answering from a table keyed by fragment path
    struct TableProber(HashMap<String, Option<Fingerprint>>);

    #[async_trait]
    impl FragmentProber for TableProber {
        async fn probe(&self, path: &Path) -> Result<Fingerprint> {
            match self.0.get(path.to_string_lossy().as_ref()) {
                Some(Some(fp)) => Ok(fp.clone()),
                Some(None) => Err(Error::Io(std::io::Error::other("unreadable"))),
                None => panic!("unexpected probe of {}", path.display()),
            }
        }
    }

    /// Builds a manifest of `/s/segN.ts` lines with one EXTINF tag per fragment
    fn manifest(tuples: &[Option<FingerprintTuple>]) -> (Vec<String>, TableProber) {
        let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-TARGETDURATION:4".to_string()];
        let mut table = HashMap::new();
        for (i, tuple) in tuples.iter().enumerate() {
            let path = format!("/s/seg{i}.ts");
            lines.push("#EXTINF:4.0,".to_string());
            lines.push(path.clone());
            table.insert(
                path,
                Some(Fingerprint {
                    hash: format!("hash{i}"),
                    tuple: *tuple,
                }),
            );
        }
        lines.push("#EXT-X-ENDLIST".to_string());
        (lines, TableProber(table))
    }

    fn fragment_line(i: usize) -> usize {
        3 + 2 * i
    }

    #[tokio::test]
    async fn deviating_bookends_are_filtered() {
        let mut tuples = vec![Some(PROGRAM); 10];
        tuples[0] = Some(AD);
        tuples[9] = Some(AD);
        let (lines, prober) = manifest(&tuples);
        let filter = AdFilter::new(Arc::new(prober), None, 4);

        let outcome = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.filtered, vec![fragment_line(0), fragment_line(9)]);
        assert_eq!(outcome.lines[fragment_line(0)], "#/s/seg0.ts");
        assert_eq!(outcome.lines[fragment_line(9)], "#/s/seg9.ts");
        for i in 1..9 {
            assert_eq!(outcome.lines[fragment_line(i)], format!("/s/seg{i}.ts"));
        }
        // Tags and ordering untouched
        assert_eq!(outcome.lines.len(), lines.len());
        assert_eq!(outcome.lines[0], "#EXTM3U");
        assert_eq!(outcome.lines.last().unwrap(), "#EXT-X-ENDLIST");
    }

    #[tokio::test]
    async fn mid_stream_ad_is_filtered_and_remembered() {
        let mut tuples = vec![Some(PROGRAM); 10];
        tuples[5] = Some(AD);
        let (lines, prober) = manifest(&tuples);
        let blacklist = Arc::new(MemoryBlacklist::new());
        let filter = AdFilter::new(Arc::new(prober), Some(blacklist.clone()), 2);

        let outcome = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.filtered, vec![fragment_line(5)]);
        assert!(blacklist.contains("hash5"));
        assert!(blacklist.is_dirty());
        assert_eq!(blacklist.len(), 1);
    }

    #[tokio::test]
    async fn known_hash_is_filtered_even_when_it_matches_canonical() {
        let tuples = vec![Some(PROGRAM); 4];
        let (lines, prober) = manifest(&tuples);
        let blacklist = Arc::new(MemoryBlacklist::with_keys(["hash2"]));
        let filter = AdFilter::new(Arc::new(prober), Some(blacklist.clone()), 2);

        let outcome = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.filtered, vec![fragment_line(2)]);
        assert!(!blacklist.is_dirty(), "known hashes are not re-added");
    }

    #[tokio::test]
    async fn positional_key_marks_fragment_as_known() {
        let tuples = vec![Some(PROGRAM); 3];
        let (lines, prober) = manifest(&tuples);
        let key = fragment_line(1).to_string();
        let blacklist = Arc::new(MemoryBlacklist::with_keys([key]));
        let filter = AdFilter::new(Arc::new(prober), Some(blacklist), 1);

        let outcome = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.filtered, vec![fragment_line(1)]);
    }

    #[tokio::test]
    async fn unreadable_edge_fragments_are_dropped() {
        let mut tuples = vec![Some(PROGRAM); 5];
        tuples[0] = None;
        tuples[4] = None;
        let (lines, prober) = manifest(&tuples);
        let filter = AdFilter::new(Arc::new(prober), None, 3);

        let outcome = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.filtered, vec![fragment_line(0), fragment_line(4)]);
    }

    #[tokio::test]
    async fn probe_failure_counts_as_unreadable() {
        let tuples = vec![Some(PROGRAM); 3];
        let (lines, mut prober) = manifest(&tuples);
        prober.0.insert("/s/seg2.ts".to_string(), None);
        let filter = AdFilter::new(Arc::new(prober), None, 3);

        let outcome = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.filtered, vec![fragment_line(2)]);
    }

    #[tokio::test]
    async fn unreadable_fragment_mid_stream_is_fatal() {
        let mut tuples = vec![Some(PROGRAM); 5];
        tuples[2] = None;
        let (lines, prober) = manifest(&tuples);
        let filter = AdFilter::new(Arc::new(prober), None, 3);

        let err = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FingerprintParse(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn nothing_readable_is_fatal() {
        let tuples = vec![None; 3];
        let (lines, prober) = manifest(&tuples);
        let filter = AdFilter::new(Arc::new(prober), None, 3);

        let err = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FingerprintParse(_)));
    }

    #[tokio::test]
    async fn manifest_without_fragments_passes_through() {
        let lines = vec!["#EXTM3U".to_string(), String::new()];
        let filter = AdFilter::new(Arc::new(TableProber(HashMap::new())), None, 1);

        let outcome = filter
            .filter_lines(&lines, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.lines, lines);
        assert!(outcome.filtered.is_empty());
    }

    #[test]
    fn modal_tie_prefers_first_seen() {
        let entries: Vec<Entry> = [AD, PROGRAM, PROGRAM, AD]
            .into_iter()
            .enumerate()
            .map(|(line, t)| Entry {
                line,
                hash: None,
                tuple: Some(t),
                filtered: false,
            })
            .collect();
        assert_eq!(modal_tuple(&entries), Some(AD));
    }
}
