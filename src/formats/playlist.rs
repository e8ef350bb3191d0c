//! Line-level HLS manifest handling
//!
//! Only what the downloader needs: telling master from media manifests, picking
//! the highest-resolution variant, and listing or rewriting fragment references.
//! Master manifests go through `m3u8-rs`; media manifests stay line-level so tag
//! lines survive verbatim into the rewritten copy.

use crate::adblock::is_fragment_line;
use crate::error::{Error, Result};
use url::Url;

/// A variant stream listed in a master manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variant {
    /// Reference as written in the manifest
    pub uri: String,
    /// Width x height from the variant's `RESOLUTION` attribute, if any
    pub resolution: Option<(u64, u64)>,
}

impl Variant {
    /// Pixel area; variants without a resolution count as 0
    pub fn area(&self) -> u64 {
        self.resolution.map(|(w, h)| w * h).unwrap_or(0)
    }
}

/// Parsed manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Playlist {
    /// Lists variant manifests
    Master(Vec<Variant>),
    /// Lists fragments
    Media(MediaPlaylist),
}

/// Media manifest: the original lines plus the positions of fragment references
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaPlaylist {
    lines: Vec<String>,
    fragments: Vec<usize>,
}

impl MediaPlaylist {
    /// Manifest lines, trimmed
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Fragment references in playback order
    pub fn fragment_refs(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().map(|&i| self.lines[i].as_str())
    }

    /// Number of fragments
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Fragment references resolved against the manifest url
    pub fn fragment_urls(&self, base: &Url) -> Result<Vec<Url>> {
        self.fragment_refs().map(|r| join(base, r)).collect()
    }

    /// Lines with the i-th fragment reference replaced by `replacements[i]`
    ///
    /// # Errors
    ///
    /// [`Error::ManifestParse`] when the replacement count differs from the
    /// fragment count.
    pub fn rewrite(&self, replacements: &[String]) -> Result<Vec<String>> {
        if replacements.len() != self.fragments.len() {
            return Err(Error::ManifestParse(format!(
                "{} replacements for {} fragments",
                replacements.len(),
                self.fragments.len()
            )));
        }
        let mut lines = self.lines.clone();
        for (&line, replacement) in self.fragments.iter().zip(replacements) {
            lines[line] = replacement.clone();
        }
        Ok(lines)
    }
}

/// Whether a reference points at another manifest (query and fragment ignored)
fn is_manifest_ref(reference: &str) -> bool {
    reference
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
        .ends_with(".m3u8")
}

/// Parse manifest text
///
/// A manifest is a master manifest when any non-tag line references another
/// manifest. Its variants are the `#EXT-X-STREAM-INF` streams (I-frame streams
/// skipped). Manifests `m3u8-rs` cannot read are scanned line by line instead: a
/// `RESOLUTION=WxH` in any tag line applies to the references that follow it.
///
/// # Errors
///
/// [`Error::ManifestParse`] for an empty manifest or a media manifest without
/// fragments.
pub fn parse(text: &str) -> Result<Playlist> {
    let lines: Vec<String> = text.lines().map(|l| l.trim().to_string()).collect();
    if lines.iter().all(|l| l.is_empty()) {
        return Err(Error::ManifestParse("manifest is empty".to_string()));
    }

    let refs: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| is_fragment_line(l))
        .map(|(i, _)| i)
        .collect();

    if refs.iter().any(|&i| is_manifest_ref(&lines[i])) {
        return Ok(Playlist::Master(master_variants(text, &lines)));
    }

    if refs.is_empty() {
        return Err(Error::ManifestParse(
            "media manifest lists no fragments".to_string(),
        ));
    }
    Ok(Playlist::Media(MediaPlaylist {
        lines,
        fragments: refs,
    }))
}

fn master_variants(text: &str, lines: &[String]) -> Vec<Variant> {
    match m3u8_rs::parse_master_playlist_res(text.as_bytes()) {
        Ok(master) if master.variants.iter().any(|v| !v.is_i_frame) => master
            .variants
            .into_iter()
            .filter(|v| !v.is_i_frame)
            .map(|v| Variant {
                uri: v.uri,
                resolution: v.resolution.map(|r| (r.width, r.height)),
            })
            .collect(),
        Ok(_) => loose_variants(lines),
        Err(e) => {
            tracing::debug!(error = %e, "Master manifest is not strict HLS, scanning lines");
            loose_variants(lines)
        }
    }
}

/// Every reference, sized by the most recent `RESOLUTION=WxH` seen in a tag line
fn loose_variants(lines: &[String]) -> Vec<Variant> {
    let mut resolution = None;
    let mut variants = Vec::new();
    for line in lines {
        if line.starts_with('#') {
            if let Some(found) = resolution_attr(line) {
                resolution = Some(found);
            }
        } else if !line.is_empty() {
            variants.push(Variant {
                uri: line.clone(),
                resolution,
            });
        }
    }
    variants
}

fn resolution_attr(line: &str) -> Option<(u64, u64)> {
    let (_, rest) = line.split_once("RESOLUTION=")?;
    let value = rest.split([',', ' ']).next()?;
    let (w, h) = value.split_once(['x', 'X'])?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Highest-area variant; the first one wins among equals
pub fn select_variant(variants: &[Variant]) -> Option<&Variant> {
    let mut best: Option<&Variant> = None;
    for variant in variants {
        if best.is_none_or(|b| variant.area() > b.area()) {
            best = Some(variant);
        }
    }
    best
}

/// Resolve a manifest reference against the manifest's own url
pub fn join(base: &Url, reference: &str) -> Result<Url> {
    base.join(reference)
        .map_err(|e| Error::ManifestParse(format!("bad reference `{}`: {}", reference, e)))
}
