//! Audio and subtitle retention policy.
//!
//! Single tracks are always kept. When a file carries several tracks of one
//! kind we keep the preferred language plus anything untagged, and fall back to
//! the first track by stream order when nothing matches. The policy is lossy:
//! foreign-language tracks alongside an English one are dropped.

use serde::{Deserialize, Serialize};

/// Language tags that mean "nobody labelled this track".
const UNTAGGED: &[&str] = &["und", "unk", "unknown", "mis", "zxx", ""];

/// Retention settings handed to the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackPolicy {
    /// Lowercased language tag to keep (e.g. "eng").
    pub preferred_language: String,
}

/// Which tracks of one kind survive the remux.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSelection {
    /// Absolute stream indices to keep, in stream order.
    pub retained: Vec<u32>,
    /// Stream index to flag as default among the retained tracks.
    pub primary: Option<u32>,
    /// Stream indices that will be dropped.
    pub dropped: Vec<u32>,
}

impl TrackSelection {
    /// Keep every track; the first default-flagged one (or the first) is primary.
    pub fn keep_all(tracks: &[(u32, Option<&str>, bool)]) -> Self {
        let retained: Vec<u32> = tracks.iter().map(|(i, _, _)| *i).collect();
        Self {
            primary: pick_primary(tracks, &retained),
            retained,
            dropped: Vec::new(),
        }
    }

    /// Nothing would be removed.
    pub fn is_noop(&self) -> bool {
        self.dropped.is_empty()
    }
}

fn is_untagged(language: Option<&str>) -> bool {
    match language {
        None => true,
        Some(l) => UNTAGGED.contains(&l.trim().to_lowercase().as_str()),
    }
}

fn pick_primary(tracks: &[(u32, Option<&str>, bool)], retained: &[u32]) -> Option<u32> {
    tracks
        .iter()
        .find(|(i, _, is_default)| *is_default && retained.contains(i))
        .map(|(i, _, _)| *i)
        .or_else(|| retained.first().copied())
}

/// Applies the retention policy to one kind of track.
///
/// `tracks` holds `(stream index, language tag, default flag)` in stream order.
pub fn select_tracks(tracks: &[(u32, Option<&str>, bool)], policy: &TrackPolicy) -> TrackSelection {
    if tracks.len() <= 1 {
        return TrackSelection::keep_all(tracks);
    }

    let preferred = policy.preferred_language.to_lowercase();
    let has_preferred = tracks
        .iter()
        .any(|(_, lang, _)| lang.map(|l| l.to_lowercase() == preferred).unwrap_or(false));

    let retained: Vec<u32> = if has_preferred {
        tracks
            .iter()
            .filter(|(_, lang, _)| {
                is_untagged(*lang) || lang.map(|l| l.to_lowercase() == preferred).unwrap_or(false)
            })
            .map(|(i, _, _)| *i)
            .collect()
    } else {
        // No track in the preferred language; keep the first one only
        vec![tracks[0].0]
    };

    let dropped = tracks
        .iter()
        .map(|(i, _, _)| *i)
        .filter(|i| !retained.contains(i))
        .collect();

    TrackSelection {
        primary: pick_primary(tracks, &retained),
        retained,
        dropped,
    }
}
