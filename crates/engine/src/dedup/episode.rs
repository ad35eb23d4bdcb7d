//! Episode code extraction from file names.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Season and episode number of a TV file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EpisodeCode {
    pub season: u32,
    pub episode: u32,
}

impl std::fmt::Display for EpisodeCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{:02}E{:03}", self.season, self.episode)
    }
}

fn patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // S01E02, s1e002, S01 E02
            Regex::new(r"(?i)(?:^|[^a-z0-9])s(\d{1,2})\s?e(\d{2,3})(?:[^0-9]|$)")
                .expect("static regex"),
            // 1x02, 01x002
            Regex::new(r"(?i)(?:^|[^a-z0-9])(\d{1,2})x(\d{2,3})(?:[^0-9]|$)")
                .expect("static regex"),
        ]
    })
}

/// Finds the first episode code in a file name.
///
/// `S##E##` style wins over `##x##` when both appear. Returns `None` when the
/// name carries no code.
pub fn parse_episode_code(name: &str) -> Option<EpisodeCode> {
    patterns().iter().find_map(|re| {
        let caps = re.captures(name)?;
        Some(EpisodeCode {
            season: caps.get(1)?.as_str().parse().ok()?,
            episode: caps.get(2)?.as_str().parse().ok()?,
        })
    })
}
