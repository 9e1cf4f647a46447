//! Completion estimate for a finished extraction run.
//!
//! Three signals, combined pessimistically: configuration coverage, an
//! absolute quantity floor that rescues high-volume runs, and a comparison
//! against what peer runs historically found for the same keywords. The
//! estimate is advisory; it never gates importing.

use harvest_core::{ExtractionRun, KeywordConfigState};

/// Coverage below this is considered incomplete on its own.
pub const COVERAGE_FLOOR_PERCENT: u8 = 70;
/// A run that found at least this many postings counts as complete even
/// when configuration coverage was poor.
pub const HIGH_VOLUME_THRESHOLD: i64 = 150;
/// Peer comparison only kicks in for runs that found this few postings
/// or fewer; larger runs speak for themselves.
pub const PEER_COMPARISON_CEILING: i64 = 20;
/// Finding at least this share of the peer average counts as matching it.
pub const PEER_SIMILARITY_FLOOR_PERCENT: f64 = 80.0;

/// Historical comparison input for one keyword of the run.
#[derive(Debug, Clone)]
pub struct KeywordPeer {
    pub keyword: String,
    pub this_run_found: i64,
    /// Average found-count of prior runs for the keyword, `None` when no
    /// peer run ever handled it.
    pub peer_average: Option<f64>,
}

/// Pure estimate in percent. `configs` is the per keyword × configuration
/// bookkeeping of the run; `peers` one entry per keyword.
pub fn estimate(run: &ExtractionRun, configs: &[KeywordConfigState], peers: &[KeywordPeer]) -> u8 {
    // Capped runs bypass coverage: stopping early is the requested
    // behavior, not a shortfall.
    if let Some(cap) = run.result_cap {
        if run.found_count >= i64::from(cap) {
            return 100;
        }
        return peer_signal(100, peers);
    }

    let coverage = coverage_percent(configs);
    if coverage >= 100 {
        return 100;
    }
    // Poor coverage with a large haul still counts as complete; volume is
    // its own evidence that the run worked.
    if coverage < COVERAGE_FLOOR_PERCENT && run.found_count >= HIGH_VOLUME_THRESHOLD {
        return 100;
    }
    if run.found_count <= PEER_COMPARISON_CEILING {
        return peer_signal(coverage, peers);
    }
    coverage
}

fn coverage_percent(configs: &[KeywordConfigState]) -> u8 {
    if configs.is_empty() {
        return 100;
    }
    let handled = configs.iter().filter(|c| c.handled).count();
    ((handled * 100) / configs.len()).min(100) as u8
}

/// Cap `previous` by how far the run fell short of its keyword peers.
/// Keywords with no history contribute nothing.
fn peer_signal(previous: u8, peers: &[KeywordPeer]) -> u8 {
    let mut shortfalls = Vec::new();
    for peer in peers {
        let Some(average) = peer.peer_average else {
            continue;
        };
        if average <= 0.0 {
            continue;
        }
        let ratio = peer.this_run_found as f64 / average * 100.0;
        if ratio >= PEER_SIMILARITY_FLOOR_PERCENT {
            shortfalls.push(0.0);
        } else {
            shortfalls.push(100.0 - ratio);
        }
    }
    if shortfalls.is_empty() {
        return previous;
    }
    let mean = shortfalls.iter().sum::<f64>() / shortfalls.len() as f64;
    let peer_percent = (100.0 - mean).clamp(0.0, 100.0) as u8;
    previous.min(peer_percent)
}
