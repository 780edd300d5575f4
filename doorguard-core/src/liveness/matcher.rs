// Nearest-neighbour matching of a live embedding against stored encodings

use crate::data_structures::UserId;
use crate::directory::StoredEncoding;
use crate::liveness::types::{Classification, Embedding, MatchedUser};
use log::{debug, warn};
use std::collections::HashMap;

pub struct EmbeddingMatcher {
    pub match_threshold: f64,
    pub separation_margin: f64,
}

impl EmbeddingMatcher {
    pub fn new(match_threshold: f64, separation_margin: f64) -> Self {
        EmbeddingMatcher { match_threshold, separation_margin }
    }

    /// Matches `probe` against every stored encoding. Candidates are compared
    /// per user (closest encoding of each user), so a user enrolled with
    /// several encodings never competes with themselves.
    pub fn classify(&self, probe: &Embedding, store: &[StoredEncoding]) -> Classification {
        if store.is_empty() {
            return Classification::RegistrationNeeded;
        }

        let mut per_user: HashMap<&UserId, f64> = HashMap::new();
        for stored in store {
            match probe.distance(&stored.embedding) {
                Some(d) => {
                    let best = per_user.entry(&stored.user_id).or_insert(f64::INFINITY);
                    if d < *best {
                        *best = d;
                    }
                }
                None => warn!(
                    "[Matcher] Skipping encoding {} of {}: dimension {} != probe {}",
                    stored.encoding_id,
                    stored.user_id,
                    stored.embedding.0.len(),
                    probe.0.len()
                ),
            }
        }

        let mut ranked: Vec<(&UserId, f64)> = per_user.into_iter().collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let Some(&(best_user, best)) = ranked.first() else {
            return Classification::Unmatched;
        };
        if best > self.match_threshold {
            debug!("[Matcher] Best candidate {} too far ({:.3} > {:.3})", best_user, best, self.match_threshold);
            return Classification::Unmatched;
        }
        if let Some(&(runner_up, second)) = ranked.get(1) {
            if second - best <= self.separation_margin {
                warn!(
                    "[Matcher] Ambiguous match between {} ({:.3}) and {} ({:.3})",
                    best_user, best, runner_up, second
                );
                return Classification::Unmatched;
            }
        }

        Classification::Matched(MatchedUser {
            user_id: best_user.clone(),
            distance: best,
            confidence: (1.0 - best).clamp(0.0, 1.0),
        })
    }
}
