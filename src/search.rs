//! Profile search: bounded-time filtering over the hosted and neighbor
//! repositories, with a per-session cache for paged retrieval.
//!
//! The repositories are scanned in batches with a cheap prefilter (wildcard
//! name/type, bounding box); exact haversine distance and the extra-data
//! regex run in memory on the candidates. The scan never holds store locks
//! across batches — it reads committed state and the covered-servers list is
//! not guaranteed atomic with the query.

use crate::handlers::{reply, reply_error, Handled};
use crate::net::message::{
    ConversationPayload, ConversationResponse, ProfileSearchQuery, ProfileSearchResult,
    SearchRecord, Status, ThumbnailBytes,
};
use crate::net::serde_safe::BoundedVec;
use crate::net::server::ServerContext;
use crate::net::session::Session;
use crate::types::{
    GeoLocation, ImageId, MAX_RESPONSE_RECORDS_WITHOUT_IMAGES, MAX_RESPONSE_RECORDS_WITH_IMAGES,
    MAX_TOTAL_RECORDS_WITHOUT_IMAGES, MAX_TOTAL_RECORDS_WITH_IMAGES, SEARCH_REGEX_BUDGET_MS,
    SEARCH_REGEX_PER_PROFILE_MS, SEARCH_TIME_BUDGET_MS,
};
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// =============================================================================
// WILDCARD MATCHING
// =============================================================================

/// Case-insensitive wildcard match: `*` any run, `?` any single char.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[char], v: &[char]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &v[1..]),
            (Some(pc), Some(vc)) => pc == vc && inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.to_lowercase().chars().collect();
    let v: Vec<char> = value.to_lowercase().chars().collect();
    inner(&p, &v)
}

/// True when the pattern matches everything.
fn is_match_all(pattern: &str) -> bool {
    pattern.is_empty() || pattern == "*"
}

// =============================================================================
// REGEX BUDGET
// =============================================================================

/// Extra-data regex matching runs under a total budget and a per-profile
/// budget; a profile whose match overruns either is a non-match.
struct RegexBudget {
    regex: Regex,
    spent: Duration,
}

impl RegexBudget {
    fn new(regex: Regex) -> Self {
        Self {
            regex,
            spent: Duration::ZERO,
        }
    }

    fn matches(&mut self, value: &str) -> bool {
        if self.spent >= Duration::from_millis(SEARCH_REGEX_BUDGET_MS) {
            return false;
        }
        let start = Instant::now();
        let matched = self.regex.is_match(value);
        let elapsed = start.elapsed();
        self.spent += elapsed;
        matched && elapsed < Duration::from_millis(SEARCH_REGEX_PER_PROFILE_MS)
    }
}

// =============================================================================
// SEARCH
// =============================================================================

struct Candidate {
    record: SearchRecord,
    thumbnail: Option<ImageId>,
}

pub async fn profile_search(
    ctx: &Arc<ServerContext>,
    session: &Arc<Session>,
    query: ProfileSearchQuery,
) -> Handled {
    let (max_response_cap, max_total_cap) = if query.include_thumbnail_images {
        (MAX_RESPONSE_RECORDS_WITH_IMAGES, MAX_TOTAL_RECORDS_WITH_IMAGES)
    } else {
        (
            MAX_RESPONSE_RECORDS_WITHOUT_IMAGES,
            MAX_TOTAL_RECORDS_WITHOUT_IMAGES,
        )
    };

    if query.max_response_record_count == 0
        || query.max_response_record_count > max_response_cap
        || query.max_response_record_count > query.max_total_record_count
    {
        return reply_error(Status::invalid("maxResponseRecordCount"));
    }
    if query.max_total_record_count == 0 || query.max_total_record_count > max_total_cap {
        return reply_error(Status::invalid("maxTotalRecordCount"));
    }
    if query.name.len() > 64 {
        return reply_error(Status::invalid("name"));
    }
    if query.profile_type.len() > 64 {
        return reply_error(Status::invalid("type"));
    }
    if query.extra_data.len() > 256 {
        return reply_error(Status::invalid("extraData"));
    }

    let center = GeoLocation::new(query.latitude, query.longitude);
    let location_filter = query.radius_m > 0;
    if location_filter && !center.is_valid() {
        let field = if query.latitude.is_finite() && (-90.0..=90.0).contains(&query.latitude) {
            "longitude"
        } else {
            "latitude"
        };
        return reply_error(Status::invalid(field));
    }

    let mut regex_budget = if query.extra_data.is_empty() {
        None
    } else {
        match Regex::new(&query.extra_data) {
            Ok(r) => Some(RegexBudget::new(r)),
            Err(_) => return reply_error(Status::invalid("extraData")),
        }
    };

    let deadline = Instant::now() + Duration::from_millis(SEARCH_TIME_BUDGET_MS);
    let max_total = query.max_total_record_count as usize;
    let mut candidates: Vec<Candidate> = Vec::new();

    // Bounding box for the repository-level prefilter; exact distance is
    // checked per candidate.
    let bbox = location_filter.then(|| {
        let lat_delta = query.radius_m as f64 / 111_000.0;
        let lon_delta =
            query.radius_m as f64 / (111_000.0 * center.latitude.to_radians().cos().abs().max(0.01));
        (
            center.latitude - lat_delta,
            center.latitude + lat_delta,
            center.longitude - lon_delta,
            center.longitude + lon_delta,
        )
    });
    let in_bbox = |lat: f64, lon: f64| match bbox {
        Some((lat_min, lat_max, lon_min, lon_max)) => {
            lat >= lat_min && lat <= lat_max && lon >= lon_min && lon <= lon_max
        }
        None => true,
    };

    // Hosted repository first.
    let mut offset = 0usize;
    'hosted: while candidates.len() < max_total && Instant::now() < deadline {
        let remaining = max_total - candidates.len();
        let batch_size = (10 * remaining).max(1000);
        let batch = match ctx.store.scan_hosted(
            |p| {
                (is_match_all(&query.name) || wildcard_match(&query.name, &p.name))
                    && (is_match_all(&query.profile_type)
                        || wildcard_match(&query.profile_type, &p.profile_type))
                    && in_bbox(p.latitude, p.longitude)
            },
            offset,
            batch_size,
        ) {
            Ok(b) => b,
            Err(e) => {
                warn!("hosted scan failed: {}", e);
                return reply_error(Status::Internal);
            }
        };
        let exhausted = batch.len() < batch_size;
        offset += batch.len();

        for profile in batch {
            if Instant::now() >= deadline {
                break 'hosted;
            }
            if location_filter {
                let loc = GeoLocation::new(profile.latitude, profile.longitude);
                if center.distance_m(&loc) > query.radius_m as f64 {
                    continue;
                }
            }
            if let Some(budget) = regex_budget.as_mut() {
                if !budget.matches(&profile.extra_data) {
                    continue;
                }
            }
            candidates.push(Candidate {
                record: SearchRecord {
                    is_hosted: true,
                    server_id: ctx.server_id,
                    identity_id: profile.identity_id,
                    version: profile.version,
                    name: profile.name,
                    profile_type: profile.profile_type,
                    latitude: profile.latitude,
                    longitude: profile.longitude,
                    extra_data: profile.extra_data,
                    thumbnail_image: ThumbnailBytes::default(),
                },
                thumbnail: profile.thumbnail_image,
            });
            if candidates.len() >= max_total {
                break 'hosted;
            }
        }

        if exhausted {
            break;
        }
    }

    // Neighbor repository, unless hosted-only or already full.
    let mut searched_neighbors = false;
    if !query.include_hosted_only && candidates.len() < max_total && Instant::now() < deadline {
        searched_neighbors = true;
        let mut offset = 0usize;
        'neighbor: while candidates.len() < max_total && Instant::now() < deadline {
            let remaining = max_total - candidates.len();
            let batch_size = (10 * remaining).max(1000);
            let batch = match ctx.store.scan_neighbor_profiles(
                |p| {
                    (is_match_all(&query.name) || wildcard_match(&query.name, &p.name))
                        && (is_match_all(&query.profile_type)
                            || wildcard_match(&query.profile_type, &p.profile_type))
                        && in_bbox(p.latitude, p.longitude)
                },
                offset,
                batch_size,
            ) {
                Ok(b) => b,
                Err(e) => {
                    warn!("neighbor scan failed: {}", e);
                    return reply_error(Status::Internal);
                }
            };
            let exhausted = batch.len() < batch_size;
            offset += batch.len();

            for profile in batch {
                if Instant::now() >= deadline {
                    break 'neighbor;
                }
                if location_filter {
                    let loc = GeoLocation::new(profile.latitude, profile.longitude);
                    if center.distance_m(&loc) > query.radius_m as f64 {
                        continue;
                    }
                }
                if let Some(budget) = regex_budget.as_mut() {
                    if !budget.matches(&profile.extra_data) {
                        continue;
                    }
                }
                candidates.push(Candidate {
                    record: SearchRecord {
                        is_hosted: false,
                        server_id: profile.neighbor_id,
                        identity_id: profile.identity_id,
                        version: profile.version,
                        name: profile.name,
                        profile_type: profile.profile_type,
                        latitude: profile.latitude,
                        longitude: profile.longitude,
                        extra_data: profile.extra_data,
                        thumbnail_image: ThumbnailBytes::default(),
                    },
                    thumbnail: profile.thumbnail_image,
                });
                if candidates.len() >= max_total {
                    break 'neighbor;
                }
            }

            if exhausted {
                break;
            }
        }
    }

    // Attach thumbnails after filtering so only surviving records pay the
    // blob reads.
    let mut records: Vec<SearchRecord> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let mut record = candidate.record;
        if query.include_thumbnail_images {
            if let Some(id) = candidate.thumbnail {
                if let Ok(Some(data)) = ctx.images.read(&id).await {
                    record.thumbnail_image = ThumbnailBytes::new_unchecked(data);
                }
            }
        }
        records.push(record);
    }

    // Covered servers: local only, or local plus every neighbor consulted.
    let mut covered = vec![ctx.server_id];
    if searched_neighbors {
        match ctx.store.list_neighbor_servers() {
            Ok(neighbors) => covered.extend(neighbors.into_iter().map(|n| n.neighbor_id)),
            Err(e) => warn!("covered-servers listing failed: {}", e),
        }
    }
    covered.truncate(256);

    let total = records.len() as u32;
    let max_response = query.max_response_record_count as usize;
    let immediate = if records.len() > max_response {
        let rest = records.clone();
        session.state().await.search_cache = Some(rest);
        records.truncate(max_response);
        records
    } else {
        session.state().await.search_cache = None;
        records
    };

    debug!(
        "search: {} records ({} returned), neighbors: {}",
        total,
        immediate.len(),
        searched_neighbors
    );

    reply(ConversationResponse::ok(ConversationPayload::ProfileSearch(
        Box::new(ProfileSearchResult {
            total_record_count: total,
            max_response_record_count: query.max_response_record_count,
            covered_servers: BoundedVec::new_unchecked(covered),
            records: BoundedVec::new_unchecked(immediate),
        }),
    )))
}

/// Slice `[record_index, record_index + record_count)` out of the session's
/// cached search result.
pub async fn profile_search_part(
    session: &Arc<Session>,
    record_index: u32,
    record_count: u32,
) -> Handled {
    if record_count == 0 || record_count > 1_000 {
        return reply_error(Status::invalid("recordCount"));
    }

    let state = session.state().await;
    let Some(cache) = state.search_cache.as_ref() else {
        return reply_error(Status::NotAvailable);
    };

    let index = record_index as usize;
    let count = record_count as usize;
    if index >= cache.len() {
        return reply_error(Status::invalid("recordIndex"));
    }
    if index + count > cache.len() {
        return reply_error(Status::invalid("recordCount"));
    }

    let records = cache[index..index + count].to_vec();
    drop(state);

    reply(ConversationResponse::ok(
        ConversationPayload::ProfileSearchPart {
            records: BoundedVec::new_unchecked(records),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_basics() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("al?ce", "Alice"));
        assert!(wildcard_match("al*", "alice"));
        assert!(wildcard_match("*ce", "Alice"));
        assert!(!wildcard_match("al?ce", "ace"));
        assert!(!wildcard_match("bob", "alice"));
        assert!(wildcard_match("", ""));
        assert!(!wildcard_match("", "x"));
    }

    #[test]
    fn test_wildcard_case_insensitive() {
        assert!(wildcard_match("ALICE", "alice"));
        assert!(wildcard_match("a*E", "AlicE"));
    }

    #[test]
    fn test_regex_budget_total_exhaustion() {
        let mut budget = RegexBudget::new(Regex::new("x").unwrap());
        budget.spent = Duration::from_millis(SEARCH_REGEX_BUDGET_MS);
        assert!(!budget.matches("x"));
    }

    #[test]
    fn test_regex_budget_normal_match() {
        let mut budget = RegexBudget::new(Regex::new("^chat:").unwrap());
        assert!(budget.matches("chat:enabled"));
        assert!(!budget.matches("voice:enabled"));
    }
}
