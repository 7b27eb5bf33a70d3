//! Core types and protocol limits shared across the node.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every wire collection and payload has an
//!    explicit size limit enforced at deserialization.
//!
//! 2. **One address everywhere** — identities are addressed by the SHA-256
//!    of their Ed25519 public key, on the wire and in storage.
//!
//! 3. **Declarative gating** — every request names the listener roles and the
//!    conversation status it requires; the dispatcher enforces both before a
//!    handler runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// SHA-256 digest.
pub type Hash = [u8; 32];

/// Identity address: SHA-256 of the identity's Ed25519 public key.
pub type IdentityId = [u8; 32];

/// Ed25519 public key bytes.
pub type PublicKeyBytes = [u8; 32];

/// Opaque id of one side of an application-service relay.
pub type RelayToken = [u8; 16];

/// Opaque id of an image blob file on disk.
pub type ImageId = [u8; 16];

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Frame cap: 4-byte big-endian length prefix, body at most 1 MiB.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Safety margin subtracted from the frame cap when packing replication
/// batches, so a batch serialized with its envelope still fits one frame.
pub const FRAME_SAFETY_MARGIN: usize = 32;

/// Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;

/// Conversation challenge length.
pub const CHALLENGE_SIZE: usize = 32;

// =============================================================================
// PROTOCOL LIMITS
// =============================================================================

/// Maximum UTF-8 byte length of a profile name.
pub const MAX_NAME_BYTES: usize = 64;

/// Maximum UTF-8 byte length of a profile type.
pub const MAX_TYPE_BYTES: usize = 64;

/// Maximum UTF-8 byte length of profile extra data.
pub const MAX_EXTRA_DATA_BYTES: usize = 512;

/// Maximum profile image size (PNG or JPEG).
pub const MAX_IMAGE_BYTES: usize = 512 * 1024;

/// Maximum thumbnail image size. Thumbnails travel in search responses and
/// neighborhood updates; a full response of 100 image-bearing records must
/// still fit one frame.
pub const MAX_THUMBNAIL_BYTES: usize = 8 * 1024;

/// Maximum application services one session may register.
pub const MAX_APPLICATION_SERVICES: usize = 32;

/// Maximum UTF-8 byte length of an application service name.
pub const MAX_SERVICE_NAME_BYTES: usize = 32;

/// Maximum payload of one relayed application-service message.
pub const MAX_APP_MESSAGE_BYTES: usize = 512 * 1024;

/// Maximum items in one neighborhood shared-profile update.
pub const MAX_UPDATE_ITEMS: usize = 1_000;

/// Neighborhood updates are applied in transactions of at most this many items.
pub const UPDATE_APPLY_BATCH: usize = 100;

/// Search response cap when thumbnails are included / excluded.
pub const MAX_RESPONSE_RECORDS_WITH_IMAGES: u32 = 100;
pub const MAX_RESPONSE_RECORDS_WITHOUT_IMAGES: u32 = 1_000;

/// Search total cap when thumbnails are included / excluded.
pub const MAX_TOTAL_RECORDS_WITH_IMAGES: u32 = 1_000;
pub const MAX_TOTAL_RECORDS_WITHOUT_IMAGES: u32 = 10_000;

/// Ping payload cap.
pub const MAX_PING_PAYLOAD: usize = 32;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Default idle keep-alive: sessions with no decoded frame for this long are
/// closed by the sweeper.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// A relay not paired on the app-service port within this window is destroyed.
pub const RELAY_PAIRING_TIMEOUT_SECS: u64 = 60;

/// The callee must answer an incoming call notification within this window.
pub const INCOMING_CALL_TIMEOUT_SECS: u64 = 30;

/// Total wall-clock budget of one profile search.
pub const SEARCH_TIME_BUDGET_MS: u64 = 15_000;

/// Total budget for extra-data regex matching within one search.
pub const SEARCH_REGEX_BUDGET_MS: u64 = 1_000;

/// Per-profile budget for extra-data regex matching; over budget = non-match.
pub const SEARCH_REGEX_PER_PROFILE_MS: u64 = 25;

/// A cancelled hosting agreement with a redirect stays queryable this long.
pub const REDIRECT_RETENTION_SECS: u64 = 14 * 24 * 3600;

/// A follower being initialized blocks its action queue for this long before
/// the blocker is considered stale.
pub const INITIALIZATION_BLOCK_SECS: u64 = 20 * 60;

// =============================================================================
// SERVER ROLES
// =============================================================================

/// Role flags, one per listening endpoint.
pub type RoleSet = u8;

/// Plain TCP discovery endpoint (`ListRoles`).
pub const ROLE_PRIMARY: RoleSet = 1 << 0;
/// Server-to-server neighborhood replication.
pub const ROLE_SERVER_NEIGHBOR: RoleSet = 1 << 1;
/// Unverified clients: registration, verification, search, calls.
pub const ROLE_CLIENT_NON_CUSTOMER: RoleSet = 1 << 2;
/// Hosted-identity check-in, profile and relation operations.
pub const ROLE_CLIENT_CUSTOMER: RoleSet = 1 << 3;
/// Application-service relay endpoints.
pub const ROLE_CLIENT_APP_SERVICE: RoleSet = 1 << 4;

pub fn role_name(role: RoleSet) -> &'static str {
    match role {
        ROLE_PRIMARY => "primary",
        ROLE_SERVER_NEIGHBOR => "server-neighbor",
        ROLE_CLIENT_NON_CUSTOMER => "client-non-customer",
        ROLE_CLIENT_CUSTOMER => "client-customer",
        ROLE_CLIENT_APP_SERVICE => "client-app-service",
        _ => "unknown",
    }
}

// =============================================================================
// SEMANTIC VERSION
// =============================================================================

/// Three-byte semantic version used for protocol and profile versioning.
///
/// `INVALID` (0.0.0) is the sentinel for an uninitialized profile; a profile
/// is initialized iff its version is not `INVALID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemVer(pub u8, pub u8, pub u8);

impl SemVer {
    pub const INVALID: SemVer = SemVer(0, 0, 0);

    /// The only protocol version currently spoken.
    pub const V1: SemVer = SemVer(1, 0, 0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl Default for SemVer {
    fn default() -> Self {
        SemVer::INVALID
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

// =============================================================================
// CONVERSATION STATE MACHINE
// =============================================================================

/// Conversation status of one session.
///
/// ```text
///               StartConversation
///   ┌──────┐   (version + challenge)   ┌─────────┐
///   │ None │──────────────────────────►│ Started │
///   └──────┘                           └────┬────┘
///                          VerifyIdentity   │   CheckIn
///                      ┌────────────────────┴──────────────────┐
///                      ▼                                       ▼
///                ┌──────────┐                          ┌───────────────┐
///                │ Verified │                          │ Authenticated │
///                └──────────┘                          └───────────────┘
/// ```
///
/// Statuses are ordered: `Authenticated` satisfies a `Verified` gate, and any
/// non-`None` status satisfies a `Started` gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConversationStatus {
    None,
    Started,
    Verified,
    Authenticated,
}

/// Required conversation status of a request, checked by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusGate {
    /// Conversation must not have started yet.
    NoneOnly,
    /// Any status at or past `Started`.
    Started,
    /// `Verified` or `Authenticated`.
    Verified,
    /// `Authenticated` only; failure maps to `Unauthorized`.
    Authenticated,
    /// Alias of `Started` for requests that only need a live conversation.
    Any,
}

impl StatusGate {
    pub fn admits(&self, status: ConversationStatus) -> bool {
        match self {
            StatusGate::NoneOnly => status == ConversationStatus::None,
            StatusGate::Started | StatusGate::Any => status >= ConversationStatus::Started,
            StatusGate::Verified => status >= ConversationStatus::Verified,
            StatusGate::Authenticated => status == ConversationStatus::Authenticated,
        }
    }
}

// =============================================================================
// GEOGRAPHIC LOCATION
// =============================================================================

/// Profile location in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance to `other` in meters (haversine).
    pub fn distance_m(&self, other: &GeoLocation) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semver_sentinel() {
        assert!(!SemVer::INVALID.is_valid());
        assert!(SemVer::V1.is_valid());
        assert_eq!(SemVer::V1.to_string(), "1.0.0");
    }

    #[test]
    fn test_status_ordering() {
        assert!(StatusGate::Verified.admits(ConversationStatus::Authenticated));
        assert!(StatusGate::Started.admits(ConversationStatus::Verified));
        assert!(!StatusGate::Verified.admits(ConversationStatus::Started));
        assert!(!StatusGate::Authenticated.admits(ConversationStatus::Verified));
        assert!(StatusGate::NoneOnly.admits(ConversationStatus::None));
        assert!(!StatusGate::NoneOnly.admits(ConversationStatus::Started));
    }

    #[test]
    fn test_location_bounds() {
        assert!(GeoLocation::new(90.0, 180.0).is_valid());
        assert!(GeoLocation::new(-90.0, -180.0).is_valid());
        assert!(!GeoLocation::new(90.01, 0.0).is_valid());
        assert!(!GeoLocation::new(0.0, -180.01).is_valid());
        assert!(!GeoLocation::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_haversine_prague_berlin() {
        // Prague -> Berlin is roughly 280 km.
        let prague = GeoLocation::new(50.075, 14.437);
        let berlin = GeoLocation::new(52.520, 13.405);
        let d = prague.distance_m(&berlin);
        assert!((270_000.0..290_000.0).contains(&d), "distance {}", d);
    }

    #[test]
    fn test_haversine_zero() {
        let p = GeoLocation::new(50.0, 14.4);
        assert!(p.distance_m(&p) < 1e-6);
    }
}
