//! Wire protocol: envelope, request/response one-ofs, payload types.
//!
//! Every frame carries one `Message { id, body }`. Requests are either
//! `Single` (no conversation context needed) or `Conversation` (gated on the
//! session's conversation status). Responses mirror the split; a response is
//! matched to its request by the envelope id.
//!
//! All variable-length fields deserialize through bounded wrappers, so the
//! frame cap plus these bounds limit what any peer can make us allocate.

use crate::net::serde_safe::{BoundedBytes, BoundedVec};
use crate::types::{
    IdentityId, PublicKeyBytes, RoleSet, SemVer, MAX_APP_MESSAGE_BYTES, MAX_EXTRA_DATA_BYTES,
    MAX_IMAGE_BYTES, MAX_NAME_BYTES, MAX_PING_PAYLOAD, MAX_SERVICE_NAME_BYTES,
    MAX_THUMBNAIL_BYTES, MAX_TYPE_BYTES, MAX_UPDATE_ITEMS,
};
use serde::{Deserialize, Serialize};

/// Envelope id used for the protocol-violation response emitted when a
/// handler fails before a request id is known.
pub const PROTOCOL_VIOLATION_MSG_ID: u32 = 0x0BAD_C0DE;

/// Type aliases for bounded payloads
pub type SignatureBytes = BoundedBytes<64>;
pub type PingPayload = BoundedBytes<MAX_PING_PAYLOAD>;
pub type ImageBytes = BoundedBytes<MAX_IMAGE_BYTES>;
pub type ThumbnailBytes = BoundedBytes<MAX_THUMBNAIL_BYTES>;
pub type AppMessageBytes = BoundedBytes<MAX_APP_MESSAGE_BYTES>;
pub type UpdateItems = BoundedVec<SharedProfileUpdateItem, MAX_UPDATE_ITEMS>;

// =============================================================================
// STATUS CODES
// =============================================================================

/// Response status. `InvalidValue` carries the name of the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ProtocolViolation,
    Unsupported,
    BadRole,
    BadConversationStatus,
    Unauthorized,
    InvalidValue(String),
    InvalidSignature,
    NotFound,
    AlreadyExists,
    QuotaExceeded,
    Uninitialized,
    NotAvailable,
    Rejected,
    Busy,
    Internal,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    pub fn invalid(field: impl Into<String>) -> Status {
        Status::InvalidValue(field.into())
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u32,
    pub body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Response(Response),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Single(SingleRequest),
    Conversation(ConversationRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Single(SingleResponse),
    Conversation(ConversationResponse),
}

impl Message {
    pub fn request(id: u32, req: Request) -> Self {
        Self {
            id,
            body: Body::Request(req),
        }
    }

    pub fn response(id: u32, resp: Response) -> Self {
        Self {
            id,
            body: Body::Response(resp),
        }
    }
}

// =============================================================================
// SINGLE REQUESTS
// =============================================================================
// Requests that need no conversation: liveness, discovery, identity lookup,
// and the token-authenticated app-service endpoints.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SingleRequest {
    /// Echo, any role.
    Ping(PingPayload),

    /// Enumerate active roles with their ports. Primary role only.
    ListRoles,

    /// Look up a profile by identity id.
    GetIdentityInformation {
        identity_id: IdentityId,
        include_profile_image: bool,
        include_thumbnail_image: bool,
        include_application_services: bool,
    },

    /// App-service relay endpoint. The first message on a connection carries
    /// an empty payload and pairs the connection to its relay side; later
    /// messages carry payloads forwarded to the peer.
    ApplicationServiceSendMessage {
        token: crate::types::RelayToken,
        message: AppMessageBytes,
    },

    /// Server-to-client delivery of a relayed payload. Never valid as an
    /// inbound request to the server.
    ApplicationServiceReceiveMessageNotification { message: AppMessageBytes },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleResponse {
    pub status: Status,
    pub payload: SinglePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SinglePayload {
    None,
    Ping(PingPayload),
    ListRoles(BoundedVec<RoleInfo, 8>),
    IdentityInformation(Box<IdentityInfo>),
}

impl SingleResponse {
    pub fn ok(payload: SinglePayload) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn error(status: Status) -> Self {
        Self {
            status,
            payload: SinglePayload::None,
        }
    }
}

/// One advertised listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInfo {
    pub role: RoleSet,
    pub port: u16,
    pub is_tcp: bool,
    pub is_tls: bool,
}

/// Profile lookup result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityInfo {
    pub is_hosted: bool,
    pub is_online: bool,
    pub version: SemVer,
    pub name: String,
    pub profile_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub extra_data: String,
    pub hosting_redirect: Option<IdentityId>,
    pub application_services: BoundedVec<String, 32>,
    pub profile_image: ImageBytes,
    pub thumbnail_image: ThumbnailBytes,
}

// =============================================================================
// CONVERSATION REQUESTS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConversationRequest {
    /// Version negotiation and challenge exchange.
    Start {
        versions: BoundedVec<SemVer, 16>,
        challenge: [u8; 32],
        public_key: PublicKeyBytes,
    },

    /// Prove ownership of the session public key by signing the server
    /// challenge.
    VerifyIdentity {
        challenge: [u8; 32],
        signature: SignatureBytes,
    },

    /// Same proof as `VerifyIdentity`, plus the identity must be hosted here.
    CheckIn {
        challenge: [u8; 32],
        signature: SignatureBytes,
    },

    /// Create or reactivate a hosted identity under a hosting contract.
    RegisterHosting { contract: HostingContract },

    /// Partial profile update with set-flags.
    UpdateProfile(Box<ProfileUpdate>),

    /// End the hosting agreement, optionally leaving a redirect.
    CancelHostingAgreement { redirect: Option<IdentityId> },

    /// Register application services on the checked-in session.
    ApplicationServiceAdd {
        service_names: BoundedVec<String, 32>,
    },

    /// Remove one application service from the checked-in session.
    ApplicationServiceRemove { service_name: String },

    /// Open a call to a hosted identity's application service.
    CallIdentityApplicationService {
        identity_id: IdentityId,
        service_name: String,
    },

    /// Server-to-callee notification of an incoming call. Never valid as an
    /// inbound request to the server.
    IncomingCallNotification {
        caller_public_key: PublicKeyBytes,
        service_name: String,
        callee_token: crate::types::RelayToken,
    },

    /// Profile search.
    ProfileSearch(Box<ProfileSearchQuery>),

    /// Page through cached results of the previous search on this session.
    ProfileSearchPart { record_index: u32, record_count: u32 },

    /// Attach a signed relationship card to the checked-in identity.
    AddRelatedIdentity { card: Box<RelationCard> },

    /// Detach the card of one application id.
    RemoveRelatedIdentity { application_id: [u8; 32] },

    /// Query relationship cards of an identity.
    GetIdentityRelationshipsInformation {
        identity_id: IdentityId,
        include_invalid: bool,
        card_type: Option<String>,
        issuer: Option<PublicKeyBytes>,
    },

    /// Follower asks this server to start streaming its identity snapshot.
    StartNeighborhoodInitialization {
        primary_port: u16,
        neighbor_port: u16,
    },

    /// End of snapshot stream. Sent by the initializing server.
    FinishNeighborhoodInitialization,

    /// Batch of profile changes, both during initialization and afterwards.
    NeighborhoodSharedProfileUpdate { items: UpdateItems },

    /// Follower asks to stop receiving updates.
    StopNeighborhoodUpdates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub status: Status,
    pub payload: ConversationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConversationPayload {
    None,
    Start {
        version: SemVer,
        public_key: PublicKeyBytes,
        /// Signature over the client's challenge, proving the server key.
        signature: SignatureBytes,
        /// Echo of the client challenge.
        client_challenge: [u8; 32],
        /// Challenge the client must sign in `VerifyIdentity` / `CheckIn`.
        challenge: [u8; 32],
    },
    CallIdentityApplicationService {
        caller_token: crate::types::RelayToken,
    },
    ProfileSearch(Box<ProfileSearchResult>),
    ProfileSearchPart {
        records: BoundedVec<SearchRecord, 1_000>,
    },
    IdentityRelationships {
        cards: BoundedVec<RelationCard, 256>,
    },
}

impl ConversationResponse {
    pub fn ok(payload: ConversationPayload) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn error(status: Status) -> Self {
        Self {
            status,
            payload: ConversationPayload::None,
        }
    }
}

// =============================================================================
// PAYLOAD TYPES
// =============================================================================

/// Hosting plan contract presented by a registering client.
///
/// The signature covers `signing_bytes()` and must verify against the key the
/// session started its conversation with. Plan semantics beyond the
/// recognized type literals are not validated here; the network-level plan
/// registry is a separate concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostingContract {
    pub public_key: PublicKeyBytes,
    pub plan_type: String,
    pub valid_from: u64,
    pub signature: SignatureBytes,
}

impl HostingContract {
    pub const RECOGNIZED_PLANS: [&'static str; 2] = ["individual", "organization"];

    /// Bytes the contract signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.plan_type.len() + 8);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(self.plan_type.as_bytes());
        out.extend_from_slice(&self.valid_from.to_be_bytes());
        out
    }
}

/// Partial profile update. A field is applied iff its set-flag is true.
///
/// On the first update of an uninitialized profile the version, name and
/// location flags must all be set. Setting an empty image removes both the
/// profile image and the thumbnail.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileUpdate {
    pub set_version: bool,
    pub version: SemVer,
    pub set_name: bool,
    pub name: String,
    pub set_image: bool,
    pub image: ImageBytes,
    pub thumbnail: ThumbnailBytes,
    pub set_location: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub set_extra_data: bool,
    pub extra_data: String,
}

impl ProfileUpdate {
    pub fn any_set(&self) -> bool {
        self.set_version || self.set_name || self.set_image || self.set_location
            || self.set_extra_data
    }
}

/// Signed relationship card between an issuer and the hosted identity.
///
/// `card_id` is the SHA-256 of the card serialized with `card_id` zeroed and
/// both signatures empty. The issuer signs `card_id`; the recipient signs
/// `card_id ++ issuer_signature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationCard {
    pub card_id: [u8; 32],
    pub card_version: u32,
    pub application_id: [u8; 32],
    pub card_type: String,
    pub valid_from: u64,
    pub valid_to: u64,
    pub issuer_public_key: PublicKeyBytes,
    pub recipient_public_key: PublicKeyBytes,
    pub issuer_signature: SignatureBytes,
    pub recipient_signature: SignatureBytes,
}

impl RelationCard {
    /// Canonical bytes hashed into `card_id`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        let mut normalized = self.clone();
        normalized.card_id = [0u8; 32];
        normalized.issuer_signature = SignatureBytes::default();
        normalized.recipient_signature = SignatureBytes::default();
        crate::net::serde_safe::to_bytes(&normalized)
    }

    /// Bytes the recipient signature covers.
    pub fn recipient_signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.issuer_signature.len());
        out.extend_from_slice(&self.card_id);
        out.extend_from_slice(&self.issuer_signature);
        out
    }
}

/// Profile search filters and limits.
///
/// `name` and `profile_type` are wildcard patterns (`*`, `?`); `radius_m = 0`
/// disables the location filter; an empty `extra_data` disables the regex
/// filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSearchQuery {
    pub name: String,
    pub profile_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: u32,
    pub extra_data: String,
    pub include_thumbnail_images: bool,
    pub include_hosted_only: bool,
    pub max_response_record_count: u32,
    pub max_total_record_count: u32,
}

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRecord {
    pub is_hosted: bool,
    /// Server hosting the identity: our id for hosted rows, the neighbor's
    /// id for replicated rows.
    pub server_id: IdentityId,
    pub identity_id: IdentityId,
    pub version: SemVer,
    pub name: String,
    pub profile_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub extra_data: String,
    pub thumbnail_image: ThumbnailBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSearchResult {
    pub total_record_count: u32,
    pub max_response_record_count: u32,
    pub covered_servers: BoundedVec<IdentityId, 256>,
    pub records: BoundedVec<SearchRecord, 1_000>,
}

// =============================================================================
// NEIGHBORHOOD UPDATE ITEMS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SharedProfileUpdateItem {
    Add(Box<SharedProfileAdd>),
    Change(Box<SharedProfileChange>),
    Delete { identity_id: IdentityId },
    /// Liveness marker: bumps the neighbor's `last_refresh_at`.
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedProfileAdd {
    pub public_key: PublicKeyBytes,
    pub version: SemVer,
    pub name: String,
    pub profile_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub extra_data: String,
    /// Empty = no thumbnail.
    pub thumbnail_image: ThumbnailBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SharedProfileChange {
    pub identity_id: IdentityId,
    pub set_version: bool,
    pub version: SemVer,
    pub set_name: bool,
    pub name: String,
    pub set_location: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub set_extra_data: bool,
    pub extra_data: String,
    pub set_thumbnail: bool,
    /// Empty with `set_thumbnail` = remove the thumbnail.
    pub thumbnail_image: ThumbnailBytes,
}

// =============================================================================
// REQUEST KINDS
// =============================================================================
// Discriminants used to pair responses with the pending requests the server
// sent, and to key the dispatcher's precondition table.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Ping,
    ListRoles,
    GetIdentityInformation,
    ApplicationServiceSendMessage,
    ApplicationServiceReceiveMessageNotification,
    Start,
    VerifyIdentity,
    CheckIn,
    RegisterHosting,
    UpdateProfile,
    CancelHostingAgreement,
    ApplicationServiceAdd,
    ApplicationServiceRemove,
    CallIdentityApplicationService,
    IncomingCallNotification,
    ProfileSearch,
    ProfileSearchPart,
    AddRelatedIdentity,
    RemoveRelatedIdentity,
    GetIdentityRelationshipsInformation,
    StartNeighborhoodInitialization,
    FinishNeighborhoodInitialization,
    NeighborhoodSharedProfileUpdate,
    StopNeighborhoodUpdates,
}

impl SingleRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            SingleRequest::Ping(_) => RequestKind::Ping,
            SingleRequest::ListRoles => RequestKind::ListRoles,
            SingleRequest::GetIdentityInformation { .. } => RequestKind::GetIdentityInformation,
            SingleRequest::ApplicationServiceSendMessage { .. } => {
                RequestKind::ApplicationServiceSendMessage
            }
            SingleRequest::ApplicationServiceReceiveMessageNotification { .. } => {
                RequestKind::ApplicationServiceReceiveMessageNotification
            }
        }
    }
}

impl ConversationRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            ConversationRequest::Start { .. } => RequestKind::Start,
            ConversationRequest::VerifyIdentity { .. } => RequestKind::VerifyIdentity,
            ConversationRequest::CheckIn { .. } => RequestKind::CheckIn,
            ConversationRequest::RegisterHosting { .. } => RequestKind::RegisterHosting,
            ConversationRequest::UpdateProfile(_) => RequestKind::UpdateProfile,
            ConversationRequest::CancelHostingAgreement { .. } => {
                RequestKind::CancelHostingAgreement
            }
            ConversationRequest::ApplicationServiceAdd { .. } => {
                RequestKind::ApplicationServiceAdd
            }
            ConversationRequest::ApplicationServiceRemove { .. } => {
                RequestKind::ApplicationServiceRemove
            }
            ConversationRequest::CallIdentityApplicationService { .. } => {
                RequestKind::CallIdentityApplicationService
            }
            ConversationRequest::IncomingCallNotification { .. } => {
                RequestKind::IncomingCallNotification
            }
            ConversationRequest::ProfileSearch(_) => RequestKind::ProfileSearch,
            ConversationRequest::ProfileSearchPart { .. } => RequestKind::ProfileSearchPart,
            ConversationRequest::AddRelatedIdentity { .. } => RequestKind::AddRelatedIdentity,
            ConversationRequest::RemoveRelatedIdentity { .. } => {
                RequestKind::RemoveRelatedIdentity
            }
            ConversationRequest::GetIdentityRelationshipsInformation { .. } => {
                RequestKind::GetIdentityRelationshipsInformation
            }
            ConversationRequest::StartNeighborhoodInitialization { .. } => {
                RequestKind::StartNeighborhoodInitialization
            }
            ConversationRequest::FinishNeighborhoodInitialization => {
                RequestKind::FinishNeighborhoodInitialization
            }
            ConversationRequest::NeighborhoodSharedProfileUpdate { .. } => {
                RequestKind::NeighborhoodSharedProfileUpdate
            }
            ConversationRequest::StopNeighborhoodUpdates => RequestKind::StopNeighborhoodUpdates,
        }
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Single(r) => r.kind(),
            Request::Conversation(r) => r.kind(),
        }
    }

    pub fn is_conversation(&self) -> bool {
        matches!(self, Request::Conversation(_))
    }
}

/// Upper bounds re-exported for handler validation.
pub const NAME_MAX: usize = MAX_NAME_BYTES;
pub const TYPE_MAX: usize = MAX_TYPE_BYTES;
pub const EXTRA_DATA_MAX: usize = MAX_EXTRA_DATA_BYTES;
pub const SERVICE_NAME_MAX: usize = MAX_SERVICE_NAME_BYTES;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::serde_safe::{from_bytes, to_bytes};

    #[test]
    fn test_envelope_roundtrip() {
        let msg = Message::request(
            3,
            Request::Conversation(ConversationRequest::Start {
                versions: BoundedVec::new_unchecked(vec![SemVer::V1]),
                challenge: [7u8; 32],
                public_key: [9u8; 32],
            }),
        );
        let bytes = to_bytes(&msg).unwrap();
        let decoded: Message = from_bytes(&bytes).unwrap();
        assert_eq!(decoded.id, 3);
        match decoded.body {
            Body::Request(Request::Conversation(ConversationRequest::Start {
                versions,
                challenge,
                ..
            })) => {
                assert_eq!(versions.len(), 1);
                assert_eq!(challenge, [7u8; 32]);
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_update_items_bounded() {
        let items: Vec<SharedProfileUpdateItem> =
            (0..MAX_UPDATE_ITEMS + 1).map(|_| SharedProfileUpdateItem::Refresh).collect();
        let bytes = to_bytes(&items).unwrap();
        assert!(from_bytes::<UpdateItems>(&bytes).is_err());
    }

    #[test]
    fn test_card_canonical_ignores_signatures() {
        let mut card = RelationCard {
            card_id: [0u8; 32],
            card_version: 1,
            application_id: [1u8; 32],
            card_type: "friend".into(),
            valid_from: 100,
            valid_to: 200,
            issuer_public_key: [2u8; 32],
            recipient_public_key: [3u8; 32],
            issuer_signature: SignatureBytes::default(),
            recipient_signature: SignatureBytes::default(),
        };
        let before = card.canonical_bytes().unwrap();

        card.card_id = [9u8; 32];
        card.issuer_signature = SignatureBytes::new_unchecked(vec![5u8; 64]);
        card.recipient_signature = SignatureBytes::new_unchecked(vec![6u8; 64]);
        let after = card.canonical_bytes().unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_request_kind_mapping() {
        let req = Request::Single(SingleRequest::ListRoles);
        assert_eq!(req.kind(), RequestKind::ListRoles);
        assert!(!req.is_conversation());

        let req = Request::Conversation(ConversationRequest::StopNeighborhoodUpdates);
        assert_eq!(req.kind(), RequestKind::StopNeighborhoodUpdates);
        assert!(req.is_conversation());
    }
}
