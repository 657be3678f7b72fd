// crates/service-gate-core/src/lib.rs
// ============================================================================
// Module: Service Gate Core Library
// Description: Public API surface for the Service Gate domain core.
// Purpose: Expose capability, credential, directory, and RBAC primitives.
// Dependencies: crate::{capability, records, directory, rbac, ...}
// ============================================================================

//! ## Overview
//! Service Gate core holds the transport-free half of the gateway: the
//! capability algebra used to scope application grants, short-lived access
//! tokens, minute-bucket request signatures, the watch-synchronized provider
//! directory, callback filter matching, and the non-resource RBAC resolver
//! that binds authorization decisions to a backend service.
//!
//! Nothing here performs HTTP. Server crates compose these pieces into
//! request pipelines.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod access_token;
pub mod cache;
pub mod capability;
pub mod clock;
pub mod directory;
pub mod filter;
pub mod identity;
pub mod rbac;
pub mod records;
pub mod signature;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use access_token::AccessTokenError;
pub use access_token::AccessTokenRequest;
pub use access_token::AccessTokenService;
pub use access_token::IssuedToken;
pub use cache::TtlCache;
pub use capability::DecodedOp;
pub use capability::PermissionRequirement;
pub use capability::decode_op;
pub use clock::Clock;
pub use clock::FixedClock;
pub use clock::SystemClock;
pub use directory::DirectoryError;
pub use directory::ProviderDirectory;
pub use filter::matches_filters;
pub use identity::TenantIdentity;
pub use identity::UserInfo;
pub use rbac::Decision;
pub use rbac::RbacResolver;
pub use rbac::RequestAttributes;
pub use records::ApplicationCredential;
pub use records::ProviderKind;
pub use records::ProviderRecord;
pub use records::RecordState;
pub use signature::SignatureError;
pub use signature::SignatureValidator;
pub use store::DirectoryStore;
pub use store::InMemoryDirectoryStore;
pub use store::StoreError;
