//! Vehicle command protocol: session keys, metadata, and HMAC signing.

pub mod signer;

pub use signer::{
    compute_hmac_tag, derive_session_info_key, derive_signing_key, verify_session_info_tag,
    CommandSession, SigningMetadata,
};
