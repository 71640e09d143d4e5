pub mod confidence;
pub mod offer;
pub mod regions;
pub mod session;
pub mod vector;

pub use confidence::Confidence;
pub use offer::{
    company_key, normalize_number, ContactInformation, FieldRef, FieldKind, Guarantee, LoanOffer,
    NumericRange, OfferTerms, SchemaField, TriState, MISSING,
};
pub use session::{clamp_title, ConversationTurn, Role, Session, SessionKind, SessionSummary, DEFAULT_TITLE};
pub use vector::VectorHit;
