//! Shared vocabulary for the warden crates: connection status, the operation
//! error taxonomy, registration tokens and the coordination data model.

pub mod errors;
pub mod ids;
pub mod model;
pub mod path;
pub mod status;

pub use errors::{OpError, ResultCode, SessionError};
pub use ids::{RegistrationToken, SubscriptionId};
pub use status::{ConnectionStatus, SessionState};
