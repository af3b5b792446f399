//! Session identity: the durable client id and the server-issued
//! conversation id.

pub mod identity;

pub use identity::{IdentityError, SessionIdentity};
