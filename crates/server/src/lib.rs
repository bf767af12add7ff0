//! Runner binary support: the delegate HTTP control surface, the local
//! exec path and the stream wiring shared by both.

pub mod delegate;
pub mod streams;

pub use crate::delegate::{delegate_router, DelegateState};
