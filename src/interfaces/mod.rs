//! Trait seams and the shared error type.
//!
//! The session protocol only talks to the database through these traits,
//! which keeps the advisory-lock dance independent of any one driver.

mod connection;
mod error;

pub use connection::{ConnectionProvider, StoreConnection};
pub use error::{Result, StoreError};
