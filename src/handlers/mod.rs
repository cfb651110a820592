//! Domain collaborators bound to the consumers.
//!
//! The consumer core only sees the outcome of these handlers. Each one
//! delegates to a narrow store trait; the in-memory stores back standalone
//! mode and tests.

pub mod fleet;
pub mod images;
pub mod riders;

pub use fleet::{FleetRegistry, InMemoryFleetRegistry, RenameLicencePlate};
pub use images::RiderImageStore;
pub use riders::{InMemoryRiderDirectory, RiderDirectory, UpsertRider};
