//! Wire types shared between the rig daemon and its clients: the
//! environment spec document, the canonical event model, resolved
//! endpoints/wiring, and the HTTP request/response bodies.

pub mod events;
pub mod models;
pub mod spec;
pub mod wiring;
