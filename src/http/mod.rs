//! HTTP layer: routing, error mapping and the depot request flow.

pub mod depot;
pub mod handler;
