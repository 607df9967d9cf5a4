//! Upstream Fleet API: HTTP client, vehicle operations, and auth helpers.

pub mod auth;
pub mod client;
pub mod vehicle;

pub use client::FleetClient;
pub use vehicle::VehicleApi;
