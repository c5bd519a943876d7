//! Repository traits for registry operations.

pub mod accounts;
pub mod clients;
pub mod hubs;
pub mod label_links;
pub mod services;

pub use accounts::AccountRepo;
pub use clients::ClientRepo;
pub use hubs::{HubCheckin, HubRepo};
pub use label_links::LabelLinkRepo;
pub use services::{NewService, ServiceRepo};
