//! HubSpot adapters for the formsync pipeline.
//!
//! Raw HTTP against the public REST API (no SDK):
//!
//! - [`HubSpotFormSource`]: form-integrations v1 submissions, `limit`/`after` paging
//! - [`HubSpotContacts`]: CRM v3 contacts search, batch read, PATCH and batch update
//!
//! Every response carries the `X-HubSpot-RateLimit-*` headers back to the
//! rate governor as [`formsync_core::RateFeedback`].

mod client;
mod contacts;
mod source;
pub mod wire;

pub use client::{rate_feedback, ApiFailure, ApiResponse, HubSpotClient, HubSpotConfig};
pub use contacts::HubSpotContacts;
pub use source::HubSpotFormSource;

/// Environment variable holding the private app token.
pub const TOKEN_ENV: &str = "HUBSPOT_PRIVATE_APP_TOKEN";

/// Public API host.
pub const DEFAULT_BASE_URL: &str = "https://api.hubapi.com";
