//! Identifier generation for bus events and subscriptions.
//!
//! Bus event ids keep the `<millis>-<random>` shape so they sort roughly by
//! emission time and stay readable in persisted filenames. Uniqueness comes
//! from the random suffix; uuid already pulls in a CSPRNG so we reuse it
//! instead of adding a rand dependency.

use chrono::Utc;
use uuid::Uuid;

fn random_suffix() -> u128 {
    Uuid::new_v4().as_u128() % 1_000_000
}

/// Generate an event id: `"<epoch-millis>-<random>"`.
pub fn event_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), random_suffix())
}

/// Generate a subscription id: `"sub-<epoch-millis>-<random>"`.
pub fn subscription_id() -> String {
    format!("sub-{}-{}", Utc::now().timestamp_millis(), random_suffix())
}
