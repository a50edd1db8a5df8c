mod ids;

pub use ids::{event_id, subscription_id};
