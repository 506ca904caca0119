//! Connection lifecycle: state, reconnect policy, readiness and subscription bookkeeping

pub mod policy;
pub mod readiness;
pub mod registry;
pub mod state;
pub(crate) mod supervisor;

pub use policy::{MaxReconnectAttempts, ReconnectDecision, ReconnectPolicy};
pub use readiness::{AttemptOutcome, ReadinessSignal};
pub use registry::{DeliveryMode, MessageHandler, SubscriptionIntent, SubscriptionStatus};
pub use state::ConnectionState;
pub use supervisor::{ClientEvent, SessionSnapshot};
