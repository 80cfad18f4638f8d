//! Durable mail between agents: typed messages, broadcast groups,
//! auto-nudge markers, and debounced delivery.

pub mod broker;
pub mod groups;
pub mod nudge;

pub use broker::{MailBroker, SendRequest};
pub use groups::Groups;
pub use nudge::PendingNudge;
