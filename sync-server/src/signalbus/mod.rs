//! Signal bus: level-triggered wakeups keyed by signal name.
//!
//! Mutation handlers call [`SignalBus::notify`] after they commit; every
//! watch stream subscribed to that name wakes and re-reads the data it
//! cares about. Signals carry no payload and coalesce: any number of
//! notifies before a subscriber drains its slot count as one wake.
//!
//! Two implementations:
//! - [`MemSignalBus`] - in-process registry
//! - [`PgSignalBus`] - relays notifies between replicas over a Postgres
//!   notify channel, delivering locally only when the notification echoes back

mod local;
mod pg;

pub use local::{MemSignalBus, Subscription};
pub use pg::{
    ListenerOptions, NotificationSource, NotifyPublisher, PgNotificationSource, PgPublisher,
    PgSignalBus,
};

/// Payload that wakes every subscription on every replica.
pub const NOTIFY_ALL: &str = "*";

/// Publish/subscribe interface shared by both bus implementations.
pub trait SignalBus: Send + Sync {
    /// Wake every subscription under `name`. Never blocks.
    fn notify(&self, name: &str);

    /// Wake every subscription regardless of name.
    fn notify_all(&self);

    /// Subscribe to `name`. The subscription is released when closed or dropped.
    fn subscribe(&self, name: &str) -> Subscription;
}

/// Signal name for changes to an organization's devices.
pub fn devices_signal(organization: &uuid::Uuid) -> String {
    format!("/devices/org={organization}")
}

/// Signal name for changes to an organization's security groups.
pub fn security_groups_signal(organization: &uuid::Uuid) -> String {
    format!("/security-groups/org={organization}")
}

/// Signal name for changes to an organization's device metadata.
pub fn metadata_signal(organization: &uuid::Uuid) -> String {
    format!("/metadata/org={organization}")
}
