//! Capability traits the router and reconciler rely on.
//!
//! A [`Shard`] is one capacity-bounded world. It knows its own occupancy and
//! can take ownership of a [`Connection`], but it never decides where a
//! connection goes. Routing lives in [`crate::router`].

use crate::error::HandoffError;

/// A client transport handle that can be handed to a world.
pub trait Connection: Send + 'static {
    /// Stable identifier used to prevent double admission.
    fn id(&self) -> u32;

    /// Best-effort close. Never fails, even if the peer is already gone.
    fn close(self, reason: &str);
}

/// A global population figure tagged with the order in which it was read.
///
/// Epochs increase with every store read, so a world can drop an update that
/// was overtaken by a newer one while it was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopulationUpdate {
    pub epoch: u64,
    pub total: u64,
}

/// Emitted by a world whenever its occupancy changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulationEvent {
    EntityAdded { world: usize, client_id: u32 },
    EntityRemoved { world: usize, client_id: u32 },
}

pub trait Shard: Send + Sync + 'static {
    type Conn: Connection;

    fn name(&self) -> &str;

    /// Maximum concurrent connections, fixed at creation.
    fn capacity(&self) -> usize;

    fn occupancy(&self) -> usize;

    /// Attach a connection, incrementing occupancy by one.
    ///
    /// Fails without mutating anything if the world is full, not yet running,
    /// or already holds this connection.
    fn accept_handoff(&self, conn: Self::Conn) -> Result<(), HandoffError<Self::Conn>>;

    /// Apply a new global population figure.
    ///
    /// Returns true when the update changed what the world shows its players.
    /// Stale epochs and repeated totals are ignored.
    fn update_population(&self, update: PopulationUpdate) -> bool;

    fn has_capacity(&self) -> bool {
        self.occupancy() < self.capacity()
    }
}
