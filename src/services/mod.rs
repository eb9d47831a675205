//! Use-case services built on the storage adapter and the event log.

pub mod agents;
pub mod analytics;
pub mod cell_sync;
pub mod cells;
pub mod cursors;
pub mod deferreds;
pub mod event_store;
pub mod locks;
pub mod memory;
pub mod messaging;
pub mod projection;
pub mod reservations;
pub mod store_migration;

pub use agents::AgentService;
pub use analytics::AnalyticsService;
pub use cell_sync::{ImportReport, SyncService};
pub use cells::CellService;
pub use cursors::CursorService;
pub use deferreds::{DeferredOutcome, DeferredService};
pub use event_store::EventService;
pub use locks::LockService;
pub use memory::{FindOptions, MemoryService};
pub use messaging::{InboxEntry, MessageService};
pub use reservations::ReservationService;
