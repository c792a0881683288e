//! # fleetdeck-core
//!
//! Keeps a live, cross-referenced model of cluster resources in step with the
//! server's change feed.
//!
//! ## Design Principles
//!
//! - **Fire and forget**: reconciliation spawns its fetch-then-mutate steps and
//!   returns at once. The graph converges eventually; nothing waits on it.
//! - **Order-agnostic**: changes may arrive late, twice, or out of order. Every
//!   handler recomputes from the resource's current state, so replays are no-ops.
//! - **One instance per id**: the [`Store`] is an identity map. Collections hold
//!   shared handles, so a change to a resource is visible everywhere it is listed.
//! - **Locks never cross awaits**: resource locks are `parking_lot` guards taken
//!   and dropped inside synchronous sections.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fleetdeck_core::{MemoryStore, ManualTransport, Subscription, SyncConfig};
//!
//! let config = load_sync_config()?;
//! let mut subscription = Subscription::new(transport, store, &config);
//! subscription.enter(Some("1a5"));
//! subscription.run(&mut events).await;
//! ```

pub mod audit;
pub mod bootstrap;
pub mod config;
pub mod decoder;
pub mod error;
pub mod lifecycle;
pub mod reconcile;
pub mod resource;
pub mod session;
pub mod store;
pub mod transport;

pub use audit::{check_links, collection_sizes, orphaned_members, LinkViolation, Problem};
pub use bootstrap::{ProjectSelector, Selection, PREFERENCE_KIND, PROJECT_KIND};
pub use config::*;
pub use decoder::{Change, ChangeDecoder, ResourceChange};
pub use error::{Result, StoreError, SyncError};
pub use lifecycle::{subscribe_url, ConnectionState, ConnectionStats, Subscription};
pub use reconcile::{handler_for, Handler, IncludeRule, Pending, Reconciler, HANDLERS};
pub use resource::{Resource, ResourceKey, ResourceRef, STATE_ACTIVE};
pub use session::{MemoryPreferences, MemorySession, Preferences, SessionStore};
pub use store::{FindOptions, MemoryStore, Store};
pub use transport::{ManualTransport, Transport, TransportEvent};
