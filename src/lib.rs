//! Software transactional memory over versioned cells.
//!
//! # Architecture
//!
//! - **Objects** ([`TxnObject`]) hold their last committed record behind an
//!   epoch-protected pointer, a lock word and a lock-free list of blocked waiters.
//! - **Reads** are optimistic: no locks, consistency comes from a global
//!   [`VersionClock`] and the isolation level of the transaction.
//! - **Writes** go to per-transaction drafts. Locks are taken only inside
//!   commit, in object id order, through a pluggable [`CommitLockPolicy`].
//! - **Blocking**: [`Transaction::retry`] parks the thread until one of the
//!   objects it read is changed by another commit.
//!
//! # Example
//!
//! ```
//! use vstm::Stm;
//!
//! let stm = Stm::new();
//! let from = stm.object(100i64);
//! let to = stm.object(0i64);
//!
//! stm.atomically(|tx| {
//!     let amount = 30;
//!     *tx.open_for_write(&from)? -= amount;
//!     *tx.open_for_write(&to)? += amount;
//!     Ok(())
//! })
//! .unwrap();
//!
//! assert_eq!(from.atomic_get(), Some(70));
//! assert_eq!(to.atomic_get(), Some(30));
//! ```

mod attached;
mod backoff;
mod clock;
mod config;
pub mod context;
mod errors;
mod factory;
mod latch;
mod listeners;
mod lock_policy;
mod object;
mod speculative;
mod tranlocal;
mod transaction;

pub use backoff::{BackoffAction, BackoffPolicy, ExponentialBackoff, NoBackoff};
pub use clock::{ClockMode, INITIAL_VERSION, VersionClock};
pub use config::{IsolationLevel, StmConfig, TransactionFactoryBuilder, TxnConfig};
pub use errors::StmError;
pub use factory::TransactionFactory;
pub use latch::{AwaitOutcome, Latch};
pub use lock_policy::{CommitLockPolicy, FailFast, LockRequest, SpinAndRetry, release_acquired};
pub use object::{LockMode, ObjectHandle, Registration, TxnObject};
pub use speculative::{SpeculativeProfile, StorageKind};
pub use tranlocal::{Tracked, Tranlocal};
pub use transaction::{InterruptHandle, Transaction, TxnStatus};

use dashmap::DashMap;
use std::sync::Arc;

/// Name of the family used by [`Stm::atomically`] and [`Stm::execute`].
pub const DEFAULT_FAMILY: &str = "default";

/// The STM engine: version clock, defaults and learned family profiles.
pub struct Stm {
    clock: VersionClock,
    config: StmConfig,
    default_txn: Arc<TxnConfig>,
    families: DashMap<String, Arc<SpeculativeProfile>>,
}

impl Stm {
    pub fn new() -> Self {
        Self::with_config(StmConfig::default())
    }

    pub fn with_config(config: StmConfig) -> Self {
        let mut default_txn = TxnConfig::from_stm(&config);
        default_txn.family = DEFAULT_FAMILY.to_string();
        default_txn.anonymous = false;
        default_txn.max_array_size = default_txn.max_array_size.max(1);
        Self {
            clock: VersionClock::new(config.clock),
            config,
            default_txn: Arc::new(default_txn),
            families: DashMap::new(),
        }
    }

    pub fn clock(&self) -> &VersionClock {
        &self.clock
    }

    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Create an object committed with `value`, visible to every transaction.
    pub fn object<T: Tracked>(&self, value: T) -> TxnObject<T> {
        TxnObject::committed(value, INITIAL_VERSION)
    }

    /// Create an object without committed state. A transaction must construct
    /// it with [`Transaction::open_for_construction`] before it can be read.
    pub fn unborn<T: Tracked>(&self) -> TxnObject<T> {
        TxnObject::unborn()
    }

    /// Configure a transaction family.
    pub fn factory(&self) -> TransactionFactoryBuilder<'_> {
        TransactionFactoryBuilder::new(self)
    }

    fn default_factory(&self) -> TransactionFactory<'_> {
        TransactionFactory::new(self, Arc::clone(&self.default_txn))
    }

    /// Run `body` atomically in the default family.
    ///
    /// See [`TransactionFactory::atomically`].
    pub fn atomically<R, F>(&self, body: F) -> Result<R, StmError>
    where
        F: FnMut(&mut Transaction<'_>) -> Result<R, StmError>,
    {
        self.default_factory().atomically(body)
    }

    /// Run `body` atomically in the default family with the transaction bound
    /// to the current thread.
    ///
    /// See [`TransactionFactory::execute`].
    pub fn execute<R, F>(&self, body: F) -> Result<R, StmError>
    where
        F: FnMut() -> Result<R, StmError>,
    {
        self.default_factory().execute(body)
    }

    /// Speculative profile shared by every factory of a named family.
    pub(crate) fn family_profile(&self, family: &str) -> Arc<SpeculativeProfile> {
        if let Some(profile) = self.families.get(family) {
            return Arc::clone(&profile);
        }
        self.families
            .entry(family.to_string())
            .or_insert_with(|| Arc::new(SpeculativeProfile::lean(family)))
            .clone()
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Stm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stm")
            .field("clock", &self.clock.current())
            .field("config", &self.config)
            .field("families", &self.families.len())
            .finish()
    }
}
