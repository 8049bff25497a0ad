use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::Stm;
use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use crate::clock::ClockMode;
use crate::errors::StmError;
use crate::factory::TransactionFactory;
use crate::lock_policy::{CommitLockPolicy, SpinAndRetry};

static ANONYMOUS_FAMILIES: AtomicU64 = AtomicU64::new(1);

/// Transaction isolation level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Every read sees the latest committed record. Only writes are validated.
    ReadCommitted,
    /// The whole transaction reads one snapshot. Write skew is possible.
    #[default]
    Snapshot,
    /// Snapshot plus commit-time validation of everything read.
    Serializable,
}

impl IsolationLevel {
    pub fn is_write_skew_allowed(self) -> bool {
        self != IsolationLevel::Serializable
    }

    /// Whether reads must come from the transaction's snapshot.
    pub fn reads_snapshot(self) -> bool {
        self != IsolationLevel::ReadCommitted
    }
}

/// Process-level defaults of an [`Stm`].
#[derive(Debug, Clone)]
pub struct StmConfig {
    pub clock: ClockMode,
    pub isolation: IsolationLevel,
    pub max_retries: u32,
    pub spin_credits: u32,
    pub max_array_size: usize,
    pub speculative: bool,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::Strict,
            isolation: IsolationLevel::Snapshot,
            max_retries: 1000,
            spin_credits: 16,
            max_array_size: 20,
            speculative: true,
        }
    }
}

/// Immutable tuning parameters of a transaction family.
#[derive(Clone)]
pub struct TxnConfig {
    pub(crate) family: String,
    pub(crate) anonymous: bool,
    pub(crate) readonly: Option<bool>,
    pub(crate) read_tracking: bool,
    pub(crate) interruptible: bool,
    pub(crate) blocking_allowed: bool,
    pub(crate) max_retries: u32,
    pub(crate) timeout: Option<Duration>,
    pub(crate) backoff: Arc<dyn BackoffPolicy>,
    pub(crate) lock_policy: Arc<dyn CommitLockPolicy>,
    pub(crate) isolation: IsolationLevel,
    pub(crate) dirty_check: bool,
    pub(crate) speculative: bool,
    pub(crate) max_array_size: usize,
}

impl TxnConfig {
    pub(crate) fn from_stm(config: &StmConfig) -> Self {
        Self {
            family: format!(
                "anonymous-{}",
                ANONYMOUS_FAMILIES.fetch_add(1, Ordering::Relaxed)
            ),
            anonymous: true,
            readonly: None,
            read_tracking: true,
            interruptible: false,
            blocking_allowed: true,
            max_retries: config.max_retries,
            timeout: None,
            backoff: Arc::new(ExponentialBackoff::MAX_100_MS),
            lock_policy: Arc::new(SpinAndRetry::new(config.spin_credits, 1)),
            isolation: config.isolation,
            dirty_check: true,
            speculative: config.speculative,
            max_array_size: config.max_array_size,
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Explicit readonly setting; `None` lets the speculative profile decide.
    pub fn readonly(&self) -> Option<bool> {
        self.readonly
    }

    pub fn is_read_tracking_enabled(&self) -> bool {
        self.read_tracking
    }

    pub fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    pub fn is_blocking_allowed(&self) -> bool {
        self.blocking_allowed
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn is_dirty_check_enabled(&self) -> bool {
        self.dirty_check
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    pub fn max_array_size(&self) -> usize {
        self.max_array_size
    }

    fn validate(&self) -> Result<(), StmError> {
        if self.max_array_size == 0 {
            return Err(StmError::Config(
                "max array size must be at least 1".to_string(),
            ));
        }
        if self.isolation == IsolationLevel::Serializable && !self.read_tracking {
            return Err(StmError::Config(
                "serializable isolation requires read tracking".to_string(),
            ));
        }
        if self.family.is_empty() {
            return Err(StmError::Config("family name can't be empty".to_string()));
        }
        if self.timeout == Some(Duration::ZERO) && self.blocking_allowed {
            return Err(StmError::Config(
                "a zero timeout leaves no time to block, disable blocking instead".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for TxnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnConfig")
            .field("family", &self.family)
            .field("readonly", &self.readonly)
            .field("read_tracking", &self.read_tracking)
            .field("interruptible", &self.interruptible)
            .field("blocking_allowed", &self.blocking_allowed)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("isolation", &self.isolation)
            .field("dirty_check", &self.dirty_check)
            .field("speculative", &self.speculative)
            .field("max_array_size", &self.max_array_size)
            .finish()
    }
}

/// Builder for a [`TransactionFactory`]. Obtained from [`Stm::factory`].
pub struct TransactionFactoryBuilder<'a> {
    stm: &'a Stm,
    config: TxnConfig,
}

impl<'a> TransactionFactoryBuilder<'a> {
    pub(crate) fn new(stm: &'a Stm) -> Self {
        Self {
            stm,
            config: TxnConfig::from_stm(stm.config()),
        }
    }

    /// Name the family; named families share their speculative profile.
    pub fn family(mut self, name: impl Into<String>) -> Self {
        self.config.family = name.into();
        self.config.anonymous = false;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.config.readonly = Some(readonly);
        self
    }

    pub fn read_tracking(mut self, enabled: bool) -> Self {
        self.config.read_tracking = enabled;
        self
    }

    pub fn interruptible(mut self, interruptible: bool) -> Self {
        self.config.interruptible = interruptible;
        self
    }

    pub fn blocking_allowed(mut self, allowed: bool) -> Self {
        self.config.blocking_allowed = allowed;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Budget for all blocking waits of one `atomically` call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn backoff(mut self, policy: impl BackoffPolicy + 'static) -> Self {
        self.config.backoff = Arc::new(policy);
        self
    }

    pub fn lock_policy(mut self, policy: impl CommitLockPolicy + 'static) -> Self {
        self.config.lock_policy = Arc::new(policy);
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.config.isolation = isolation;
        self
    }

    pub fn dirty_check(mut self, enabled: bool) -> Self {
        self.config.dirty_check = enabled;
        self
    }

    pub fn speculative(mut self, enabled: bool) -> Self {
        self.config.speculative = enabled;
        self
    }

    pub fn max_array_size(mut self, size: usize) -> Self {
        self.config.max_array_size = size;
        self
    }

    /// Validate the combination and create the factory.
    pub fn build(self) -> Result<TransactionFactory<'a>, StmError> {
        self.config.validate()?;
        Ok(TransactionFactory::new(self.stm, Arc::new(self.config)))
    }
}
