use std::sync::Arc;
use tracing::{debug, warn};

use crate::Stm;
use crate::config::TxnConfig;
use crate::context;
use crate::errors::StmError;
use crate::speculative::SpeculativeProfile;
use crate::transaction::Transaction;

/// Creates transactions of one family and runs bodies atomically.
///
/// Obtained from [`Stm::factory`]. The factory owns the family's speculative
/// profile, so later runs start with the shape earlier runs learned.
pub struct TransactionFactory<'a> {
    stm: &'a Stm,
    config: Arc<TxnConfig>,
    profile: Arc<SpeculativeProfile>,
}

impl<'a> TransactionFactory<'a> {
    pub(crate) fn new(stm: &'a Stm, config: Arc<TxnConfig>) -> Self {
        let profile = if !config.speculative {
            Arc::new(SpeculativeProfile::fat(config.family.clone()))
        } else if config.anonymous {
            Arc::new(SpeculativeProfile::lean(config.family.clone()))
        } else {
            stm.family_profile(&config.family)
        };
        Self {
            stm,
            config,
            profile,
        }
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn profile(&self) -> &SpeculativeProfile {
        &self.profile
    }

    /// Start a transaction driven by the caller.
    ///
    /// The caller commits or aborts it; dropping it aborts.
    pub fn begin(&self) -> Transaction<'a> {
        Transaction::new(self.stm, Arc::clone(&self.config), Arc::clone(&self.profile))
    }

    /// Run `body` in a transaction until it commits.
    ///
    /// Conflicts abort the attempt and run `body` again after the backoff;
    /// [`StmError::Retry`] blocks until something the attempt read changes.
    /// Any other error aborts the transaction and is returned as is.
    pub fn atomically<R, F>(&self, mut body: F) -> Result<R, StmError>
    where
        F: FnMut(&mut Transaction<'a>) -> Result<R, StmError>,
    {
        let mut txn = self.begin();
        self.run(&mut txn, |txn| body(txn))
    }

    /// Like [`TransactionFactory::atomically`], with the transaction bound to
    /// the current thread for [`context::with_current`] and the ambient
    /// object operations.
    ///
    /// Joins the ambient transaction when one is already bound.
    pub fn execute<R, F>(&self, mut body: F) -> Result<R, StmError>
    where
        F: FnMut() -> Result<R, StmError>,
    {
        if context::has_current() {
            return body();
        }
        let mut txn = self.begin();
        self.run(&mut txn, |txn| {
            let _bound = context::bind(txn);
            body()
        })
    }

    fn run<R, F>(&self, txn: &mut Transaction<'a>, mut attempt: F) -> Result<R, StmError>
    where
        F: FnMut(&mut Transaction<'a>) -> Result<R, StmError>,
    {
        let mut retries = 0u32;
        loop {
            let err = match attempt(txn).and_then(|value| txn.commit().map(|()| value)) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let blocked = match err {
                // The profile was fattened; run again right away, for free.
                StmError::SpeculativeFailure => {
                    txn.restart();
                    continue;
                }
                StmError::Retry => {
                    let woken = txn.await_change();
                    txn.abort_quietly();
                    woken?;
                    true
                }
                err if err.is_control_flow() => {
                    debug!(
                        txn = txn.id(),
                        family = %self.config.family,
                        attempt = txn.attempt(),
                        error = %err,
                        "transaction conflict"
                    );
                    txn.abort_quietly();
                    false
                }
                err => {
                    txn.abort_quietly();
                    return Err(err);
                }
            };

            retries += 1;
            if retries > self.config.max_retries {
                warn!(
                    family = %self.config.family,
                    max_retries = self.config.max_retries,
                    "transaction retry budget exhausted"
                );
                return Err(StmError::TooManyRetries {
                    family: self.config.family.clone(),
                    max_retries: self.config.max_retries,
                });
            }
            if !blocked {
                self.config.backoff.backoff(retries).perform();
            }
            txn.restart();
        }
    }
}
