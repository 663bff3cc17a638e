//! Runtime options for [`super::CacheServer::serve`].

use std::fmt;

use chrono::TimeDelta;

use crate::domain::{Session, Target};
use crate::refresh::{RefreshOptions, RetrievalFn};
use crate::tokens::TokenReaderFn;
use crate::{Error, Result};

/// Options passed when the cache server starts serving.
///
/// Unset intervals and factor fall back to the [`super::DaemonConfig`] values.
/// A setter that rejects its input leaves the options unchanged.
#[derive(Clone, Default)]
pub struct Options {
    debug: bool,
    refresh_interval: Option<TimeDelta>,
    recheck_support_interval: Option<TimeDelta>,
    interval_randomization_factor: f64,
    interval_randomization_factor_set: bool,
    token_reader: Option<TokenReaderFn>,
    retrieval: RefreshOptions,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable store diagnostics.
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn set_refresh_interval(&mut self, interval: TimeDelta) -> Result<()> {
        if interval <= TimeDelta::zero() {
            return Err(Error::validation(format!(
                "refresh interval {interval} must be positive"
            )));
        }
        self.refresh_interval = Some(interval);
        Ok(())
    }

    pub fn set_recheck_support_interval(&mut self, interval: TimeDelta) -> Result<()> {
        if interval <= TimeDelta::zero() {
            return Err(Error::validation(format!(
                "recheck support interval {interval} must be positive"
            )));
        }
        self.recheck_support_interval = Some(interval);
        Ok(())
    }

    /// Set the jitter factor. `0` disables jitter.
    pub fn set_interval_randomization_factor(&mut self, factor: f64) -> Result<()> {
        if factor.is_nan() || factor < 0.0 {
            return Err(Error::validation(format!(
                "interval randomization factor {factor} must be non negative"
            )));
        }
        if factor.is_infinite() {
            return Err(Error::validation(format!(
                "interval randomization factor {factor} must be finite"
            )));
        }
        self.interval_randomization_factor = factor;
        self.interval_randomization_factor_set = true;
        Ok(())
    }

    pub fn set_token_reader(&mut self, reader: TokenReaderFn) {
        self.token_reader = Some(reader);
    }

    pub fn set_target_retrieval_fn(&mut self, f: RetrievalFn<Target>) {
        self.retrieval = std::mem::take(&mut self.retrieval).with_target_retrieval_fn(f);
    }

    pub fn set_session_retrieval_fn(&mut self, f: RetrievalFn<Session>) {
        self.retrieval = std::mem::take(&mut self.retrieval).with_session_retrieval_fn(f);
    }

    pub fn with_token_reader(mut self, reader: TokenReaderFn) -> Self {
        self.set_token_reader(reader);
        self
    }

    pub fn with_target_retrieval_fn(mut self, f: RetrievalFn<Target>) -> Self {
        self.set_target_retrieval_fn(f);
        self
    }

    pub fn with_session_retrieval_fn(mut self, f: RetrievalFn<Session>) -> Self {
        self.set_session_retrieval_fn(f);
        self
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn refresh_interval(&self) -> Option<TimeDelta> {
        self.refresh_interval
    }

    pub fn recheck_support_interval(&self) -> Option<TimeDelta> {
        self.recheck_support_interval
    }

    /// The factor, if one was set explicitly (including `0`).
    pub fn interval_randomization_factor(&self) -> Option<f64> {
        self.interval_randomization_factor_set
            .then_some(self.interval_randomization_factor)
    }

    pub fn token_reader(&self) -> Option<&TokenReaderFn> {
        self.token_reader.as_ref()
    }

    pub fn retrieval(&self) -> &RefreshOptions {
        &self.retrieval
    }

    /// Remove the token reader, returning it.
    pub fn take_token_reader(&mut self) -> Option<TokenReaderFn> {
        self.token_reader.take()
    }
}

/// Functions compare by presence only.
impl PartialEq for Options {
    fn eq(&self, other: &Self) -> bool {
        self.debug == other.debug
            && self.refresh_interval == other.refresh_interval
            && self.recheck_support_interval == other.recheck_support_interval
            && self.interval_randomization_factor == other.interval_randomization_factor
            && self.interval_randomization_factor_set == other.interval_randomization_factor_set
            && self.token_reader.is_some() == other.token_reader.is_some()
            && self.retrieval.target_fn().is_some() == other.retrieval.target_fn().is_some()
            && self.retrieval.session_fn().is_some() == other.retrieval.session_fn().is_some()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("debug", &self.debug)
            .field("refresh_interval", &self.refresh_interval)
            .field("recheck_support_interval", &self.recheck_support_interval)
            .field(
                "interval_randomization_factor",
                &self.interval_randomization_factor(),
            )
            .field("token_reader", &self.token_reader.is_some())
            .field("retrieval", &self.retrieval)
            .finish()
    }
}
