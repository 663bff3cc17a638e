//! Per-principal refresh failures.

use std::fmt;

use crate::cache::Principal;
use crate::domain::ResourceType;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The principal's raw token could not be resolved.
    TokenResolution,
    /// The controller cannot issue refresh cursors.
    NotSupported,
    /// The retrieval function failed.
    Retrieval,
    /// Reading or committing cached state failed.
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub address: String,
    pub auth_token_id: String,
    pub resource_type: Option<ResourceType>,
    pub kind: FailureKind,
    pub message: String,
}

impl RefreshFailure {
    pub fn new(
        principal: &Principal,
        resource_type: Option<ResourceType>,
        kind: FailureKind,
        error: &Error,
    ) -> Self {
        Self {
            address: principal.address.clone(),
            auth_token_id: principal.auth_token_id.clone(),
            resource_type,
            kind,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource_type {
            Some(t) => write!(
                f,
                "{}/{}/{}: {}",
                self.address, self.auth_token_id, t, self.message
            ),
            None => write!(f, "{}/{}: {}", self.address, self.auth_token_id, self.message),
        }
    }
}

/// Every failure recorded during one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshFailures(Vec<RefreshFailure>);

impl RefreshFailures {
    pub fn push(&mut self, failure: RefreshFailure) {
        self.0.push(failure);
    }

    pub fn extend(&mut self, failures: impl IntoIterator<Item = RefreshFailure>) {
        self.0.extend(failures);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RefreshFailure> {
        self.0.iter()
    }

    /// True if any scope reported that refresh is not supported.
    pub fn has_not_supported(&self) -> bool {
        self.0.iter().any(|f| f.kind == FailureKind::NotSupported)
    }

    /// `Ok(())` when nothing failed, otherwise [`Error::RefreshFailed`].
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::RefreshFailed(self))
        }
    }
}

impl fmt::Display for RefreshFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}
