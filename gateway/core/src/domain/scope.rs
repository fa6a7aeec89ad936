// Copyright (c) 2026 Relay Gateway Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Capability Scopes
//!
//! A [`Scope`] is a named capability carried by a credential. The set is closed:
//! anything outside it is rejected when a token is issued and when one is
//! verified, so a typo never silently widens or narrows access.
//!
//! `admin` implies every other scope; see [`ScopeSet::allows`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Admin,
    Read,
    Run,
    Plan,
    Approve,
    Reject,
    Undo,
    Cancel,
}

impl Scope {
    pub const ALL: [Scope; 8] = [
        Scope::Admin,
        Scope::Read,
        Scope::Run,
        Scope::Plan,
        Scope::Approve,
        Scope::Reject,
        Scope::Undo,
        Scope::Cancel,
    ];

    /// Scopes granted to an issued session when the caller does not ask for any.
    pub const OPERATIONAL: [Scope; 7] = [
        Scope::Read,
        Scope::Run,
        Scope::Plan,
        Scope::Approve,
        Scope::Reject,
        Scope::Undo,
        Scope::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Admin => "admin",
            Scope::Read => "read",
            Scope::Run => "run",
            Scope::Plan => "plan",
            Scope::Approve => "approve",
            Scope::Reject => "reject",
            Scope::Undo => "undo",
            Scope::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("unknown scope(s): {}", .0.join(", "))]
    Unknown(Vec<String>),
}

impl FromStr for Scope {
    type Err = ScopeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Scope::ALL
            .iter()
            .copied()
            .find(|scope| scope.as_str() == normalized)
            .ok_or_else(|| ScopeError::Unknown(vec![normalized]))
    }
}

/// Normalize raw scope names: trim, lowercase, drop blanks and duplicates while
/// keeping first-seen order, then parse against the closed set.
///
/// An empty input (after dropping blanks) normalizes to `[read]`. Every unknown
/// name is reported at once so callers can surface the full list.
pub fn normalize_scopes<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Scope>, ScopeError> {
    let mut seen: Vec<String> = Vec::with_capacity(raw.len());
    for item in raw {
        let name = item.as_ref().trim().to_ascii_lowercase();
        if name.is_empty() || seen.contains(&name) {
            continue;
        }
        seen.push(name);
    }
    if seen.is_empty() {
        return Ok(vec![Scope::Read]);
    }

    let mut scopes = Vec::with_capacity(seen.len());
    let mut unknown = Vec::new();
    for name in seen {
        match name.parse::<Scope>() {
            Ok(scope) => scopes.push(scope),
            Err(_) => unknown.push(name),
        }
    }
    if !unknown.is_empty() {
        return Err(ScopeError::Unknown(unknown));
    }
    Ok(scopes)
}

/// Set of scopes held by an authorized caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeSet(BTreeSet<Scope>);

impl ScopeSet {
    pub fn empty() -> Self {
        Self(BTreeSet::new())
    }

    pub fn all() -> Self {
        Self(Scope::ALL.into_iter().collect())
    }

    pub fn contains(&self, scope: Scope) -> bool {
        self.0.contains(&scope)
    }

    /// `admin` grants every scope.
    pub fn allows(&self, scope: Scope) -> bool {
        self.0.contains(&Scope::Admin) || self.0.contains(&scope)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Scope> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Scope> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = Scope>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
