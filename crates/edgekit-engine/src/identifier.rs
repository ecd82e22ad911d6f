// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier resolver.
//!
//! Owns the namespace of application identifiers. Every canonical id and
//! every declared alias lives in one namespace, so a lookup can never be
//! ambiguous. Qualification (fleet prefixes and the like) is the caller's
//! business: an application reachable both as `fleet.app` and `app` simply
//! declares one of them as an alias.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// Highest numeric suffix tried before giving up with `DuplicateIdentifier`.
pub const MAX_SUFFIX: u32 = 1000;

#[derive(Debug, Default)]
struct Namespace {
    /// canonical id -> its aliases
    canonical: HashMap<String, Vec<String>>,
    /// alias -> canonical id
    aliases: HashMap<String, String>,
}

impl Namespace {
    fn is_taken(&self, id: &str) -> bool {
        self.canonical.contains_key(id) || self.aliases.contains_key(id)
    }
}

/// Maps raw identifiers to canonical ids and hands out unique ones.
#[derive(Debug, Default)]
pub struct IdentifierResolver {
    inner: RwLock<Namespace>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    // Lookups stay valid after a panicking writer; the namespace is only
    // mutated by single insert/remove calls.
    fn read(&self) -> RwLockReadGuard<'_, Namespace> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Namespace> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve any accepted form of an identifier to its canonical id.
    ///
    /// Pure lookup. Resolving a canonical id returns it unchanged.
    pub fn resolve(&self, raw: &str) -> Option<String> {
        let ns = self.read();
        if ns.canonical.contains_key(raw) {
            return Some(raw.to_string());
        }
        ns.aliases.get(raw).cloned()
    }

    /// Like [`resolve`](Self::resolve), failing with `NotFound`.
    pub fn require(&self, raw: &str) -> Result<String> {
        self.resolve(raw)
            .ok_or_else(|| Error::NotFound(raw.to_string()))
    }

    /// Reserve a unique canonical id for a new application.
    ///
    /// `desired` is used as-is when free, otherwise `desired_2`,
    /// `desired_3`, ... is chosen. `aliases` must all be free; an alias equal
    /// to the chosen id is ignored. At most `capacity` ids may be reserved.
    pub fn reserve(&self, desired: &str, aliases: &[String], capacity: usize) -> Result<String> {
        let desired = desired.trim();
        if desired.is_empty() {
            return Err(Error::Validation("appId must not be empty".to_string()));
        }
        if desired.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "appId {:?} must not contain whitespace",
                desired
            )));
        }

        let mut ns = self.write();

        if ns.canonical.len() >= capacity {
            return Err(Error::CapacityExceeded(format!(
                "at most {} applications may be installed",
                capacity
            )));
        }

        let canonical = if !ns.is_taken(desired) {
            desired.to_string()
        } else {
            (2..=MAX_SUFFIX)
                .map(|n| format!("{}_{}", desired, n))
                .find(|candidate| !ns.is_taken(candidate))
                .ok_or_else(|| Error::DuplicateIdentifier(desired.to_string()))?
        };

        let mut accepted = Vec::new();
        for alias in aliases {
            let alias = alias.trim();
            if alias.is_empty() || alias == canonical || accepted.iter().any(|a| a == alias) {
                continue;
            }
            if ns.is_taken(alias) {
                return Err(Error::Validation(format!(
                    "alias {:?} already identifies another application",
                    alias
                )));
            }
            accepted.push(alias.to_string());
        }

        for alias in &accepted {
            ns.aliases.insert(alias.clone(), canonical.clone());
        }
        ns.canonical.insert(canonical.clone(), accepted);
        Ok(canonical)
    }

    /// Re-register a known id, for records loaded at startup.
    pub fn restore(&self, canonical: &str, aliases: &[String]) {
        let mut ns = self.write();
        let mut kept = Vec::new();
        for alias in aliases {
            if !ns.is_taken(alias) && alias != canonical {
                ns.aliases.insert(alias.clone(), canonical.to_string());
                kept.push(alias.clone());
            }
        }
        ns.canonical.insert(canonical.to_string(), kept);
    }

    /// Aliases accepted for `canonical`.
    pub fn aliases_of(&self, canonical: &str) -> Vec<String> {
        self.read().canonical.get(canonical).cloned().unwrap_or_default()
    }

    /// Forget a canonical id and its aliases.
    pub fn release(&self, canonical: &str) {
        let mut ns = self.write();
        if let Some(aliases) = ns.canonical.remove(canonical) {
            for alias in aliases {
                ns.aliases.remove(&alias);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.read().canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
