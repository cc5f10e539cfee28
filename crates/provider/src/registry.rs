//! Prefix routing table
//!
//! Prefixes are validated once at construction: no two may be string prefixes
//! of each other, so at most one entry can ever match a path. Entries are kept
//! longest first regardless.

use std::sync::Arc;

use tracing::debug;

use crate::{Provider, ProviderError, Result};

struct Entry {
    prefix: String,
    provider: Arc<dyn Provider>,
}

/// A resolved route: the matching provider and the path with its prefix removed.
pub struct Route<'a> {
    pub prefix: &'a str,
    pub provider: &'a Arc<dyn Provider>,
    /// Remainder after the prefix; `/` when the path equals the prefix.
    pub trimmed_path: String,
}

/// Providers keyed by non-overlapping path prefixes.
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    /// Build a registry from `(prefix, provider)` pairs.
    ///
    /// A trailing `/` on a prefix is ignored. Fails on an empty prefix, a
    /// prefix not starting with `/`, or any pair where one prefix is a string
    /// prefix of the other (which includes duplicates).
    pub fn new(registrations: Vec<(String, Arc<dyn Provider>)>) -> Result<Self> {
        let mut entries: Vec<Entry> = Vec::with_capacity(registrations.len());

        for (raw, provider) in registrations {
            let prefix = raw.trim_end_matches('/').to_string();
            if prefix.is_empty() {
                return Err(ProviderError::Registry(format!(
                    "empty prefix for provider {}",
                    provider.id()
                )));
            }
            if !prefix.starts_with('/') {
                return Err(ProviderError::Registry(format!(
                    "prefix {prefix:?} for provider {} must start with '/'",
                    provider.id()
                )));
            }
            if let Some(existing) = entries
                .iter()
                .find(|e| e.prefix.starts_with(&prefix) || prefix.starts_with(&e.prefix))
            {
                return Err(ProviderError::Registry(format!(
                    "prefix {prefix:?} ({}) overlaps {:?} ({})",
                    provider.id(),
                    existing.prefix,
                    existing.provider.id()
                )));
            }
            debug!(prefix = %prefix, provider = provider.id(), "registered provider");
            entries.push(Entry { prefix, provider });
        }

        entries.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { entries })
    }

    /// Find the provider whose prefix matches `path` on a segment boundary.
    ///
    /// `/claude/v1` and `/claude` match `/claude`; `/claudex` does not.
    pub fn resolve(&self, path: &str) -> Option<Route<'_>> {
        self.entries.iter().find_map(|entry| {
            let rest = trim_prefix(path, &entry.prefix)?;
            Some(Route {
                prefix: &entry.prefix,
                provider: &entry.provider,
                trimmed_path: if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                },
            })
        })
    }

    /// Registered providers, longest prefix first.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn Provider>> {
        self.entries.iter().map(|e| &e.provider)
    }

    /// Registered `(prefix, provider id)` pairs, longest prefix first.
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|e| (e.prefix.as_str(), e.provider.id()))
    }
}

/// Strip `prefix` from `path` if it matches exactly or is followed by `/`.
fn trim_prefix<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}
