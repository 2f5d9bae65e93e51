//! Language identifiers resolved once at configuration time
//!
//! The probe keeps one linear map per training language. Names such as
//! `"en"` or `"de"` are resolved to a dense [`LanguageId`] when the
//! configuration is loaded, so the training step indexes a `Vec` instead of
//! looking up strings.

use anyhow::{bail, Result};
use serde::Serialize;

/// Dense ordinal of a training language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LanguageId(usize);

impl LanguageId {
    /// Position of this language in its [`LanguageSet`]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ordered, duplicate-free set of training languages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSet {
    names: Vec<String>,
}

impl LanguageSet {
    /// Build the set, rejecting empty lists, blank names, and duplicates
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut collected: Vec<String> = Vec::new();
        for name in names {
            let name = name.into();
            let name = name.trim().to_string();
            if name.is_empty() {
                bail!("Language names must not be empty");
            }
            if collected.contains(&name) {
                bail!("Duplicate training language '{name}'");
            }
            collected.push(name);
        }
        if collected.is_empty() {
            bail!("At least one training language is required");
        }
        Ok(Self { names: collected })
    }

    /// Resolve a language name to its identifier
    pub fn resolve(&self, name: &str) -> Result<LanguageId> {
        match self.names.iter().position(|n| n == name) {
            Some(idx) => Ok(LanguageId(idx)),
            None => bail!(
                "Unknown language '{name}' (configured: {})",
                self.names.join(", ")
            ),
        }
    }

    /// Name of a resolved language
    pub fn name(&self, id: LanguageId) -> &str {
        &self.names[id.0]
    }

    /// Iterate `(id, name)` pairs in ordinal order
    pub fn iter(&self) -> impl Iterator<Item = (LanguageId, &str)> + '_ {
        self.names
            .iter()
            .enumerate()
            .map(|(idx, name)| (LanguageId(idx), name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
