//! Selection of the definitions that apply to one creation run.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::definition::{DefinitionRegistry, DerivativeDefinition, Specificity};

/// Caller filters for a creation run.
#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Restrict to these keys; when absent only default definitions run.
    pub only: Option<Vec<String>>,
    /// Never run these keys.
    pub except: Option<Vec<String>>,
    /// Skip keys the asset already has a derivative for.
    pub lazy: bool,
}

impl ResolveOptions {
    pub fn only<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            only: Some(keys.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn except<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }
}

/// Order two matching candidates for the same key: the more specific one
/// sorts last. Equal specificity keeps definition order.
pub fn most_specific(a: Specificity, b: Specificity) -> Ordering {
    a.cmp(&b)
}

/// Pick the definitions to run for an asset of `content_type`.
///
/// A definition is a candidate if it passes `only`/`except` and its filter
/// matches. Among candidates sharing a key the most specific survives (the
/// later one on ties). Distinct keys stay in the order they were first
/// defined. With `lazy`, keys in `existing_keys` are dropped.
pub fn resolve<'a>(
    registry: &'a DefinitionRegistry,
    options: &ResolveOptions,
    content_type: Option<&str>,
    existing_keys: &BTreeSet<String>,
) -> Vec<&'a DerivativeDefinition> {
    let mut candidates: Vec<(usize, Specificity, &DerivativeDefinition)> = registry
        .definitions()
        .iter()
        .enumerate()
        .filter(|(_, def)| match &options.only {
            None => def.is_default(),
            Some(only) => only.iter().any(|k| k == def.key()),
        })
        .filter(|(_, def)| {
            options
                .except
                .as_ref()
                .is_none_or(|except| !except.iter().any(|k| k == def.key()))
        })
        .filter_map(|(idx, def)| {
            def.filter()
                .specificity(content_type)
                .map(|spec| (idx, spec, def))
        })
        .collect();

    // Stable, so ties keep definition order and the last one wins below.
    candidates.sort_by(|a, b| most_specific(a.1, b.1));

    let mut winners: HashMap<&str, (usize, &DerivativeDefinition)> = HashMap::new();
    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    for (idx, _, def) in candidates {
        first_seen
            .entry(def.key())
            .and_modify(|first| *first = (*first).min(idx))
            .or_insert(idx);
        winners.insert(def.key(), (idx, def));
    }

    let mut selected: Vec<(usize, &DerivativeDefinition)> = winners
        .into_iter()
        .map(|(key, (_, def))| (first_seen[key], def))
        .collect();
    selected.sort_by_key(|(first, _)| *first);

    selected
        .into_iter()
        .map(|(_, def)| def)
        .filter(|def| !(options.lazy && existing_keys.contains(def.key())))
        .collect()
}
