//! Localized message lookup with `{name}` placeholder substitution.
//!
//! Message documents are stored once per locale under `<base-id>_<locale>`
//! (e.g. `messages/lobby_de`). A lookup walks a dotted path into the localized
//! document and falls back to the default locale when either the document or
//! the path is missing there.

use std::collections::HashMap;

use docsync_core::{DocumentKey, Operation, SyncResult};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, warn};

use crate::facade::ConfigFacade;

/// Placeholder values by name.
pub type Placeholders = HashMap<String, String>;

static PLACEHOLDER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_.\-]+)\}").ok());

/// Replace every `{name}` token that has a value in `placeholders`.
///
/// Unknown tokens are left verbatim.
pub fn substitute(template: &str, placeholders: &Placeholders) -> String {
    if placeholders.is_empty() {
        return template.to_string();
    }
    match PLACEHOLDER.as_ref() {
        Some(pattern) => pattern
            .replace_all(template, |caps: &Captures<'_>| {
                placeholders
                    .get(&caps[1])
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned(),
        None => template.to_string(),
    }
}

/// Resolves localized messages through the facade's read path.
#[derive(Clone)]
pub struct MessageResolver {
    facade: ConfigFacade,
    default_locale: String,
}

impl MessageResolver {
    pub fn new(facade: ConfigFacade, default_locale: impl Into<String>) -> Self {
        Self {
            facade,
            default_locale: default_locale.into(),
        }
    }

    pub fn default_locale(&self) -> &str {
        &self.default_locale
    }

    /// Raw value at `path`, trying `locale` first and then the default locale.
    ///
    /// An unreachable locale document falls through to the default locale;
    /// the error is returned only if no locale yields the value.
    pub async fn lookup(
        &self,
        base: &DocumentKey,
        path: &str,
        locale: &str,
    ) -> SyncResult<Option<Value>> {
        let mut locales = vec![locale];
        if locale != self.default_locale {
            locales.push(&self.default_locale);
        }

        let mut unreachable = None;
        for candidate in locales {
            let key = base.localized(candidate);
            let document = match self.facade.get(&key).await {
                Ok(document) => document,
                // The next locale may still be cached.
                Err(e) if e.is_retryable() => {
                    warn!(key = %key, error = %e, "Message document unreachable");
                    if unreachable.is_none() {
                        unreachable = Some(e.context(Operation::Resolve, &key));
                    }
                    continue;
                }
                Err(e) => return Err(e.context(Operation::Resolve, &key)),
            };
            if let Some(value) = document.as_ref().and_then(|d| d.get_path(path)) {
                return Ok(Some(value.clone()));
            }
            debug!(key = %key, path, "Message not found for locale");
        }
        match unreachable {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }

    /// Resolve a message to a single string.
    ///
    /// Lists are joined with newlines; numbers and booleans are rendered as
    /// text. Objects and nulls are not messages and resolve to `None`.
    pub async fn resolve(
        &self,
        base: &DocumentKey,
        path: &str,
        locale: &str,
        placeholders: &Placeholders,
    ) -> SyncResult<Option<String>> {
        let value = self.lookup(base, path, locale).await?;
        Ok(value
            .as_ref()
            .and_then(render_lines)
            .map(|lines| substitute(&lines.join("\n"), placeholders)))
    }

    /// Resolve a message to one string per line.
    pub async fn resolve_list(
        &self,
        base: &DocumentKey,
        path: &str,
        locale: &str,
        placeholders: &Placeholders,
    ) -> SyncResult<Option<Vec<String>>> {
        let value = self.lookup(base, path, locale).await?;
        Ok(value.as_ref().and_then(render_lines).map(|lines| {
            lines
                .iter()
                .map(|line| substitute(line, placeholders))
                .collect()
        }))
    }

    /// Like [`resolve`](Self::resolve) but never fails: anything unresolved,
    /// including store errors, shows the dotted path itself.
    pub async fn resolve_or_path(
        &self,
        base: &DocumentKey,
        path: &str,
        locale: &str,
        placeholders: &Placeholders,
    ) -> String {
        match self.resolve(base, path, locale, placeholders).await {
            Ok(Some(message)) => message,
            Ok(None) => path.to_string(),
            Err(e) => {
                warn!(key = %base, path, error = %e, "Message lookup failed");
                path.to_string()
            }
        }
    }
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render_lines(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(items.iter().filter_map(render_scalar).collect()),
        other => render_scalar(other).map(|line| vec![line]),
    }
}
