//! Localized response text and command metadata.
//!
//! Locale files are TOML tables compiled into the binary. Nested tables are flattened into
//! dotted keys; an array value holds alternative phrasings, one of which is picked at random
//! each time the key is rendered. A `fragments` segment in a key path marks a set of
//! vocabulary pieces that are sampled independently and fed into another template.

use anyhow::Context as _;
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use tracing::{error, warn};

pub const DEFAULT_LOCALE: &str = "en-US";

const RESPONSE_FILES: &[(&str, &str)] = &[
    ("en-US", include_str!("../locales/response/en-US.toml")),
    ("fr", include_str!("../locales/response/fr.toml")),
];

const METADATA_FILES: &[(&str, &str)] = &[
    ("en-US", include_str!("../locales/metadata/en-US.toml")),
    ("fr", include_str!("../locales/metadata/fr.toml")),
];

/// Template variables, keyed by placeholder name.
pub type Vars = HashMap<String, String>;

/// Builds a [`Vars`] map: `vars! { "user" => mention, "id" => 5 }`.
#[macro_export]
macro_rules! vars {
    () => { $crate::i18n::Vars::new() };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut vars = $crate::i18n::Vars::new();
        $( vars.insert($name.to_string(), $value.to_string()); )+
        vars
    }};
}

type Variants = Vec<String>;

#[derive(Debug, Default)]
pub struct Localizer {
    /// key -> locale -> variants
    responses: HashMap<String, HashMap<String, Variants>>,
    /// key -> locale -> fragment -> variants
    fragments: HashMap<String, HashMap<String, HashMap<String, Variants>>>,
    /// key -> locale -> text
    metadata: HashMap<String, HashMap<String, String>>,
}

impl Localizer {
    /// Loads the locale files shipped with the binary.
    pub fn embedded() -> anyhow::Result<Self> {
        Self::from_sources(RESPONSE_FILES, METADATA_FILES)
    }

    pub fn from_sources(responses: &[(&str, &str)], metadata: &[(&str, &str)]) -> anyhow::Result<Self> {
        let mut localizer = Self::default();

        for (locale, source) in responses {
            let table: toml::Table = toml::from_str(source)
                .with_context(|| format!("Invalid response file for locale {}", locale))?;
            let mut flat = Vec::new();
            flatten(&mut Vec::new(), &toml::Value::Table(table), &mut flat);

            for (path, variants) in flat {
                match path.iter().position(|segment| segment == "fragments") {
                    Some(pos) => {
                        let key = path[..pos].join(".");
                        let fragment = path[pos + 1..].join(".");
                        localizer
                            .fragments
                            .entry(key)
                            .or_default()
                            .entry(locale.to_string())
                            .or_default()
                            .insert(fragment, variants);
                    }
                    None => {
                        localizer
                            .responses
                            .entry(path.join("."))
                            .or_default()
                            .insert(locale.to_string(), variants);
                    }
                }
            }
        }

        for (locale, source) in metadata {
            let table: toml::Table = toml::from_str(source)
                .with_context(|| format!("Invalid metadata file for locale {}", locale))?;
            let mut flat = Vec::new();
            flatten(&mut Vec::new(), &toml::Value::Table(table), &mut flat);
            for (path, mut variants) in flat {
                if let Some(text) = variants.drain(..).next() {
                    localizer
                        .metadata
                        .entry(path.join("."))
                        .or_default()
                        .insert(locale.to_string(), text);
                }
            }
        }

        Ok(localizer)
    }

    /// Renders `key` for `locale`, falling back to the default locale and finally to the key.
    pub fn render(&self, locale: &str, key: &str, vars: &Vars) -> String {
        let Some(locales) = self.responses.get(key) else {
            error!("Missing localization key {}", key);
            return key.to_string();
        };
        let variants = match locales.get(locale) {
            Some(variants) => variants,
            None => {
                warn!("Key {} has no {} text, using {}", key, locale, DEFAULT_LOCALE);
                match locales.get(DEFAULT_LOCALE) {
                    Some(variants) => variants,
                    None => {
                        error!("Key {} has no {} text", key, DEFAULT_LOCALE);
                        return key.to_string();
                    }
                }
            }
        };
        match variants.choose(&mut rand::rng()) {
            Some(template) => render_template(template, vars),
            None => key.to_string(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.responses.contains_key(key)
    }

    /// Same as [`render`](Self::render) with no variables.
    pub fn text(&self, locale: &str, key: &str) -> String {
        self.render(locale, key, &Vars::new())
    }

    /// One randomly chosen value for every fragment under `key`.
    pub fn fragments(&self, locale: &str, key: &str) -> Vars {
        let Some(locales) = self.fragments.get(key) else {
            return Vars::new();
        };
        let Some(fragments) = locales.get(locale).or_else(|| locales.get(DEFAULT_LOCALE)) else {
            return Vars::new();
        };
        let mut rng = rand::rng();
        fragments
            .iter()
            .filter_map(|(name, variants)| {
                variants
                    .choose(&mut rng)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    /// Locale -> text for a metadata key (command names, descriptions, choices).
    pub fn metadata(&self, key: &str) -> Option<&HashMap<String, String>> {
        self.metadata.get(key)
    }

    pub fn metadata_text(&self, key: &str, locale: &str) -> Option<&str> {
        self.metadata(key)?.get(locale).map(String::as_str)
    }
}

fn flatten(path: &mut Vec<String>, value: &toml::Value, out: &mut Vec<(Vec<String>, Variants)>) {
    match value {
        toml::Value::Table(table) => {
            for (key, child) in table {
                path.push(key.clone());
                flatten(path, child, out);
                path.pop();
            }
        }
        toml::Value::Array(items) => {
            let variants = items.iter().map(scalar_text).collect();
            out.push((path.clone(), variants));
        }
        other => out.push((path.clone(), vec![scalar_text(other)])),
    }
}

fn scalar_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replaces `{name}` placeholders with values from `vars`. Unknown placeholders are kept.
pub fn render_template(template: &str, vars: &Vars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..name_len];
        if !name.is_empty() && after[name_len..].starts_with('}') {
            match vars.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            }
            rest = &after[name_len + 1..];
        } else {
            out.push('{');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}
