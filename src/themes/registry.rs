//! Theme registry: the built-in catalog merged with user override files.
//!
//! Loading is a fixed three-step overlay:
//! 1. catalog defaults (default locale, duration bounds, content types)
//! 2. built-in themes embedded in the binary
//! 3. user files (`*.yaml`, `*.yml`) from the themes directory, in file-name order
//!
//! Per-field strategy when an override hits an existing theme:
//! - scalars (`channel_name`, `description`, `default_locale`,
//!   `duration_bounds`) replace the lower layer
//! - `tags`, `topics` and `content_types` are unioned, lower layer first,
//!   unless the override lists the field under `exclusive`, in which case
//!   the override replaces it
//!
//! Every built-in theme stays reachable as `builtin:<id>`, unaffected by
//! user files. The registry is immutable once built.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};

const BUILTIN_CATALOG: &str = include_str!("builtin.yaml");

/// Prefix that addresses the unmerged built-in catalog
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Allowed narration length for a theme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBounds {
    pub min_secs: u32,
    pub max_secs: u32,
}

impl DurationBounds {
    pub fn contains(&self, duration: Duration) -> bool {
        let secs = duration.as_secs_f64();
        secs >= f64::from(self.min_secs) && secs <= f64::from(self.max_secs)
    }
}

impl Default for DurationBounds {
    fn default() -> Self {
        Self {
            min_secs: 30,
            max_secs: 60,
        }
    }
}

/// Voice and hashtag defaults for a language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    /// Display name, used in prompts
    pub name: String,
    pub voice: String,
    pub voice_female: String,
    /// Used when a generated script carries no hashtags
    #[serde(default)]
    pub hashtags: Vec<String>,
}

/// Resolved configuration of one theme in one language
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocaleConfig {
    /// Identifier the theme was resolved by (`builtin:<id>` for built-ins)
    pub theme: String,
    /// The locale actually used (differs from the request on fallback)
    pub language: String,
    pub channel_name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub content_types: Vec<String>,
    pub topics: Vec<String>,
    pub duration_bounds: DurationBounds,
}

impl LocaleConfig {
    /// Pick the requested content type, falling back to the first one
    /// the locale supports
    pub fn content_type_or_default(&self, requested: Option<&str>) -> PipelineResult<String> {
        if let Some(ct) = requested {
            if self.content_types.iter().any(|c| c == ct) {
                return Ok(ct.to_string());
            }
        }

        let fallback = self
            .content_types
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::InvalidTheme {
                theme: self.theme.clone(),
                reason: format!("locale '{}' has no content types", self.language),
            })?;

        if let Some(ct) = requested {
            warn!(
                theme = %self.theme,
                language = %self.language,
                requested = ct,
                fallback = %fallback,
                "Content type not supported by theme, using default"
            );
        }
        Ok(fallback)
    }
}

/// A merged, validated theme
#[derive(Debug, Clone, Serialize)]
pub struct ThemeDefinition {
    pub id: String,
    pub default_locale: Option<String>,
    pub locales: BTreeMap<String, LocaleConfig>,
}

/// Which list field an override replaces instead of extending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListField {
    Tags,
    ContentTypes,
    Topics,
}

/// Schema shared by the built-in catalog and user files
#[derive(Debug, Clone, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    defaults: Option<CatalogDefaults>,
    #[serde(default)]
    languages: BTreeMap<String, LanguageProfile>,
    #[serde(default)]
    themes: BTreeMap<String, RawTheme>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CatalogDefaults {
    #[serde(default)]
    default_locale: Option<String>,
    #[serde(default)]
    duration_bounds: Option<DurationBounds>,
    #[serde(default)]
    content_types: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawTheme {
    #[serde(default)]
    default_locale: Option<String>,
    #[serde(default)]
    duration_bounds: Option<DurationBounds>,
    #[serde(default)]
    locales: BTreeMap<String, RawLocale>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawLocale {
    #[serde(default)]
    channel_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    content_types: Option<Vec<String>>,
    #[serde(default)]
    topics: Option<Vec<String>>,
    #[serde(default)]
    exclusive: Vec<ListField>,
}

impl RawTheme {
    fn overlay(&mut self, upper: RawTheme) {
        replace_if_set(&mut self.default_locale, upper.default_locale);
        replace_if_set(&mut self.duration_bounds, upper.duration_bounds);
        for (language, locale) in upper.locales {
            match self.locales.get_mut(&language) {
                Some(existing) => existing.overlay(locale),
                None => {
                    self.locales.insert(language, locale);
                }
            }
        }
    }
}

impl RawLocale {
    fn overlay(&mut self, upper: RawLocale) {
        let exclusive = |field| upper.exclusive.contains(&field);
        merge_list(&mut self.tags, upper.tags, exclusive(ListField::Tags));
        merge_list(
            &mut self.content_types,
            upper.content_types,
            exclusive(ListField::ContentTypes),
        );
        merge_list(&mut self.topics, upper.topics, exclusive(ListField::Topics));
        replace_if_set(&mut self.channel_name, upper.channel_name);
        replace_if_set(&mut self.description, upper.description);
    }
}

fn replace_if_set<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn merge_list(base: &mut Option<Vec<String>>, upper: Option<Vec<String>>, exclusive: bool) {
    let Some(upper) = upper else { return };
    match base {
        Some(existing) if !exclusive => {
            for item in upper {
                if !existing.contains(&item) {
                    existing.push(item);
                }
            }
        }
        _ => *base = Some(dedup(upper)),
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Read-only registry of merged themes and language profiles
#[derive(Debug, Clone)]
pub struct ThemeRegistry {
    themes: HashMap<String, ThemeDefinition>,
    builtin: HashMap<String, ThemeDefinition>,
    languages: BTreeMap<String, LanguageProfile>,
    sources: Vec<PathBuf>,
}

impl ThemeRegistry {
    /// Registry with the built-in catalog only
    pub fn builtin() -> PipelineResult<Self> {
        Self::build(Vec::new())
    }

    /// Load the built-in catalog plus every override file in `themes_dir`
    pub fn load(themes_dir: Option<&Path>) -> PipelineResult<Self> {
        let mut layers = Vec::new();

        if let Some(dir) = themes_dir.filter(|d| d.is_dir()) {
            for path in discover_files(dir)? {
                let content = std::fs::read_to_string(&path)?;
                let file: CatalogFile =
                    serde_yaml::from_str(&content).map_err(|e| PipelineError::InvalidTheme {
                        theme: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                debug!(path = %path.display(), themes = file.themes.len(), "Loaded theme overrides");
                layers.push((path, file));
            }
        }

        Self::build(layers)
    }

    fn build(layers: Vec<(PathBuf, CatalogFile)>) -> PipelineResult<Self> {
        let builtin_file: CatalogFile =
            serde_yaml::from_str(BUILTIN_CATALOG).map_err(|e| PipelineError::InvalidTheme {
                theme: "builtin".to_string(),
                reason: e.to_string(),
            })?;

        // Step 1: defaults
        let mut defaults = CatalogDefaults {
            default_locale: Some("es".to_string()),
            duration_bounds: Some(DurationBounds::default()),
            content_types: Vec::new(),
        };
        if let Some(builtin_defaults) = builtin_file.defaults.clone() {
            apply_defaults(&mut defaults, builtin_defaults);
        }

        // Step 2: built-ins
        let mut languages = builtin_file.languages;
        let builtin_raw = builtin_file.themes;
        let mut merged = builtin_raw.clone();

        // Step 3: user overrides by identifier
        let mut sources = Vec::with_capacity(layers.len());
        for (path, file) in layers {
            if let Some(user_defaults) = file.defaults {
                apply_defaults(&mut defaults, user_defaults);
            }
            languages.extend(file.languages);
            for (id, theme) in file.themes {
                match merged.get_mut(&id) {
                    Some(existing) => {
                        debug!(theme = %id, path = %path.display(), "Merging override onto theme");
                        existing.overlay(theme);
                    }
                    None => {
                        merged.insert(id, theme);
                    }
                }
            }
            sources.push(path);
        }

        let builtin = finalize_all(builtin_raw, &defaults, BUILTIN_PREFIX)?;
        let themes = finalize_all(merged, &defaults, "")?;

        info!(
            themes = themes.len(),
            languages = languages.len(),
            override_files = sources.len(),
            "Theme registry loaded"
        );

        Ok(Self {
            themes,
            builtin,
            languages,
            sources,
        })
    }

    /// Resolve the configuration of `theme_id` in `language`.
    ///
    /// A missing locale falls back to the theme's default locale; without
    /// one this is `LocaleNotFound`.
    pub fn resolve(&self, theme_id: &str, language: &str) -> PipelineResult<&LocaleConfig> {
        let theme = self.get(theme_id).ok_or_else(|| PipelineError::ThemeNotFound {
            theme: theme_id.to_string(),
        })?;

        if let Some(locale) = theme.locales.get(language) {
            return Ok(locale);
        }

        let fallback = theme
            .default_locale
            .as_ref()
            .and_then(|default| theme.locales.get(default));

        match fallback {
            Some(locale) => {
                warn!(
                    theme = theme_id,
                    requested = language,
                    fallback = %locale.language,
                    "Locale not found, using default locale"
                );
                Ok(locale)
            }
            None => Err(PipelineError::LocaleNotFound {
                theme: theme_id.to_string(),
                language: language.to_string(),
            }),
        }
    }

    /// Look up a theme; `builtin:<id>` bypasses user overrides
    pub fn get(&self, theme_id: &str) -> Option<&ThemeDefinition> {
        match theme_id.strip_prefix(BUILTIN_PREFIX) {
            Some(id) => self.builtin.get(id),
            None => self.themes.get(theme_id),
        }
    }

    /// Sorted identifiers of all merged themes
    pub fn theme_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.themes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn language(&self, code: &str) -> Option<&LanguageProfile> {
        self.languages.get(code)
    }

    pub fn languages(&self) -> &BTreeMap<String, LanguageProfile> {
        &self.languages
    }

    /// Override files that contributed to this registry
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }
}

fn apply_defaults(defaults: &mut CatalogDefaults, upper: CatalogDefaults) {
    replace_if_set(&mut defaults.default_locale, upper.default_locale);
    replace_if_set(&mut defaults.duration_bounds, upper.duration_bounds);
    if !upper.content_types.is_empty() {
        defaults.content_types = upper.content_types;
    }
}

fn discover_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for ext in ["yaml", "yml"] {
        let pattern = dir.join(format!("*.{}", ext));
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern).map_err(|e| PipelineError::InvalidTheme {
            theme: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        files.extend(entries.filter_map(Result::ok));
    }
    files.sort();
    Ok(files)
}

/// Finalize every theme of one map. Resolved locales carry the
/// identifier they are addressed by, `namespace` included.
fn finalize_all(
    raw: BTreeMap<String, RawTheme>,
    defaults: &CatalogDefaults,
    namespace: &str,
) -> PipelineResult<HashMap<String, ThemeDefinition>> {
    raw.into_iter()
        .map(|(id, theme)| {
            let addressed = format!("{}{}", namespace, id);
            finalize(&addressed, theme, defaults).map(|def| (id, def))
        })
        .collect()
}

/// Validate a merged theme and fill missing locale fields from its
/// default locale
fn finalize(id: &str, raw: RawTheme, defaults: &CatalogDefaults) -> PipelineResult<ThemeDefinition> {
    let invalid = |reason: String| PipelineError::InvalidTheme {
        theme: id.to_string(),
        reason,
    };

    if raw.locales.is_empty() {
        return Err(invalid("theme has no locales".to_string()));
    }

    let default_locale = match raw.default_locale {
        Some(explicit) if !raw.locales.contains_key(&explicit) => {
            return Err(invalid(format!("default locale '{}' is not defined", explicit)));
        }
        Some(explicit) => Some(explicit),
        None => defaults
            .default_locale
            .clone()
            .filter(|code| raw.locales.contains_key(code)),
    };

    let bounds = raw
        .duration_bounds
        .or(defaults.duration_bounds)
        .unwrap_or_default();
    if bounds.min_secs >= bounds.max_secs {
        return Err(invalid(format!(
            "duration bounds {}-{}s are empty",
            bounds.min_secs, bounds.max_secs
        )));
    }

    let base = default_locale.as_ref().and_then(|code| raw.locales.get(code));

    let mut locales = BTreeMap::new();
    for (language, locale) in &raw.locales {
        let pick = |own: &Option<String>, inherited: Option<&Option<String>>| {
            own.clone().or_else(|| inherited.cloned().flatten())
        };
        let pick_list = |own: &Option<Vec<String>>, inherited: Option<&Option<Vec<String>>>| {
            own.clone().or_else(|| inherited.cloned().flatten())
        };

        let channel_name = pick(&locale.channel_name, base.map(|b| &b.channel_name))
            .ok_or_else(|| invalid(format!("locale '{}' has no channel_name", language)))?;
        let description = pick(&locale.description, base.map(|b| &b.description))
            .ok_or_else(|| invalid(format!("locale '{}' has no description", language)))?;
        let tags = pick_list(&locale.tags, base.map(|b| &b.tags)).unwrap_or_default();
        let content_types = pick_list(&locale.content_types, base.map(|b| &b.content_types))
            .unwrap_or_else(|| defaults.content_types.clone());
        let topics = pick_list(&locale.topics, base.map(|b| &b.topics)).unwrap_or_default();

        if content_types.is_empty() {
            return Err(invalid(format!("locale '{}' has no content types", language)));
        }
        if topics.is_empty() {
            return Err(invalid(format!("locale '{}' has an empty topic pool", language)));
        }

        locales.insert(
            language.clone(),
            LocaleConfig {
                theme: id.to_string(),
                language: language.clone(),
                channel_name,
                description,
                tags,
                content_types,
                topics,
                duration_bounds: bounds,
            },
        );
    }

    Ok(ThemeDefinition {
        id: id.to_string(),
        default_locale,
        locales,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn with_override(yaml: &str) -> ThemeRegistry {
        let file: CatalogFile = serde_yaml::from_str(yaml).unwrap();
        ThemeRegistry::build(vec![(PathBuf::from("override.yaml"), file)]).unwrap()
    }

    #[test]
    fn test_builtin_themes_resolve() {
        let registry = ThemeRegistry::builtin().unwrap();
        assert_eq!(registry.theme_ids(), vec!["curiosidades", "historia", "tecnologia"]);

        for id in registry.theme_ids() {
            for language in ["es", "en"] {
                let locale = registry.resolve(id, language).unwrap();
                assert!(!locale.topics.is_empty());
                assert!(!locale.content_types.is_empty());
                assert_eq!(locale.duration_bounds, DurationBounds::default());
            }
        }
    }

    #[test]
    fn test_unknown_theme() {
        let registry = ThemeRegistry::builtin().unwrap();
        let err = registry.resolve("cocina", "es").unwrap_err();
        assert!(matches!(err, PipelineError::ThemeNotFound { .. }));
    }

    #[test]
    fn test_missing_locale_falls_back_to_default() {
        let registry = ThemeRegistry::builtin().unwrap();
        let locale = registry.resolve("historia", "pt").unwrap();
        assert_eq!(locale.language, "es");
        assert_eq!(locale.channel_name, "Historia Viral");
    }

    #[test]
    fn test_missing_locale_without_default() {
        let registry = with_override(
            r#"
themes:
  cocina:
    locales:
      fr:
        channel_name: Cuisine
        description: Recettes
        topics: [pain]
"#,
        );
        let err = registry.resolve("cocina", "de").unwrap_err();
        assert!(matches!(err, PipelineError::LocaleNotFound { .. }));
    }

    #[test]
    fn test_override_unions_lists_and_replaces_scalars() {
        let registry = with_override(
            r#"
themes:
  curiosidades:
    locales:
      es:
        channel_name: Mi Canal
        tags: [viral, misterio]
        topics: [volcanes activos]
"#,
        );
        let locale = registry.resolve("curiosidades", "es").unwrap();
        assert_eq!(locale.channel_name, "Mi Canal");
        assert_eq!(locale.description, "Curiosidades y datos sorprendentes del mundo");
        assert_eq!(locale.topics.len(), 6);
        assert_eq!(locale.topics.last().map(String::as_str), Some("volcanes activos"));
        // "viral" already present, only "misterio" is added
        assert_eq!(locale.tags.len(), 6);
    }

    #[test]
    fn test_exclusive_field_replaces() {
        let registry = with_override(
            r#"
themes:
  curiosidades:
    locales:
      es:
        topics: [solo este tema]
        exclusive: [topics]
"#,
        );
        let locale = registry.resolve("curiosidades", "es").unwrap();
        assert_eq!(locale.topics, vec!["solo este tema".to_string()]);
    }

    #[test]
    fn test_builtin_namespace_bypasses_overrides() {
        let registry = with_override(
            r#"
themes:
  curiosidades:
    locales:
      es:
        topics: [solo este tema]
        exclusive: [topics]
"#,
        );
        let merged = registry.resolve("curiosidades", "es").unwrap();
        let builtin = registry.resolve("builtin:curiosidades", "es").unwrap();
        assert_eq!(merged.topics.len(), 1);
        assert_eq!(builtin.topics.len(), 5);
    }

    #[test]
    fn test_new_locale_inherits_missing_fields() {
        let registry = with_override(
            r#"
themes:
  tecnologia:
    locales:
      pt:
        channel_name: Tech Viral BR
"#,
        );
        let locale = registry.resolve("tecnologia", "pt").unwrap();
        assert_eq!(locale.language, "pt");
        assert_eq!(locale.channel_name, "Tech Viral BR");
        assert_eq!(locale.topics[0], "gadgets más innovadores del año");
    }

    #[test]
    fn test_theme_without_topics_is_invalid() {
        let file: CatalogFile = serde_yaml::from_str(
            r#"
themes:
  vacio:
    locales:
      es:
        channel_name: Vacío
        description: Nada
        topics: []
"#,
        )
        .unwrap();
        let err = ThemeRegistry::build(vec![(PathBuf::from("x.yaml"), file)]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTheme { .. }));
    }

    #[test]
    fn test_load_from_directory() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("deportes.yaml"),
            "themes:\n  deportes:\n    locales:\n      es:\n        channel_name: Deportes\n        description: Deporte\n        topics: [récords olímpicos]\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let registry = ThemeRegistry::load(Some(temp.path())).unwrap();
        assert_eq!(registry.sources().len(), 1);

        let locale = registry.resolve("deportes", "es").unwrap();
        assert_eq!(locale.content_types, vec!["TOP_5".to_string()]);
    }

    #[test]
    fn test_language_profiles() {
        let registry = ThemeRegistry::builtin().unwrap();
        let de = registry.language("de").unwrap();
        assert_eq!(de.voice, "de-DE-ConradNeural");
        assert_eq!(de.voice_female, "de-DE-KatjaNeural");
        assert_eq!(registry.languages().len(), 6);
    }

    #[test]
    fn test_content_type_fallback() {
        let registry = ThemeRegistry::builtin().unwrap();
        let locale = registry.resolve("curiosidades", "es").unwrap();
        assert_eq!(locale.content_type_or_default(Some("CURIOSIDADES")).unwrap(), "CURIOSIDADES");
        assert_eq!(locale.content_type_or_default(Some("MITOS")).unwrap(), "TOP_5");
        assert_eq!(locale.content_type_or_default(None).unwrap(), "TOP_5");
    }

    #[test]
    fn test_content_type_fallback_without_types_is_invalid() {
        let registry = ThemeRegistry::builtin().unwrap();
        let mut locale = registry.resolve("historia", "es").unwrap().clone();
        locale.content_types.clear();

        let err = locale.content_type_or_default(Some("MITOS")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTheme { .. }));
        assert!(locale.content_type_or_default(None).is_err());
    }

    #[test]
    fn test_builtin_and_merged_locales_are_addressed_apart() {
        let registry = with_override(
            r#"
themes:
  curiosidades:
    locales:
      es:
        topics: [solo este tema]
        exclusive: [topics]
"#,
        );
        let merged = registry.resolve("curiosidades", "es").unwrap();
        let builtin = registry.resolve("builtin:curiosidades", "es").unwrap();

        assert_eq!(merged.theme, "curiosidades");
        assert_eq!(builtin.theme, "builtin:curiosidades");

        // Each draws only from its own pool
        let sampler = crate::themes::TopicSampler::seeded(3);
        let from_builtin = sampler.next(builtin).unwrap();
        assert!(builtin.topics.contains(&from_builtin));
        for _ in 0..4 {
            assert_eq!(sampler.next(merged).as_deref(), Some("solo este tema"));
        }
        let again = sampler.next(builtin).unwrap();
        assert!(builtin.topics.contains(&again));
        assert_ne!(again, from_builtin);
    }
}
