//! Prompt template lookup and placeholder substitution.
//!
//! Templates are keyed by (theme, language, content type). Files are named
//! `{theme}_{language}.txt`; each holds one or more sections introduced by
//! a `[[CONTENT_TYPE]]` header line. A file without headers is a single
//! `DEFAULT` section. Built-in templates live under the theme `default`.
//!
//! Lookup order, most specific first: for each language in
//! `[requested, fallback_language]`, for each theme in `[requested,
//! "default"]`, for each content type in `[requested,
//! fallback_content_type]`.
//!
//! Placeholders are `{name}`; `{{` and `}}` produce literal braces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, info};

use crate::config::PromptSettings;
use crate::error::{PipelineError, PipelineResult};
use crate::themes::{LanguageProfile, LocaleConfig, BUILTIN_PREFIX};

/// Theme key of the shipped templates
pub const DEFAULT_THEME: &str = "default";

/// Section used for files without headers
pub const DEFAULT_SECTION: &str = "DEFAULT";

const BUILTIN_TEMPLATES: [(&str, &str); 2] = [
    ("es", include_str!("builtin_es.txt")),
    ("en", include_str!("builtin_en.txt")),
];

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex")
});

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\[([A-Za-z0-9_\-]+)\]\]\s*$").expect("valid regex"));

/// Template text for one (theme, language, content type)
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub theme: String,
    pub language: String,
    pub content_type: String,
    pub text: String,
}

impl PromptTemplate {
    /// Identifier used in error messages
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.theme, self.language, self.content_type)
    }

    /// Substitute every placeholder; any unbound name is an error
    pub fn render(&self, variables: &PromptVariables) -> PipelineResult<String> {
        let mut unbound: Option<String> = None;

        let rendered = PLACEHOLDER_RE.replace_all(&self.text, |caps: &Captures| {
            match (caps.get(0).map(|m| m.as_str()), caps.get(1)) {
                (Some("{{"), _) => "{".to_string(),
                (Some("}}"), _) => "}".to_string(),
                (_, Some(name)) => match variables.get(name.as_str()) {
                    Some(value) => value.to_string(),
                    None => {
                        unbound.get_or_insert_with(|| name.as_str().to_string());
                        String::new()
                    }
                },
                _ => String::new(),
            }
        });

        match unbound {
            Some(placeholder) => Err(PipelineError::UnboundPlaceholder {
                placeholder,
                template: self.key(),
            }),
            None => Ok(rendered.into_owned()),
        }
    }
}

/// Values available to templates
#[derive(Debug, Clone, Default)]
pub struct PromptVariables {
    values: HashMap<String, String>,
}

impl PromptVariables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard variables for a job: topic, content type, channel, bounds,
    /// language and default hashtags
    pub fn for_job(
        locale: &LocaleConfig,
        profile: &LanguageProfile,
        topic: &str,
        content_type: &str,
    ) -> Self {
        Self::new()
            .with("topic", topic)
            .with("content_type", content_type.replace('_', " "))
            .with("channel_name", &locale.channel_name)
            .with("description", &locale.description)
            .with("min_duration", locale.duration_bounds.min_secs.to_string())
            .with("max_duration", locale.duration_bounds.max_secs.to_string())
            .with("language_name", &profile.name)
            .with("hashtags", profile.hashtags.join(" "))
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// All known templates plus the configured fallback chain
#[derive(Debug, Clone)]
pub struct PromptResolver {
    templates: HashMap<(String, String, String), PromptTemplate>,
    fallback_language: Option<String>,
    fallback_content_type: Option<String>,
}

impl PromptResolver {
    /// Built-in templates only
    pub fn builtin(settings: &PromptSettings) -> Self {
        let mut resolver = Self {
            templates: HashMap::new(),
            fallback_language: settings.fallback_language.clone(),
            fallback_content_type: settings.fallback_content_type.clone(),
        };
        for (language, text) in BUILTIN_TEMPLATES {
            resolver.add_file(DEFAULT_THEME, language, text);
        }
        resolver
    }

    /// Built-in templates overlaid with every `{theme}_{language}.txt` in
    /// `prompts_dir`
    pub fn load(prompts_dir: Option<&Path>, settings: &PromptSettings) -> PipelineResult<Self> {
        let mut resolver = Self::builtin(settings);

        let Some(dir) = prompts_dir.filter(|d| d.is_dir()) else {
            return Ok(resolver);
        };

        let mut loaded = 0usize;
        for path in discover_files(dir)? {
            let Some((theme, language)) = split_file_stem(&path) else {
                debug!(path = %path.display(), "Skipping prompt file without {{theme}}_{{language}} name");
                continue;
            };
            let content = std::fs::read_to_string(&path)?;
            resolver.add_file(&theme, &language, &content);
            loaded += 1;
        }

        info!(files = loaded, templates = resolver.templates.len(), "Prompt templates loaded");
        Ok(resolver)
    }

    /// Register all sections of one template file
    pub fn add_file(&mut self, theme: &str, language: &str, content: &str) {
        for (content_type, text) in parse_sections(content) {
            self.insert(PromptTemplate {
                theme: theme.to_string(),
                language: language.to_string(),
                content_type,
                text,
            });
        }
    }

    pub fn insert(&mut self, template: PromptTemplate) {
        let key = (
            template.theme.clone(),
            template.language.clone(),
            template.content_type.clone(),
        );
        self.templates.insert(key, template);
    }

    /// Find the template for a triple, walking the fallback chain
    pub fn find(&self, theme: &str, language: &str, content_type: &str) -> PipelineResult<&PromptTemplate> {
        let theme = theme.strip_prefix(BUILTIN_PREFIX).unwrap_or(theme);

        let languages = chain(language, self.fallback_language.as_deref());
        let themes = chain(theme, Some(DEFAULT_THEME));
        let content_types = chain(content_type, self.fallback_content_type.as_deref());

        for lang in &languages {
            for th in &themes {
                for ct in &content_types {
                    let key = (th.to_string(), lang.to_string(), ct.to_string());
                    if let Some(template) = self.templates.get(&key) {
                        if (*th, *lang, *ct) != (theme, language, content_type) {
                            debug!(
                                requested = %format!("{}/{}/{}", theme, language, content_type),
                                resolved = %template.key(),
                                "Prompt template resolved through fallback"
                            );
                        }
                        return Ok(template);
                    }
                }
            }
        }

        Err(PipelineError::TemplateNotFound {
            theme: theme.to_string(),
            language: language.to_string(),
            content_type: content_type.to_string(),
        })
    }

    /// Look up the template and substitute `variables` into it
    pub fn resolve(
        &self,
        theme: &str,
        language: &str,
        content_type: &str,
        variables: &PromptVariables,
    ) -> PipelineResult<String> {
        self.find(theme, language, content_type)?.render(variables)
    }
}

fn chain<'a>(first: &'a str, fallback: Option<&'a str>) -> Vec<&'a str> {
    let mut out = vec![first];
    if let Some(fb) = fallback.filter(|fb| *fb != first) {
        out.push(fb);
    }
    out
}

fn discover_files(dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let pattern = dir.join("*.txt");
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| PipelineError::Store(format!("bad prompt directory pattern: {}", e)))?
        .filter_map(Result::ok)
        .collect();
    files.sort();
    Ok(files)
}

/// `curiosidades_es.txt` -> ("curiosidades", "es"); the language is the
/// part after the last underscore
fn split_file_stem(path: &Path) -> Option<(String, String)> {
    let stem = path.file_stem()?.to_str()?;
    let (theme, language) = stem.rsplit_once('_')?;
    if theme.is_empty() || language.is_empty() {
        return None;
    }
    Some((theme.to_string(), language.to_string()))
}

fn parse_sections(content: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut current: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in content.lines() {
        if let Some(caps) = SECTION_RE.captures(line.trim()) {
            push_section(&mut sections, current.take(), &mut body);
            current = caps.get(1).map(|m| m.as_str().to_string());
        } else {
            body.push(line);
        }
    }
    push_section(&mut sections, current, &mut body);

    sections
}

fn push_section(sections: &mut Vec<(String, String)>, name: Option<String>, body: &mut Vec<&str>) {
    let text = body.join("\n").trim().to_string();
    body.clear();
    if !text.is_empty() {
        sections.push((name.unwrap_or_else(|| DEFAULT_SECTION.to_string()), text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::themes::ThemeRegistry;
    use tempfile::TempDir;

    fn template(text: &str) -> PromptTemplate {
        PromptTemplate {
            theme: "curiosidades".to_string(),
            language: "es".to_string(),
            content_type: "TOP_5".to_string(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_render_substitutes_all() {
        let vars = PromptVariables::new().with("topic", "volcanes");
        let out = template("Habla de {topic}. Otra vez: {topic}.").render(&vars).unwrap();
        assert_eq!(out, "Habla de volcanes. Otra vez: volcanes.");
    }

    #[test]
    fn test_missing_topic_is_unbound() {
        let vars = PromptVariables::new().with("channel_name", "Datos");
        let err = template("Guion sobre {topic} para {channel_name}")
            .render(&vars)
            .unwrap_err();
        match err {
            PipelineError::UnboundPlaceholder { placeholder, template } => {
                assert_eq!(placeholder, "topic");
                assert_eq!(template, "curiosidades/es/TOP_5");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_escaped_braces() {
        let vars = PromptVariables::new().with("topic", "x");
        let t = template(r#"JSON: {{"topic": "{topic}"}}"#);
        assert_eq!(t.render(&vars).unwrap(), r#"JSON: {"topic": "x"}"#);
    }

    #[test]
    fn test_builtin_templates_render_with_job_variables() {
        let registry = ThemeRegistry::builtin().unwrap();
        let resolver = PromptResolver::builtin(&PromptSettings::default());

        for id in registry.theme_ids() {
            for language in ["es", "en"] {
                let locale = registry.resolve(id, language).unwrap();
                for content_type in &locale.content_types {
                    let vars = PromptVariables::for_job(
                        locale,
                        registry.language(language).unwrap(),
                        "tema",
                        content_type,
                    );
                    let prompt = resolver.resolve(id, language, content_type, &vars).unwrap();
                    assert!(prompt.contains("tema"));
                    assert!(!prompt.contains('{'));
                }
            }
        }
    }

    #[test]
    fn test_language_fallback() {
        let resolver = PromptResolver::builtin(&PromptSettings::default());
        let template = resolver.find("historia", "pt", "TOP_5").unwrap();
        assert_eq!(template.key(), "default/es/TOP_5");
    }

    #[test]
    fn test_not_found_without_fallbacks() {
        let settings = PromptSettings {
            fallback_language: None,
            fallback_content_type: None,
        };
        let resolver = PromptResolver::builtin(&settings);
        let err = resolver.find("historia", "pt", "TOP_5").unwrap_err();
        assert!(matches!(err, PipelineError::TemplateNotFound { .. }));

        let err = resolver.find("historia", "es", "MITOS").unwrap_err();
        assert!(matches!(err, PipelineError::TemplateNotFound { .. }));
    }

    #[test]
    fn test_user_file_takes_precedence() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("historia_es.txt"),
            "[[TOP_5]]\nTop de historia: {topic}\n\n[[MITOS]]\nMitos sobre {topic}\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("sin-idioma.txt"), "ignored {nothing}").unwrap();

        let resolver = PromptResolver::load(Some(temp.path()), &PromptSettings::default()).unwrap();
        let vars = PromptVariables::new().with("topic", "Roma");

        assert_eq!(
            resolver.resolve("historia", "es", "TOP_5", &vars).unwrap(),
            "Top de historia: Roma"
        );
        assert_eq!(
            resolver.resolve("builtin:historia", "es", "MITOS", &vars).unwrap(),
            "Mitos sobre Roma"
        );
        // Other themes still see the shipped template
        assert!(resolver.find("tecnologia", "es", "TOP_5").unwrap().theme == DEFAULT_THEME);
    }

    #[test]
    fn test_headerless_file_is_default_section() {
        let sections = parse_sections("Solo texto {topic}\n");
        assert_eq!(sections, vec![("DEFAULT".to_string(), "Solo texto {topic}".to_string())]);
    }
}
