// Language registry for the judge worker
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use judge_common::language::{LanguageRecipe, LanguagesFile};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

/// Summary exposed on the languages endpoint
#[derive(Debug, Clone, Serialize)]
pub struct LanguageInfo {
    pub name: String,
    pub display_name: String,
    pub version: String,
    pub file_extension: String,
    pub is_compiled: bool,
}

/// Immutable set of language recipes, shared after startup
#[derive(Clone)]
pub struct LanguageRegistry {
    recipes: Arc<HashMap<String, LanguageRecipe>>,
}

impl LanguageRegistry {
    /// Load recipes from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let file: LanguagesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Self::from_recipes(file.languages)
    }

    /// Build from recipes, rejecting invalid or duplicate entries
    pub fn from_recipes(recipes: Vec<LanguageRecipe>) -> Result<Self> {
        let mut map = HashMap::new();
        for recipe in recipes {
            if let Err(reason) = recipe.check() {
                bail!("Invalid language recipe: {}", reason);
            }
            let name = recipe.name.clone();
            if map.insert(name.clone(), recipe).is_some() {
                bail!("Duplicate language recipe: {}", name);
            }
        }
        if map.is_empty() {
            bail!("No language recipes configured");
        }

        Ok(Self {
            recipes: Arc::new(map),
        })
    }

    /// Recipe for a language name
    pub fn get(&self, language: &str) -> Result<&LanguageRecipe, UnsupportedLanguage> {
        self.recipes
            .get(language)
            .ok_or_else(|| UnsupportedLanguage(language.to_string()))
    }

    pub fn contains(&self, language: &str) -> bool {
        self.recipes.contains_key(language)
    }

    /// All supported language names, sorted
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.recipes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn describe(&self) -> Vec<LanguageInfo> {
        let mut infos: Vec<LanguageInfo> = self
            .recipes
            .values()
            .map(|r| LanguageInfo {
                name: r.name.clone(),
                display_name: r.display_name.clone(),
                version: r.version.clone(),
                file_extension: r.file_extension.clone(),
                is_compiled: r.is_compiled,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}
