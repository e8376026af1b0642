// src/aliases.rs — language alias resolution (spec §4.3 step 1, §4.7, §6.3 kernel-aliases)

use std::collections::HashMap;
use std::path::Path;

use crate::error::AgentError;

/// Canonical language tags the agent ships kernel images for. An alias that
/// resolves outside this set is rejected as `UnsupportedLang` (spec §4.3 step 1).
const CANONICAL_LANGS: &[&str] = &[
    "python3", "nodejs", "go", "rust", "julia", "r-base", "php", "c", "cpp",
];

#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    alias_to_canonical: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        let mut t = Self::default();
        // Built-in aliases mirroring the original agent's default table.
        t.alias_to_canonical.insert("python".into(), "python3".into());
        t.alias_to_canonical.insert("py".into(), "python3".into());
        t.alias_to_canonical.insert("js".into(), "nodejs".into());
        t.alias_to_canonical.insert("node".into(), "nodejs".into());
        t.alias_to_canonical.insert("golang".into(), "go".into());
        t.alias_to_canonical.insert("r".into(), "r-base".into());
        t
    }

    pub fn load_file(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path).map_err(AgentError::Io)?;
        let parsed: toml::Value = toml::from_str(&contents)
            .map_err(|e| AgentError::Config(format!("invalid kernel-aliases file: {e}")))?;
        let table = parsed
            .as_table()
            .ok_or_else(|| AgentError::Config("kernel-aliases file must be a TOML table".into()))?;

        let mut aliases = Self::new();
        for (alias, canonical) in table {
            if let Some(canonical) = canonical.as_str() {
                aliases.alias_to_canonical.insert(alias.clone(), canonical.to_string());
            }
        }
        Ok(aliases)
    }

    /// Resolves `lang` through the alias table (spec §4.3 step 1). Unknown
    /// languages are passed through unchanged here; callers decide whether an
    /// unresolved name is actually supported (image inspect will fail for it).
    pub fn resolve(&self, lang: &str) -> String {
        self.alias_to_canonical
            .get(lang)
            .cloned()
            .unwrap_or_else(|| lang.to_string())
    }

    /// Resolves `lang` and rejects it as `UnsupportedLang` unless the result
    /// names one of the agent's known canonical languages (spec §4.3 step 1).
    pub fn resolve_checked(&self, lang: &str) -> Result<String, AgentError> {
        let canonical = self.resolve(lang);
        if CANONICAL_LANGS.contains(&canonical.as_str()) {
            Ok(canonical)
        } else {
            Err(AgentError::UnsupportedLang(lang.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtin_alias() {
        let table = AliasTable::new();
        assert_eq!(table.resolve("python"), "python3");
    }

    #[test]
    fn passes_through_unknown_language() {
        let table = AliasTable::new();
        assert_eq!(table.resolve("python3"), "python3");
    }

    #[test]
    fn loads_overrides_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.toml");
        std::fs::write(&path, "py2 = \"python2\"\n").unwrap();
        let table = AliasTable::load_file(&path).unwrap();
        assert_eq!(table.resolve("py2"), "python2");
        assert_eq!(table.resolve("python"), "python3");
    }

    #[test]
    fn resolve_checked_accepts_known_canonical_language() {
        let table = AliasTable::new();
        assert_eq!(table.resolve_checked("py").unwrap(), "python3");
    }

    #[test]
    fn resolve_checked_rejects_unknown_language() {
        let table = AliasTable::new();
        assert!(matches!(
            table.resolve_checked("cobol"),
            Err(AgentError::UnsupportedLang(_))
        ));
    }
}
