//! Sensor identity registry: name/id lookup and selector resolution.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// A fixed seed so the same sensor name always derives the same id across
/// process restarts, used when the archive stores names but no explicit id.
const NAME_HASH_SEED: u64 = 0x7367_4e5f_494d_5330;

pub fn derive_id(name: &str) -> u64 {
    xxhash_rust::xxh3::xxh3_64_with_seed(name.as_bytes(), NAME_HASH_SEED)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorDef {
    pub name: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub textname: Option<String>,
    #[serde(default)]
    pub iotype: Option<String>,
    #[serde(default)]
    pub sets: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SensorInfo {
    pub id: u64,
    pub name: String,
    pub textname: Option<String>,
    pub iotype: Option<String>,
}

/// Name/id registry for the sensors a replay job can address.
///
/// Built once at startup and treated as immutable afterward; cheap to clone
/// because lookups are shared behind an `Arc` at the call sites that need it.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    by_id: HashMap<u64, SensorInfo>,
    by_name: HashMap<String, u64>,
    sets: HashMap<String, Vec<u64>>,
}

impl Catalog {
    pub fn from_defs(defs: Vec<SensorDef>) -> Self {
        let mut catalog = Catalog::default();
        for def in defs {
            let id = def.id.unwrap_or_else(|| derive_id(&def.name));
            catalog.by_name.insert(def.name.clone(), id);
            catalog.by_id.insert(
                id,
                SensorInfo {
                    id,
                    name: def.name.clone(),
                    textname: def.textname,
                    iotype: def.iotype,
                },
            );
            for set in def.sets {
                catalog.sets.entry(set).or_default().push(id);
            }
        }
        catalog
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let defs: Vec<SensorDef> =
            serde_json::from_str(contents).context("invalid sensor catalog JSON")?;
        Ok(Self::from_defs(defs))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog file {}", path.display()))?;
        Self::from_json_str(&contents)
    }

    pub fn sensors(&self) -> Vec<SensorInfo> {
        let mut list: Vec<_> = self.by_id.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        list
    }

    pub fn id_by_name(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    pub fn name_by_id(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(|info| info.name.as_str())
    }

    pub fn contains_id(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Registers an id discovered at runtime (e.g. an archive-only id with no
    /// catalog entry) so it round-trips through name lookups as its own
    /// stringified id.
    pub fn ensure_id(&mut self, id: u64) {
        self.by_id.entry(id).or_insert_with(|| SensorInfo {
            id,
            name: id.to_string(),
            textname: None,
            iotype: None,
        });
    }

    /// Resolves a selector string into a sorted, deduplicated list of ids.
    ///
    /// Grammar: `ALL`, a set name, a comma-separated list of names/ids, or a
    /// single glob pattern (`*`, `?`) matched against sensor names.
    pub fn resolve(&self, selector: &str) -> Result<Vec<u64>> {
        let selector = selector.trim();
        if selector.eq_ignore_ascii_case("ALL") {
            let mut ids: Vec<u64> = self.by_id.keys().copied().collect();
            ids.sort_unstable();
            return Ok(ids);
        }
        if let Some(ids) = self.sets.get(selector) {
            let mut ids = ids.clone();
            ids.sort_unstable();
            ids.dedup();
            return Ok(ids);
        }
        if selector.contains(',') {
            let mut ids = Vec::new();
            for part in selector.split(',') {
                ids.extend(self.resolve_single(part.trim())?);
            }
            ids.sort_unstable();
            ids.dedup();
            return Ok(ids);
        }
        self.resolve_single(selector)
    }

    fn resolve_single(&self, token: &str) -> Result<Vec<u64>> {
        if token.is_empty() {
            return Ok(Vec::new());
        }
        if let Ok(id) = token.parse::<u64>() {
            if self.by_id.contains_key(&id) {
                return Ok(vec![id]);
            }
        }
        if let Some(&id) = self.by_name.get(token) {
            return Ok(vec![id]);
        }
        if token.contains('*') || token.contains('?') {
            let pattern =
                glob::Pattern::new(token).with_context(|| format!("invalid glob: {token}"))?;
            let mut ids: Vec<u64> = self
                .by_name
                .iter()
                .filter(|(name, _)| pattern.matches(name))
                .map(|(_, id)| *id)
                .collect();
            ids.sort_unstable();
            return Ok(ids);
        }
        anyhow::bail!("unknown sensor selector: {token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_catalog() -> Catalog {
        Catalog::from_defs(vec![
            SensorDef {
                name: "temp.outdoor".to_string(),
                id: Some(1),
                textname: Some("Outdoor Temp".to_string()),
                iotype: Some("AI".to_string()),
                sets: vec!["weather".to_string()],
            },
            SensorDef {
                name: "temp.indoor".to_string(),
                id: Some(2),
                textname: None,
                iotype: Some("AI".to_string()),
                sets: vec!["weather".to_string()],
            },
            SensorDef {
                name: "humidity".to_string(),
                id: None,
                textname: None,
                iotype: None,
                sets: vec![],
            },
        ])
    }

    #[test]
    fn resolves_all() {
        let catalog = sample_catalog();
        assert_eq!(catalog.resolve("ALL").unwrap().len(), 3);
    }

    #[test]
    fn resolves_set_name() {
        let catalog = sample_catalog();
        let ids = catalog.resolve("weather").unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn resolves_comma_list_of_names() {
        let catalog = sample_catalog();
        let ids = catalog.resolve("temp.outdoor,humidity").unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1));
    }

    #[test]
    fn resolves_glob() {
        let catalog = sample_catalog();
        let ids = catalog.resolve("temp.*").unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn derives_stable_id_without_explicit_id() {
        let catalog = sample_catalog();
        let derived = derive_id("humidity");
        assert_eq!(catalog.id_by_name("humidity"), Some(derived));
    }

    #[test]
    fn rejects_unknown_selector() {
        let catalog = sample_catalog();
        assert!(catalog.resolve("does-not-exist").is_err());
    }

    #[test]
    fn loads_catalog_from_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"name":"temp.outdoor","id":1,"sets":["weather"]}]"#,
        )
        .expect("write catalog fixture");
        let catalog = Catalog::from_json_file(&path).unwrap();
        assert_eq!(catalog.id_by_name("temp.outdoor"), Some(1));
    }
}
