//! Parser for the types database.
//!
//! One type per line: `<type>\t<ds>:<KIND>:<min>:<max>[, ...]`. `U` as a
//! bound means unbounded. `#` starts a comment. Malformed data-source specs
//! are skipped; a type left with no data source is skipped entirely; the
//! first definition of a type name wins.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use super::validation::ConfigError;
use crate::types::{DataSet, DataSource, DsType, SchemaLookup, bounded};

/// Parsed type definitions, looked up by type name.
#[derive(Debug, Default, Clone)]
pub struct TypesDb {
    sets: HashMap<String, Arc<DataSet>>,
}

impl TypesDb {
    /// Read and parse `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|source| ConfigError::TypesDbError {
                path: path.to_path_buf(),
                source,
            })?;
        let db = Self::parse(&content);
        tracing::info!(path = %path.display(), types = db.len(), "Types database loaded");
        Ok(db)
    }

    /// Parse types database content. Never fails; bad lines are logged and skipped.
    pub fn parse(content: &str) -> Self {
        let mut sets = HashMap::new();
        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let Some(set) = parse_line(raw, line_no) else {
                continue;
            };
            if sets.contains_key(&set.type_name) {
                tracing::debug!(line = line_no, type_name = %set.type_name,
                    "Duplicate type definition ignored");
                continue;
            }
            sets.insert(set.type_name.clone(), Arc::new(set));
        }
        Self { sets }
    }

    /// Add or replace a definition.
    pub fn insert(&mut self, data_set: DataSet) {
        self.sets
            .insert(data_set.type_name.clone(), Arc::new(data_set));
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<DataSet>> {
        self.sets.get(type_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }
}

impl SchemaLookup for TypesDb {
    fn data_set(&self, type_name: &str) -> Option<Arc<DataSet>> {
        self.get(type_name)
    }
}

fn parse_line(raw: &str, line_no: usize) -> Option<DataSet> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let Some((type_name, specs)) = line.split_once(|c: char| c == '\t' || c == ' ') else {
        tracing::warn!(line = line_no, "Malformed types.db line: no separator");
        return None;
    };
    let specs = specs.split('#').next().unwrap_or_default().trim();
    let type_name = type_name.trim();
    if type_name.is_empty() || specs.is_empty() {
        tracing::warn!(line = line_no, "Malformed types.db line: empty type name or specs");
        return None;
    }

    let sources: Vec<DataSource> = specs
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|spec| {
            parse_source(spec)
                .inspect_err(|reason| {
                    tracing::warn!(line = line_no, spec = %spec, reason = %reason,
                        "Skipping malformed data source");
                })
                .ok()
        })
        .collect();

    if sources.is_empty() {
        tracing::warn!(line = line_no, type_name = %type_name, "No valid data sources, type skipped");
        return None;
    }
    Some(DataSet::new(bounded(type_name), sources))
}

fn parse_source(spec: &str) -> Result<DataSource, String> {
    let parts: Vec<&str> = spec.split(':').map(str::trim).collect();
    let [name, kind, min, max] = parts.as_slice() else {
        return Err(format!("expected 4 fields, found {}", parts.len()));
    };
    if name.is_empty() {
        return Err("empty data source name".to_string());
    }
    let kind = DsType::from_str(kind).map_err(|_| format!("unknown kind '{kind}'"))?;
    let min = parse_bound(min, f64::NEG_INFINITY)?;
    let max = parse_bound(max, f64::INFINITY)?;
    Ok(DataSource::new(bounded(name), kind, min, max))
}

fn parse_bound(s: &str, unbounded: f64) -> Result<f64, String> {
    if s == "U" {
        return Ok(unbounded);
    }
    match s.parse::<f64>() {
        Ok(v) if !v.is_nan() => Ok(v),
        _ => Err(format!("invalid bound '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = "\
# collectd-style types
load\tshortterm:GAUGE:0:5000, midterm:GAUGE:0:5000, longterm:GAUGE:0:5000
if_octets       rx:DERIVE:0:U, tx:DERIVE:0:U   # trailing comment
percent value:GAUGE:0:100.1
uptime\tvalue:GAUGE:0:U

broken\tvalue:HISTOGRAM:0:U
partial\tgood:COUNTER:U:U, bad:GAUGE:0
load\tvalue:GAUGE:0:1
";

    #[test]
    fn test_parse_full_and_bounds() {
        let db = TypesDb::parse(SAMPLE);

        let load = db.get("load").unwrap();
        assert_eq!(load.len(), 3);
        assert_eq!(load.sources[1].name, "midterm");
        assert_eq!(load.sources[2].max, 5000.0);

        let octets = db.get("if_octets").unwrap();
        assert_eq!(octets.sources[0].kind, DsType::Derive);
        assert_eq!(octets.sources[1].max, f64::INFINITY);

        let partial = db.get("partial").unwrap();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial.sources[0].min, f64::NEG_INFINITY);
    }

    #[test]
    fn test_space_separator_and_comment() {
        let db = TypesDb::parse(SAMPLE);
        let percent = db.get("percent").unwrap();
        assert_eq!(percent.sources[0].max, 100.1);
        assert_eq!(db.get("if_octets").unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_kind_skips_type() {
        let db = TypesDb::parse(SAMPLE);
        assert!(db.get("broken").is_none());
        assert_eq!(db.len(), 5);
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let db = TypesDb::parse(SAMPLE);
        assert_eq!(db.get("load").unwrap().len(), 3);
    }

    #[test]
    fn test_kind_case_insensitive() {
        let db = TypesDb::parse("temp\tvalue:gauge:-273.15:U\n");
        let temp = db.get("temp").unwrap();
        assert_eq!(temp.sources[0].kind, DsType::Gauge);
        assert_eq!(temp.sources[0].min, -273.15);
    }

    #[test]
    fn test_load_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), SAMPLE).unwrap();

        let db = TypesDb::load(file.path()).unwrap();
        assert!(db.data_set("uptime").is_some());
    }

    #[test]
    fn test_load_missing_file() {
        let err = TypesDb::load("/nonexistent/types.db").unwrap_err();
        assert!(matches!(err, ConfigError::TypesDbError { .. }));
    }
}
