//! Tool registry consumed by the executor and the flaw injector.
//!
//! The registry is external input (the workflow generator owns the real
//! capability index); the core only needs names, categories, and short
//! descriptions. Categories are inferred from name segments when the
//! source does not provide them, matching the operation families the
//! task library uses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Input,
    Transform,
    Validation,
    Output,
    Network,
    Computation,
    Utility,
}

impl ToolCategory {
    /// Infer the operation family from the tool name. The library's tool
    /// names follow a `<domain>_<operation>` convention (data_reader,
    /// file_writer, api_poster, ...).
    pub fn infer(name: &str) -> ToolCategory {
        let n = name.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| n.contains(w));
        if has(&["reader", "fetcher", "scanner", "loader", "receiver"]) {
            ToolCategory::Input
        } else if has(&["parser", "transformer", "converter", "filter", "mapper", "aggregator"]) {
            ToolCategory::Transform
        } else if has(&["validator", "checker", "verifier", "tester"]) {
            ToolCategory::Validation
        } else if has(&["writer", "poster", "exporter", "sender", "publisher"]) {
            ToolCategory::Output
        } else if has(&["api", "http", "request", "endpoint"]) {
            ToolCategory::Network
        } else if has(&["calculator", "computer", "analyzer", "processor"]) {
            ToolCategory::Computation
        } else {
            ToolCategory::Utility
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ToolCategory>,
}

fn default_description() -> String {
    String::new()
}

impl ToolSpec {
    pub fn named(name: impl Into<String>) -> ToolSpec {
        let name = name.into();
        ToolSpec { description: format!("Tool for {}", name.replace('_', " ")), name, category: None }
    }

    pub fn effective_category(&self) -> ToolCategory {
        self.category.unwrap_or_else(|| ToolCategory::infer(&self.name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    pub fn new() -> ToolRegistry {
        ToolRegistry::default()
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    /// Ensure a name is present, inferring its category. Used when the
    /// registry is synthesized from workflow sequences instead of a file.
    pub fn ensure(&mut self, name: &str) {
        if !self.tools.contains_key(name) {
            self.register(ToolSpec::named(name));
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Load from a JSON array of tool specs.
    pub fn from_json_file(path: &Path) -> anyhow::Result<ToolRegistry> {
        let raw = std::fs::read_to_string(path)?;
        let specs: Vec<ToolSpec> = serde_json::from_str(&raw)?;
        let mut registry = ToolRegistry::new();
        for spec in specs {
            registry.register(spec);
        }
        Ok(registry)
    }

    /// Alternatives to `name`: other registered tools whose category
    /// relation matches. Same-category neighbors model semantically
    /// adjacent tools; cross-category ones model outright misuse.
    pub fn alternatives(&self, name: &str, same_category: bool) -> Vec<&ToolSpec> {
        let target = match self.get(name) {
            Some(spec) => spec.effective_category(),
            None => ToolCategory::infer(name),
        };
        self.tools
            .values()
            .filter(|t| t.name != name && (t.effective_category() == target) == same_category)
            .collect()
    }

    /// First registered tool in the given category, if any.
    pub fn any_in_category(&self, category: ToolCategory) -> Option<&ToolSpec> {
        self.tools.values().find(|t| t.effective_category() == category)
    }
}
