use std::fs;
use std::path::Path;

use crdt_attrs::Layout;
use serde::Deserialize;

/// Benchmark parameters, read from an optional TOML file.
///
/// ```toml
/// elements = 1000
/// updates = 50
/// layouts = ["key-value-sequence", "nested-map"]
/// seed = 7
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    pub elements: usize,
    pub updates: usize,
    pub layouts: Vec<Layout>,
    pub seed: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            elements: 100,
            updates: 100,
            layouts: Layout::ALL.to_vec(),
            seed: 42,
        }
    }
}

/// Values given on the command line. They win over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub elements: Option<usize>,
    pub updates: Option<usize>,
    pub layouts: Vec<Layout>,
    pub seed: Option<u64>,
}

impl BenchConfig {
    /// Defaults, or the contents of `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
        Self::parse(&text).map_err(|e| format!("invalid config {}: {e}", path.display()).into())
    }

    fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(elements) = overrides.elements {
            self.elements = elements;
        }
        if let Some(updates) = overrides.updates {
            self.updates = updates;
        }
        if !overrides.layouts.is_empty() {
            self.layouts = overrides.layouts;
        }
        if let Some(seed) = overrides.seed {
            self.seed = seed;
        }
        self
    }
}
