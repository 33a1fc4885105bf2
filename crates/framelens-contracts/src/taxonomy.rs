use std::fmt::Write as _;
use std::sync::OnceLock;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Media taxonomy (Mililiere framework) shipped with the binary and supplied
/// to the model as grounding context for classification.
const TAXONOMY_JSON: &str = include_str!("../resources/taxonomy.json");

/// One taxonomy node. Every field is optional in the source data: inner
/// branches may carry only subcategories, leaves usually carry a description
/// and an example, and case-study leaves replace the example with a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub subcategories: IndexMap<String, TaxonomyNode>,
}

/// The full classification tree. Sibling names are unique by construction
/// (map keys) and insertion order is preserved so the serialized grounding
/// text is stable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Taxonomy {
    pub categories: IndexMap<String, TaxonomyNode>,
}

impl Taxonomy {
    /// The embedded reference taxonomy, parsed once.
    pub fn embedded() -> &'static Taxonomy {
        static EMBEDDED: OnceLock<Taxonomy> = OnceLock::new();
        EMBEDDED.get_or_init(|| {
            serde_json::from_str(TAXONOMY_JSON).expect("embedded taxonomy resource is valid JSON")
        })
    }

    /// Pretty-printed JSON of the whole tree, appended to analysis prompts as
    /// grounding text.
    pub fn prompt_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Full `A > B > C` paths to every leaf (nodes without subcategories).
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for (name, node) in &self.categories {
            collect_leaf_paths(name, node, &mut paths);
        }
        paths
    }

    /// Indented outline of the tree for terminal display.
    pub fn render_outline(&self) -> String {
        let mut out = String::new();
        for (name, node) in &self.categories {
            render_node(&mut out, name, node, 0);
        }
        out
    }
}

fn collect_leaf_paths(prefix: &str, node: &TaxonomyNode, out: &mut Vec<String>) {
    if node.subcategories.is_empty() {
        out.push(prefix.to_string());
        return;
    }
    for (name, child) in &node.subcategories {
        let path = format!("{prefix} > {name}");
        collect_leaf_paths(&path, child, out);
    }
}

fn render_node(out: &mut String, name: &str, node: &TaxonomyNode, depth: usize) {
    let indent = "  ".repeat(depth);
    let _ = writeln!(out, "{indent}{name}");
    if let Some(description) = node.description.as_deref() {
        let _ = writeln!(out, "{indent}  | {}", first_sentence(description));
    }
    for (child_name, child) in &node.subcategories {
        render_node(out, child_name, child, depth + 1);
    }
}

fn first_sentence(text: &str) -> &str {
    match text.find(". ") {
        Some(idx) => &text[..idx + 1],
        None => text,
    }
}
