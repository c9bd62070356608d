//! Query-plan nodes for diagnostics.
//!
//! Each operator describes itself with a `PlanNode`, nesting the plans of
//! its inputs. The tree is serializable so it can be logged or diffed.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    pub operator: String,

    /// Plans of the operators feeding this one, left to right.
    pub inputs: Vec<PlanNode>,

    /// Operator-specific settings (window size, policy, mode...).
    pub details: BTreeMap<String, String>,
}

impl PlanNode {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            inputs: vec![],
            details: BTreeMap::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<PlanNode>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        1 + self.inputs.iter().map(PlanNode::size).sum::<usize>()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn render(&self, depth: usize, out: &mut String) -> fmt::Result {
        write!(out, "{:indent$}{}", "", self.operator, indent = depth * 2)?;
        if !self.details.is_empty() {
            let parts: Vec<String> = self
                .details
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(out, " [{}]", parts.join(", "))?;
        }
        out.push('\n');
        for input in &self.inputs {
            input.render(depth + 1, out)?;
        }
        Ok(())
    }
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.render(0, &mut out)?;
        f.write_str(out.trim_end())
    }
}
