use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::Result;
use crate::schema::flag_field;

/// Standard CTD derivations: a verdict on the key also applies to every value
/// computed from it.
const DEFAULT_DEPENDENCIES: &[(&str, &[&str])] = &[
    ("CNDC_CTD", &["SALT_CTD"]),
    ("CNDC2_CTD", &["SALT2_CTD"]),
    ("TEMP_CTD", &["DENS_CTD", "SVEL_CTD", "DOXY_SAT_CTD"]),
    ("TEMP2_CTD", &["DENS2_CTD", "SVEL2_CTD", "DOXY_SAT2_CTD"]),
    ("SALT_CTD", &["DENS_CTD", "SVEL_CTD", "DOXY_SAT_CTD"]),
    ("SALT2_CTD", &["DENS2_CTD", "SVEL2_CTD", "DOXY_SAT2_CTD"]),
    ("DOXY_CTD", &["DOXY_SAT_CTD"]),
    ("DOXY2_CTD", &["DOXY_SAT2_CTD"]),
];

/// Directed graph of parameter derivations.
///
/// An edge `a -> b` means `b` is computed from `a`, so any flag set on `a`
/// must also be set on `b`. Dependents are followed transitively.
#[derive(Debug, Clone)]
pub struct ParameterDependencies {
    graph: DiGraph<String, ()>,
    /// Map from parameter name → NodeIndex for fast lookup.
    node_map: HashMap<String, NodeIndex>,
}

impl Default for ParameterDependencies {
    fn default() -> Self {
        Self::from_pairs(
            DEFAULT_DEPENDENCIES
                .iter()
                .flat_map(|(par, deps)| deps.iter().map(move |dep| (*par, *dep))),
        )
    }
}

impl ParameterDependencies {
    /// No dependencies: every verdict lands on its own parameter only.
    pub fn empty() -> Self {
        Self {
            graph: DiGraph::new(),
            node_map: HashMap::new(),
        }
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut deps = Self::empty();
        for (parameter, dependent) in pairs {
            deps.add(parameter, dependent);
        }
        deps
    }

    /// Load from JSON `{"TEMP_CTD": ["DENS_CTD", ...]}`. Names may carry the
    /// `Q0_` prefix.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(json)?;
        let mut deps = Self::empty();
        for (parameter, dependents) in &raw {
            for dependent in dependents {
                deps.add(parameter, dependent);
            }
        }
        Ok(deps)
    }

    pub fn add(&mut self, parameter: &str, dependent: &str) {
        let src = self.node(strip_flag_prefix(parameter));
        let dst = self.node(strip_flag_prefix(dependent));
        if src != dst && self.graph.find_edge(src, dst).is_none() {
            self.graph.add_edge(src, dst, ());
        }
    }

    /// Every parameter derived from `parameter`, directly or indirectly, in
    /// discovery order.
    pub fn dependent_parameters(&self, parameter: &str) -> Vec<String> {
        let Some(&start) = self.node_map.get(strip_flag_prefix(parameter)) else {
            return Vec::new();
        };
        self.reachable(start)
            .into_iter()
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// `Q0_` keys that receive the verdict for `parameter`: its own first,
    /// then its dependents.
    pub fn flag_keys(&self, parameter: &str) -> Vec<String> {
        let own = strip_flag_prefix(parameter);
        std::iter::once(own.to_string())
            .chain(self.dependent_parameters(own))
            .map(|p| flag_field::auto_key(&p))
            .collect()
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(idx) = self.node_map.get(name) {
            return *idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.node_map.insert(name.to_string(), idx);
        idx
    }

    /// Depth-first walk along outgoing edges, excluding `start` itself.
    fn reachable(&self, start: NodeIndex) -> Vec<NodeIndex> {
        let mut result = Vec::new();
        let mut visited = HashSet::from([start]);
        let mut stack: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .collect();
        stack.reverse();

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            result.push(node);
            let mut next: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .filter(|n| !visited.contains(n))
                .collect();
            next.reverse();
            stack.extend(next);
        }

        result
    }
}

fn strip_flag_prefix(name: &str) -> &str {
    name.strip_prefix(flag_field::AUTO_PREFIX).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_transitive() {
        let deps = ParameterDependencies::default();
        let mut from_cndc = deps.dependent_parameters("CNDC_CTD");
        from_cndc.sort();
        assert_eq!(
            from_cndc,
            vec!["DENS_CTD", "DOXY_SAT_CTD", "SALT_CTD", "SVEL_CTD"]
        );
        assert!(deps.dependent_parameters("PRES_CTD").is_empty());
    }

    #[test]
    fn test_flag_keys_start_with_own_parameter() {
        let deps = ParameterDependencies::from_pairs([("TEMP_CTD", "DENS_CTD")]);
        assert_eq!(deps.flag_keys("TEMP_CTD"), vec!["Q0_TEMP_CTD", "Q0_DENS_CTD"]);
        assert_eq!(deps.flag_keys("PRES_CTD"), vec!["Q0_PRES_CTD"]);
    }

    #[test]
    fn test_from_json_accepts_flag_prefixes() {
        let deps =
            ParameterDependencies::from_json_str(r#"{"Q0_DOXY_CTD": ["Q0_DOXY_SAT_CTD"]}"#).unwrap();
        assert_eq!(deps.dependent_parameters("DOXY_CTD"), vec!["DOXY_SAT_CTD"]);
    }

    #[test]
    fn test_cycles_terminate() {
        let deps = ParameterDependencies::from_pairs([("A", "B"), ("B", "A")]);
        assert_eq!(deps.dependent_parameters("A"), vec!["B"]);
    }
}
