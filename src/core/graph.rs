//! Dependency graph checks over service definitions.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::error::ConfigurationError;

/// One service in the dependency graph
#[derive(Debug, Clone, Copy)]
pub struct GraphNode<'a> {
    pub name: &'a str,
    pub priority: i32,
    pub dependencies: &'a [String],
}

/// Find a dependency cycle, returned as a path that starts and ends on the same service.
///
/// Dependencies that are not part of the graph are ignored.
pub fn find_cycle(nodes: &[GraphNode<'_>]) -> Option<Vec<String>> {
    let edges: HashMap<&str, &[String]> = nodes.iter().map(|n| (n.name, n.dependencies)).collect();

    let mut names: Vec<&str> = edges.keys().copied().collect();
    names.sort_unstable();

    let mut visited = HashSet::new();
    let mut stack = Vec::new();
    for name in names {
        if let Some(cycle) = visit(name, &edges, &mut visited, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    edges: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    if let Some(pos) = stack.iter().position(|n| *n == node) {
        let mut cycle: Vec<String> = stack[pos..].iter().map(|n| n.to_string()).collect();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    if visited.contains(node) {
        return None;
    }

    visited.insert(node);
    stack.push(node);

    if let Some(deps) = edges.get(node) {
        for dep in deps.iter() {
            let Some((&dep, _)) = edges.get_key_value(dep.as_str()) else {
                continue;
            };
            if let Some(cycle) = visit(dep, edges, visited, stack) {
                return Some(cycle);
            }
        }
    }

    stack.pop();
    None
}

/// Check every dependency refers to a node in the graph
pub fn check_dependencies(nodes: &[GraphNode<'_>]) -> Result<(), ConfigurationError> {
    let known: HashSet<&str> = nodes.iter().map(|n| n.name).collect();
    let mut sorted: Vec<&GraphNode<'_>> = nodes.iter().collect();
    sorted.sort_by_key(|n| n.name);

    for node in sorted {
        if let Some(missing) = node
            .dependencies
            .iter()
            .find(|d| !known.contains(d.as_str()))
        {
            return Err(ConfigurationError::UnknownDependency {
                service: node.name.to_string(),
                dependency: missing.clone(),
            });
        }
    }
    Ok(())
}

/// Topological order, dependencies first; ties go to lower priority, then name
pub fn topological_order(nodes: &[GraphNode<'_>]) -> Result<Vec<String>, ConfigurationError> {
    check_dependencies(nodes)?;
    if let Some(cycle) = find_cycle(nodes) {
        return Err(ConfigurationError::CyclicDependency { cycle });
    }

    let by_name: HashMap<&str, &GraphNode<'_>> = nodes.iter().map(|n| (n.name, n)).collect();
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in nodes {
        let unique: HashSet<&str> = node.dependencies.iter().map(String::as_str).collect();
        remaining.insert(node.name, unique.len());
        for dep in unique {
            dependents.entry(dep).or_default().push(node.name);
        }
    }

    let mut ready: BTreeSet<(i32, &str)> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| (by_name[name].priority, *name))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.pop_first() {
        let (_, name) = next;
        order.push(name.to_string());

        for dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert((by_name[dependent].priority, *dependent));
                }
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn node<'a>(name: &'a str, priority: i32, dependencies: &'a [String]) -> GraphNode<'a> {
        GraphNode {
            name,
            priority,
            dependencies,
        }
    }

    #[test]
    fn test_detects_cycle_path() {
        let a = deps(&["c"]);
        let b = deps(&["a"]);
        let c = deps(&["b"]);
        let nodes = [
            node("a", 0, &a),
            node("b", 0, &b),
            node("c", 0, &c),
        ];

        let cycle = find_cycle(&nodes).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let a = deps(&["a"]);
        let nodes = [node("a", 0, &a)];
        assert_eq!(find_cycle(&nodes), Some(deps(&["a", "a"])));
    }

    #[test]
    fn test_unknown_dependencies_are_not_cycles() {
        let a = deps(&["missing"]);
        let nodes = [node("a", 0, &a)];
        assert!(find_cycle(&nodes).is_none());
        assert_eq!(
            check_dependencies(&nodes),
            Err(ConfigurationError::UnknownDependency {
                service: "a".into(),
                dependency: "missing".into()
            })
        );
    }

    #[test]
    fn test_topological_order_with_priorities() {
        let none = deps(&[]);
        let on_db = deps(&["db"]);
        let on_cache_db = deps(&["cache", "db"]);
        let nodes = [
            node("api", 0, &on_cache_db),
            node("cache", 2, &on_db),
            node("db", 5, &none),
            node("auth", 1, &none),
        ];

        let order = topological_order(&nodes).unwrap();
        assert_eq!(order, deps(&["auth", "db", "cache", "api"]));
    }
}
