//! Dependency graph checks: reference existence, cycle detection and
//! topological ordering.
//!
//! Everything here is iterative so deep graphs cannot exhaust the stack.

use std::collections::{HashMap, VecDeque};

use crate::error::{Result, StackError};

use super::types::ServiceDescriptor;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Check that every dependency names a declared service. A service naming
/// itself is a cycle and is left to [`find_cycle`].
pub fn check_references(services: &[ServiceDescriptor]) -> Result<()> {
    let names: HashMap<&str, ()> = services.iter().map(|s| (s.name.as_str(), ())).collect();
    for svc in services {
        for dep in &svc.dependencies {
            if !names.contains_key(dep.as_str()) {
                return Err(StackError::Config(format!(
                    "service '{}' depends on undefined service '{}'",
                    svc.name, dep
                )));
            }
        }
    }
    Ok(())
}

/// Find a dependency cycle, returned as a closed path (`a, b, c, a`).
///
/// Services are visited in declaration order so the reported cycle is stable.
pub fn find_cycle(services: &[ServiceDescriptor]) -> Option<Vec<String>> {
    let index: HashMap<&str, usize> = services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; services.len()];

    for root in 0..services.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // (node, next dependency to look at)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnPath;

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let deps = &services[node].dependencies;
            if top.1 >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }
            let dep = deps[top.1].as_str();
            top.1 += 1;

            let Some(&child) = index.get(dep) else {
                continue;
            };
            match marks[child] {
                Mark::Done => {}
                Mark::OnPath => {
                    let start = stack.iter().position(|&(n, _)| n == child).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|&(n, _)| services[n].name.clone())
                        .collect();
                    cycle.push(services[child].name.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[child] = Mark::OnPath;
                    stack.push((child, 0));
                }
            }
        }
    }
    None
}

/// Order services so each appears after all of its dependencies.
///
/// Kahn's algorithm; among ready services declaration order wins.
pub fn topological_order(services: &[ServiceDescriptor]) -> Result<Vec<usize>> {
    if let Some(cycle) = find_cycle(services) {
        return Err(StackError::CyclicDependency { cycle });
    }

    let index: HashMap<&str, usize> = services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    let mut remaining: Vec<usize> = services.iter().map(|s| s.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); services.len()];
    for (i, svc) in services.iter().enumerate() {
        for dep in &svc.dependencies {
            if let Some(&d) = index.get(dep.as_str()) {
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..services.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(services.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &child in &dependents[i] {
            remaining[child] -= 1;
            if remaining[child] == 0 {
                ready.push_back(child);
            }
        }
    }

    if order.len() != services.len() {
        // find_cycle already ruled this out; keep the invariant explicit.
        return Err(StackError::Config(
            "dependency graph could not be ordered".to_string(),
        ));
    }
    Ok(order)
}

/// Group services (already topologically ordered) by dependency depth.
/// Wave 0 holds services without dependencies; every service sits one wave
/// after its deepest dependency.
pub fn launch_waves(ordered: &[ServiceDescriptor]) -> Vec<Vec<String>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();
    for svc in ordered {
        let d = svc
            .dependencies
            .iter()
            .filter_map(|dep| depth.get(dep.as_str()))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(svc.name.as_str(), d);
        if waves.len() <= d {
            waves.resize_with(d + 1, Vec::new);
        }
        waves[d].push(svc.name.clone());
    }
    waves
}
