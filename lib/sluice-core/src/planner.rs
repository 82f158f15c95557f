//! Update planning.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
};

use indexmap::IndexSet;
use snafu::Snafu;

use crate::registry::ServiceDefinition;

/// Planning error.
///
/// Every variant is fatal for the run: no service is touched when a plan cannot be built.
#[derive(Debug, Snafu, Eq, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[snafu(display(
        "dependency cycle detected: {}; break the cycle in the registry file",
        path.join(" -> ")
    ))]
    Cycle {
        /// Services forming the cycle, starting and ending with the same service.
        path: Vec<String>,
    },

    /// A service depends on a service that is not registered.
    #[snafu(display(
        "service '{}' depends on unknown service '{}'; register it or remove the dependency",
        service,
        dependency
    ))]
    MissingDependency {
        /// Dependent service.
        service: String,

        /// Missing dependency.
        dependency: String,
    },

    /// The run was restricted to a service that is not registered.
    #[snafu(display("unknown service '{}'; run `sluice status` to list registered services", name))]
    UnknownService {
        /// Requested service name.
        name: String,
    },
}

/// An ordered sequence of services to process in one run.
///
/// Every dependency of an entry either appears earlier in the plan or is not part of the plan at all. The plan is fixed
/// once built.
#[derive(Clone, Debug)]
pub struct UpdatePlan {
    services: Vec<ServiceDefinition>,
}

impl UpdatePlan {
    /// Builds a plan over all of the given services.
    ///
    /// Services are sorted topologically by dependency. Whenever more than one service is ready, the one with the lowest
    /// priority goes first, and ties are broken by declaration order.
    ///
    /// # Errors
    ///
    /// If the dependency graph has a cycle or references an unknown service, an error is returned.
    pub fn build(services: &[ServiceDefinition]) -> Result<Self, PlanError> {
        let order = topological_order(services)?;
        Ok(Self {
            services: order.into_iter().map(|i| services[i].clone()).collect(),
        })
    }

    /// Builds a plan containing only the named service.
    ///
    /// The full dependency graph is still validated. The service's dependencies are not part of the plan.
    ///
    /// # Errors
    ///
    /// If the service is unknown, or the dependency graph is invalid, an error is returned.
    pub fn build_for(services: &[ServiceDefinition], name: &str) -> Result<Self, PlanError> {
        let full = Self::build(services)?;
        let service = full
            .services
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| PlanError::UnknownService { name: name.to_string() })?;

        Ok(Self {
            services: vec![service],
        })
    }

    /// Returns the planned services, in order.
    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    /// Returns `true` if the named service is part of this plan.
    pub fn contains(&self, name: &str) -> bool {
        self.services.iter().any(|s| s.name == name)
    }

    /// Returns the number of planned services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns `true` if nothing is planned.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Display for UpdatePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, service) in self.services.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&service.name)?;
        }
        f.write_str("]")
    }
}

/// Returns service indexes in plan order.
fn topological_order(services: &[ServiceDefinition]) -> Result<Vec<usize>, PlanError> {
    let index_of = services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect::<HashMap<_, _>>();

    let mut remaining_deps = vec![0usize; services.len()];
    let mut dependents = vec![Vec::new(); services.len()];
    for (i, service) in services.iter().enumerate() {
        for dependency in &service.dependencies {
            let Some(&d) = index_of.get(dependency.as_str()) else {
                return Err(PlanError::MissingDependency {
                    service: service.name.clone(),
                    dependency: dependency.clone(),
                });
            };
            remaining_deps[i] += 1;
            dependents[d].push(i);
        }
    }

    // Min-heap on (priority, declaration index).
    let mut ready = BinaryHeap::new();
    for (i, service) in services.iter().enumerate() {
        if remaining_deps[i] == 0 {
            ready.push(Reverse((service.priority, i)));
        }
    }

    let mut order = Vec::with_capacity(services.len());
    while let Some(Reverse((_, i))) = ready.pop() {
        order.push(i);
        for &dependent in &dependents[i] {
            remaining_deps[dependent] -= 1;
            if remaining_deps[dependent] == 0 {
                ready.push(Reverse((services[dependent].priority, dependent)));
            }
        }
    }

    if order.len() == services.len() {
        Ok(order)
    } else {
        Err(PlanError::Cycle {
            path: find_cycle(services, &index_of, &remaining_deps),
        })
    }
}

/// Finds one dependency cycle among the services that could not be ordered.
fn find_cycle(services: &[ServiceDefinition], index_of: &HashMap<&str, usize>, remaining_deps: &[usize]) -> Vec<String> {
    let mut visited = vec![false; services.len()];

    for start in (0..services.len()).filter(|&i| remaining_deps[i] > 0) {
        if visited[start] {
            continue;
        }

        // Depth-first along dependency edges, keeping the current path so we can report it once we loop back.
        let mut stack = IndexSet::new();
        let mut traversal = vec![(start, 0usize)];
        stack.insert(start);
        visited[start] = true;

        while let Some((node, next_edge)) = traversal.last_mut() {
            let node = *node;
            let Some(dependency) = services[node].dependencies.get(*next_edge) else {
                stack.shift_remove(&node);
                traversal.pop();
                continue;
            };
            *next_edge += 1;

            let d = index_of[dependency.as_str()];
            if let Some(position) = stack.get_index_of(&d) {
                let mut path = stack
                    .iter()
                    .skip(position)
                    .map(|&i| services[i].name.clone())
                    .collect::<Vec<_>>();
                path.push(services[d].name.clone());
                return path;
            }
            if !visited[d] {
                visited[d] = true;
                stack.insert(d);
                traversal.push((d, 0));
            }
        }
    }

    Vec::new()
}
