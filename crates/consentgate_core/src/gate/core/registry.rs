//! Static catalog of integrable third-party services.
//!
//! The registry is validated once at startup: identifiers are unique,
//! priorities lie in `1..=10`, every dependency names a registered service and
//! the dependency graph is acyclic. A cycle is a configuration bug and makes
//! [`ServiceRegistry::new`] fail, since a service waiting on itself would stay
//! `pending` forever.
//!
//! Descriptors are kept in load order: dependencies before dependents, and
//! among services that are ready at the same time, lower priority values first.
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use serde::{Deserialize, Serialize};

use crate::gate::{core::record::ConsentCategory, error::RegistryError};

/// Immutable description of one third-party integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub category: ConsentCategory,
    /// 1 (first) to 10 (last).
    pub priority: u8,
    pub is_essential: bool,
    pub load_timeout_ms: u64,
    pub max_retries: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl ServiceDescriptor {
    pub fn new(id: &str, name: &str, category: ConsentCategory) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            category,
            priority: 5,
            is_essential: category == ConsentCategory::Necessary,
            load_timeout_ms: 10_000,
            max_retries: 3,
            dependencies: Vec::new(),
        }
    }

    pub fn with_priority(self, priority: u8) -> Self {
        Self { priority, ..self }
    }

    pub fn with_load_timeout_ms(self, load_timeout_ms: u64) -> Self {
        Self { load_timeout_ms, ..self }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self { max_retries, ..self }
    }

    pub fn with_dependencies(self, dependencies: &[&str]) -> Self {
        Self { dependencies: dependencies.iter().map(|id| id.to_string()).collect(), ..self }
    }

    pub fn essential(self, is_essential: bool) -> Self {
        Self { is_essential, ..self }
    }
}

/// Validated, load-ordered set of [`ServiceDescriptor`]s.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    descriptors: Vec<ServiceDescriptor>,
    index: HashMap<String, usize>,
}

impl ServiceRegistry {
    pub fn new(descriptors: Vec<ServiceDescriptor>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(descriptors.len());
        for (position, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.id.clone(), position).is_some() {
                return Err(RegistryError::DuplicateService(descriptor.id.clone()));
            }
            if !(1..=10).contains(&descriptor.priority) {
                return Err(RegistryError::InvalidPriority {
                    service: descriptor.id.clone(),
                    priority: descriptor.priority,
                });
            }
        }
        for descriptor in &descriptors {
            if let Some(dependency) =
                descriptor.dependencies.iter().find(|dependency| !index.contains_key(*dependency))
            {
                return Err(RegistryError::UnknownDependency {
                    service: descriptor.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
        if let Some(cycle) = find_cycle(&descriptors, &index) {
            return Err(RegistryError::Cycle(cycle));
        }

        let descriptors = load_order(descriptors, &index);
        let index = descriptors
            .iter()
            .enumerate()
            .map(|(position, descriptor)| (descriptor.id.clone(), position))
            .collect();
        Ok(Self { descriptors, index })
    }

    pub fn get(&self, id: &str) -> Option<&ServiceDescriptor> {
        self.index.get(id).map(|position| &self.descriptors[*position])
    }

    /// Descriptors in load order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.iter()
    }

    pub fn in_category(&self, category: ConsentCategory) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.iter().filter(move |descriptor| descriptor.category == category)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Catalog of a property booking site.
    pub fn default_catalog() -> Result<Self, RegistryError> {
        use ConsentCategory::*;
        Self::new(vec![
            ServiceDescriptor::new("session", "Session and CSRF cookies", Necessary)
                .with_priority(1)
                .with_load_timeout_ms(5_000),
            ServiceDescriptor::new("consent-log", "Consent receipt beacon", Necessary)
                .with_priority(2)
                .with_load_timeout_ms(5_000),
            ServiceDescriptor::new("google-analytics", "Google Analytics", Analytics)
                .with_priority(3),
            ServiceDescriptor::new("hotjar", "Hotjar heatmaps", Analytics)
                .with_priority(6)
                .with_max_retries(2),
            ServiceDescriptor::new("tag-manager", "Google Tag Manager", Marketing).with_priority(2),
            ServiceDescriptor::new("facebook-pixel", "Facebook Pixel", Marketing)
                .with_priority(5)
                .with_dependencies(&["tag-manager"]),
            ServiceDescriptor::new("google-ads", "Google Ads conversion", Marketing)
                .with_priority(7)
                .with_dependencies(&["tag-manager"]),
            ServiceDescriptor::new("recommendations", "Personalized recommendations", Preferences)
                .with_priority(4),
            ServiceDescriptor::new("saved-searches", "Saved searches", Preferences)
                .with_priority(8)
                .with_max_retries(1),
        ])
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn find_cycle(
    descriptors: &[ServiceDescriptor],
    index: &HashMap<String, usize>,
) -> Option<Vec<String>> {
    fn visit(
        node: usize,
        descriptors: &[ServiceDescriptor],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        path.push(node);
        for dependency in &descriptors[node].dependencies {
            let next = index[dependency];
            match marks[next] {
                Mark::InProgress => {
                    let start = path.iter().position(|visited| *visited == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|i| descriptors[*i].id.clone()).collect();
                    cycle.push(descriptors[next].id.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, descriptors, index, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; descriptors.len()];
    let mut path = Vec::new();
    (0..descriptors.len()).find_map(|node| {
        if marks[node] == Mark::Unvisited {
            visit(node, descriptors, index, &mut marks, &mut path)
        } else {
            None
        }
    })
}

/// Kahn's algorithm, breaking ties by (priority, declaration order).
fn load_order(
    descriptors: Vec<ServiceDescriptor>,
    index: &HashMap<String, usize>,
) -> Vec<ServiceDescriptor> {
    let mut pending: Vec<usize> =
        descriptors.iter().map(|descriptor| descriptor.dependencies.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
    for (position, descriptor) in descriptors.iter().enumerate() {
        for dependency in &descriptor.dependencies {
            dependents[index[dependency]].push(position);
        }
    }

    let mut ready: BinaryHeap<Reverse<(u8, usize)>> = descriptors
        .iter()
        .enumerate()
        .filter(|(position, _)| pending[*position] == 0)
        .map(|(position, descriptor)| Reverse((descriptor.priority, position)))
        .collect();
    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(Reverse((_, position))) = ready.pop() {
        order.push(position);
        for dependent in &dependents[position] {
            pending[*dependent] -= 1;
            if pending[*dependent] == 0 {
                ready.push(Reverse((descriptors[*dependent].priority, *dependent)));
            }
        }
    }

    let mut slots: Vec<Option<ServiceDescriptor>> = descriptors.into_iter().map(Some).collect();
    order.into_iter().filter_map(|position| slots[position].take()).collect()
}
