//! Chart containers: the host-side slots charts are mounted into.
//!
//! A container carries string attributes (`data-user-group-id`,
//! `data-chart-type`) and a size. Removing a chart removes its container.

use std::collections::BTreeMap;

use crate::plot::PlotSize;

pub const ATTR_USER_GROUP_ID: &str = "data-user-group-id";
pub const ATTR_CHART_TYPE: &str = "data-chart-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(u64);

#[derive(Debug, Clone, PartialEq)]
pub struct ChartContainer {
    pub id: ContainerId,
    pub attributes: BTreeMap<String, String>,
    pub size: PlotSize,
}

impl ChartContainer {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Ordered set of containers; order is mount order.
#[derive(Debug, Default)]
pub struct HostContainer {
    containers: Vec<ChartContainer>,
    next_id: u64,
}

impl HostContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, size: PlotSize) -> ContainerId {
        self.next_id += 1;
        let id = ContainerId(self.next_id);
        self.containers.push(ChartContainer {
            id,
            attributes: BTreeMap::new(),
            size,
        });
        id
    }

    pub fn get(&self, id: ContainerId) -> Option<&ChartContainer> {
        self.containers.iter().find(|c| c.id == id)
    }

    pub fn set_attribute(&mut self, id: ContainerId, key: &str, value: &str) -> bool {
        match self.containers.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.attributes.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    /// Update a container size. Returns false when the size is unchanged
    /// or the container is gone.
    pub fn resize(&mut self, id: ContainerId, size: PlotSize) -> bool {
        match self.containers.iter_mut().find(|c| c.id == id) {
            Some(c) if c.size != size => {
                c.size = size;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: ContainerId) -> bool {
        let before = self.containers.len();
        self.containers.retain(|c| c.id != id);
        before != self.containers.len()
    }

    pub fn find_by_attribute(&self, key: &str, value: &str) -> Option<ContainerId> {
        self.containers
            .iter()
            .find(|c| c.attribute(key) == Some(value))
            .map(|c| c.id)
    }

    pub fn list(&self) -> &[ChartContainer] {
        &self.containers
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn clear(&mut self) {
        self.containers.clear();
    }
}
