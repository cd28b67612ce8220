use std::collections::{HashMap, HashSet, VecDeque};

use super::store::DeviceDirectory;
use super::types::{DeviceFilter, HierarchyNode};
use crate::error::SeriesError;

/// Devices of `root_id` and all of its descendants, deduplicated.
pub fn expand(root_id: &str, nodes: &[HierarchyNode]) -> Result<HashSet<String>, SeriesError> {
    let by_id: HashMap<&str, &HierarchyNode> =
        nodes.iter().map(|node| (node.id.as_str(), node)).collect();
    let root = by_id
        .get(root_id)
        .ok_or_else(|| SeriesError::NotFound(format!("Hierarchy {root_id} not found")))?;

    let mut children: HashMap<&str, Vec<&HierarchyNode>> = HashMap::new();
    for node in nodes {
        if let Some(parent) = node.parent_id.as_deref() {
            children.entry(parent).or_default().push(node);
        }
    }

    let mut devices: HashSet<String> = HashSet::new();
    // Guards against malformed parent links forming a cycle.
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&HierarchyNode> = VecDeque::from([*root]);
    while let Some(node) = queue.pop_front() {
        if !visited.insert(node.id.as_str()) {
            continue;
        }
        devices.extend(node.member_device_ids.iter().cloned());
        if let Some(kids) = children.get(node.id.as_str()) {
            queue.extend(kids.iter().copied());
        }
    }
    Ok(devices)
}

/// Device filter for a request; no hierarchy means no restriction.
pub async fn resolve_device_filter(
    directory: &dyn DeviceDirectory,
    company_id: &str,
    hierarchy_id: Option<&str>,
) -> Result<DeviceFilter, SeriesError> {
    let Some(hierarchy_id) = hierarchy_id.map(str::trim).filter(|id| !id.is_empty()) else {
        return Ok(DeviceFilter::All);
    };

    let nodes = directory.hierarchy_nodes(company_id).await?;
    let devices = expand(hierarchy_id, &nodes)?;
    tracing::debug!(
        hierarchy_id = %hierarchy_id,
        devices = devices.len(),
        "expanded hierarchy"
    );
    Ok(DeviceFilter::Only(devices))
}
