//! Profile tree merge

use trellis_shared::{Profile, ProfileNode};

/// Merge `source` into `target`, matching nodes by frame at each depth.
pub fn merge_profile(target: &mut Profile, source: &Profile) {
    target.total_samples += source.total_samples;
    merge_nodes(&mut target.roots, &source.roots);
}

fn merge_nodes(target: &mut Vec<ProfileNode>, source: &[ProfileNode]) {
    for node in source {
        match target.iter_mut().find(|n| n.frame == node.frame) {
            Some(existing) => {
                existing.sample_count += node.sample_count;
                merge_nodes(&mut existing.children, &node.children);
            }
            None => target.push(node.clone()),
        }
    }
}

/// Merge an optional profile into an optional accumulator.
pub fn merge_optional_profile(target: &mut Option<Profile>, source: Option<&Profile>) {
    let Some(source) = source.filter(|p| !p.is_empty()) else {
        return;
    };
    match target {
        Some(existing) => merge_profile(existing, source),
        None => *target = Some(source.clone()),
    }
}
