//! Dissolve bundles into the ordered list of leaf units an attempt runs.

use crate::model::work::TASK_ID_KEY;
use crate::model::{JOB_ID_KEY, JOB_NAME_KEY, JobState, Properties, WorkDescriptor, WorkUnit};

/// Bundle properties that name one thing and so never pass down to leaves.
fn inheritable(key: &str) -> bool {
    key != TASK_ID_KEY && !key.starts_with("job.")
}

/// Expand a descriptor into its leaf units, depth-first, in encounter order.
///
/// Properties set on a bundle are inherited by everything nested inside it;
/// the value closest to the leaf wins. `task.id` and `job.*` stay on the
/// bundle that set them. A single unit comes back unchanged as
/// a one-element list.
pub fn flatten(descriptor: &WorkDescriptor) -> Vec<WorkUnit> {
    let mut out = Vec::with_capacity(descriptor.leaf_count());
    flatten_into(descriptor, &Properties::new(), &mut out);
    out
}

fn flatten_into(descriptor: &WorkDescriptor, inherited: &Properties, out: &mut Vec<WorkUnit>) {
    match descriptor {
        WorkDescriptor::Unit(unit) => {
            let mut leaf = unit.clone();
            for (key, value) in inherited {
                leaf.set_default(key, value);
            }
            out.push(leaf);
        }
        WorkDescriptor::Bundle(bundle) => {
            let mut scope = inherited.clone();
            scope.extend(
                bundle
                    .properties
                    .iter()
                    .filter(|(key, _)| inheritable(key))
                    .map(|(key, value)| (key.clone(), value.clone())),
            );
            for child in &bundle.units {
                flatten_into(child, &scope, out);
            }
        }
    }
}

/// Stamp job identity onto every unit and fill in any job property a unit
/// does not define itself.
pub fn propagate_job_config(units: &mut [WorkUnit], job: &JobState) {
    for unit in units.iter_mut() {
        unit.properties
            .insert(JOB_NAME_KEY.to_string(), job.job_name.clone());
        unit.properties
            .insert(JOB_ID_KEY.to_string(), job.job_id.to_string());
        for (key, value) in &job.properties {
            unit.set_default(key, value);
        }
    }
}
