//! Stateless lookup over a template's flattened step sequence.
//!
//! Tasks ordered by `order_index`, steps within each task likewise; the
//! concatenation is the canonical sequence. Lookups by a stale or corrupt
//! step id fail loudly with `NotFound` rather than silently defaulting.

use crate::error::{Error, Result};
use crate::model::template::{SopTemplate, Step, StepId};

/// Iterate all steps in flattened order.
pub fn flatten(template: &SopTemplate) -> impl Iterator<Item = &Step> {
    template.tasks.iter().flat_map(|t| t.steps.iter())
}

/// The first step in flattened order, if the template has any.
pub fn first_step(template: &SopTemplate) -> Option<&Step> {
    flatten(template).next()
}

/// Look up a step by id.
pub fn find_step(template: &SopTemplate, step_id: StepId) -> Result<&Step> {
    flatten(template)
        .find(|s| s.id == step_id)
        .ok_or_else(|| Error::NotFound(format!("step {step_id} in template {}", template.id)))
}

/// The flattened-sequence successor of `step_id`, or `None` when it is the
/// last step. Errors when `step_id` is not in the template at all.
pub fn next_step(template: &SopTemplate, step_id: StepId) -> Result<Option<StepId>> {
    let mut steps = flatten(template);
    if !steps.any(|s| s.id == step_id) {
        return Err(Error::NotFound(format!(
            "step {step_id} in template {}",
            template.id
        )));
    }
    Ok(steps.next().map(|s| s.id))
}

/// 1-based (task, step) position of a step, for operator-facing output.
pub fn position_of(template: &SopTemplate, step_id: StepId) -> Result<(usize, usize)> {
    for (task_idx, task) in template.tasks.iter().enumerate() {
        for (step_idx, step) in task.steps.iter().enumerate() {
            if step.id == step_id {
                return Ok((task_idx + 1, step_idx + 1));
            }
        }
    }
    Err(Error::NotFound(format!(
        "step {step_id} in template {}",
        template.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::template::SopTemplate;
    use uuid::Uuid;

    fn template() -> (SopTemplate, Vec<StepId>) {
        let mut t = SopTemplate::new("two tasks", Uuid::new_v4());
        let t1 = t.add_task("prep");
        let a = t1.add_step("step a").id;
        let b = t1.add_step("step b").id;
        let t2 = t.add_task("execute");
        let c = t2.add_step("step c").id;
        (t, vec![a, b, c])
    }

    #[test]
    fn flatten_crosses_task_boundaries_in_order() {
        let (t, ids) = template();
        let flat: Vec<StepId> = flatten(&t).map(|s| s.id).collect();
        assert_eq!(flat, ids);
        assert_eq!(first_step(&t).unwrap().id, ids[0]);
    }

    #[test]
    fn next_step_walks_the_sequence() {
        let (t, ids) = template();
        assert_eq!(next_step(&t, ids[0]).unwrap(), Some(ids[1]));
        assert_eq!(next_step(&t, ids[1]).unwrap(), Some(ids[2]));
        assert_eq!(next_step(&t, ids[2]).unwrap(), None);
    }

    #[test]
    fn stale_step_id_fails_loudly() {
        let (t, _) = template();
        let bogus = StepId::new();
        assert!(matches!(find_step(&t, bogus), Err(Error::NotFound(_))));
        assert!(matches!(next_step(&t, bogus), Err(Error::NotFound(_))));
        assert!(matches!(position_of(&t, bogus), Err(Error::NotFound(_))));
    }

    #[test]
    fn position_is_one_based_per_task() {
        let (t, ids) = template();
        assert_eq!(position_of(&t, ids[0]).unwrap(), (1, 1));
        assert_eq!(position_of(&t, ids[2]).unwrap(), (2, 1));
    }
}
