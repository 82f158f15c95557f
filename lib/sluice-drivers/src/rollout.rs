//! Step plans for backends that replace instances one by one.
//!
//! A plan is computed up front from instance counts alone and then executed in order, so the bounds it keeps can be
//! checked without a backend.

use sluice_core::driver::RolloutBounds;

/// One step of a rollout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Step {
    /// Stop and remove this many outdated instances, oldest first.
    Retire(usize),

    /// Start this many instances on the target version and wait until every one of them is ready.
    Launch(usize),
}

/// Plans a rolling move to the target version.
///
/// `outdated` instances run some other version, and `current` instances already run the target version. The plan
/// ends with `replicas` target instances and no outdated ones.
///
/// Ready instances never drop below `replicas - max_unavailable`, unless they started out lower, and instances never
/// exceed `replicas + max_surge`. In-place plans never surge, for instances that cannot run side by side.
pub fn rolling_steps(
    outdated: usize, current: usize, replicas: usize, bounds: RolloutBounds, in_place: bool,
) -> Vec<Step> {
    let max_unavailable = (bounds.max_unavailable as usize).max(1);
    let max_surge = if in_place {
        0
    } else {
        (bounds.max_surge as usize).max(1)
    };
    let floor = replicas.saturating_sub(max_unavailable);
    let ceiling = replicas + max_surge;

    let mut steps = Vec::new();
    let mut outdated = outdated;
    let mut ready = current;

    while ready < replicas {
        let live = outdated + ready;
        let wanted = replicas - ready;
        let room = ceiling.saturating_sub(live);

        if room > 0 {
            let launch = wanted.min(room);
            steps.push(Step::Launch(launch));
            ready += launch;
        } else {
            // No room means `live >= replicas > floor` and `outdated >= 1`, so at least one instance retires.
            let retire = outdated.min(live - floor).min(wanted);
            steps.push(Step::Retire(retire));
            outdated -= retire;
        }
    }

    if outdated > 0 {
        steps.push(Step::Retire(outdated));
    }

    steps
}

/// Plans a blue-green move: the full new set is started and ready before any outdated instance is removed.
pub fn blue_green_steps(outdated: usize, current: usize, replicas: usize) -> Vec<Step> {
    let mut steps = Vec::with_capacity(2);
    if current < replicas {
        steps.push(Step::Launch(replicas - current));
    }
    if outdated > 0 {
        steps.push(Step::Retire(outdated));
    }
    steps
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn bounds(max_unavailable: u32, max_surge: u32) -> RolloutBounds {
        RolloutBounds {
            max_unavailable,
            max_surge,
        }
    }

    /// Counts after every step.
    #[derive(Debug, Default)]
    struct Walk {
        /// Lowest number of ready instances seen.
        min_ready: usize,

        /// Highest number of instances seen, ready or starting.
        max_total: usize,

        /// Outdated and target instances at the end.
        end: (usize, usize),
    }

    fn walk(mut outdated: usize, mut current: usize, steps: &[Step]) -> Walk {
        let mut walk = Walk {
            min_ready: outdated + current,
            max_total: outdated + current,
            end: (0, 0),
        };
        for step in steps {
            match *step {
                Step::Retire(count) => {
                    assert!(count > 0 && count <= outdated, "retiring {} of {}", count, outdated);
                    outdated -= count;
                }
                Step::Launch(count) => {
                    assert!(count > 0);
                    walk.max_total = walk.max_total.max(outdated + current + count);
                    current += count;
                }
            }
            walk.min_ready = walk.min_ready.min(outdated + current);
        }
        walk.end = (outdated, current);
        walk
    }

    #[test]
    fn surge_replacement() {
        let steps = rolling_steps(3, 0, 3, bounds(1, 1), false);
        assert_eq!(
            steps,
            vec![Step::Launch(1), Step::Retire(2), Step::Launch(2), Step::Retire(1)]
        );

        let walk = walk(3, 0, &steps);
        assert_eq!(walk.min_ready, 2);
        assert_eq!(walk.max_total, 4);
        assert_eq!(walk.end, (0, 3));
    }

    #[test]
    fn in_place_replacement_never_surges() {
        let steps = rolling_steps(3, 0, 3, bounds(1, 2), true);
        assert_eq!(
            steps,
            vec![
                Step::Retire(1),
                Step::Launch(1),
                Step::Retire(1),
                Step::Launch(1),
                Step::Retire(1),
                Step::Launch(1)
            ]
        );
        assert_eq!(walk(3, 0, &steps).max_total, 3);
    }

    #[test]
    fn single_replica() {
        assert_eq!(rolling_steps(1, 0, 1, bounds(1, 1), false), vec![Step::Launch(1), Step::Retire(1)]);
        assert_eq!(rolling_steps(1, 0, 1, bounds(1, 1), true), vec![Step::Retire(1), Step::Launch(1)]);
    }

    #[test]
    fn revert_after_complete_rollout_keeps_service_up() {
        // Every instance already moved to the failed candidate.
        let steps = rolling_steps(3, 0, 3, bounds(1, 1), false);
        assert_ne!(steps.first(), Some(&Step::Retire(3)));
        assert_eq!(walk(3, 0, &steps).min_ready, 2);
    }

    #[test]
    fn revert_after_partial_rollout() {
        // Two instances still on the previous version, one on the candidate.
        let steps = rolling_steps(1, 2, 3, bounds(1, 1), false);
        assert_eq!(steps, vec![Step::Launch(1), Step::Retire(1)]);
    }

    #[test]
    fn nothing_to_do() {
        assert!(rolling_steps(0, 3, 3, bounds(1, 1), false).is_empty());
        assert!(blue_green_steps(0, 3, 3).is_empty());
    }

    #[test]
    fn leftover_instances_are_retired() {
        // An interrupted surge left an extra outdated instance.
        let steps = rolling_steps(4, 0, 3, bounds(1, 1), false);
        assert_eq!(walk(4, 0, &steps).end, (0, 3));
    }

    #[test]
    fn blue_green_retires_only_after_new_set_is_ready() {
        let steps = blue_green_steps(3, 0, 3);
        assert_eq!(steps, vec![Step::Launch(3), Step::Retire(3)]);

        let walk = walk(3, 0, &steps);
        assert_eq!(walk.min_ready, 3);
        assert_eq!(walk.max_total, 6);

        // Cleanup after a blue-green attempt that got partway.
        assert_eq!(blue_green_steps(2, 1, 3), vec![Step::Launch(2), Step::Retire(2)]);
    }

    proptest! {
        #[test]
        fn rolling_plans_keep_their_bounds(
            outdated in 0usize..12,
            current in 0usize..6,
            replicas in 1usize..12,
            max_unavailable in 1u32..5,
            max_surge in 1u32..5,
            in_place: bool,
        ) {
            let current = current.min(replicas);
            let steps = rolling_steps(outdated, current, replicas, bounds(max_unavailable, max_surge), in_place);
            let walk = walk(outdated, current, &steps);

            let floor = replicas.saturating_sub(max_unavailable as usize);
            let surge = if in_place { 0 } else { max_surge as usize };
            let ceiling = replicas + surge;

            prop_assert_eq!(walk.end, (0, replicas));
            prop_assert!(walk.min_ready >= floor.min(outdated + current));
            prop_assert!(walk.max_total <= ceiling.max(outdated + current));
        }

        #[test]
        fn blue_green_plans_never_reduce_capacity(
            outdated in 0usize..12,
            current in 0usize..6,
            replicas in 1usize..12,
        ) {
            let current = current.min(replicas);
            let steps = blue_green_steps(outdated, current, replicas);
            let walk = walk(outdated, current, &steps);

            prop_assert_eq!(walk.end, (0, replicas));
            prop_assert!(walk.min_ready >= (outdated + current).min(replicas));
            if let Some(position) = steps.iter().position(|s| matches!(s, Step::Retire(_))) {
                prop_assert!(steps[..position].iter().all(|s| matches!(s, Step::Launch(_))));
                prop_assert_eq!(position, steps.len() - 1);
            }
        }
    }
}
