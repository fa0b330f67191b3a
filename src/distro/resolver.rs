//! Conflict Resolvers
//!
//! Both resolvers compare `delta = incoming.timestamp - current.timestamp`
//! against a clock-skew bound:
//!
//! - `delta < -bound`: incoming is stale and is discarded.
//! - `delta > bound`: incoming is clearly newer and is applied as is.
//! - otherwise the two are concurrent and are merged.
//!
//! The timestamp only moves forward. Datums that do not hold an instance
//! list are left untouched.
//!
//! Concurrent removes are dropped by [`AddWinsResolver`]: a deregistration
//! racing a newer write inside the skew window stays invisible until a
//! clearly ordered removal arrives.

use crate::store::{Datum, DatumValue, InstanceOperation, OperationKind};

/// What a merge did to the current datum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming was older than the skew window allows
    Stale,
    /// Incoming was clearly newer and applied directly
    Applied,
    /// Incoming was concurrent and merged
    Merged,
    /// Value shape not handled
    Ignored,
}

impl MergeOutcome {
    /// Whether the merge may have changed the datum
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Applied | MergeOutcome::Merged)
    }
}

fn delta(incoming: u64, current: u64) -> i128 {
    incoming as i128 - current as i128
}

/// Operation-based resolver where concurrent adds beat concurrent removes
#[derive(Debug, Clone, Copy)]
pub struct AddWinsResolver {
    max_time_difference: u64,
}

impl AddWinsResolver {
    pub fn new(max_time_difference: u64) -> Self {
        Self { max_time_difference }
    }

    pub fn merge(&self, current: &mut Datum, incoming: &InstanceOperation) -> MergeOutcome {
        let bound = self.max_time_difference as i128;
        let delta = delta(incoming.timestamp, current.timestamp);

        let instances = match &mut current.value {
            DatumValue::Instances(instances) => instances,
            DatumValue::Opaque(_) => return MergeOutcome::Ignored,
        };

        if delta < 0 && -delta > bound {
            return MergeOutcome::Stale;
        }

        let outcome = if delta > bound {
            incoming.apply_to(instances);
            MergeOutcome::Applied
        } else {
            match incoming.kind {
                OperationKind::Add => instances.add(&incoming.instances),
                OperationKind::Remove => {
                    tracing::debug!(
                        "Dropping concurrent remove of {} instances from {} (delta {}ms)",
                        incoming.instances.len(),
                        current.key,
                        delta
                    );
                }
            }
            MergeOutcome::Merged
        };

        current.advance_timestamp(incoming.timestamp);
        outcome
    }
}

/// State-based resolver that only ever grows the instance set inside the
/// skew window
#[derive(Debug, Clone, Copy)]
pub struct GrowOnlyResolver {
    max_time_difference: u64,
}

impl GrowOnlyResolver {
    pub fn new(max_time_difference: u64) -> Self {
        Self { max_time_difference }
    }

    pub fn merge(&self, current: &mut Datum, incoming: &Datum) -> MergeOutcome {
        let bound = self.max_time_difference as i128;
        let delta = delta(incoming.timestamp, current.timestamp);

        let (instances, other) = match (&mut current.value, &incoming.value) {
            (DatumValue::Instances(mine), DatumValue::Instances(theirs)) => (mine, theirs),
            _ => return MergeOutcome::Ignored,
        };

        if delta < 0 && -delta > bound {
            return MergeOutcome::Stale;
        }

        if delta > bound {
            *instances = other.clone();
            current.timestamp = incoming.timestamp;
            return MergeOutcome::Applied;
        }

        instances.union(other, delta > 0);
        current.advance_timestamp(incoming.timestamp);
        MergeOutcome::Merged
    }
}
