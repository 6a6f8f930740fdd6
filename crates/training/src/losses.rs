//! Cross-process averaging of step losses for logging.

use std::collections::BTreeMap;

use crate::comm::{CommError, ProcessGroup};

/// Host-side loss dict: component name to scalar, keys sorted.
pub type LossValues = BTreeMap<String, f32>;

pub fn total(values: &LossValues) -> f32 {
    values.values().sum()
}

/// Reduces the loss dict from all ranks so the main rank holds the averages.
///
/// Returns a map with the same keys. Non-main ranks get their own values back.
pub fn reduce_loss_dict(
    loss_dict: &LossValues,
    group: &dyn ProcessGroup,
) -> Result<LossValues, CommError> {
    let world_size = group.world_size();
    if world_size < 2 {
        return Ok(loss_dict.clone());
    }
    let mut stacked: Vec<f32> = loss_dict.values().copied().collect();
    group.reduce_sum(0, &mut stacked)?;
    if group.is_main() {
        // Only the destination accumulated, so only it divides.
        for v in stacked.iter_mut() {
            *v /= world_size as f32;
        }
    }
    Ok(loss_dict.keys().cloned().zip(stacked).collect())
}

/// Step-level reduction that tolerates ranks without losses this iteration.
///
/// Every rank must call this once per step, with `None` when its forward pass failed.
/// `names` is the fixed key set. On the main rank the average runs over participating
/// ranks only. Returns `None` when nothing participated. Non-main ranks get back
/// their own losses.
pub fn reduce_step_losses(
    losses: Option<&LossValues>,
    names: &[&str],
    group: &dyn ProcessGroup,
) -> Result<Option<LossValues>, CommError> {
    if group.world_size() < 2 {
        return Ok(losses.cloned());
    }
    let mut sorted: Vec<&str> = names.to_vec();
    sorted.sort_unstable();
    let mut stacked: Vec<f32> = sorted
        .iter()
        .map(|name| {
            losses
                .and_then(|l| l.get(*name))
                .copied()
                .unwrap_or(0.0)
        })
        .collect();
    stacked.push(if losses.is_some() { 1.0 } else { 0.0 });
    group.reduce_sum(0, &mut stacked)?;

    if !group.is_main() {
        return Ok(losses.cloned());
    }
    let participants = stacked.pop().unwrap_or(0.0);
    if participants < 0.5 {
        return Ok(None);
    }
    Ok(Some(
        sorted
            .into_iter()
            .zip(stacked)
            .map(|(name, sum)| (name.to_string(), sum / participants))
            .collect(),
    ))
}
