//! Named step losses and the dense-head loss functions.

use std::collections::BTreeMap;

use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

const EPS: f32 = 1e-6;

/// Loss-component name to scalar tensor for one training step. Keys iterate sorted.
#[derive(Debug, Clone)]
pub struct LossDict<B: Backend> {
    entries: BTreeMap<String, Tensor<B, 1>>,
}

impl<B: Backend> Default for LossDict<B> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<B: Backend> LossDict<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Tensor<B, 1>) {
        self.entries.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor<B, 1>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor<B, 1>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sum of all components; `None` when the dict is empty.
    pub fn total(&self) -> Option<Tensor<B, 1>> {
        self.entries.values().cloned().reduce(|acc, v| acc + v)
    }

    /// Detached host copies of every component.
    pub fn to_scalars(&self) -> BTreeMap<String, f32> {
        self.entries
            .iter()
            .map(|(name, value)| (name.clone(), scalar(value.clone().detach())))
            .collect()
    }
}

pub(crate) fn scalar<B: Backend>(t: Tensor<B, 1>) -> f32 {
    t.into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(f32::NAN)
}

/// Elementwise binary cross-entropy between probabilities and targets.
pub(crate) fn bce<B: Backend, const D: usize>(
    prob: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    let pos = target.clone() * prob.clone().add_scalar(EPS).log();
    let neg = target.neg().add_scalar(1.0) * prob.neg().add_scalar(1.0 + EPS).log();
    (pos + neg).neg()
}

/// Sigmoid focal loss summed over cells and normalized by `num_positive`.
pub fn sigmoid_focal_loss<B: Backend>(
    logits: Tensor<B, 4>,
    target: Tensor<B, 4>,
    alpha: f32,
    gamma: f32,
    num_positive: usize,
) -> Tensor<B, 1> {
    let prob = sigmoid(logits);
    let ce = bce(prob.clone(), target.clone());
    let not_target = target.clone().neg().add_scalar(1.0);
    let p_t = prob.clone() * target.clone() + prob.neg().add_scalar(1.0) * not_target.clone();
    let alpha_t = target.mul_scalar(alpha) + not_target.mul_scalar(1.0 - alpha);
    let modulator = p_t.neg().add_scalar(1.0).powf_scalar(gamma);
    (alpha_t * modulator * ce)
        .sum()
        .div_scalar(num_positive.max(1) as f32)
}

/// Smooth-L1 over masked elements, normalized by `num_positive`.
pub fn smooth_l1_loss<B: Backend>(
    pred: Tensor<B, 4>,
    target: Tensor<B, 4>,
    mask: Tensor<B, 4>,
    beta: f32,
    num_positive: usize,
) -> Tensor<B, 1> {
    let diff = (pred - target).abs();
    let per_elem = if beta <= 0.0 {
        diff
    } else {
        let small = diff.clone().lower_elem(beta).float();
        let quadratic = diff.clone().powf_scalar(2.0).mul_scalar(0.5 / beta);
        let linear = diff.sub_scalar(0.5 * beta);
        quadratic * small.clone() + linear * small.neg().add_scalar(1.0)
    };
    (per_elem * mask)
        .sum()
        .div_scalar(num_positive.max(1) as f32)
}

/// Mean BCE-with-logits over every cell.
pub fn objectness_bce_loss<B: Backend>(logits: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
    bce(sigmoid(logits), target).mean()
}

/// L1 over masked elements, normalized by `num_positive`.
pub fn masked_l1_loss<B: Backend>(
    pred: Tensor<B, 4>,
    target: Tensor<B, 4>,
    mask: Tensor<B, 4>,
    num_positive: usize,
) -> Tensor<B, 1> {
    smooth_l1_loss(pred, target, mask, 0.0, num_positive)
}

/// BCE of the regression-weight head against centerness, counted at positive cells only.
pub fn reg_weight_loss<B: Backend>(
    logits: Tensor<B, 4>,
    centerness: Tensor<B, 4>,
    positive: Tensor<B, 4>,
    num_positive: usize,
) -> Tensor<B, 1> {
    (bce(sigmoid(logits), centerness) * positive)
        .sum()
        .div_scalar(num_positive.max(1) as f32)
}
