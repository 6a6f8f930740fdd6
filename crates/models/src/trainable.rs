use burn::module::AutodiffModule;
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;

use crate::{DenseDetector, DetectionTargets, DetectorBranch, DetectorError, LossDict};

/// Model surface used by the training engine.
pub trait TrainableDetector<B: AutodiffBackend>: AutodiffModule<B> {
    /// Forward pass in training mode, returning the named losses.
    fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: &[DetectionTargets],
    ) -> Result<LossDict<B>, DetectorError>;

    fn branch(&self) -> DetectorBranch;

    /// Keys `forward_loss` produces, known before the first step.
    fn loss_names(&self) -> &'static [&'static str] {
        self.branch().loss_names()
    }

    /// Splits gradients into parameter groups. With `split`, group 0 is the encoder and
    /// group 1 the decoder; otherwise one group holds everything.
    ///
    /// Models without an encoder/decoder boundary keep this default, which ignores `split`
    /// and always returns a single group. The engine then steps that group at the first
    /// learning rate it was given.
    fn grad_groups(&self, grads: B::Gradients, _split: bool) -> Vec<GradientsParams> {
        vec![GradientsParams::from_grads(grads, self)]
    }
}

impl<B: AutodiffBackend> TrainableDetector<B> for DenseDetector<B> {
    fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: &[DetectionTargets],
    ) -> Result<LossDict<B>, DetectorError> {
        self.losses(images, targets)
    }

    fn branch(&self) -> DetectorBranch {
        DenseDetector::branch(self)
    }

    fn grad_groups(&self, mut grads: B::Gradients, split: bool) -> Vec<GradientsParams> {
        if !split {
            return vec![GradientsParams::from_grads(grads, self)];
        }
        let encoder = GradientsParams::from_module(&mut grads, &self.encoder);
        let decoder = GradientsParams::from_module(&mut grads, &self.head);
        vec![encoder, decoder]
    }
}
