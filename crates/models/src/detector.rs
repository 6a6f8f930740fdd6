//! Dense single-class detector: conv encoder plus a per-cell prediction head.
//!
//! Shapes (normalized coords):
//! - Input images: `[N, 3, H, W]`
//! - Class logits: `[N, 1, H/4, W/4]`
//! - Boxes: `[N, 4, H/4, W/4]` (x_min, y_min, x_max, y_max in 0..1)
//! - Regression-weight logits: `[N, 1, H/4, W/4]`

use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::assign::GridTargets;
use crate::loss::{
    masked_l1_loss, objectness_bce_loss, reg_weight_loss, sigmoid_focal_loss, smooth_l1_loss,
    LossDict,
};
use crate::{DetectionTargets, DetectorError};

/// Which loss set the head is trained with. Also selects the dashboard scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorBranch {
    Retina,
    DenseBox,
}

impl DetectorBranch {
    pub fn loss_names(&self) -> &'static [&'static str] {
        match self {
            DetectorBranch::Retina => &["loss_retina_cls", "loss_retina_reg"],
            DetectorBranch::DenseBox => &[
                "loss_densebox_cls",
                "loss_densebox_reg",
                "loss_reg_weights",
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseDetectorConfig {
    pub branch: DetectorBranch,
    pub channels: usize,
    pub focal_alpha: f32,
    pub focal_gamma: f32,
    pub smooth_l1_beta: f32,
}

impl Default for DenseDetectorConfig {
    fn default() -> Self {
        Self {
            branch: DetectorBranch::Retina,
            channels: 32,
            focal_alpha: 0.25,
            focal_gamma: 2.0,
            smooth_l1_beta: 1.0 / 9.0,
        }
    }
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> Encoder<B> {
    fn new(channels: usize, device: &B::Device) -> Self {
        let conv = |c_in: usize| {
            Conv2dConfig::new([c_in, channels], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        Self {
            conv1: conv(3),
            conv2: conv(channels),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv1.forward(images));
        relu(self.conv2.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct DenseHead<B: Backend> {
    cls: Conv2d<B>,
    reg: Conv2d<B>,
    reg_weight: Conv2d<B>,
}

impl<B: Backend> DenseHead<B> {
    fn new(channels: usize, device: &B::Device) -> Self {
        let head = |c_out: usize| {
            Conv2dConfig::new([channels, c_out], [1, 1])
                .with_padding(PaddingConfig2d::Valid)
                .init(device)
        };
        Self {
            cls: head(1),
            reg: head(4),
            reg_weight: head(1),
        }
    }
}

/// Raw head outputs for one batch.
#[derive(Debug, Clone)]
pub struct DenseOutputs<B: Backend> {
    pub cls_logits: Tensor<B, 4>,
    pub boxes: Tensor<B, 4>,
    pub reg_weight_logits: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct DenseDetector<B: Backend> {
    pub(crate) encoder: Encoder<B>,
    pub(crate) head: DenseHead<B>,
    config: Ignored<DenseDetectorConfig>,
}

impl<B: Backend> DenseDetector<B> {
    pub fn new(config: DenseDetectorConfig, device: &B::Device) -> Self {
        let channels = config.channels.max(1);
        Self {
            encoder: Encoder::new(channels, device),
            head: DenseHead::new(channels, device),
            config: Ignored(config),
        }
    }

    pub fn config(&self) -> &DenseDetectorConfig {
        &self.config.0
    }

    pub fn branch(&self) -> DetectorBranch {
        self.config.0.branch
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> DenseOutputs<B> {
        let features = self.encoder.forward(images);
        DenseOutputs {
            cls_logits: self.head.cls.forward(features.clone()),
            boxes: sigmoid(self.head.reg.forward(features.clone())),
            reg_weight_logits: self.head.reg_weight.forward(features),
        }
    }

    /// Forward pass plus the branch's loss set.
    pub fn losses(
        &self,
        images: Tensor<B, 4>,
        targets: &[DetectionTargets],
    ) -> Result<LossDict<B>, DetectorError> {
        let [n, c, _, _] = images.dims();
        if n == 0 {
            return Err(DetectorError::EmptyBatch);
        }
        if c != 3 {
            return Err(DetectorError::ChannelMismatch(c));
        }
        if n != targets.len() {
            return Err(DetectorError::TargetCountMismatch {
                images: n,
                targets: targets.len(),
            });
        }
        validate_targets(targets)?;

        let device = images.device();
        let out = self.forward(images);
        let [_, _, grid_h, grid_w] = out.cls_logits.dims();
        let grid = GridTargets::build(targets, grid_h, grid_w);

        let obj = Tensor::<B, 4>::from_data(
            TensorData::new(grid.objectness.clone(), [n, 1, grid_h, grid_w]),
            &device,
        );
        let boxes = Tensor::<B, 4>::from_data(
            TensorData::new(grid.boxes.clone(), [n, 4, grid_h, grid_w]),
            &device,
        );
        let mask = Tensor::<B, 4>::from_data(
            TensorData::new(grid.box_mask.clone(), [n, 4, grid_h, grid_w]),
            &device,
        );

        let cfg = self.config();
        let mut dict = LossDict::new();
        match cfg.branch {
            DetectorBranch::Retina => {
                dict.insert(
                    "loss_retina_cls",
                    sigmoid_focal_loss(
                        out.cls_logits,
                        obj,
                        cfg.focal_alpha,
                        cfg.focal_gamma,
                        grid.num_positive,
                    ),
                );
                dict.insert(
                    "loss_retina_reg",
                    smooth_l1_loss(out.boxes, boxes, mask, cfg.smooth_l1_beta, grid.num_positive),
                );
            }
            DetectorBranch::DenseBox => {
                let centerness = Tensor::<B, 4>::from_data(
                    TensorData::new(grid.centerness.clone(), [n, 1, grid_h, grid_w]),
                    &device,
                );
                dict.insert(
                    "loss_densebox_cls",
                    objectness_bce_loss(out.cls_logits, obj.clone()),
                );
                dict.insert(
                    "loss_densebox_reg",
                    masked_l1_loss(out.boxes, boxes, mask, grid.num_positive),
                );
                dict.insert(
                    "loss_reg_weights",
                    reg_weight_loss(out.reg_weight_logits, centerness, obj, grid.num_positive),
                );
            }
        }
        Ok(dict)
    }
}

fn validate_targets(targets: &[DetectionTargets]) -> Result<(), DetectorError> {
    for (image, target) in targets.iter().enumerate() {
        for bbox in &target.boxes {
            let finite = bbox.iter().all(|v| v.is_finite());
            let ordered = bbox[0] <= bbox[2] && bbox[1] <= bbox[3];
            let in_range = bbox.iter().all(|v| (0.0..=1.0).contains(v));
            if !(finite && ordered && in_range) {
                return Err(DetectorError::InvalidBox {
                    image,
                    bbox: *bbox,
                });
            }
        }
    }
    Ok(())
}
