use burn::backend::Autodiff;
use burn::module::Module;
use burn::optim::{AdamConfig, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use models::{
    DenseDetector, DenseDetectorConfig, DetectionTargets, DetectorBranch, DetectorError,
    LossDict, TrainableDetector,
};

type ADBackend = Autodiff<NdArray<f32>>;

fn images(n: usize, size: usize) -> Tensor<ADBackend, 4> {
    let data: Vec<f32> = (0..n * 3 * size * size)
        .map(|i| (i % 17) as f32 / 17.0)
        .collect();
    Tensor::from_data(TensorData::new(data, [n, 3, size, size]), &Default::default())
}

fn detector(branch: DetectorBranch) -> DenseDetector<ADBackend> {
    DenseDetector::new(
        DenseDetectorConfig {
            branch,
            channels: 8,
            ..Default::default()
        },
        &Default::default(),
    )
}

fn targets() -> Vec<DetectionTargets> {
    vec![
        DetectionTargets::new(vec![[0.1, 0.1, 0.4, 0.5]]),
        DetectionTargets::new(vec![[0.5, 0.5, 0.9, 0.9], [0.0, 0.6, 0.2, 1.0]]),
    ]
}

#[test]
fn retina_branch_produces_finite_named_losses() {
    let model = detector(DetectorBranch::Retina);
    let losses = model.forward_loss(images(2, 16), &targets()).unwrap();
    let names: Vec<_> = losses.names().collect();
    assert_eq!(names, vec!["loss_retina_cls", "loss_retina_reg"]);
    assert_eq!(names, model.loss_names().to_vec());
    for (name, value) in losses.to_scalars() {
        assert!(value.is_finite(), "{name} is not finite");
    }
}

#[test]
fn densebox_branch_adds_regression_weights() {
    let model = detector(DetectorBranch::DenseBox);
    let losses = model.forward_loss(images(2, 16), &targets()).unwrap();
    let names: Vec<_> = losses.names().collect();
    assert_eq!(
        names,
        vec!["loss_densebox_cls", "loss_densebox_reg", "loss_reg_weights"]
    );
    assert!(losses.to_scalars().values().all(|v| v.is_finite()));
}

#[test]
fn images_without_boxes_still_train() {
    let model = detector(DetectorBranch::Retina);
    let empty = vec![DetectionTargets::default()];
    let losses = model.forward_loss(images(1, 8), &empty).unwrap();
    let scalars = losses.to_scalars();
    assert_eq!(scalars["loss_retina_reg"], 0.0);
    assert!(scalars["loss_retina_cls"] > 0.0);
}

#[test]
fn bad_inputs_are_reported() {
    let model = detector(DetectorBranch::Retina);
    let err = model.forward_loss(images(2, 8), &targets()[..1]).unwrap_err();
    assert!(matches!(
        err,
        DetectorError::TargetCountMismatch {
            images: 2,
            targets: 1
        }
    ));

    let inverted = vec![DetectionTargets::new(vec![[0.8, 0.1, 0.2, 0.5]])];
    let err = model.forward_loss(images(1, 8), &inverted).unwrap_err();
    assert!(matches!(err, DetectorError::InvalidBox { image: 0, .. }));

    let nan = vec![DetectionTargets::new(vec![[f32::NAN, 0.1, 0.2, 0.5]])];
    assert!(model.forward_loss(images(1, 8), &nan).is_err());
}

#[test]
fn split_gradients_step_each_group() {
    let model = detector(DetectorBranch::DenseBox);
    let losses = model.forward_loss(images(2, 8), &targets()).unwrap();
    let grads = losses.total().unwrap().backward();
    let groups = model.grad_groups(grads, true);
    assert_eq!(groups.len(), 2);

    let mut optim = AdamConfig::new().init();
    let mut model = model;
    for (grads, lr) in groups.into_iter().zip([1e-4, 1e-3]) {
        model = optim.step(lr, model, grads);
    }
    let after = model.forward_loss(images(2, 8), &targets()).unwrap();
    assert!(after.to_scalars().values().all(|v| v.is_finite()));
}

/// A detector that relies on the default gradient grouping.
#[derive(Module, Debug)]
struct Unsplit<B: Backend> {
    inner: DenseDetector<B>,
}

impl<B: AutodiffBackend> TrainableDetector<B> for Unsplit<B> {
    fn forward_loss(
        &self,
        images: Tensor<B, 4>,
        targets: &[DetectionTargets],
    ) -> Result<LossDict<B>, DetectorError> {
        self.inner.forward_loss(images, targets)
    }

    fn branch(&self) -> DetectorBranch {
        TrainableDetector::branch(&self.inner)
    }
}

#[test]
fn default_grouping_ignores_split() {
    let model = Unsplit {
        inner: detector(DetectorBranch::Retina),
    };
    let grads = model
        .forward_loss(images(2, 8), &targets())
        .unwrap()
        .total()
        .unwrap()
        .backward();
    let groups = model.grad_groups(grads, true);
    assert_eq!(groups.len(), 1);
    assert!(!groups[0].is_empty());
}

#[test]
fn dense_detector_without_split_is_one_group() {
    let model = detector(DetectorBranch::Retina);
    let grads = model
        .forward_loss(images(2, 8), &targets())
        .unwrap()
        .total()
        .unwrap()
        .backward();
    assert_eq!(model.grad_groups(grads, false).len(), 1);
}
