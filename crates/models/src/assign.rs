//! Host-side assignment of ground-truth boxes to head grid cells.

use crate::DetectionTargets;

/// Per-batch dense targets, laid out to match `[N, C, H, W]` head outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct GridTargets {
    pub batch: usize,
    pub grid_h: usize,
    pub grid_w: usize,
    /// `[N, 1, H, W]`: 1.0 where a box center falls.
    pub objectness: Vec<f32>,
    /// `[N, 4, H, W]`: box coordinates at positive cells.
    pub boxes: Vec<f32>,
    /// `[N, 4, H, W]`: 1.0 at positive cells.
    pub box_mask: Vec<f32>,
    /// `[N, 1, H, W]`: centerness of the positive cell center inside its box.
    pub centerness: Vec<f32>,
    pub num_positive: usize,
}

impl GridTargets {
    pub fn build(targets: &[DetectionTargets], grid_h: usize, grid_w: usize) -> Self {
        let batch = targets.len();
        let hw = grid_h * grid_w;
        let mut objectness = vec![0.0f32; batch * hw];
        let mut boxes = vec![0.0f32; batch * 4 * hw];
        let mut box_mask = vec![0.0f32; batch * 4 * hw];
        let mut centerness = vec![0.0f32; batch * hw];

        for (b, target) in targets.iter().enumerate() {
            let (obj, tgt, mask) = assign_targets_to_grid(&target.boxes, grid_h, grid_w);
            objectness[b * hw..(b + 1) * hw].copy_from_slice(&obj);
            for c in 0..4 {
                let dst = (b * 4 + c) * hw;
                boxes[dst..dst + hw].copy_from_slice(&tgt[c * hw..(c + 1) * hw]);
                box_mask[dst..dst + hw].copy_from_slice(&mask[c * hw..(c + 1) * hw]);
            }
            for idx in 0..hw {
                if obj[idx] < 0.5 {
                    continue;
                }
                let gx = idx % grid_w;
                let gy = idx / grid_w;
                let bbox = [tgt[idx], tgt[hw + idx], tgt[2 * hw + idx], tgt[3 * hw + idx]];
                centerness[b * hw + idx] = cell_centerness(bbox, gx, gy, grid_w, grid_h);
            }
        }

        let num_positive = objectness.iter().filter(|v| **v > 0.5).count();
        Self {
            batch,
            grid_h,
            grid_w,
            objectness,
            boxes,
            box_mask,
            centerness,
            num_positive,
        }
    }
}

/// Assigns each box to the cell holding its center. Later boxes overwrite earlier ones
/// that land in the same cell.
///
/// Returns `(objectness [H*W], boxes [4*H*W], mask [4*H*W])`, channel-major.
pub fn assign_targets_to_grid(
    boxes: &[[f32; 4]],
    grid_h: usize,
    grid_w: usize,
) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let hw = grid_h * grid_w;
    let mut obj = vec![0.0f32; hw];
    let mut tgt = vec![0.0f32; hw * 4];
    let mut mask = vec![0.0f32; hw * 4];
    if hw == 0 {
        return (obj, tgt, mask);
    }

    for b in boxes {
        let cx = (b[0] + b[2]) * 0.5;
        let cy = (b[1] + b[3]) * 0.5;
        let gx = (cx * grid_w as f32).clamp(0.0, (grid_w - 1) as f32) as usize;
        let gy = (cy * grid_h as f32).clamp(0.0, (grid_h - 1) as f32) as usize;
        let idx = gy * grid_w + gx;
        obj[idx] = 1.0;
        for c in 0..4 {
            tgt[c * hw + idx] = b[c];
            mask[c * hw + idx] = 1.0;
        }
    }

    (obj, tgt, mask)
}

fn cell_centerness(bbox: [f32; 4], gx: usize, gy: usize, grid_w: usize, grid_h: usize) -> f32 {
    let cx = (gx as f32 + 0.5) / grid_w as f32;
    let cy = (gy as f32 + 0.5) / grid_h as f32;
    let l = (cx - bbox[0]).max(0.0);
    let r = (bbox[2] - cx).max(0.0);
    let t = (cy - bbox[1]).max(0.0);
    let b = (bbox[3] - cy).max(0.0);
    let lr = l.max(r);
    let tb = t.max(b);
    if lr <= 0.0 || tb <= 0.0 {
        return 0.0;
    }
    ((l.min(r) / lr) * (t.min(b) / tb)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_cell_gets_the_box() {
        let (obj, tgt, mask) = assign_targets_to_grid(&[[0.0, 0.0, 0.5, 0.5]], 2, 2);
        assert_eq!(obj, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(tgt[0], 0.0);
        assert_eq!(tgt[2 * 4], 0.5);
        assert_eq!(mask.iter().sum::<f32>(), 4.0);
    }

    #[test]
    fn box_centered_on_cell_has_full_centerness() {
        let targets = vec![DetectionTargets::new(vec![[0.5, 0.5, 1.0, 1.0]])];
        let grid = GridTargets::build(&targets, 2, 2);
        assert_eq!(grid.num_positive, 1);
        assert!((grid.centerness[3] - 1.0).abs() < 1e-6);
        assert_eq!(grid.objectness, vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn images_are_laid_out_channel_major() {
        let targets = vec![
            DetectionTargets::default(),
            DetectionTargets::new(vec![[0.0, 0.0, 1.0, 1.0]]),
        ];
        let grid = GridTargets::build(&targets, 1, 1);
        assert_eq!(grid.objectness, vec![0.0, 1.0]);
        assert_eq!(grid.boxes, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
        assert_eq!(grid.box_mask[4..], [1.0, 1.0, 1.0, 1.0]);
    }
}
