use super::{BBoxTarget, RoidbEntry};
use crate::{
    common::*,
    config::BBoxNormalization,
    utils::{PixelBox, EPS},
};

/// Per-class regression normalization statistics.
///
/// Both vectors hold `4 * num_classes` values laid out class by class, which
/// matches the output layout of the regression layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BBoxStats {
    pub means: Vec<f32>,
    pub stds: Vec<f32>,
}

impl BBoxStats {
    /// Statistics that make unnormalization the identity.
    pub fn identity(num_classes: usize) -> Self {
        Self {
            means: vec![0.0; num_classes * 4],
            stds: vec![1.0; num_classes * 4],
        }
    }

    /// Repeats shared 4-vectors over all classes.
    pub fn tiled(means: [f32; 4], stds: [f32; 4], num_classes: usize) -> Self {
        Self {
            means: means.repeat(num_classes),
            stds: stds.repeat(num_classes),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.means.len() / 4
    }

    fn class_mean(&self, class: usize) -> &[f32] {
        &self.means[(class * 4)..(class * 4 + 4)]
    }

    fn class_std(&self, class: usize) -> &[f32] {
        &self.stds[(class * 4)..(class * 4 + 4)]
    }
}

/// Computes the regression target of every box in an entry.
///
/// Boxes overlapping a ground-truth box by at least `bbox_thresh` regress
/// onto the ground-truth box they overlap most.
pub fn compute_targets(entry: &RoidbEntry, bbox_thresh: f32) -> Vec<BBoxTarget> {
    let RoidbEntry {
        ref boxes,
        ref max_overlaps,
        ref max_classes,
        ..
    } = *entry;

    let gt_boxes: Vec<&PixelBox> = izip!(boxes, max_overlaps)
        .filter(|&(_, &overlap)| overlap == 1.0)
        .map(|(bbox, _)| bbox)
        .collect();

    if gt_boxes.is_empty() {
        return vec![BBoxTarget::NONE; boxes.len()];
    }

    izip!(boxes, max_overlaps, max_classes)
        .map(|(ex_box, &overlap, &class)| {
            if overlap < bbox_thresh {
                return BBoxTarget::NONE;
            }

            let gt_box = gt_boxes
                .iter()
                .copied()
                .fold((None, f32::NEG_INFINITY), |(best, best_iou), gt_box| {
                    let iou = ex_box.iou_with(gt_box);
                    if iou > best_iou {
                        (Some(gt_box), iou)
                    } else {
                        (best, best_iou)
                    }
                })
                .0
                .unwrap_or(gt_boxes[0]);

            BBoxTarget {
                class,
                deltas: ex_box.deltas_to(gt_box),
            }
        })
        .collect()
}

/// Computes per-class means and stds of the regression targets.
pub fn compute_stats(roidb: &[RoidbEntry], num_classes: usize) -> Result<BBoxStats> {
    let mut counts = vec![EPS as f64; num_classes];
    let mut sums = vec![[0f64; 4]; num_classes];
    let mut squared_sums = vec![[0f64; 4]; num_classes];

    for entry in roidb {
        let targets = entry.bbox_targets.as_ref().ok_or_else(|| {
            format_err!(
                "bbox targets of '{}' are not computed",
                entry.image.display()
            )
        })?;

        for target in targets.iter().filter(|target| target.class > 0) {
            let class = target.class;
            ensure!(
                class < num_classes,
                "class {} of '{}' exceeds num_classes {}",
                class,
                entry.image.display(),
                num_classes
            );
            counts[class] += 1.0;
            izip!(&mut sums[class], &mut squared_sums[class], &target.deltas).for_each(
                |(sum, squared_sum, &delta)| {
                    *sum += delta as f64;
                    *squared_sum += (delta as f64).powi(2);
                },
            );
        }
    }

    let (means, stds): (Vec<_>, Vec<_>) = izip!(&counts, &sums, &squared_sums)
        .flat_map(|(&count, sum, squared_sum)| {
            izip!(sum, squared_sum).map(move |(&sum, &squared_sum)| {
                let mean = sum / count;
                let var = (squared_sum / count - mean.powi(2)).max(0.0);
                (mean as f32, var.sqrt() as f32)
            })
        })
        .unzip();

    Ok(BBoxStats { means, stds })
}

/// Subtracts class means and divides by class stds in place.
///
/// Components whose std is zero are only centered.
pub fn normalize_targets(roidb: &mut [RoidbEntry], stats: &BBoxStats) {
    roidb
        .iter_mut()
        .filter_map(|entry| entry.bbox_targets.as_mut())
        .flatten()
        .filter(|target| target.class > 0)
        .for_each(|target| {
            let mean = stats.class_mean(target.class);
            let std = stats.class_std(target.class);
            izip!(&mut target.deltas, mean, std).for_each(|(delta, &mean, &std)| {
                *delta -= mean;
                if std > 0.0 {
                    *delta /= std;
                }
            });
        });
}

/// Attaches regression targets to every entry and returns the statistics
/// used to normalize them.
pub fn add_bbox_regression_targets(
    roidb: &mut [RoidbEntry],
    num_classes: usize,
    bbox_thresh: f32,
    normalization: &BBoxNormalization,
) -> Result<BBoxStats> {
    ensure!(!roidb.is_empty(), "the roidb must not be empty");

    for entry in roidb.iter_mut() {
        ensure!(
            entry.max_classes.iter().all(|&class| class < num_classes),
            "'{}' has a class beyond num_classes {}",
            entry.image.display(),
            num_classes
        );
        entry.bbox_targets = Some(compute_targets(entry, bbox_thresh));
    }

    let stats = match *normalization {
        BBoxNormalization::Disabled => return Ok(BBoxStats::identity(num_classes)),
        BBoxNormalization::Computed => compute_stats(roidb, num_classes)?,
        BBoxNormalization::Precomputed { means, stds } => {
            BBoxStats::tiled(means, stds, num_classes)
        }
    };
    debug!("bbox target means: {:?}", stats.means);
    debug!("bbox target stds: {:?}", stats.stds);

    normalize_targets(roidb, &stats);
    Ok(stats)
}
