//! The RoI data layer that feeds minibatches to the network.

use super::{BBoxTarget, RoidbEntry};
use crate::{common::*, config::TrainingConfig};

/// Per-channel RGB pixel means subtracted from input images.
pub const PIXEL_MEANS: [f32; 3] = [122.7717, 115.9465, 102.9801];

/// A training minibatch.
#[derive(Debug)]
pub struct Minibatch {
    /// Zero-padded images in shape `[N, 3, H, W]`.
    pub images: Tensor,
    /// RoIs in shape `[R, 5]`, each row `(batch_index, x1, y1, x2, y2)` in scaled coordinates.
    pub rois: Tensor,
    /// Class labels in shape `[R]`. Zero is background.
    pub labels: Tensor,
    /// Regression targets in shape `[R, 4 * num_classes]`.
    pub bbox_targets: Tensor,
    /// Ones at the target slots of `bbox_targets`, zeros elsewhere.
    pub bbox_inside_weights: Tensor,
}

/// RoIs sampled from one image.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledRois {
    pub indices: Vec<usize>,
    pub labels: Vec<i64>,
}

/// Options of the RoI data layer.
#[derive(Debug, Clone)]
pub struct RoiDataLayerInit {
    pub ims_per_batch: usize,
    pub batch_size: usize,
    pub fg_fraction: f64,
    pub fg_thresh: f32,
    pub bg_thresh_lo: f32,
    pub bg_thresh_hi: f32,
    pub scales: Vec<usize>,
    pub max_size: usize,
    pub num_classes: usize,
    pub image_dir: Option<PathBuf>,
    pub seed: Option<u64>,
    pub device: Device,
}

impl RoiDataLayerInit {
    pub fn from_config(
        config: &TrainingConfig,
        num_classes: usize,
        image_dir: Option<PathBuf>,
        seed: Option<u64>,
        device: Device,
    ) -> Self {
        Self {
            ims_per_batch: config.ims_per_batch.get(),
            batch_size: config.batch_size.get(),
            fg_fraction: config.fg_fraction.raw(),
            fg_thresh: config.fg_thresh.raw() as f32,
            bg_thresh_lo: config.bg_thresh_lo.raw() as f32,
            bg_thresh_hi: config.bg_thresh_hi.raw() as f32,
            scales: config.scales.clone(),
            max_size: config.max_size,
            num_classes,
            image_dir,
            seed,
            device,
        }
    }

    pub fn build(self) -> Result<RoiDataLayer> {
        let Self {
            ims_per_batch,
            batch_size,
            fg_fraction,
            ref scales,
            max_size,
            seed,
            ..
        } = self;

        ensure!(ims_per_batch > 0, "ims_per_batch must be positive");
        ensure!(
            batch_size % ims_per_batch == 0,
            "batch_size must be multiple of ims_per_batch"
        );
        ensure!(
            (0.0..=1.0).contains(&fg_fraction),
            "fg_fraction must be within [0, 1]"
        );
        ensure!(
            !scales.is_empty() && scales.iter().all(|&scale| scale > 0),
            "scales must be non-empty and positive"
        );
        ensure!(max_size > 0, "max_size must be positive");

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(RoiDataLayer {
            init: self,
            roidb: Arc::new(vec![]),
            perm: vec![],
            cursor: 0,
            rng,
        })
    }
}

/// Samples images from the roidb and assembles minibatches.
#[derive(Debug)]
pub struct RoiDataLayer {
    init: RoiDataLayerInit,
    roidb: Arc<Vec<RoidbEntry>>,
    perm: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl RoiDataLayer {
    /// Replaces the roidb and reshuffles.
    pub fn set_roidb(&mut self, roidb: Arc<Vec<RoidbEntry>>) -> Result<()> {
        ensure!(!roidb.is_empty(), "the roidb must not be empty");
        ensure!(
            roidb.iter().all(|entry| entry.bbox_targets.is_some()),
            "bbox targets must be computed before training"
        );
        self.roidb = roidb;
        self.shuffle_roidb_inds();
        Ok(())
    }

    fn shuffle_roidb_inds(&mut self) {
        self.perm = (0..self.roidb.len()).collect();
        self.perm.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    fn next_minibatch_inds(&mut self) -> Vec<usize> {
        let count = self.init.ims_per_batch.min(self.roidb.len());
        if self.cursor + count >= self.roidb.len() {
            self.shuffle_roidb_inds();
        }
        let inds = self.perm[self.cursor..(self.cursor + count)].to_vec();
        self.cursor += count;
        inds
    }

    /// Assembles the next minibatch.
    pub fn next_minibatch(&mut self) -> Result<Minibatch> {
        ensure!(!self.roidb.is_empty(), "the roidb is not set");

        let RoiDataLayerInit {
            ims_per_batch,
            batch_size,
            fg_fraction,
            max_size,
            num_classes,
            device,
            ..
        } = self.init;
        let scales = self.init.scales.clone();
        let rois_per_image = batch_size / ims_per_batch;
        let fg_rois_per_image = (fg_fraction * rois_per_image as f64).round() as usize;
        let roidb = self.roidb.clone();
        let inds = self.next_minibatch_inds();

        let mut images = vec![];
        let mut rois = vec![];
        let mut labels = vec![];
        let mut bbox_targets = vec![];
        let mut bbox_inside_weights = vec![];

        for (batch_index, &roidb_index) in inds.iter().enumerate() {
            let entry = &roidb[roidb_index];
            let target_size = scales[self.rng.gen_range(0..scales.len())];
            let (image, im_scale) = self.load_image(entry, target_size, max_size)?;
            images.push(image);

            let sampled = self.sample_rois(entry, fg_rois_per_image, rois_per_image);
            let targets = entry
                .bbox_targets
                .as_ref()
                .ok_or_else(|| format_err!("bbox targets are not computed"))?;

            for (&box_index, &label) in izip!(&sampled.indices, &sampled.labels) {
                let [x1, y1, x2, y2] = entry.boxes[box_index].scale(im_scale).tlbr();
                rois.extend([batch_index as f32, x1, y1, x2, y2]);
                labels.push(label);

                let (targets_row, weights_row) =
                    expand_bbox_target(&targets[box_index], num_classes);
                bbox_targets.extend(targets_row);
                bbox_inside_weights.extend(weights_row);
            }
        }

        let images = im_list_to_blob(&images, device);
        let num_rois = labels.len() as i64;
        let num_outputs = (num_classes * 4) as i64;

        Ok(Minibatch {
            images,
            rois: Tensor::of_slice(&rois).view([num_rois, 5]).to_device(device),
            labels: Tensor::of_slice(&labels).to_device(device),
            bbox_targets: Tensor::of_slice(&bbox_targets)
                .view([num_rois, num_outputs])
                .to_device(device),
            bbox_inside_weights: Tensor::of_slice(&bbox_inside_weights)
                .view([num_rois, num_outputs])
                .to_device(device),
        })
    }

    /// Samples foreground and background RoIs of an image without replacement.
    pub fn sample_rois(
        &mut self,
        entry: &RoidbEntry,
        fg_rois_per_image: usize,
        rois_per_image: usize,
    ) -> SampledRois {
        let RoiDataLayerInit {
            fg_thresh,
            bg_thresh_lo,
            bg_thresh_hi,
            ..
        } = self.init;

        let fg_inds: Vec<usize> = entry
            .max_overlaps
            .iter()
            .positions(|&overlap| overlap >= fg_thresh)
            .collect();
        let bg_inds: Vec<usize> = entry
            .max_overlaps
            .iter()
            .positions(|&overlap| overlap >= bg_thresh_lo && overlap < bg_thresh_hi)
            .collect();

        let num_fg = fg_rois_per_image.min(fg_inds.len());
        let fg_inds: Vec<usize> = fg_inds
            .choose_multiple(&mut self.rng, num_fg)
            .copied()
            .collect();

        let num_bg = (rois_per_image - num_fg).min(bg_inds.len());
        let bg_inds: Vec<usize> = bg_inds
            .choose_multiple(&mut self.rng, num_bg)
            .copied()
            .collect();

        let labels: Vec<i64> = fg_inds
            .iter()
            .map(|&index| entry.max_classes[index] as i64)
            .chain(std::iter::repeat(0).take(bg_inds.len()))
            .collect();
        let indices: Vec<usize> = fg_inds.into_iter().chain(bg_inds).collect();

        SampledRois { indices, labels }
    }

    fn load_image(
        &self,
        entry: &RoidbEntry,
        target_size: usize,
        max_size: usize,
    ) -> Result<(Tensor, f32)> {
        let path = match &self.init.image_dir {
            Some(dir) if entry.image.is_relative() => dir.join(&entry.image),
            _ => entry.image.clone(),
        };
        let image = vision::image::load(&path)
            .with_context(|| format!("failed to load image '{}'", path.display()))?;
        let image = if entry.flipped {
            image.flip(&[2])
        } else {
            image
        };
        prep_im_for_blob(&image, target_size, max_size)
    }
}

/// Rescales an image so its short side matches `target_size` without the
/// long side exceeding `max_size`, then subtracts pixel means.
pub fn prep_im_for_blob(
    image: &Tensor,
    target_size: usize,
    max_size: usize,
) -> Result<(Tensor, f32)> {
    let (_channels, height, width) = image.size3()?;
    let scale = image_scale(height, width, target_size, max_size);
    let new_h = (height as f32 * scale).round() as i64;
    let new_w = (width as f32 * scale).round() as i64;

    let resized = vision::image::resize(image, new_w, new_h)?;
    let means = Tensor::of_slice(&PIXEL_MEANS).view([3, 1, 1]);
    let image = resized.to_kind(Kind::Float) - means;
    Ok((image, scale))
}

/// Computes the resize factor of an image.
pub fn image_scale(height: i64, width: i64, target_size: usize, max_size: usize) -> f32 {
    let size_min = height.min(width) as f32;
    let size_max = height.max(width) as f32;
    let scale = target_size as f32 / size_min;
    if (scale * size_max).round() > max_size as f32 {
        max_size as f32 / size_max
    } else {
        scale
    }
}

/// Stacks images into a zero-padded `[N, 3, H, W]` blob.
fn im_list_to_blob(images: &[Tensor], device: Device) -> Tensor {
    let max_h = images.iter().map(|image| image.size()[1]).max().unwrap_or(0);
    let max_w = images.iter().map(|image| image.size()[2]).max().unwrap_or(0);
    let blob = Tensor::zeros(
        &[images.len() as i64, 3, max_h, max_w],
        (Kind::Float, device),
    );

    tch::no_grad(|| {
        for (index, image) in images.iter().enumerate() {
            let size = image.size();
            let mut slot = blob
                .get(index as i64)
                .narrow(1, 0, size[1])
                .narrow(2, 0, size[2]);
            slot.copy_(&image.to_device(device));
        }
    });

    blob
}

/// Expands a compact target into the `4 * num_classes` layout of the regression layer.
fn expand_bbox_target(target: &BBoxTarget, num_classes: usize) -> (Vec<f32>, Vec<f32>) {
    let mut targets = vec![0f32; num_classes * 4];
    let mut weights = vec![0f32; num_classes * 4];
    if target.class > 0 {
        let range = (target.class * 4)..(target.class * 4 + 4);
        targets[range.clone()].copy_from_slice(&target.deltas);
        weights[range].fill(1.0);
    }
    (targets, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::PixelBox;

    fn layer(seed: u64) -> RoiDataLayer {
        RoiDataLayerInit {
            ims_per_batch: 2,
            batch_size: 8,
            fg_fraction: 0.25,
            fg_thresh: 0.5,
            bg_thresh_lo: 0.1,
            bg_thresh_hi: 0.5,
            scales: vec![600],
            max_size: 1000,
            num_classes: 3,
            image_dir: None,
            seed: Some(seed),
            device: Device::Cpu,
        }
        .build()
        .unwrap()
    }

    fn entry(max_overlaps: &[f32], max_classes: &[usize]) -> RoidbEntry {
        RoidbEntry {
            image: "img.png".into(),
            width: 100,
            height: 100,
            boxes: vec![PixelBox::try_new(0.0, 0.0, 9.0, 9.0).unwrap(); max_overlaps.len()],
            gt_classes: vec![0; max_overlaps.len()],
            max_overlaps: max_overlaps.to_vec(),
            max_classes: max_classes.to_vec(),
            flipped: false,
            bbox_targets: Some(vec![BBoxTarget::NONE; max_overlaps.len()]),
        }
    }

    #[test]
    fn sample_respects_fg_fraction() {
        let mut layer = layer(7);
        let entry = entry(
            &[1.0, 0.9, 0.7, 0.6, 0.3, 0.2, 0.15, 0.4, 0.05],
            &[1, 2, 2, 1, 1, 2, 1, 1, 0],
        );
        let sampled = layer.sample_rois(&entry, 1, 4);

        assert_eq!(sampled.indices.len(), 4);
        assert_eq!(sampled.labels.len(), 4);
        assert!(entry.max_overlaps[sampled.indices[0]] >= 0.5);
        assert_eq!(
            sampled.labels[0],
            entry.max_classes[sampled.indices[0]] as i64
        );
        assert!(sampled.labels[1..].iter().all(|&label| label == 0));
        assert!(sampled.indices[1..].iter().all(|&index| {
            let overlap = entry.max_overlaps[index];
            (0.1..0.5).contains(&overlap)
        }));
        assert_eq!(sampled.indices.iter().unique().count(), 4);
    }

    #[test]
    fn sample_fills_with_background() {
        let mut layer = layer(1);
        let entry = entry(&[0.8, 0.2, 0.3], &[1, 1, 2]);
        let sampled = layer.sample_rois(&entry, 2, 4);

        // one fg available, two bg available
        assert_eq!(sampled.indices.len(), 3);
        assert_eq!(sampled.indices[0], 0);
        assert_eq!(sampled.labels, vec![1, 0, 0]);
    }

    #[test]
    fn minibatch_inds_cycle_through_roidb() -> Result<()> {
        let mut layer = layer(3);
        let roidb: Vec<_> = (0..5).map(|_| entry(&[0.6, 0.2], &[1, 1])).collect();
        layer.set_roidb(Arc::new(roidb))?;

        for _ in 0..10 {
            let inds = layer.next_minibatch_inds();
            assert_eq!(inds.len(), 2);
            assert!(inds.iter().all(|&index| index < 5));
            assert_ne!(inds[0], inds[1]);
        }
        Ok(())
    }

    #[test]
    fn set_roidb_requires_targets() {
        let mut layer = layer(0);
        let mut entry = entry(&[0.6, 0.2], &[1, 1]);
        entry.bbox_targets = None;
        assert!(layer.set_roidb(Arc::new(vec![entry])).is_err());
        assert!(layer.set_roidb(Arc::new(vec![])).is_err());
    }

    #[test]
    fn image_scale_caps_long_side() {
        assert_eq!(image_scale(300, 400, 600, 1000), 2.0);
        assert_eq!(image_scale(375, 1242, 600, 1000), 1000.0 / 1242.0);
    }

    #[test]
    fn expanded_targets_fill_class_slot() {
        let target = BBoxTarget {
            class: 2,
            deltas: [0.1, 0.2, 0.3, 0.4],
        };
        let (targets, weights) = expand_bbox_target(&target, 3);
        assert_eq!(&targets[8..12], &[0.1, 0.2, 0.3, 0.4]);
        assert_eq!(&targets[0..8], &[0.0; 8]);
        assert_eq!(weights.iter().sum::<f32>(), 4.0);

        let (targets, weights) = expand_bbox_target(&BBoxTarget::NONE, 3);
        assert!(targets.iter().chain(&weights).all(|&value| value == 0.0));
    }

    #[test]
    fn blob_pads_images() {
        let images = vec![
            Tensor::ones(&[3, 4, 6], (Kind::Float, Device::Cpu)),
            Tensor::ones(&[3, 5, 2], (Kind::Float, Device::Cpu)),
        ];
        let blob = im_list_to_blob(&images, Device::Cpu);
        assert_eq!(blob.size(), vec![2, 3, 5, 6]);
        assert_eq!(f64::from(&blob.sum(Kind::Double)), (3 * 4 * 6 + 3 * 5 * 2) as f64);
    }
}
