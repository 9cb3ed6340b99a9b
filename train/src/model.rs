//! The Fast R-CNN training network.

use crate::{
    common::*,
    config::NetworkConfig,
    data::{Minibatch, RoiDataLayer, RoidbEntry},
};

/// Output channels of each convolution of the VGG16 stages.
pub const VGG16_STAGES: &[&[i64]] = &[
    &[64, 64],
    &[128, 128],
    &[256, 256, 256],
    &[512, 512, 512],
    &[512, 512, 512],
];

/// Width of the fully connected layers of VGG16.
pub const VGG16_FC_DIM: i64 = 4096;

/// Side length of the pooled RoI feature.
pub const POOLED_SIZE: i64 = 7;

/// Ratio between feature map and input image resolution.
pub const SPATIAL_SCALE: f64 = 1.0 / 16.0;

/// A network that the solver can train.
pub trait TrainNet {
    /// Hands the training roidb to the data source of the network.
    fn set_roidb(&mut self, roidb: Arc<Vec<RoidbEntry>>) -> Result<()>;

    /// Runs the forward pass on the next minibatch and returns the scalar loss.
    fn forward_loss(&mut self) -> Result<Tensor>;
}

/// The Fast R-CNN network initializer.
#[derive(Debug, Clone)]
pub struct FastRcnnNetInit {
    /// Output channels of the convolutions, grouped by pooling stage.
    pub stages: Vec<Vec<i64>>,
    pub fc_dim: i64,
    pub num_classes: usize,
    /// If set, adds the context branch with RoIs enlarged by this factor.
    pub context_scale: Option<f64>,
    pub dropout: f64,
}

impl FastRcnnNetInit {
    /// The VGG16 network described by the configuration.
    pub fn vgg16(config: &NetworkConfig) -> Self {
        Self {
            stages: VGG16_STAGES.iter().map(|stage| stage.to_vec()).collect(),
            fc_dim: VGG16_FC_DIM,
            num_classes: config.num_classes,
            context_scale: config.context_scale.map(|scale| scale.raw()),
            dropout: config.dropout.raw(),
        }
    }

    pub fn build<'p, P>(self, path: P, data_layer: RoiDataLayer) -> Result<FastRcnnNet>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            stages,
            fc_dim,
            num_classes,
            context_scale,
            dropout,
        } = self;

        ensure!(
            stages.len() == 5 && stages.iter().all(|stage| !stage.is_empty()),
            "the backbone must have five non-empty stages"
        );
        ensure!(num_classes >= 2, "num_classes must be at least 2");
        if let Some(scale) = context_scale {
            ensure!(scale > 0.0, "context_scale must be positive");
        }

        let mut in_c = 3;
        let stages: Vec<Vec<nn::Conv2D>> = stages
            .iter()
            .enumerate()
            .map(|(stage_index, channels)| {
                channels
                    .iter()
                    .enumerate()
                    .map(|(conv_index, &out_c)| {
                        let name = format!("conv{}_{}", stage_index + 1, conv_index + 1);
                        let conv = nn::conv2d(
                            path / name,
                            in_c,
                            out_c,
                            3,
                            nn::ConvConfig {
                                padding: 1,
                                ..Default::default()
                            },
                        );
                        in_c = out_c;
                        conv
                    })
                    .collect()
            })
            .collect();

        let pooled_dim = in_c * POOLED_SIZE * POOLED_SIZE;
        let fc6 = nn::linear(path / "fc6", pooled_dim, fc_dim, Default::default());
        let fc7 = nn::linear(path / "fc7", fc_dim, fc_dim, Default::default());

        let context = context_scale.map(|scale| ContextBranch {
            scale,
            fc6: nn::linear(path / "fc6_context", pooled_dim, fc_dim, Default::default()),
            fc7: nn::linear(path / "fc7_context", fc_dim, fc_dim, Default::default()),
        });

        let head_dim = if context.is_some() { fc_dim * 2 } else { fc_dim };
        let num_classes = num_classes as i64;
        let cls_score = Head::new(path / "cls_score", head_dim, num_classes, 0.01);
        let bbox_pred = Head::new(path / "bbox_pred", head_dim, num_classes * 4, 0.001);

        Ok(FastRcnnNet {
            data_layer,
            stages,
            fc6,
            fc7,
            context,
            cls_score,
            bbox_pred,
            dropout,
        })
    }
}

/// The fully connected layers of the context branch.
#[derive(Debug)]
struct ContextBranch {
    scale: f64,
    fc6: nn::Linear,
    fc7: nn::Linear,
}

/// A fully connected prediction layer with Gaussian initialized weights and zero bias.
#[derive(Debug)]
struct Head {
    ws: Tensor,
    bs: Tensor,
}

impl Head {
    fn new(path: nn::Path, in_dim: i64, out_dim: i64, stdev: f64) -> Self {
        let ws = path.var(
            "weight",
            &[out_dim, in_dim],
            nn::Init::Randn { mean: 0.0, stdev },
        );
        let bs = path.var("bias", &[out_dim], nn::Init::Const(0.0));
        Self { ws, bs }
    }

    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.linear(&self.ws, Some(&self.bs))
    }
}

/// The classification and regression outputs per RoI.
#[derive(Debug)]
pub struct FastRcnnOutput {
    /// Class logits in shape `[R, num_classes]`.
    pub cls_score: Tensor,
    /// Box deltas in shape `[R, 4 * num_classes]`.
    pub bbox_pred: Tensor,
}

/// The loss terms of a minibatch.
#[derive(Debug)]
pub struct FastRcnnLoss {
    pub loss_cls: Tensor,
    pub loss_bbox: Tensor,
    pub total: Tensor,
}

/// VGG16 Fast R-CNN with an optional context branch.
#[derive(Debug)]
pub struct FastRcnnNet {
    data_layer: RoiDataLayer,
    stages: Vec<Vec<nn::Conv2D>>,
    fc6: nn::Linear,
    fc7: nn::Linear,
    context: Option<ContextBranch>,
    cls_score: Head,
    bbox_pred: Head,
    dropout: f64,
}

impl FastRcnnNet {
    pub fn forward_t(
        &self,
        images: &Tensor,
        rois: &Tensor,
        train: bool,
    ) -> Result<FastRcnnOutput> {
        let num_stages = self.stages.len();
        let features = self
            .stages
            .iter()
            .enumerate()
            .fold(images.shallow_clone(), |xs, (index, convs)| {
                let xs = convs.iter().fold(xs, |xs, conv| xs.apply(conv).relu());
                if index + 1 < num_stages {
                    xs.max_pool2d_default(2)
                } else {
                    xs
                }
            });

        let fc7 = roi_pool(&features, rois, POOLED_SIZE, SPATIAL_SCALE)?
            .flatten(1, -1)
            .apply(&self.fc6)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.fc7)
            .relu()
            .dropout(self.dropout, train);

        let fc7 = match &self.context {
            Some(ContextBranch { scale, fc6, fc7: fc7_context }) => {
                let context_rois = enlarge_rois(rois, *scale);
                let context = roi_pool(&features, &context_rois, POOLED_SIZE, SPATIAL_SCALE)?
                    .flatten(1, -1)
                    .apply(fc6)
                    .relu()
                    .dropout(self.dropout, train)
                    .apply(fc7_context)
                    .relu()
                    .dropout(self.dropout, train);
                Tensor::cat(&[fc7, context], 1)
            }
            None => fc7,
        };

        Ok(FastRcnnOutput {
            cls_score: self.cls_score.forward(&fc7),
            bbox_pred: self.bbox_pred.forward(&fc7),
        })
    }

    /// Softmax cross-entropy plus smooth L1 over weighted box deltas.
    pub fn loss(&self, output: &FastRcnnOutput, minibatch: &Minibatch) -> FastRcnnLoss {
        let Minibatch {
            labels,
            bbox_targets,
            bbox_inside_weights,
            ..
        } = minibatch;
        let num_rois = labels.size()[0].max(1) as f64;

        let loss_cls = output.cls_score.cross_entropy_for_logits(labels);
        let diff = (&output.bbox_pred - bbox_targets) * bbox_inside_weights;
        let loss_bbox = smooth_l1(&diff).sum(Kind::Float) / num_rois;
        let total = &loss_cls + &loss_bbox;

        FastRcnnLoss {
            loss_cls,
            loss_bbox,
            total,
        }
    }
}

impl TrainNet for FastRcnnNet {
    fn set_roidb(&mut self, roidb: Arc<Vec<RoidbEntry>>) -> Result<()> {
        self.data_layer.set_roidb(roidb)
    }

    fn forward_loss(&mut self) -> Result<Tensor> {
        let minibatch = self.data_layer.next_minibatch()?;
        let output = self.forward_t(&minibatch.images, &minibatch.rois, true)?;
        let FastRcnnLoss {
            loss_cls,
            loss_bbox,
            total,
        } = self.loss(&output, &minibatch);
        debug!(
            "loss_cls = {:.5}, loss_bbox = {:.5}",
            f64::from(&loss_cls),
            f64::from(&loss_bbox)
        );
        Ok(total)
    }
}

/// Max-pools each RoI of a feature map into a fixed `size` × `size` grid.
///
/// `rois` has shape `[R, 5]` with rows `(batch_index, x1, y1, x2, y2)` in
/// input image coordinates. The output has shape `[R, C, size, size]`.
pub fn roi_pool(
    features: &Tensor,
    rois: &Tensor,
    size: i64,
    spatial_scale: f64,
) -> Result<Tensor> {
    let (batch_size, _channels, height, width) = features.size4()?;
    let (num_rois, num_cols) = rois.size2()?;
    ensure!(num_cols == 5, "rois must have 5 columns, but get {}", num_cols);
    ensure!(num_rois > 0, "rois must not be empty");

    let values = Vec::<f32>::from(&rois.to_device(Device::Cpu).contiguous().view([-1]));
    let pooled: Vec<_> = values
        .chunks(5)
        .map(|roi| -> Result<_> {
            let batch_index = roi[0] as i64;
            ensure!(
                (0..batch_size).contains(&batch_index),
                "roi batch index {} is out of range",
                batch_index
            );
            let quantize = |value: f32, limit: i64| {
                ((value as f64 * spatial_scale).round() as i64).clamp(0, limit - 1)
            };
            let x1 = quantize(roi[1], width);
            let y1 = quantize(roi[2], height);
            let x2 = quantize(roi[3], width).max(x1);
            let y2 = quantize(roi[4], height).max(y1);

            let (pooled, _indices) = features
                .get(batch_index)
                .narrow(1, y1, y2 - y1 + 1)
                .narrow(2, x1, x2 - x1 + 1)
                .adaptive_max_pool2d(&[size, size]);
            Ok(pooled)
        })
        .try_collect()?;

    Ok(Tensor::stack(&pooled, 0))
}

/// Resizes RoIs by a factor around their centers.
pub fn enlarge_rois(rois: &Tensor, factor: f64) -> Tensor {
    let batch_index = rois.narrow(1, 0, 1);
    let x1 = rois.narrow(1, 1, 1);
    let y1 = rois.narrow(1, 2, 1);
    let x2 = rois.narrow(1, 3, 1);
    let y2 = rois.narrow(1, 4, 1);

    let cx = (&x1 + &x2) / 2.0;
    let cy = (&y1 + &y2) / 2.0;
    let half_w = (&x2 - &x1) * (factor / 2.0);
    let half_h = (&y2 - &y1) * (factor / 2.0);

    Tensor::cat(
        &[
            batch_index,
            &cx - &half_w,
            &cy - &half_h,
            &cx + &half_w,
            &cy + &half_h,
        ],
        1,
    )
}

/// Elementwise smooth L1 with unit transition point.
pub fn smooth_l1(diff: &Tensor) -> Tensor {
    let abs = diff.abs();
    let quad = abs.clamp_max(1.0);
    &quad * &quad * 0.5 + (&abs - &quad)
}
