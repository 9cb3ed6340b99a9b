use super::Solver;
use crate::{
    common::*,
    config::{Config, SolverConfig},
    data::{add_bbox_regression_targets, BBoxStats, RoidbEntry},
    utils::Timer,
};

/// File extension of the serialized variable store.
pub const SNAPSHOT_EXTENSION: &str = "ot";

/// Drives a [Solver] and writes snapshots with unnormalized regression weights.
pub struct SolverWrapper<S>
where
    S: Solver,
{
    solver: S,
    output_dir: PathBuf,
    bbox_stats: BBoxStats,
    bbox_reg: bool,
    bbox_pred_layer: String,
    snapshot_prefix: String,
    snapshot_infix: String,
    speed_interval: Option<NonZeroUsize>,
    snapshot_iters: Option<NonZeroUsize>,
}

impl<S> SolverWrapper<S>
where
    S: Solver,
{
    /// Prepares regression targets, builds the solver, loads the pretrained
    /// weights and hands the roidb to the solver.
    pub fn new<F>(
        config: &Config,
        mut roidb: Vec<RoidbEntry>,
        output_dir: &Path,
        pretrained_model: Option<&Path>,
        build_solver: F,
    ) -> Result<Self>
    where
        F: FnOnce(&SolverConfig) -> Result<S>,
    {
        let Config {
            ref solver,
            ref training,
            ref network,
            ref weight_transfer,
            ..
        } = *config;

        ensure!(!roidb.is_empty(), "the training roidb is empty");

        info!("Computing bounding-box regression targets...");
        let bbox_stats = add_bbox_regression_targets(
            &mut roidb,
            network.num_classes,
            training.bbox_thresh.raw() as f32,
            &training.bbox_normalization,
        )?;
        info!("done");

        let mut solver_impl = build_solver(solver)?;

        if let Some(path) = pretrained_model {
            info!("Loading pretrained model weights from {}", path.display());
            solver_impl.copy_from(path)?;
            let num_copied = solver_impl.params().transfer_weights(weight_transfer)?;
            debug!(
                "{} of {} weight transfers applied",
                num_copied,
                weight_transfer.len()
            );
        }

        solver_impl.set_roidb(Arc::new(roidb))?;

        Ok(Self {
            solver: solver_impl,
            output_dir: output_dir.to_owned(),
            bbox_stats,
            bbox_reg: training.bbox_reg,
            bbox_pred_layer: network.bbox_pred_layer.clone(),
            snapshot_prefix: solver.snapshot_prefix.clone(),
            snapshot_infix: training.snapshot_infix.clone(),
            speed_interval: solver.display.checked_mul(10).and_then(NonZeroUsize::new),
            snapshot_iters: NonZeroUsize::new(training.snapshot_iters),
        })
    }

    /// Saves the network parameters of the current iteration.
    ///
    /// With bounding-box regression enabled, the regression layer is saved
    /// in unnormalized form and restored in memory afterwards.
    pub fn snapshot(&mut self) -> Result<PathBuf> {
        let file_name = snapshot_filename(
            &self.snapshot_prefix,
            &self.snapshot_infix,
            self.solver.iter(),
        );
        let path = self.output_dir.join(file_name);

        let params = self.solver.params();
        let backup = if self.bbox_reg {
            let blocks = params.get(&self.bbox_pred_layer).ok_or_else(|| {
                format_err!(
                    "the regression layer '{}' does not exist",
                    self.bbox_pred_layer
                )
            })?;
            let (weight, bias) = match blocks {
                [weight, bias, ..] => (weight, bias),
                _ => bail!(
                    "the regression layer '{}' must have weight and bias",
                    self.bbox_pred_layer
                ),
            };
            let num_outputs = weight.size()[0];
            ensure!(
                self.bbox_stats.stds.len() as i64 == num_outputs
                    && self.bbox_stats.means.len() as i64 == num_outputs,
                "the regression layer '{}' has {} outputs, but the bbox stats have {}",
                self.bbox_pred_layer,
                num_outputs,
                self.bbox_stats.stds.len()
            );

            let orig_weight = weight.copy();
            let orig_bias = bias.copy();

            let device = weight.device();
            let kind = weight.kind();
            let stds = Tensor::of_slice(&self.bbox_stats.stds)
                .to_kind(kind)
                .to_device(device);
            let means = Tensor::of_slice(&self.bbox_stats.means)
                .to_kind(kind)
                .to_device(device);

            tch::no_grad(|| {
                let unnorm_weight = weight * stds.unsqueeze(1);
                let unnorm_bias = bias * &stds + &means;
                weight.shallow_clone().copy_(&unnorm_weight);
                bias.shallow_clone().copy_(&unnorm_bias);
            });

            Some((weight, bias, orig_weight, orig_bias))
        } else {
            None
        };

        let result = fs::create_dir_all(&self.output_dir)
            .with_context(|| {
                format!(
                    "failed to create output directory '{}'",
                    self.output_dir.display()
                )
            })
            .and_then(|()| self.solver.save(&path));

        if let Some((weight, bias, orig_weight, orig_bias)) = backup {
            tch::no_grad(|| {
                weight.shallow_clone().copy_(&orig_weight);
                bias.shallow_clone().copy_(&orig_bias);
            });
        }

        result?;
        info!("Wrote snapshot to: {}", path.display());
        Ok(path)
    }

    /// Steps the solver up to `max_iters` and returns the written snapshots.
    pub fn train_model(&mut self, max_iters: usize) -> Result<Vec<PathBuf>> {
        let mut last_snapshot_iter = None;
        let mut snapshots = vec![];
        let mut timer = Timer::new();

        while self.solver.iter() < max_iters {
            let prev_iter = self.solver.iter();

            timer.tic();
            self.solver.step(1)?;
            timer.toc();

            let iter = self.solver.iter();
            ensure!(
                iter == prev_iter + 1,
                "the solver advanced from iteration {} to {} in a single step",
                prev_iter,
                iter
            );

            if let Some(speed_interval) = self.speed_interval {
                if iter % speed_interval.get() == 0 {
                    info!("speed: {:.3}s / iter", timer.average_time().as_secs_f64());
                }
            }

            if let Some(snapshot_iters) = self.snapshot_iters {
                if iter % snapshot_iters.get() == 0 {
                    last_snapshot_iter = Some(iter);
                    snapshots.push(self.snapshot()?);
                }
            }
        }

        if last_snapshot_iter != Some(self.solver.iter()) {
            snapshots.push(self.snapshot()?);
        }

        Ok(snapshots)
    }
}

/// The snapshot file name `<prefix>[_<infix>]_iter_<iter>.ot`.
pub fn snapshot_filename(prefix: &str, infix: &str, iter: usize) -> String {
    if infix.is_empty() {
        format!("{}_iter_{}.{}", prefix, iter, SNAPSHOT_EXTENSION)
    } else {
        format!("{}_{}_iter_{}.{}", prefix, infix, iter, SNAPSHOT_EXTENSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{
            BBoxNormalization, DatasetConfig, LearningRatePolicy, NetworkConfig, TrainingConfig,
            WeightTransfer,
        },
        data::{BBoxTarget, RoidbEntry},
        utils::PixelBox,
    };

    /// Counts steps and owns a tiny variable store.
    struct MockSolver {
        vs: nn::VarStore,
        iter: usize,
        steps: usize,
        roidb_len: Option<usize>,
    }

    impl Solver for MockSolver {
        fn iter(&self) -> usize {
            self.iter
        }

        fn step(&mut self, iters: usize) -> Result<()> {
            self.iter += iters;
            self.steps += iters;
            Ok(())
        }

        fn set_roidb(&mut self, roidb: Arc<Vec<RoidbEntry>>) -> Result<()> {
            self.roidb_len = Some(roidb.len());
            Ok(())
        }

        fn var_store(&self) -> &nn::VarStore {
            &self.vs
        }

        fn var_store_mut(&mut self) -> &mut nn::VarStore {
            &mut self.vs
        }
    }

    const NUM_CLASSES: usize = 2;

    fn build_mock(start_iter: usize) -> impl FnOnce(&SolverConfig) -> Result<MockSolver> {
        move |_| {
            let vs = nn::VarStore::new(Device::Cpu);
            let root = vs.root();
            let _fc6 = nn::linear(&root / "fc6", 3, 4, Default::default());
            let _fc6_context = nn::linear(&root / "fc6_context", 3, 4, Default::default());
            let _bbox_pred = nn::linear(
                &root / "bbox_pred",
                4,
                NUM_CLASSES as i64 * 4,
                Default::default(),
            );
            Ok(MockSolver {
                vs,
                iter: start_iter,
                steps: 0,
                roidb_len: None,
            })
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "frcn-train-{}-{}-{}",
            name,
            std::process::id(),
            Local::now().timestamp_nanos()
        ))
    }

    fn entry() -> RoidbEntry {
        RoidbEntry {
            image: "000001.jpg".into(),
            width: 100,
            height: 80,
            boxes: vec![
                PixelBox::try_new(10.0, 10.0, 50.0, 50.0).unwrap(),
                PixelBox::try_new(12.0, 11.0, 52.0, 49.0).unwrap(),
            ],
            gt_classes: vec![1, 0],
            max_overlaps: vec![1.0, 0.8],
            max_classes: vec![1, 1],
            flipped: false,
            bbox_targets: None,
        }
    }

    fn config(bbox_reg: bool, snapshot_iters: Option<usize>, infix: &str) -> Config {
        Config {
            solver: SolverConfig {
                lr_policy: LearningRatePolicy::Fixed { base_lr: r64(0.001) },
                momentum: r64(0.9),
                weight_decay: r64(0.0005),
                display: 20,
                average_loss: NonZeroUsize::new(1).unwrap(),
                snapshot_prefix: "vgg16_fast_rcnn".into(),
                device: Device::Cpu,
                random_seed: None,
            },
            training: TrainingConfig {
                fg_thresh: r64(0.5),
                bg_thresh_lo: r64(0.1),
                bg_thresh_hi: r64(0.5),
                bbox_reg,
                bbox_thresh: r64(0.5),
                bbox_normalization: BBoxNormalization::Precomputed {
                    means: [0.0, 0.0, 0.0, 0.0],
                    stds: [0.1, 0.1, 0.2, 0.2],
                },
                snapshot_iters: snapshot_iters.unwrap_or(0),
                snapshot_infix: infix.into(),
                use_flipped: false,
                ims_per_batch: NonZeroUsize::new(2).unwrap(),
                batch_size: NonZeroUsize::new(128).unwrap(),
                fg_fraction: r64(0.25),
                scales: vec![600],
                max_size: 1000,
            },
            network: NetworkConfig {
                num_classes: NUM_CLASSES,
                context_scale: None,
                frozen_layers: vec![],
                bbox_pred_layer: "bbox_pred".into(),
                dropout: r64(0.5),
            },
            weight_transfer: vec![
                WeightTransfer::new("fc6", "fc6_context"),
                WeightTransfer::new("conv1_1", "conv1_1_depth"),
            ],
            dataset: DatasetConfig {
                roidb_file: "roidb.json".into(),
                image_dir: None,
            },
            output_dir: "output".into(),
            pretrained_model: None,
            max_iters: 25,
        }
    }

    #[test]
    fn snapshot_filenames() {
        assert_eq!(
            snapshot_filename("vgg16_fast_rcnn", "", 1000),
            "vgg16_fast_rcnn_iter_1000.ot"
        );
        assert_eq!(
            snapshot_filename("vgg16_fast_rcnn", "stage1", 1000),
            "vgg16_fast_rcnn_stage1_iter_1000.ot"
        );
    }

    #[test]
    fn empty_roidb_is_rejected() {
        let output_dir = temp_dir("empty");
        let result = SolverWrapper::new(
            &config(true, None, ""),
            vec![],
            &output_dir,
            None,
            build_mock(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn construction_hands_roidb_to_solver() -> Result<()> {
        let output_dir = temp_dir("construct");
        let wrapper = SolverWrapper::new(
            &config(true, None, ""),
            vec![entry(), entry()],
            &output_dir,
            None,
            build_mock(0),
        )?;
        assert_eq!(wrapper.solver.roidb_len, Some(2));
        assert_eq!(wrapper.bbox_stats.stds.len(), NUM_CLASSES * 4);
        Ok(())
    }

    #[test]
    fn pretrained_weights_are_loaded_and_transferred() -> Result<()> {
        let output_dir = temp_dir("pretrained");
        fs::create_dir_all(&output_dir)?;

        // save a model whose fc6 differs from a freshly built one
        let pretrained = build_mock(0)(&config(true, None, "").solver)?;
        tch::no_grad(|| {
            let _ = pretrained.vs.variables()["fc6.weight"].shallow_clone().fill_(0.25);
        });
        let pretrained_path = output_dir.join("pretrained.ot");
        pretrained.save(&pretrained_path)?;

        let wrapper = SolverWrapper::new(
            &config(true, None, ""),
            vec![entry()],
            &output_dir,
            Some(&pretrained_path),
            build_mock(0),
        )?;
        let variables = wrapper.solver.vs.variables();
        assert!(variables["fc6.weight"].equal(&variables["fc6_context.weight"]));
        assert!(variables["fc6.bias"].equal(&variables["fc6_context.bias"]));
        assert_eq!(f64::from(&variables["fc6_context.weight"].get(0).get(0)), 0.25);

        fs::remove_dir_all(&output_dir)?;
        Ok(())
    }

    #[test]
    fn snapshot_unnormalizes_and_restores() -> Result<()> {
        let output_dir = temp_dir("snapshot");
        let mut wrapper = SolverWrapper::new(
            &config(true, None, "stage1"),
            vec![entry()],
            &output_dir,
            None,
            build_mock(1000),
        )?;

        let variables = wrapper.solver.vs.variables();
        let weight = variables["bbox_pred.weight"].copy();
        let bias = variables["bbox_pred.bias"].copy();

        let path = wrapper.snapshot()?;
        assert_eq!(
            path,
            output_dir.join("vgg16_fast_rcnn_stage1_iter_1000.ot")
        );
        assert!(path.is_file());

        // in-memory parameters are restored bit for bit
        let variables = wrapper.solver.vs.variables();
        assert!(variables["bbox_pred.weight"].equal(&weight));
        assert!(variables["bbox_pred.bias"].equal(&bias));

        // the file holds unnormalized parameters
        let mut loaded = build_mock(0)(&config(true, None, "").solver)?;
        loaded.vs.load(&path)?;
        let loaded_vars = loaded.vs.variables();
        let stds = Tensor::of_slice(&wrapper.bbox_stats.stds);
        let means = Tensor::of_slice(&wrapper.bbox_stats.means);
        let expect_weight = &weight * stds.unsqueeze(1);
        let expect_bias = &bias * &stds + &means;
        assert!(loaded_vars["bbox_pred.weight"].allclose(&expect_weight, 1e-6, 1e-6, false));
        assert!(loaded_vars["bbox_pred.bias"].allclose(&expect_bias, 1e-6, 1e-6, false));

        fs::remove_dir_all(&output_dir)?;
        Ok(())
    }

    #[test]
    fn snapshot_without_bbox_reg_saves_raw_params() -> Result<()> {
        let output_dir = temp_dir("raw");
        let mut wrapper = SolverWrapper::new(
            &config(false, None, ""),
            vec![entry()],
            &output_dir,
            None,
            build_mock(7),
        )?;
        let path = wrapper.snapshot()?;
        assert_eq!(path, output_dir.join("vgg16_fast_rcnn_iter_7.ot"));

        let mut loaded = build_mock(0)(&config(false, None, "").solver)?;
        loaded.vs.load(&path)?;
        let variables = wrapper.solver.vs.variables();
        assert!(loaded.vs.variables()["bbox_pred.weight"].equal(&variables["bbox_pred.weight"]));

        fs::remove_dir_all(&output_dir)?;
        Ok(())
    }

    #[test]
    fn missing_regression_layer_fails_snapshot() -> Result<()> {
        let output_dir = temp_dir("missing-layer");
        let mut config = config(true, None, "");
        config.network.bbox_pred_layer = "bbox_pred_kitti".into();
        let mut wrapper =
            SolverWrapper::new(&config, vec![entry()], &output_dir, None, build_mock(0))?;
        assert!(wrapper.snapshot().is_err());
        Ok(())
    }

    #[test]
    fn mismatched_stats_fail_snapshot() -> Result<()> {
        let output_dir = temp_dir("mismatch");
        let mut config = config(true, None, "");
        // stats cover 3 classes but the regression layer predicts 2
        config.network.num_classes = NUM_CLASSES + 1;
        let mut wrapper =
            SolverWrapper::new(&config, vec![entry()], &output_dir, None, build_mock(0))?;
        let weight = wrapper.solver.vs.variables()["bbox_pred.weight"].copy();

        assert!(wrapper.snapshot().is_err());
        assert!(wrapper.solver.vs.variables()["bbox_pred.weight"].equal(&weight));
        assert!(!output_dir.exists());
        Ok(())
    }

    #[test]
    fn snapshot_failure_restores_params() -> Result<()> {
        let work_dir = temp_dir("failed-write");
        fs::create_dir_all(&work_dir)?;
        let blocker = work_dir.join("blocker");
        fs::write(&blocker, "not a directory")?;

        // the output directory cannot be created under a regular file
        let output_dir = blocker.join("output");
        let mut wrapper = SolverWrapper::new(
            &config(true, None, ""),
            vec![entry()],
            &output_dir,
            None,
            build_mock(3),
        )?;
        let variables = wrapper.solver.vs.variables();
        let weight = variables["bbox_pred.weight"].copy();
        let bias = variables["bbox_pred.bias"].copy();

        assert!(wrapper.snapshot().is_err());

        let variables = wrapper.solver.vs.variables();
        assert!(variables["bbox_pred.weight"].equal(&weight));
        assert!(variables["bbox_pred.bias"].equal(&bias));

        fs::remove_dir_all(&work_dir)?;
        Ok(())
    }

    #[test]
    fn huge_display_interval_does_not_overflow() -> Result<()> {
        let output_dir = temp_dir("huge-display");
        let mut config = config(false, None, "");
        config.solver.display = usize::MAX;
        let mut wrapper =
            SolverWrapper::new(&config, vec![entry()], &output_dir, None, build_mock(0))?;
        assert!(wrapper.speed_interval.is_none());

        let snapshots = wrapper.train_model(3)?;
        assert_eq!(snapshots.len(), 1);

        fs::remove_dir_all(&output_dir)?;
        Ok(())
    }

    #[test]
    fn training_loop_snapshots_periodically_and_at_end() -> Result<()> {
        let output_dir = temp_dir("loop");
        let mut wrapper = SolverWrapper::new(
            &config(true, Some(10), ""),
            vec![entry()],
            &output_dir,
            None,
            build_mock(0),
        )?;

        let snapshots = wrapper.train_model(25)?;
        let names: Vec<_> = snapshots
            .iter()
            .map(|path| path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            [
                "vgg16_fast_rcnn_iter_10.ot",
                "vgg16_fast_rcnn_iter_20.ot",
                "vgg16_fast_rcnn_iter_25.ot"
            ]
        );
        assert_eq!(wrapper.solver.steps, 25);

        fs::remove_dir_all(&output_dir)?;
        Ok(())
    }

    #[test]
    fn training_loop_skips_duplicate_final_snapshot() -> Result<()> {
        let output_dir = temp_dir("no-dup");
        let mut wrapper = SolverWrapper::new(
            &config(true, Some(10), ""),
            vec![entry()],
            &output_dir,
            None,
            build_mock(5),
        )?;

        let snapshots = wrapper.train_model(20)?;
        assert_eq!(snapshots.len(), 2);
        assert_eq!(wrapper.solver.steps, 15);

        fs::remove_dir_all(&output_dir)?;
        Ok(())
    }

    #[test]
    fn training_loop_without_periodic_snapshots() -> Result<()> {
        let output_dir = temp_dir("final-only");
        let mut wrapper = SolverWrapper::new(
            &config(false, None, ""),
            vec![entry()],
            &output_dir,
            None,
            build_mock(30),
        )?;

        // already past max_iters: no steps, one final snapshot
        let snapshots = wrapper.train_model(25)?;
        assert_eq!(snapshots, [output_dir.join("vgg16_fast_rcnn_iter_30.ot")]);
        assert_eq!(wrapper.solver.steps, 0);

        fs::remove_dir_all(&output_dir)?;
        Ok(())
    }

    #[test]
    fn solver_skipping_iterations_is_fatal() -> Result<()> {
        struct Skipping(MockSolver);

        impl Solver for Skipping {
            fn iter(&self) -> usize {
                self.0.iter()
            }

            fn step(&mut self, iters: usize) -> Result<()> {
                self.0.step(iters * 2)
            }

            fn set_roidb(&mut self, roidb: Arc<Vec<RoidbEntry>>) -> Result<()> {
                self.0.set_roidb(roidb)
            }

            fn var_store(&self) -> &nn::VarStore {
                self.0.var_store()
            }

            fn var_store_mut(&mut self) -> &mut nn::VarStore {
                self.0.var_store_mut()
            }
        }

        let output_dir = temp_dir("skip");
        let mut wrapper = SolverWrapper::new(
            &config(false, None, ""),
            vec![entry()],
            &output_dir,
            None,
            |config| Ok(Skipping(build_mock(0)(config)?)),
        )?;
        assert!(wrapper.train_model(10).is_err());
        Ok(())
    }

    #[test]
    fn targets_are_attached_before_handoff() -> Result<()> {
        let mut roidb = vec![entry()];
        let stats = add_bbox_regression_targets(
            &mut roidb,
            NUM_CLASSES,
            0.5,
            &BBoxNormalization::Disabled,
        )?;
        assert_eq!(stats, BBoxStats::identity(NUM_CLASSES));
        let targets = roidb[0].bbox_targets.as_ref().unwrap();
        assert_eq!(targets[0].class, 1);
        assert_ne!(targets[1], BBoxTarget::NONE);
        Ok(())
    }
}
