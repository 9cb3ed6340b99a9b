use crate::{
    common::*,
    config::SolverConfig,
    data::RoidbEntry,
    model::TrainNet,
    params::NetParams,
    utils::LrScheduler,
};
use std::collections::VecDeque;

/// The optimizer driving a network.
///
/// Parameter access, weight loading and serialization go through the
/// variable store, so implementors only provide stepping and the store.
pub trait Solver {
    /// The number of completed iterations.
    fn iter(&self) -> usize;

    /// Runs `iters` optimization steps.
    fn step(&mut self, iters: usize) -> Result<()>;

    /// Hands the training roidb to the network's data source.
    fn set_roidb(&mut self, roidb: Arc<Vec<RoidbEntry>>) -> Result<()>;

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// The network parameters grouped by layer.
    fn params(&self) -> NetParams {
        NetParams::from_var_store(self.var_store())
    }

    /// Loads every parameter present in the weights file.
    ///
    /// Parameters missing from the file keep their values.
    fn copy_from(&mut self, path: &Path) -> Result<()> {
        ensure!(
            path.is_file(),
            "pretrained weights file '{}' does not exist",
            path.display()
        );
        let missing = self
            .var_store_mut()
            .load_partial(path)
            .with_context(|| format!("failed to load weights from '{}'", path.display()))?;
        if !missing.is_empty() {
            warn!(
                "{} parameters are not found in '{}': {}",
                missing.len(),
                path.display(),
                missing.iter().join(", ")
            );
        }
        Ok(())
    }

    /// Serializes all parameters to a file.
    fn save(&self, path: &Path) -> Result<()> {
        self.var_store()
            .save(path)
            .with_context(|| format!("failed to save weights to '{}'", path.display()))?;
        Ok(())
    }
}

/// Stochastic gradient descent with momentum over a [TrainNet].
pub struct SgdSolver<N>
where
    N: TrainNet,
{
    vs: nn::VarStore,
    net: N,
    optimizer: nn::Optimizer,
    lr_scheduler: LrScheduler,
    display: usize,
    average_loss: usize,
    losses: VecDeque<f64>,
    iter: usize,
}

impl<N> SgdSolver<N>
where
    N: TrainNet,
{
    /// Creates the variable store, builds the network under its root and
    /// sets up the optimizer.
    pub fn new<F>(config: &SolverConfig, frozen_layers: &[String], build_net: F) -> Result<Self>
    where
        F: FnOnce(&nn::Path) -> Result<N>,
    {
        let SolverConfig {
            ref lr_policy,
            momentum,
            weight_decay,
            display,
            average_loss,
            device,
            random_seed,
            ..
        } = *config;

        info!("initializing solver on {:?}", device);
        if let Some(seed) = random_seed {
            tch::manual_seed(seed as i64);
        }

        let lr_scheduler = LrScheduler::new(lr_policy)?;
        let vs = nn::VarStore::new(device);
        let net = build_net(&vs.root())?;
        freeze_layers(&vs, frozen_layers);

        let optimizer = nn::Sgd {
            momentum: momentum.raw(),
            dampening: 0.0,
            wd: weight_decay.raw(),
            nesterov: false,
        }
        .build(&vs, lr_scheduler.lr(0))?;

        Ok(Self {
            vs,
            net,
            optimizer,
            lr_scheduler,
            display,
            average_loss: average_loss.get(),
            losses: VecDeque::new(),
            iter: 0,
        })
    }

    /// The mean of the recent losses.
    pub fn smoothed_loss(&self) -> Option<f64> {
        (!self.losses.is_empty())
            .then(|| self.losses.iter().sum::<f64>() / self.losses.len() as f64)
    }
}

impl<N> Solver for SgdSolver<N>
where
    N: TrainNet,
{
    fn iter(&self) -> usize {
        self.iter
    }

    fn step(&mut self, iters: usize) -> Result<()> {
        for _ in 0..iters {
            let loss = self.net.forward_loss()?;
            let loss_value = f64::from(&loss);
            ensure!(
                loss_value.is_finite(),
                "loss diverged to {} at iteration {}",
                loss_value,
                self.iter
            );

            if self.losses.len() == self.average_loss {
                self.losses.pop_front();
            }
            self.losses.push_back(loss_value);

            let lr = self.lr_scheduler.lr(self.iter);
            if self.display > 0 && self.iter % self.display == 0 {
                info!(
                    "Iteration {}, loss = {:.5}, lr = {}",
                    self.iter,
                    self.smoothed_loss().unwrap_or(loss_value),
                    lr
                );
            }

            self.optimizer.set_lr(lr);
            self.optimizer.backward_step(&loss);
            self.iter += 1;
        }
        Ok(())
    }

    fn set_roidb(&mut self, roidb: Arc<Vec<RoidbEntry>>) -> Result<()> {
        self.net.set_roidb(roidb)
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }
}

/// Stops gradient updates of the listed layers.
fn freeze_layers(vs: &nn::VarStore, frozen_layers: &[String]) {
    if frozen_layers.is_empty() {
        return;
    }

    vs.variables()
        .into_iter()
        .filter(|(name, _)| {
            let layer = name.rsplit_once('.').map_or(name.as_str(), |(layer, _)| layer);
            frozen_layers.iter().any(|frozen| frozen == layer)
        })
        .for_each(|(name, tensor)| {
            debug!("freeze parameter '{}'", name);
            let _ = tensor.set_requires_grad(false);
        });
}
