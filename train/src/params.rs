//! Layer-indexed access to network parameters.

use crate::{common::*, config::WeightTransfer};

/// Network parameters grouped by layer.
///
/// Tensors share storage with the variable store they were collected from,
/// so in-place writes through this table modify the network.
#[derive(Debug)]
pub struct NetParams {
    layers: IndexMap<String, Vec<Tensor>>,
}

impl NetParams {
    /// Groups the variables of a store by layer.
    ///
    /// A variable `conv1_1.weight` belongs to layer `conv1_1`. Blocks of a
    /// layer are ordered `weight`, `bias`, then the rest by name.
    pub fn from_var_store(vs: &nn::VarStore) -> Self {
        let mut layers: IndexMap<String, Vec<(String, Tensor)>> = IndexMap::new();

        vs.variables()
            .into_iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .for_each(|(name, tensor)| {
                let (layer, block) = match name.rsplit_once('.') {
                    Some((layer, block)) => (layer.to_string(), block.to_string()),
                    None => (name.clone(), String::new()),
                };
                layers.entry(layer).or_default().push((block, tensor));
            });

        let layers = layers
            .into_iter()
            .map(|(layer, mut blocks)| {
                blocks.sort_by_key(|(block, _)| (block_rank(block), block.clone()));
                let tensors = blocks.into_iter().map(|(_, tensor)| tensor).collect();
                (layer, tensors)
            })
            .collect();

        Self { layers }
    }

    /// Returns the parameter blocks of a layer, or `None` if the layer is absent.
    pub fn get(&self, layer: &str) -> Option<&[Tensor]> {
        self.layers.get(layer).map(|blocks| blocks.as_slice())
    }

    /// Copies parameter values from `src` to `dst`.
    ///
    /// Returns `Ok(false)` without touching anything if either layer is
    /// absent. Fails if the layers differ in block count or block shapes.
    pub fn copy_layer_params(&self, src: &str, dst: &str) -> Result<bool> {
        let (src_blocks, dst_blocks) = match (self.get(src), self.get(dst)) {
            (Some(src_blocks), Some(dst_blocks)) => (src_blocks, dst_blocks),
            _ => return Ok(false),
        };

        ensure!(
            src_blocks.len() == dst_blocks.len(),
            "layer '{}' has {} parameter blocks but layer '{}' has {}",
            src,
            src_blocks.len(),
            dst,
            dst_blocks.len()
        );
        izip!(src_blocks, dst_blocks)
            .enumerate()
            .try_for_each(|(index, (src_block, dst_block))| {
                ensure!(
                    src_block.size() == dst_block.size(),
                    "block {} of layer '{}' has shape {:?} but the one of '{}' has {:?}",
                    index,
                    src,
                    src_block.size(),
                    dst,
                    dst_block.size()
                );
                Ok(())
            })?;

        tch::no_grad(|| {
            izip!(src_blocks, dst_blocks).for_each(|(src_block, dst_block)| {
                dst_block.shallow_clone().copy_(src_block);
            });
        });

        Ok(true)
    }

    /// Applies a list of layer copies in order and returns the number of copies performed.
    pub fn transfer_weights(&self, transfers: &[WeightTransfer]) -> Result<usize> {
        transfers.iter().try_fold(0, |count, WeightTransfer { src, dst }| {
            let copied = self.copy_layer_params(src, dst)?;
            if copied {
                info!("initialized layer '{}' from '{}'", dst, src);
            } else {
                debug!("skipped copying '{}' to '{}'", src, dst);
            }
            Ok(count + copied as usize)
        })
    }
}

fn block_rank(block: &str) -> usize {
    match block {
        "weight" => 0,
        "bias" => 1,
        _ => 2,
    }
}
