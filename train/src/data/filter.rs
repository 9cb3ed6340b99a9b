use super::RoidbEntry;
use crate::{common::*, config::TrainingConfig};

/// Overlap thresholds that classify RoIs as foreground or background.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiThresholds {
    pub fg_thresh: f32,
    pub bg_thresh_lo: f32,
    pub bg_thresh_hi: f32,
}

impl RoiThresholds {
    pub fn is_fg(&self, overlap: f32) -> bool {
        overlap >= self.fg_thresh && overlap < 1.0
    }

    pub fn is_bg(&self, overlap: f32) -> bool {
        overlap >= self.bg_thresh_lo && overlap < self.bg_thresh_hi
    }
}

impl From<&TrainingConfig> for RoiThresholds {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            fg_thresh: config.fg_thresh.raw() as f32,
            bg_thresh_lo: config.bg_thresh_lo.raw() as f32,
            bg_thresh_hi: config.bg_thresh_hi.raw() as f32,
        }
    }
}

/// Checks whether the entry has at least one foreground and one background RoI.
///
/// Ground-truth boxes (overlap 1.0) do not count as foreground here.
pub fn is_valid_entry(entry: &RoidbEntry, thresholds: &RoiThresholds) -> bool {
    let has_fg = entry
        .max_overlaps
        .iter()
        .any(|&overlap| thresholds.is_fg(overlap));
    let has_bg = entry
        .max_overlaps
        .iter()
        .any(|&overlap| thresholds.is_bg(overlap));
    has_fg && has_bg
}

/// Removes roidb entries that have no usable RoIs, preserving the order of the rest.
pub fn filter_roidb(roidb: Vec<RoidbEntry>, thresholds: &RoiThresholds) -> Vec<RoidbEntry> {
    let num = roidb.len();
    let filtered: Vec<_> = roidb
        .into_iter()
        .filter(|entry| is_valid_entry(entry, thresholds))
        .collect();
    let num_after = filtered.len();

    info!(
        "Filtered {} roidb entries: {} -> {}",
        num - num_after,
        num,
        num_after
    );
    filtered
}
