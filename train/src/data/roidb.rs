use crate::{common::*, utils::PixelBox};

/// A roidb record as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoidbRecord {
    pub image: PathBuf,
    pub width: usize,
    pub height: usize,
    /// Boxes in `[x1, y1, x2, y2]` inclusive pixel coordinates.
    pub boxes: Vec<[f32; 4]>,
    /// Ground-truth class per box. Zero for proposals.
    pub gt_classes: Vec<usize>,
    /// Per-box overlap with the ground truth of each class.
    pub gt_overlaps: Vec<Vec<f32>>,
    #[serde(default)]
    pub flipped: bool,
}

/// The regression target of a single box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBoxTarget {
    /// The class the deltas regress to. Zero means no target.
    pub class: usize,
    pub deltas: [f32; 4],
}

impl BBoxTarget {
    pub const NONE: Self = Self {
        class: 0,
        deltas: [0.0; 4],
    };
}

/// A prepared per-image entry of the region-of-interest database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoidbEntry {
    pub image: PathBuf,
    pub width: usize,
    pub height: usize,
    pub boxes: Vec<PixelBox>,
    pub gt_classes: Vec<usize>,
    /// The maximum overlap score of each box over all classes.
    pub max_overlaps: Vec<f32>,
    /// The class attaining the maximum overlap of each box.
    pub max_classes: Vec<usize>,
    pub flipped: bool,
    /// Regression targets, filled by
    /// [add_bbox_regression_targets](super::add_bbox_regression_targets).
    pub bbox_targets: Option<Vec<BBoxTarget>>,
}

impl RoidbEntry {
    /// Builds an entry from a record, deriving max overlaps and classes.
    pub fn from_record(record: RoidbRecord) -> Result<Self> {
        let RoidbRecord {
            image,
            width,
            height,
            boxes,
            gt_classes,
            gt_overlaps,
            flipped,
        } = record;
        let num_boxes = boxes.len();

        ensure!(
            gt_classes.len() == num_boxes && gt_overlaps.len() == num_boxes,
            "'{}' has {} boxes, but {} gt_classes and {} gt_overlaps rows",
            image.display(),
            num_boxes,
            gt_classes.len(),
            gt_overlaps.len()
        );

        let boxes: Vec<_> = boxes
            .into_iter()
            .map(|[x1, y1, x2, y2]| PixelBox::try_new(x1, y1, x2, y2))
            .try_collect()
            .with_context(|| format!("invalid box in '{}'", image.display()))?;

        let (max_overlaps, max_classes): (Vec<_>, Vec<_>) = itertools::process_results(
            gt_overlaps.iter().map(|row| -> Result<_> {
                let (class, overlap) = row
                    .iter()
                    .copied()
                    .enumerate()
                    .fold(None, |max: Option<(usize, f32)>, (class, overlap)| match max {
                        Some((_, max_overlap)) if max_overlap >= overlap => max,
                        _ => Some((class, overlap)),
                    })
                    .ok_or_else(|| format_err!("empty gt_overlaps row in '{}'", image.display()))?;

                // boxes with zero overlap are background, the others must have a class
                ensure!(
                    (overlap == 0.0) == (class == 0),
                    "inconsistent overlap {} for class {} in '{}'",
                    overlap,
                    class,
                    image.display()
                );
                Ok((overlap, class))
            }),
            |iter| iter.unzip(),
        )?;

        Ok(Self {
            image,
            width,
            height,
            boxes,
            gt_classes,
            max_overlaps,
            max_classes,
            flipped,
            bbox_targets: None,
        })
    }

    /// Returns a horizontally mirrored copy of the entry.
    pub fn flipped(&self) -> Result<Self> {
        let width = self.width as f32;
        let boxes: Vec<_> = self
            .boxes
            .iter()
            .map(|bbox| {
                let x1 = width - bbox.x2 - 1.0;
                let x2 = width - bbox.x1 - 1.0;
                ensure!(
                    x2 >= x1,
                    "flipped box {:?} of '{}' is invalid",
                    bbox,
                    self.image.display()
                );
                PixelBox::try_new(x1, bbox.y1, x2, bbox.y2)
            })
            .try_collect()?;

        Ok(Self {
            boxes,
            flipped: !self.flipped,
            bbox_targets: None,
            ..self.clone()
        })
    }
}

/// Loads roidb records from a JSON file.
pub fn load_roidb<P>(path: P) -> Result<Vec<RoidbRecord>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read roidb file '{}'", path.display()))?;
    let records = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse roidb file '{}'", path.display()))?;
    Ok(records)
}

/// Derives max overlaps and classes for each record.
pub fn prepare_roidb(records: Vec<RoidbRecord>) -> Result<Vec<RoidbEntry>> {
    records.into_iter().map(RoidbEntry::from_record).collect()
}

/// Appends a horizontally flipped copy of every entry.
pub fn append_flipped_images(roidb: &mut Vec<RoidbEntry>) -> Result<()> {
    let flipped: Vec<_> = roidb.iter().map(RoidbEntry::flipped).try_collect()?;
    roidb.extend(flipped);
    Ok(())
}

/// Returns a roidb for use in training.
pub fn get_training_roidb(
    records: Vec<RoidbRecord>,
    use_flipped: bool,
) -> Result<Vec<RoidbEntry>> {
    info!("preparing training data");
    let mut roidb = prepare_roidb(records)?;

    if use_flipped {
        info!("appending horizontally-flipped training examples");
        append_flipped_images(&mut roidb)?;
    }
    info!("{} roidb entries ready", roidb.len());

    Ok(roidb)
}
