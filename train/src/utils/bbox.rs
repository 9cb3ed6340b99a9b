use crate::common::*;

/// Small constant added to box sizes before division.
pub const EPS: f32 = 1e-14;

/// Bounding box in inclusive pixel coordinates.
///
/// Width and height count both border pixels, so a box with `x1 == x2`
/// is one pixel wide.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PixelBox {
    pub fn try_new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
        ensure!(
            x2 >= x1 && y2 >= y1,
            "x2 >= x1 and y2 >= y1 must hold, but get [{}, {}, {}, {}]",
            x1,
            y1,
            x2,
            y2
        );
        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn w(&self) -> f32 {
        self.x2 - self.x1 + 1.0
    }

    pub fn h(&self) -> f32 {
        self.y2 - self.y1 + 1.0
    }

    pub fn area(&self) -> f32 {
        self.w() * self.h()
    }

    pub fn tlbr(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Intersection over union with another box.
    pub fn iou_with(&self, other: &Self) -> f32 {
        let iw = self.x2.min(other.x2) - self.x1.max(other.x1) + 1.0;
        if iw <= 0.0 {
            return 0.0;
        }
        let ih = self.y2.min(other.y2) - self.y1.max(other.y1) + 1.0;
        if ih <= 0.0 {
            return 0.0;
        }
        let inter = iw * ih;
        inter / (self.area() + other.area() - inter)
    }

    /// Multiplies all coordinates by a factor.
    pub fn scale(&self, factor: f32) -> Self {
        Self {
            x1: self.x1 * factor,
            y1: self.y1 * factor,
            x2: self.x2 * factor,
            y2: self.y2 * factor,
        }
    }

    /// Resizes the box by a factor around its center.
    pub fn enlarge(&self, factor: f32) -> Self {
        let cx = (self.x1 + self.x2) / 2.0;
        let cy = (self.y1 + self.y2) / 2.0;
        let half_w = (self.x2 - self.x1) / 2.0 * factor;
        let half_h = (self.y2 - self.y1) / 2.0 * factor;
        Self {
            x1: cx - half_w,
            y1: cy - half_h,
            x2: cx + half_w,
            y2: cy + half_h,
        }
    }

    /// Computes the `(dx, dy, dw, dh)` deltas that move `self` onto `target`.
    pub fn deltas_to(&self, target: &Self) -> [f32; 4] {
        let ex_w = self.w() + EPS;
        let ex_h = self.h() + EPS;
        let ex_cx = self.x1 + 0.5 * ex_w;
        let ex_cy = self.y1 + 0.5 * ex_h;

        let gt_w = target.w() + EPS;
        let gt_h = target.h() + EPS;
        let gt_cx = target.x1 + 0.5 * gt_w;
        let gt_cy = target.y1 + 0.5 * gt_h;

        [
            (gt_cx - ex_cx) / ex_w,
            (gt_cy - ex_cy) / ex_h,
            (gt_w / ex_w).ln(),
            (gt_h / ex_h).ln(),
        ]
    }
}
