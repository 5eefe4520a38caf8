//! Connected-component extraction and region scoring over a [`SkinMask`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::skin::SkinMask;

/// Minimum component size at the 640x480 reference resolution.
pub const MIN_HAND_AREA: usize = 2000;
pub const MAX_HANDS: usize = 2;

/// Area at which the size component of the confidence saturates.
const FULL_SIZE_AREA: f32 = 10_000.0;
const SIZE_WEIGHT: f32 = 0.6;
const FILL_WEIGHT: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandType {
    Left,
    Right,
    Unknown,
}

impl HandType {
    /// Lowercase name used in file names and metadata keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandType::Left => "left",
            HandType::Right => "right",
            HandType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandType::Left => "Left",
            HandType::Right => "Right",
            HandType::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// Axis-aligned box spanning `min..max` on each axis.
///
/// Components record the extreme pixel coordinates, so `width()` is one less than the pixel
/// extent, matching platform `Rect` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl BoundingBox {
    pub fn new(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        debug_assert!(min_x <= max_x && min_y <= max_y);
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }

    pub fn area(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    pub fn center_x(&self) -> u32 {
        (self.min_x + self.max_x) / 2
    }

    /// Grows the box by `padding` on every side and clamps it to a `width x height` image.
    /// `max_x`/`max_y` may equal the image edge.
    ///
    /// Returns `None` when the clamped box is empty.
    pub fn padded_within(&self, padding: u32, width: u32, height: u32) -> Option<BoundingBox> {
        if self.min_x >= width || self.min_y >= height {
            return None;
        }
        let padded = BoundingBox {
            min_x: self.min_x.saturating_sub(padding),
            min_y: self.min_y.saturating_sub(padding),
            max_x: self.max_x.saturating_add(padding).min(width),
            max_y: self.max_y.saturating_add(padding).min(height),
        };
        (padded.width() > 0 && padded.height() > 0).then_some(padded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandRegion {
    pub bounding_box: BoundingBox,
    pub confidence: f32,
    pub timestamp: u64,
    pub hand_type: HandType,
}

/// Pixel count and extent of one connected component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentStats {
    pub area: usize,
    pub bounding_box: BoundingBox,
}

/// Size plus compactness score, clamped to [0, 1].
pub fn region_confidence(area: usize, bounding_box: &BoundingBox) -> f32 {
    let area = area as f32;
    let size_score = (area / FULL_SIZE_AREA).min(1.0);
    let fill_ratio = area / bounding_box.area().max(1) as f32;

    (SIZE_WEIGHT * size_score + FILL_WEIGHT * fill_ratio).clamp(0.0, 1.0)
}

/// Positional heuristic: the half of the image holding the box center.
pub fn classify_hand_type(bounding_box: &BoundingBox, image_width: u32) -> HandType {
    if bounding_box.center_x() < image_width / 2 {
        HandType::Left
    } else {
        HandType::Right
    }
}

#[derive(Debug, Clone)]
pub struct RegionExtractor {
    min_hand_area: usize,
    max_hands: usize,
}

impl RegionExtractor {
    pub fn new() -> Self {
        Self {
            min_hand_area: MIN_HAND_AREA,
            max_hands: MAX_HANDS,
        }
    }

    pub fn with_min_hand_area(mut self, min_area: usize) -> Self {
        self.min_hand_area = min_area;
        self
    }

    pub fn with_max_hands(mut self, max_hands: usize) -> Self {
        self.max_hands = max_hands;
        self
    }

    pub fn min_hand_area(&self) -> usize {
        self.min_hand_area
    }

    pub fn max_hands(&self) -> usize {
        self.max_hands
    }

    /// Finds hand candidates in `mask`, best first, at most `max_hands` of them.
    pub fn extract(&self, mask: &SkinMask, timestamp: u64) -> Vec<HandRegion> {
        let mut regions: Vec<HandRegion> = connected_components(mask)
            .into_iter()
            .filter(|component| component.area >= self.min_hand_area)
            .map(|component| HandRegion {
                bounding_box: component.bounding_box,
                confidence: region_confidence(component.area, &component.bounding_box),
                timestamp,
                hand_type: classify_hand_type(&component.bounding_box, mask.width()),
            })
            .collect();

        // stable: equal scores keep scan order
        regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        regions.truncate(self.max_hands);
        regions
    }
}

impl Default for RegionExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// 4-connected components of the skin pixels, in row-major discovery order.
pub fn connected_components(mask: &SkinMask) -> Vec<ComponentStats> {
    let width = mask.width() as usize;
    let height = mask.height() as usize;
    let skin = mask.as_slice();
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let mut visited = vec![false; skin.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut components = Vec::new();

    for seed in 0..skin.len() {
        if !skin[seed] || visited[seed] {
            continue;
        }

        let (seed_x, seed_y) = (seed % width, seed / width);
        let mut area = 0usize;
        let (mut min_x, mut max_x, mut min_y, mut max_y) = (seed_x, seed_x, seed_y, seed_y);

        visited[seed] = true;
        stack.push(seed);

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % width, idx / width);
            area += 1;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            let mut visit = |next: usize| {
                if skin[next] && !visited[next] {
                    visited[next] = true;
                    stack.push(next);
                }
            };
            if x + 1 < width {
                visit(idx + 1);
            }
            if x > 0 {
                visit(idx - 1);
            }
            if y + 1 < height {
                visit(idx + width);
            }
            if y > 0 {
                visit(idx - width);
            }
        }

        components.push(ComponentStats {
            area,
            bounding_box: BoundingBox::new(min_x as u32, min_y as u32, max_x as u32, max_y as u32),
        });
    }

    components
}
