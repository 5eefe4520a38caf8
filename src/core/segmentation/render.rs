//! Mask and overlay rendering for detected regions.

use std::convert::Infallible;

use embedded_graphics::{
    mono_font::{ascii::FONT_10X20, MonoTextStyle},
    pixelcolor::Rgb888,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::{Baseline, Text},
};

use super::frame::{Frame, BYTES_PER_PIXEL};
use super::region::{BoundingBox, HandRegion};

pub const PRIMARY_COLOR: Rgb888 = Rgb888::GREEN;
pub const SECONDARY_COLOR: Rgb888 = Rgb888::BLUE;
pub const STROKE_WIDTH: u32 = 4;
/// Gap between the label baseline and the top edge of the box.
const LABEL_GAP: i32 = 10;

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRenderer;

impl FrameRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Black frame with every region's bounding box filled white.
    ///
    /// The whole box is filled, not just the component's pixels.
    pub fn render_mask(&self, width: u32, height: u32, regions: &[HandRegion]) -> Frame {
        let mut mask = Frame::filled(width, height, [0, 0, 0, 255]);
        let mut target = RgbaTarget::new(&mut mask);
        for region in regions {
            fill(&mut target, &region.bounding_box, Rgb888::WHITE);
        }
        mask
    }

    /// Copy of `frame` with stroked boxes and `"{type}: {confidence}"` labels.
    pub fn render_annotated(&self, frame: &Frame, regions: &[HandRegion]) -> Frame {
        let mut annotated = frame.clone();
        let mut target = RgbaTarget::new(&mut annotated);

        for (index, region) in regions.iter().enumerate() {
            let color = if index == 0 {
                PRIMARY_COLOR
            } else {
                SECONDARY_COLOR
            };
            stroke(&mut target, &region.bounding_box, color);

            let label = format!("{}: {:.2}", region.hand_type, region.confidence);
            let label_y = (region.bounding_box.min_y as i32 - LABEL_GAP)
                .max(FONT_10X20.character_size.height as i32);
            let style = MonoTextStyle::new(&FONT_10X20, color);
            Text::with_baseline(
                &label,
                Point::new(region.bounding_box.min_x as i32, label_y),
                style,
                Baseline::Alphabetic,
            )
            .draw(&mut target)
            .unwrap_or_else(|infallible| match infallible {});
        }

        annotated
    }
}

fn to_rectangle(bounding_box: &BoundingBox) -> Rectangle {
    Rectangle::new(
        Point::new(bounding_box.min_x as i32, bounding_box.min_y as i32),
        Size::new(bounding_box.width(), bounding_box.height()),
    )
}

fn fill(target: &mut RgbaTarget<'_>, bounding_box: &BoundingBox, color: Rgb888) {
    to_rectangle(bounding_box)
        .into_styled(PrimitiveStyle::with_fill(color))
        .draw(target)
        .unwrap_or_else(|infallible| match infallible {});
}

fn stroke(target: &mut RgbaTarget<'_>, bounding_box: &BoundingBox, color: Rgb888) {
    to_rectangle(bounding_box)
        .into_styled(PrimitiveStyle::with_stroke(color, STROKE_WIDTH))
        .draw(target)
        .unwrap_or_else(|infallible| match infallible {});
}

/// `DrawTarget` over a frame's RGBA buffer; out-of-bounds pixels are dropped.
struct RgbaTarget<'a> {
    frame: &'a mut Frame,
}

impl<'a> RgbaTarget<'a> {
    fn new(frame: &'a mut Frame) -> Self {
        Self { frame }
    }
}

impl OriginDimensions for RgbaTarget<'_> {
    fn size(&self) -> Size {
        Size::new(self.frame.width, self.frame.height)
    }
}

impl DrawTarget for RgbaTarget<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let width = self.frame.width as i32;
        let height = self.frame.height as i32;
        for Pixel(point, color) in pixels {
            if point.x < 0 || point.y < 0 || point.x >= width || point.y >= height {
                continue;
            }
            let idx = (point.y as usize * width as usize + point.x as usize) * BYTES_PER_PIXEL;
            if let Some(rgba) = self.frame.data.get_mut(idx..idx + BYTES_PER_PIXEL) {
                rgba.copy_from_slice(&[color.r(), color.g(), color.b(), 255]);
            }
        }
        Ok(())
    }
}
