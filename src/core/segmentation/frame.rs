use std::time::Duration;

use super::error::{Result, SegmentationError};

pub const BYTES_PER_PIXEL: usize = 4;

/// 帧数据结构（RGBA，行优先）
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    pub timestamp: Duration,
    pub frame_number: u64,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        data: Vec<u8>,
        timestamp_ms: u64,
        frame_number: u64,
    ) -> Self {
        Self {
            width,
            height,
            data,
            timestamp: Duration::from_millis(timestamp_ms),
            frame_number,
        }
    }

    /// Like [`Frame::new`] but rejects buffers that do not hold `width * height` RGBA pixels.
    pub fn try_new(
        width: u32,
        height: u32,
        data: Vec<u8>,
        timestamp_ms: u64,
        frame_number: u64,
    ) -> Result<Self> {
        let frame = Self::new(width, height, data, timestamp_ms, frame_number);
        frame.validate()?;
        Ok(frame)
    }

    /// A frame where every pixel has the same RGBA value.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixel_count = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixel_count * BYTES_PER_PIXEL);
        for _ in 0..pixel_count {
            data.extend_from_slice(&rgba);
        }
        Self::new(width, height, data, 0, 0)
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp.as_millis() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(SegmentationError::InvalidFrame(format!(
                "empty frame {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.pixel_count() * BYTES_PER_PIXEL;
        if self.data.len() != expected {
            return Err(SegmentationError::InvalidFrame(format!(
                "expected {} bytes for {}x{} RGBA, got {}",
                expected,
                self.width,
                self.height,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// RGBA value at (x, y). Panics when out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL;
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }

    /// Copies the `width x height` block at (x, y) into a new owned frame.
    ///
    /// The block must lie inside the frame; callers clamp first.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Frame> {
        let fits = |start: u32, len: u32, limit: u32| {
            start.checked_add(len).is_some_and(|end| end <= limit)
        };
        if !fits(x, width, self.width) || !fits(y, height, self.height) {
            return Err(SegmentationError::InvalidFrame(format!(
                "crop {}x{}+{}+{} outside {}x{} frame",
                width, height, x, y, self.width, self.height
            )));
        }
        self.validate()?;

        let stride = self.width as usize * BYTES_PER_PIXEL;
        let row_bytes = width as usize * BYTES_PER_PIXEL;
        let mut data = Vec::with_capacity(row_bytes * height as usize);
        for row in y as usize..y as usize + height as usize {
            let start = row * stride + x as usize * BYTES_PER_PIXEL;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }

        Ok(Frame {
            width,
            height,
            data,
            timestamp: self.timestamp,
            frame_number: self.frame_number,
        })
    }
}

/// 从原生层传递的原始帧数据（YUV420 三平面）
#[derive(Debug)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub timestamp_ms: u64,
    pub frame_number: u64,
}

impl RawFrame {
    pub fn to_rgba(&self) -> Result<Frame> {
        if self.width < 2 || self.height < 2 {
            return Err(SegmentationError::InvalidFrame(format!(
                "YUV420 frame too small: {}x{}",
                self.width, self.height
            )));
        }
        let (width, height) = (self.width as usize, self.height as usize);
        let luma_len = width * height;
        let chroma_len = (width / 2) * (height / 2);
        if self.y_plane.len() < luma_len
            || self.u_plane.len() < chroma_len
            || self.v_plane.len() < chroma_len
        {
            return Err(SegmentationError::InvalidFrame(format!(
                "YUV planes too short for {}x{}",
                self.width, self.height
            )));
        }

        let chroma_width = width / 2;
        let mut rgba_data = vec![0u8; luma_len * BYTES_PER_PIXEL];

        for y in 0..height {
            for x in 0..width {
                let y_idx = y * width + x;
                let uv_idx = (y / 2) * chroma_width + x / 2;
                let uv_idx = uv_idx.min(chroma_len.saturating_sub(1));

                let y_val = self.y_plane[y_idx] as f32;
                let u_val = self.u_plane[uv_idx] as f32 - 128.0;
                let v_val = self.v_plane[uv_idx] as f32 - 128.0;

                let rgba_idx = y_idx * BYTES_PER_PIXEL;
                rgba_data[rgba_idx] = (y_val + 1.402 * v_val).clamp(0.0, 255.0) as u8;
                rgba_data[rgba_idx + 1] =
                    (y_val - 0.344136 * u_val - 0.714136 * v_val).clamp(0.0, 255.0) as u8;
                rgba_data[rgba_idx + 2] = (y_val + 1.772 * u_val).clamp(0.0, 255.0) as u8;
                rgba_data[rgba_idx + 3] = 255;
            }
        }

        Ok(Frame::new(
            self.width,
            self.height,
            rgba_data,
            self.timestamp_ms,
            self.frame_number,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::filled(100, 100, [255, 255, 255, 255]);

        assert_eq!(frame.width, 100);
        assert_eq!(frame.height, 100);
        assert_eq!(frame.pixel_count(), 10000);
        assert_eq!(frame.data.len(), 100 * 100 * 4);
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn test_try_new_rejects_short_buffer() {
        let result = Frame::try_new(10, 10, vec![0u8; 10], 0, 0);
        assert!(matches!(result, Err(SegmentationError::InvalidFrame(_))));
    }

    #[test]
    fn test_crop_copies_block() {
        let mut frame = Frame::filled(20, 10, [0, 0, 0, 255]);
        let idx = (5 * 20 + 7) * 4;
        frame.data[idx] = 200;

        let cropped = frame.crop(5, 3, 6, 4).unwrap();
        assert_eq!(cropped.width, 6);
        assert_eq!(cropped.height, 4);
        assert_eq!(cropped.pixel(2, 2), [200, 0, 0, 255]);
        assert_eq!(cropped.pixel(0, 0), [0, 0, 0, 255]);
    }

    #[test]
    fn test_crop_out_of_bounds() {
        let frame = Frame::filled(20, 10, [0, 0, 0, 255]);
        assert!(frame.crop(15, 0, 10, 5).is_err());
        // would wrap in u32
        assert!(frame.crop(u32::MAX, 0, 2, 1).is_err());
        assert!(frame.crop(0, 5, 1, u32::MAX).is_err());
    }

    #[test]
    fn test_crop_keeps_frame_metadata_and_full_extent() {
        let mut frame = Frame::filled(4, 3, [1, 2, 3, 255]);
        frame.timestamp = Duration::from_millis(77);
        frame.frame_number = 9;
        let last = frame.data.len() - 4;
        frame.data[last] = 250;

        let whole = frame.crop(0, 0, 4, 3).unwrap();
        assert_eq!(whole, frame);

        let corner = frame.crop(3, 2, 1, 1).unwrap();
        assert_eq!(corner.pixel(0, 0), [250, 2, 3, 255]);
        assert_eq!(corner.timestamp_ms(), 77);
        assert_eq!(corner.frame_number, 9);
    }

    #[test]
    fn test_crop_rejects_short_buffer() {
        let mut frame = Frame::filled(8, 8, [0, 0, 0, 255]);
        frame.data.truncate(40);
        assert!(matches!(
            frame.crop(0, 0, 4, 4),
            Err(SegmentationError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_yuv_to_rgba() {
        let width = 64;
        let height = 64;
        let raw_frame = RawFrame {
            width,
            height,
            y_plane: vec![128u8; (width * height) as usize],
            u_plane: vec![128u8; (width * height / 4) as usize],
            v_plane: vec![128u8; (width * height / 4) as usize],
            timestamp_ms: 40,
            frame_number: 1,
        };

        let frame = raw_frame.to_rgba().unwrap();
        assert_eq!(frame.width, width);
        assert_eq!(frame.data.len(), (width * height * 4) as usize);
        assert_eq!(frame.pixel(10, 10), [128, 128, 128, 255]);
        assert_eq!(frame.timestamp_ms(), 40);
    }

    #[test]
    fn test_yuv_rejects_short_planes() {
        let raw_frame = RawFrame {
            width: 8,
            height: 8,
            y_plane: vec![0u8; 10],
            u_plane: vec![],
            v_plane: vec![],
            timestamp_ms: 0,
            frame_number: 0,
        };
        assert!(raw_frame.to_rgba().is_err());
    }

    #[test]
    fn test_yuv_huge_dimensions_rejected_without_overflow() {
        let raw_frame = RawFrame {
            width: u32::MAX,
            height: 70_000,
            y_plane: vec![0u8; 16],
            u_plane: vec![0u8; 4],
            v_plane: vec![0u8; 4],
            timestamp_ms: 0,
            frame_number: 0,
        };
        assert!(matches!(
            raw_frame.to_rgba(),
            Err(SegmentationError::InvalidFrame(_))
        ));
    }
}
