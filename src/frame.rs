//! Frame buffers and the frame source contract.
//!
//! - `Frame`: packed RGB8 pixels with their dimensions.
//! - `FrameSource`: anything that can hand the pipeline its next frame.
//!
//! Tiling extraction and motion sampling both go through `Frame::region` /
//! `Frame::render_into`, so every consumer sees the same pixel layout.

use anyhow::{anyhow, Result};

use crate::geometry::TileRect;

/// Bytes per pixel for packed RGB8.
pub const RGB_CHANNELS: usize = 3;

/// Packed RGB8 frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel payloads are large; only show the shape.
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected_len,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Frame filled with a single colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * RGB_CHANNELS);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&rgb);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_rgb(&self) -> &[u8] {
        &self.data
    }

    pub fn into_rgb(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn same_dimensions(&self, other: &Frame) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// RGB triple at `(x, y)`. Caller guarantees the coordinate is in range.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// RGB triple at a linear pixel index.
    pub fn pixel_at(&self, index: usize) -> [u8; 3] {
        let idx = index * RGB_CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgb: [u8; 3]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let idx = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        self.data[idx..idx + RGB_CHANNELS].copy_from_slice(&rgb);
    }

    /// Paint an axis-aligned block, clipped to the frame.
    pub fn fill_rect(&mut self, rect: TileRect, rgb: [u8; 3]) {
        let rect = self.clip(rect);
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                self.set_pixel(x, y, rgb);
            }
        }
    }

    /// Clip a rectangle to the frame bounds.
    pub fn clip(&self, rect: TileRect) -> TileRect {
        let x = rect.x.min(self.width);
        let y = rect.y.min(self.height);
        let width = rect.width.min(self.width - x);
        let height = rect.height.min(self.height - y);
        TileRect::new(x, y, width, height)
    }

    /// Copy a rectangular sub-region at native resolution.
    pub fn region(&self, rect: TileRect) -> Frame {
        let rect = self.clip(rect);
        let row_bytes = rect.width as usize * RGB_CHANNELS;
        let mut data = Vec::with_capacity(row_bytes * rect.height as usize);
        for row in rect.y..rect.y + rect.height {
            let start = (row as usize * self.width as usize + rect.x as usize) * RGB_CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Frame {
            data,
            width: rect.width,
            height: rect.height,
        }
    }

    /// Render a region into a fixed-size buffer using nearest-neighbour sampling.
    pub fn render_into(&self, rect: TileRect, out_width: u32, out_height: u32) -> Frame {
        let rect = self.clip(rect);
        if rect.is_empty() || out_width == 0 || out_height == 0 {
            return Frame {
                data: Vec::new(),
                width: 0,
                height: 0,
            };
        }
        let mut data = Vec::with_capacity(out_width as usize * out_height as usize * RGB_CHANNELS);
        for oy in 0..out_height {
            let sy = rect.y + (oy as u64 * rect.height as u64 / out_height as u64) as u32;
            for ox in 0..out_width {
                let sx = rect.x + (ox as u64 * rect.width as u64 / out_width as u64) as u32;
                data.extend_from_slice(&self.pixel(sx, sy));
            }
        }
        Frame {
            data,
            width: out_width,
            height: out_height,
        }
    }
}

/// Statistics reported by a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Producer of frames for the detection pipeline.
pub trait FrameSource: Send {
    /// Connect to the underlying device or stream.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 7]);
            }
        }
        Frame::new(data, width, height).unwrap()
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2).is_err());
        assert!(Frame::new(vec![0u8; 12], 2, 2).is_ok());
    }

    #[test]
    fn region_copies_expected_pixels() {
        let frame = gradient(8, 6);
        let tile = frame.region(TileRect::new(2, 3, 4, 2));
        assert_eq!((tile.width(), tile.height()), (4, 2));
        assert_eq!(tile.as_rgb().len(), 4 * 2 * RGB_CHANNELS);
        assert_eq!(tile.pixel(0, 0), [2, 3, 7]);
        assert_eq!(tile.pixel(3, 1), [5, 4, 7]);
    }

    #[test]
    fn region_is_clipped_to_frame() {
        let frame = gradient(8, 6);
        let tile = frame.region(TileRect::new(6, 4, 10, 10));
        assert_eq!((tile.width(), tile.height()), (2, 2));
        assert_eq!(tile.pixel(1, 1), [7, 5, 7]);
    }

    #[test]
    fn render_into_downsamples() {
        let frame = gradient(8, 8);
        let small = frame.render_into(TileRect::full(8, 8), 4, 4);
        assert_eq!((small.width(), small.height()), (4, 4));
        assert_eq!(small.pixel(1, 1), [2, 2, 7]);
        assert_eq!(small.pixel(3, 3), [6, 6, 7]);
    }

    #[test]
    fn fill_rect_paints_clipped_block() {
        let mut frame = Frame::solid(4, 4, [0, 0, 0]);
        frame.fill_rect(TileRect::new(2, 2, 5, 5), [255, 0, 0]);
        assert_eq!(frame.pixel(3, 3), [255, 0, 0]);
        assert_eq!(frame.pixel(1, 1), [0, 0, 0]);
    }
}
