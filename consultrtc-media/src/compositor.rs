//! Tiled video compositing
//!
//! Participants are placed on a `ceil(sqrt(n))` square grid over a fixed
//! canvas. Each frame is letterboxed into its cell with nearest-neighbour
//! scaling; the background is black.

use crate::error::{MediaError, MediaResult};
use crate::tracks::VideoFrame;
use tracing::warn;

/// Default canvas width
pub const CANVAS_WIDTH: u32 = 1280;
/// Default canvas height
pub const CANVAS_HEIGHT: u32 = 720;
/// Default composite frame rate
pub const COMPOSITE_FPS: u32 = 25;

/// Grid placement for a number of participants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    /// Grid columns
    pub columns: u32,
    /// Grid rows
    pub rows: u32,
    /// Width of one cell
    pub cell_width: u32,
    /// Height of one cell
    pub cell_height: u32,
}

impl TileLayout {
    /// Square grid large enough for `participants` on a `width` x `height` canvas
    pub fn for_participants(participants: usize, width: u32, height: u32) -> Self {
        let side = (participants.max(1) as f64).sqrt().ceil() as u32;
        Self {
            columns: side,
            rows: side,
            cell_width: width / side,
            cell_height: height / side,
        }
    }

    /// Top-left corner of cell `index`, row-major
    pub fn cell_origin(&self, index: usize) -> (u32, u32) {
        let index = index as u32;
        let column = index % self.columns;
        let row = index / self.columns;
        (column * self.cell_width, row * self.cell_height)
    }

    /// Number of cells
    pub fn capacity(&self) -> usize {
        (self.columns * self.rows) as usize
    }
}

/// Fit `source` into `target` preserving aspect ratio.
///
/// Returns the scaled size and the offset inside the target.
pub fn letterbox(source: (u32, u32), target: (u32, u32)) -> ((u32, u32), (u32, u32)) {
    let (src_w, src_h) = source;
    let (dst_w, dst_h) = target;
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return ((0, 0), (0, 0));
    }
    let source_aspect = src_w as f64 / src_h as f64;
    let target_aspect = dst_w as f64 / dst_h as f64;

    if source_aspect > target_aspect {
        // Source is wider - fit to width
        let scaled_height = ((dst_w as f64 / source_aspect) as u32).max(1);
        ((dst_w, scaled_height), (0, (dst_h - scaled_height) / 2))
    } else {
        // Source is taller - fit to height
        let scaled_width = ((dst_h as f64 * source_aspect) as u32).max(1);
        ((scaled_width, dst_h), ((dst_w - scaled_width) / 2, 0))
    }
}

/// Draws participant frames onto one canvas
#[derive(Debug, Clone)]
pub struct Compositor {
    width: u32,
    height: u32,
    layout: TileLayout,
}

impl Compositor {
    /// Compositor for `participants` on a `width` x `height` canvas
    pub fn new(width: u32, height: u32, participants: usize) -> MediaResult<Self> {
        if width == 0 || height == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: format!("canvas size {}x{} is empty", width, height),
            });
        }
        Ok(Self {
            width,
            height,
            layout: TileLayout::for_participants(participants, width, height),
        })
    }

    /// Grid in use
    pub fn layout(&self) -> TileLayout {
        self.layout
    }

    /// Canvas size
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Compose one canvas frame. `None` entries leave their cell black.
    pub fn compose(&self, frames: &[Option<&VideoFrame>], timestamp: u64) -> VideoFrame {
        let mut canvas = VideoFrame::black(self.width, self.height, timestamp);
        for (index, frame) in frames.iter().enumerate().take(self.layout.capacity()) {
            let Some(frame) = frame else {
                continue;
            };
            if frame.data.len() != frame.expected_len() {
                warn!(
                    index,
                    expected = frame.expected_len(),
                    actual = frame.data.len(),
                    "Skipping malformed frame"
                );
                continue;
            }
            self.draw(&mut canvas, index, frame);
        }
        canvas
    }

    fn draw(&self, canvas: &mut VideoFrame, index: usize, frame: &VideoFrame) {
        let (cell_x, cell_y) = self.layout.cell_origin(index);
        let ((scaled_w, scaled_h), (offset_x, offset_y)) = letterbox(
            (frame.width, frame.height),
            (self.layout.cell_width, self.layout.cell_height),
        );
        let canvas_stride = self.width as usize * 4;
        let frame_stride = frame.width as usize * 4;

        for y in 0..scaled_h {
            let src_y = (y as u64 * frame.height as u64 / scaled_h as u64) as usize;
            let dst_y = (cell_y + offset_y + y) as usize;
            for x in 0..scaled_w {
                let src_x = (x as u64 * frame.width as u64 / scaled_w as u64) as usize;
                let dst_x = (cell_x + offset_x + x) as usize;
                let src = src_y * frame_stride + src_x * 4;
                let dst = dst_y * canvas_stride + dst_x * 4;
                canvas.data[dst..dst + 4].copy_from_slice(&frame.data[src..src + 4]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> VideoFrame {
        VideoFrame {
            width,
            height,
            data: rgba.repeat((width * height) as usize),
            timestamp: 0,
            is_keyframe: true,
        }
    }

    fn pixel(frame: &VideoFrame, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * frame.width + x) * 4) as usize;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2], frame.data[i + 3]]
    }

    #[test]
    fn test_grid_sizes() {
        assert_eq!(TileLayout::for_participants(1, 1280, 720).columns, 1);
        assert_eq!(TileLayout::for_participants(2, 1280, 720).columns, 2);
        assert_eq!(TileLayout::for_participants(4, 1280, 720).columns, 2);
        let five = TileLayout::for_participants(5, 1280, 720);
        assert_eq!((five.columns, five.rows), (3, 3));
        assert_eq!((five.cell_width, five.cell_height), (426, 240));
        assert_eq!(five.cell_origin(4), (426, 240));
    }

    #[test]
    fn test_letterbox() {
        assert_eq!(letterbox((640, 480), (640, 360)), ((480, 360), (80, 0)));
        assert_eq!(letterbox((1280, 720), (640, 640)), ((640, 360), (0, 140)));
    }

    #[test]
    fn test_compose_places_tiles() {
        let compositor = Compositor::new(4, 4, 4).unwrap();
        let red = solid(2, 2, [255, 0, 0, 255]);
        let blue = solid(4, 4, [0, 0, 255, 255]);
        let canvas = compositor.compose(&[Some(&red), None, None, Some(&blue)], 40);

        assert_eq!(canvas.timestamp, 40);
        assert_eq!(pixel(&canvas, 0, 0), [255, 0, 0, 255]);
        assert_eq!(pixel(&canvas, 2, 0), [0, 0, 0, 255]);
        assert_eq!(pixel(&canvas, 3, 3), [0, 0, 255, 255]);
    }

    #[test]
    fn test_malformed_frame_skipped() {
        let compositor = Compositor::new(4, 4, 1).unwrap();
        let mut broken = solid(2, 2, [255, 255, 255, 255]);
        broken.data.truncate(3);
        let canvas = compositor.compose(&[Some(&broken)], 0);
        assert_eq!(pixel(&canvas, 0, 0), [0, 0, 0, 255]);
    }
}
