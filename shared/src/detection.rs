//! Detection frame types
//!
//! The vision detector is external; these types are its output contract.
//! Coordinates are integer pixels in the frame's own space.

/// Axis-aligned box in frame-pixel space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Horizontal center, rounded toward the left edge
    pub fn center_x(&self) -> i32 {
        self.x + self.width / 2
    }

    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    /// Height over width, `None` for degenerate boxes
    pub fn aspect_ratio(&self) -> Option<f32> {
        if self.width <= 0 || self.height <= 0 {
            return None;
        }
        Some(self.height as f32 / self.width as f32)
    }
}

/// A semantic label attached by the detector
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    pub confidence: f32,
}

impl Label {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// One detected object
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectedObject {
    pub bounds: BoundingBox,
    pub labels: Vec<Label>,
}

impl DetectedObject {
    pub fn new(bounds: BoundingBox) -> Self {
        Self {
            bounds,
            labels: Vec::new(),
        }
    }

    pub fn with_label(mut self, text: impl Into<String>, confidence: f32) -> Self {
        self.labels.push(Label::new(text, confidence));
        self
    }
}

/// Everything the detector saw in one camera frame
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionFrame {
    pub objects: Vec<DetectedObject>,
    pub width: u32,
    pub height: u32,
}

impl DetectionFrame {
    pub fn new(width: u32, height: u32, objects: Vec<DetectedObject>) -> Self {
        Self {
            objects,
            width,
            height,
        }
    }

    pub fn empty(width: u32, height: u32) -> Self {
        Self::new(width, height, Vec::new())
    }

    pub fn is_malformed(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_geometry() {
        let b = BoundingBox::new(100, 50, 41, 120);
        assert_eq!(b.center_x(), 120);
        assert_eq!(b.area(), 41 * 120);
        assert!((b.aspect_ratio().unwrap() - 120.0 / 41.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_degenerate_box() {
        let b = BoundingBox::new(0, 0, 0, 10);
        assert_eq!(b.area(), 0);
        assert!(b.aspect_ratio().is_none());
    }

    #[test]
    fn test_malformed_frame() {
        assert!(DetectionFrame::empty(0, 480).is_malformed());
        assert!(DetectionFrame::empty(640, 0).is_malformed());
        assert!(!DetectionFrame::empty(640, 480).is_malformed());
    }
}
