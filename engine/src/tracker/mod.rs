use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

mod person;
mod registry;

pub use person::PersonState;
pub use registry::{SharedTrackRegistry, TrackRegistry, TrackSnapshot, TrackerConfig};

/// A 2D point in frame pixel units.
#[derive(Clone, Copy, PartialEq, Default, Debug)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// An axis-aligned bounding box in `(x1, y1, x2, y2)` corner form.
///
/// Always finite with `x1 <= x2` and `y1 <= y2`, and with a finite center and size.
#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
#[serde(try_from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
        if ![x1, y1, x2, y2].iter().all(|value| value.is_finite()) {
            return Err(Error::invalid(format!(
                "bounding box has non-finite coordinates ({x1}, {y1}, {x2}, {y2})"
            )));
        }
        if x2 < x1 || y2 < y1 {
            return Err(Error::invalid(format!(
                "bounding box corners are inverted ({x1}, {y1}, {x2}, {y2})"
            )));
        }
        if ![x1 + x2, y1 + y2, x2 - x1, y2 - y1]
            .iter()
            .all(|value| value.is_finite())
        {
            return Err(Error::invalid(format!(
                "bounding box center or size overflows ({x1}, {y1}, {x2}, {y2})"
            )));
        }

        Ok(Self { x1, y1, x2, y2 })
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn corners(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl TryFrom<[f32; 4]> for BoundingBox {
    type Error = Error;

    fn try_from([x1, y1, x2, y2]: [f32; 4]) -> Result<Self> {
        Self::new(x1, y1, x2, y2)
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(value: BoundingBox) -> Self {
        value.corners()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_center() {
        let bbox = BoundingBox::new(80.0, 60.0, 120.0, 140.0).unwrap();

        assert_eq!(bbox.center(), Point::new(100.0, 100.0));
        assert_eq!(bbox.width(), 40.0);
        assert_eq!(bbox.height(), 80.0);
    }

    #[test]
    fn bounding_box_rejects_malformed() {
        assert!(
            BoundingBox::new(10.0, 10.0, 5.0, 20.0)
                .unwrap_err()
                .is_invalid_input()
        );
        assert!(BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).is_err());
        assert!(BoundingBox::new(0.0, 0.0, f32::INFINITY, 1.0).is_err());
    }

    #[test]
    fn bounding_box_rejects_overflowing_center() {
        assert!(
            BoundingBox::new(f32::MAX, 0.0, f32::MAX, 1.0)
                .unwrap_err()
                .is_invalid_input()
        );
        assert!(BoundingBox::new(-f32::MAX, 0.0, f32::MAX, 1.0).is_err());
        assert!(serde_json::from_str::<BoundingBox>("[0, 3.4e38, 1, 3.4e38]").is_err());

        let bbox = BoundingBox::new(f32::MAX / 2.0, 0.0, f32::MAX / 2.0, 1.0).unwrap();
        assert!(bbox.center().x.is_finite());
    }

    #[test]
    fn bounding_box_deserialize_validates() {
        let bbox = serde_json::from_str::<BoundingBox>("[0, 0, 10, 20]").unwrap();
        assert_eq!(bbox.center(), Point::new(5.0, 10.0));

        assert!(serde_json::from_str::<BoundingBox>("[10, 0, 0, 20]").is_err());
    }

    #[test]
    fn point_distance() {
        assert_eq!(Point::new(0.0, 0.0).distance(Point::new(3.0, 4.0)), 5.0);
    }
}
