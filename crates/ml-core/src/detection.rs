use std::fmt;

use serde::{Deserialize, Serialize};

/// Single tracked detection returned by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub track_id: i64,
    pub class_id: i64,
    /// Center x, center y, width, height in frame pixels.
    #[serde(rename = "bbox")]
    pub bbox_xywh: [f32; 4],
    #[serde(default = "default_score")]
    pub score: f32,
}

fn default_score() -> f32 {
    1.0
}

impl Detection {
    pub fn centroid(&self) -> (f32, f32) {
        (self.bbox_xywh[0], self.bbox_xywh[1])
    }

    /// Corner form `[left, top, right, bottom]`.
    pub fn bbox_ltrb(&self) -> [f32; 4] {
        let [cx, cy, w, h] = self.bbox_xywh;
        [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
    }

    /// Recognized class of this detection, if any.
    pub fn traffic_class(&self) -> Option<TrafficClass> {
        TrafficClass::from_coco_id(self.class_id)
    }
}

/// Object categories the counter recognizes, keyed by COCO class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TrafficClass {
    Person,
    Bicycle,
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl TrafficClass {
    pub const ALL: [TrafficClass; 6] = [
        TrafficClass::Person,
        TrafficClass::Bicycle,
        TrafficClass::Car,
        TrafficClass::Motorcycle,
        TrafficClass::Bus,
        TrafficClass::Truck,
    ];

    /// Classes summed into the traffic density figure. Motorcycles are counted
    /// and reported but do not contribute to density.
    pub const DENSITY: [TrafficClass; 5] = [
        TrafficClass::Car,
        TrafficClass::Bus,
        TrafficClass::Truck,
        TrafficClass::Person,
        TrafficClass::Bicycle,
    ];

    pub fn from_coco_id(class_id: i64) -> Option<Self> {
        match class_id {
            0 => Some(TrafficClass::Person),
            1 => Some(TrafficClass::Bicycle),
            2 => Some(TrafficClass::Car),
            3 => Some(TrafficClass::Motorcycle),
            5 => Some(TrafficClass::Bus),
            7 => Some(TrafficClass::Truck),
            _ => None,
        }
    }

    pub fn coco_id(self) -> i64 {
        match self {
            TrafficClass::Person => 0,
            TrafficClass::Bicycle => 1,
            TrafficClass::Car => 2,
            TrafficClass::Motorcycle => 3,
            TrafficClass::Bus => 5,
            TrafficClass::Truck => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TrafficClass::Person => "Person",
            TrafficClass::Bicycle => "Bicycle",
            TrafficClass::Car => "Car",
            TrafficClass::Motorcycle => "Motorcycle",
            TrafficClass::Bus => "Bus",
            TrafficClass::Truck => "Truck",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
