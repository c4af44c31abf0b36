use serde::Serialize;

/// Highest density still reported as smooth traffic.
pub const LOW_MAX: u64 = 10;
/// Highest density still reported as moderate traffic.
pub const MEDIUM_MAX: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrafficLevel {
    Low,
    Medium,
    High,
}

impl TrafficLevel {
    pub fn color(self) -> &'static str {
        match self {
            TrafficLevel::Low => "green",
            TrafficLevel::Medium => "orange",
            TrafficLevel::High => "red",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            TrafficLevel::Low => "Smooth Traffic Flow",
            TrafficLevel::Medium => "Moderate Traffic Volume",
            TrafficLevel::High => "Heavy Traffic Volume",
        }
    }
}

/// Congestion status derived from the cumulative density total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficStatus {
    pub level: TrafficLevel,
    pub color: &'static str,
    pub message: &'static str,
    pub density: u64,
    pub alert: bool,
}

pub fn classify(total: u64) -> TrafficStatus {
    let level = match total {
        0..=LOW_MAX => TrafficLevel::Low,
        _ if total <= MEDIUM_MAX => TrafficLevel::Medium,
        _ => TrafficLevel::High,
    };
    TrafficStatus {
        level,
        color: level.color(),
        message: level.message(),
        density: total,
        alert: level == TrafficLevel::High,
    }
}
