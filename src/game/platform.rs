//! Static platforms players can land on

use super::vector::Bounds;
use super::{ARENA_HEIGHT, ARENA_WIDTH};

pub const PLATFORM_WIDTH: f64 = 500.0;
pub const PLATFORM_HEIGHT: f64 = 30.0;

/// An immutable rectangular surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Platform {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl Platform {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn bounds(&self) -> Bounds {
        Bounds {
            left: self.x,
            right: self.x + self.width,
            top: self.y,
            bottom: self.y + self.height,
            width: self.width,
            height: self.height,
        }
    }
}

/// The arena's platform layout: two tiers, mirrored left/right.
pub fn default_platforms() -> Vec<Platform> {
    vec![
        Platform::new(115.0, ARENA_HEIGHT - 250.0, PLATFORM_WIDTH, PLATFORM_HEIGHT),
        Platform::new(
            ARENA_WIDTH - 610.0,
            ARENA_HEIGHT - 250.0,
            PLATFORM_WIDTH,
            PLATFORM_HEIGHT,
        ),
        Platform::new(115.0, ARENA_HEIGHT - 500.0, PLATFORM_WIDTH, PLATFORM_HEIGHT),
        Platform::new(
            ARENA_WIDTH - 610.0,
            ARENA_HEIGHT - 500.0,
            PLATFORM_WIDTH,
            PLATFORM_HEIGHT,
        ),
    ]
}
