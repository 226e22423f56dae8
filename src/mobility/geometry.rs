//! Plane geometry for node positions.
//!
//! Contains helpers for:
//! - Distances (squared distance to avoid a sqrt in range checks)
//! - Time until a moving point hits the wall of a rectangle
//! - Reflecting a velocity off the wall that was hit

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Position in metres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Position after moving at `velocity` for `elapsed`.
    pub fn advanced(&self, velocity: Vector, elapsed: Duration) -> Point {
        let t = elapsed.as_secs_f64();
        Point {
            x: self.x + velocity.x * t,
            y: self.y + velocity.y * t,
        }
    }
}

/// Velocity in metres per second.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector {
    pub x: f64,
    pub y: f64,
}

impl Vector {
    pub const ZERO: Vector = Vector { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Vector of length `speed` pointing at `heading` radians.
    pub fn from_polar(speed: f64, heading: f64) -> Self {
        Self {
            x: speed * heading.cos(),
            y: speed * heading.sin(),
        }
    }

    pub fn length(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Axis-aligned rectangle used as the boundary of random walkers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rect {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Rect {
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Self {
        Self { min_x, max_x, min_y, max_y }
    }

    /// Inclusive point-in-rectangle test.
    pub fn contains(&self, p: &Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }

    pub fn clamp(&self, p: Point) -> Point {
        Point {
            x: p.x.clamp(self.min_x, self.max_x),
            y: p.y.clamp(self.min_y, self.max_y),
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.min_x, self.max_x, self.min_y, self.max_y].iter().all(|v| v.is_finite()) && self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    /// Seconds until a point at `p` moving at `v` leaves the rectangle.
    ///
    /// Returns `None` when the point never reaches a wall (zero velocity).
    /// A point already on a wall and moving outwards gets `Some(0.0)`.
    pub fn time_to_boundary(&self, p: &Point, v: &Vector) -> Option<f64> {
        let tx = axis_exit(p.x, v.x, self.min_x, self.max_x);
        let ty = axis_exit(p.y, v.y, self.min_y, self.max_y);
        match (tx, ty) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Flip the velocity components pointing out through a wall `p` touches.
    pub fn reflect(&self, p: &Point, v: Vector) -> Vector {
        const EPS: f64 = 1e-6;
        let mut reflected = v;
        if (p.x <= self.min_x + EPS && v.x < 0.0) || (p.x >= self.max_x - EPS && v.x > 0.0) {
            reflected.x = -v.x;
        }
        if (p.y <= self.min_y + EPS && v.y < 0.0) || (p.y >= self.max_y - EPS && v.y > 0.0) {
            reflected.y = -v.y;
        }
        reflected
    }
}

fn axis_exit(position: f64, speed: f64, min: f64, max: f64) -> Option<f64> {
    if speed > 0.0 {
        Some(((max - position) / speed).max(0.0))
    } else if speed < 0.0 {
        Some(((min - position) / speed).max(0.0))
    } else {
        None
    }
}

/// Squared Euclidean distance in metres².
pub fn distance2(a: &Point, b: &Point) -> f64 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

pub fn distance(a: &Point, b: &Point) -> f64 {
    distance2(a, b).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert_eq!(distance2(&a, &b), 25.0);
        assert_eq!(distance(&a, &b), 5.0);
    }

    #[test]
    fn advancing_and_polar_vectors() {
        let p = Point::new(1.0, 1.0).advanced(Vector::new(2.0, -1.0), Duration::from_millis(500));
        assert_eq!(p, Point::new(2.0, 0.5));
        let v = Vector::from_polar(2.0, std::f64::consts::FRAC_PI_2);
        assert!(v.x.abs() < 1e-12);
        assert!((v.y - 2.0).abs() < 1e-12);
        assert!((v.length() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn time_to_boundary_takes_the_nearest_wall() {
        let rect = Rect::new(0.0, 10.0, 0.0, 10.0);
        let p = Point::new(5.0, 8.0);
        assert_eq!(rect.time_to_boundary(&p, &Vector::new(1.0, 1.0)), Some(2.0));
        assert_eq!(rect.time_to_boundary(&p, &Vector::new(-5.0, 0.0)), Some(1.0));
        assert_eq!(rect.time_to_boundary(&p, &Vector::ZERO), None);
    }

    #[test]
    fn reflection_flips_only_the_wall_normal() {
        let rect = Rect::new(0.0, 10.0, 0.0, 10.0);
        let on_right_wall = Point::new(10.0, 4.0);
        assert_eq!(rect.reflect(&on_right_wall, Vector::new(1.0, 1.0)), Vector::new(-1.0, 1.0));
        // Moving away from the wall already: untouched.
        assert_eq!(rect.reflect(&on_right_wall, Vector::new(-1.0, 1.0)), Vector::new(-1.0, 1.0));
        let corner = Point::new(0.0, 0.0);
        assert_eq!(rect.reflect(&corner, Vector::new(-1.0, -2.0)), Vector::new(1.0, 2.0));
    }

    #[test]
    fn clamp_and_contains() {
        let rect = Rect::new(-5.0, 5.0, 0.0, 1.0);
        assert!(rect.contains(&Point::new(5.0, 1.0)));
        assert!(!rect.contains(&Point::new(5.1, 1.0)));
        assert_eq!(rect.clamp(Point::new(9.0, -3.0)), Point::new(5.0, 0.0));
        assert!(!Rect::new(1.0, 0.0, 0.0, 1.0).is_valid());
    }
}
