//! Node positions and motion models.
//!
//! Each node with a position has one `MotionState`:
//! - `Static`: set once, never changes (fixed, grid and random placement)
//! - `Linear`: constant velocity, evaluated lazily as `p0 + v * (t - t0)`
//! - `Walk`: bounded random walk, advanced by self-rescheduling refresh events
//!
//! Only walkers need events. Everything else can be read at any instant.

pub mod geometry;

use std::collections::BTreeMap;
use std::f64::consts::TAU;
use std::time::Duration;

use crate::config::{GridLayout, MobilityConfig, RingHeading, WalkChange};
use crate::error::{SimError, SimResult};
use crate::network::NodeId;
use crate::simulation::rng::saturating_secs;
use crate::simulation::{RandomVariable, SimRng};
use geometry::{Point, Rect, Vector};

/// Leg length used in distance mode when the drawn speed is zero.
const IDLE_LEG: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub enum MotionState {
    Static { position: Point },
    Linear { origin: Point, velocity: Vector, since: Duration },
    Walk(Walker),
}

/// State of one bounded random walker.
#[derive(Debug, Clone)]
pub struct Walker {
    bounds: Rect,
    speed: RandomVariable,
    change: WalkChange,
    /// Position at `since`.
    position: Point,
    velocity: Vector,
    since: Duration,
    leg_end: Duration,
}

impl Walker {
    fn position_at(&self, time: Duration) -> Point {
        self.bounds.clamp(self.position.advanced(self.velocity, time.saturating_sub(self.since)))
    }

    fn start_leg(&mut self, now: Duration, rng: &mut SimRng) {
        let heading = rng.uniform(0.0, TAU);
        let speed = self.speed.sample(rng);
        self.velocity = settle(&self.bounds, &self.position, Vector::from_polar(speed, heading));
        let length = match self.change {
            WalkChange::Time { interval } => interval,
            WalkChange::Distance { distance } if speed > 0.0 => saturating_secs(distance / speed),
            WalkChange::Distance { .. } => IDLE_LEG,
        };
        self.leg_end = now.saturating_add(length);
    }

    /// Bring the walker up to `now` and return the time of the next refresh.
    fn refresh(&mut self, now: Duration, rng: &mut SimRng) -> Duration {
        self.position = self.position_at(now);
        self.since = now;
        if now >= self.leg_end {
            self.start_leg(now, rng);
        } else {
            self.velocity = settle(&self.bounds, &self.position, self.velocity);
        }
        match self.bounds.time_to_boundary(&self.position, &self.velocity) {
            Some(secs) => {
                // Round up so the walker is on (clamped to) the wall when the refresh fires.
                let wall = now.saturating_add(Duration::from_nanos((secs * 1e9).ceil() as u64));
                wall.min(self.leg_end)
            }
            None => self.leg_end,
        }
    }
}

/// Reflect off any wall `p` touches, then stop motion along an axis that is
/// still pointing out (a rectangle with zero width or height).
fn settle(bounds: &Rect, p: &Point, v: Vector) -> Vector {
    let mut v = bounds.reflect(p, v);
    if (p.x >= bounds.max_x && v.x > 0.0) || (p.x <= bounds.min_x && v.x < 0.0) {
        v.x = 0.0;
    }
    if (p.y >= bounds.max_y && v.y > 0.0) || (p.y <= bounds.min_y && v.y < 0.0) {
        v.y = 0.0;
    }
    v
}

/// Owns the position state of every node.
#[derive(Debug, Default)]
pub struct MobilityEngine {
    states: BTreeMap<NodeId, MotionState>,
}

impl MobilityEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fixed(&mut self, node: NodeId, position: Point) {
        self.states.insert(node, MotionState::Static { position });
    }

    pub fn set_constant_velocity(&mut self, node: NodeId, position: Point, velocity: Vector, now: Duration) {
        self.states.insert(
            node,
            MotionState::Linear {
                origin: position,
                velocity,
                since: now,
            },
        );
    }

    /// Install `config` on `nodes` (in order).
    ///
    /// # Parameters
    ///
    /// * `nodes` - Nodes to place; their index selects grid cells, ring slots and list entries
    /// * `config` - Motion model
    /// * `rng` - Source for random placement and walk legs
    /// * `now` - Current simulation time
    ///
    /// # Returns
    ///
    /// The first refresh time of every random walker. The caller schedules a
    /// refresh event for each.
    pub fn install(&mut self, nodes: &[NodeId], config: &MobilityConfig, rng: &mut SimRng, now: Duration) -> SimResult<Vec<(NodeId, Duration)>> {
        config.validate()?;
        let mut refreshes = Vec::new();
        let count = nodes.len();
        for (index, &node) in nodes.iter().enumerate() {
            let state = match config {
                MobilityConfig::Fixed { positions } => MotionState::Static {
                    position: positions[index % positions.len()],
                },
                MobilityConfig::Grid {
                    min_x,
                    min_y,
                    delta_x,
                    delta_y,
                    grid_width,
                    layout,
                } => {
                    let width = *grid_width as usize;
                    let (major, minor) = (index / width, index % width);
                    let (column, row) = match layout {
                        GridLayout::RowFirst => (minor, major),
                        GridLayout::ColumnFirst => (major, minor),
                    };
                    MotionState::Static {
                        position: Point::new(min_x + delta_x * column as f64, min_y + delta_y * row as f64),
                    }
                }
                MobilityConfig::UniformRandomPlacement { bounds } => MotionState::Static {
                    position: Point::new(rng.uniform(bounds.min_x, bounds.max_x), rng.uniform(bounds.min_y, bounds.max_y)),
                },
                MobilityConfig::ConstantVelocity { tracks } => {
                    let track = tracks[index % tracks.len()];
                    MotionState::Linear {
                        origin: track.position,
                        velocity: track.velocity,
                        since: now,
                    }
                }
                MobilityConfig::Ring {
                    center,
                    radius,
                    speed,
                    heading,
                } => {
                    let angle = TAU * index as f64 / count as f64;
                    let (sin, cos) = angle.sin_cos();
                    let velocity = match heading {
                        RingHeading::Radial => Vector::new(speed * cos, speed * sin),
                        RingHeading::Tangential => Vector::new(-speed * sin, speed * cos),
                    };
                    MotionState::Linear {
                        origin: Point::new(center.x + radius * cos, center.y + radius * sin),
                        velocity,
                        since: now,
                    }
                }
                MobilityConfig::BoundedRandomWalk { bounds, speed, change } => {
                    let mut walker = Walker {
                        bounds: *bounds,
                        speed: speed.clone(),
                        change: *change,
                        position: Point::new(rng.uniform(bounds.min_x, bounds.max_x), rng.uniform(bounds.min_y, bounds.max_y)),
                        velocity: Vector::ZERO,
                        since: now,
                        leg_end: now,
                    };
                    refreshes.push((node, walker.refresh(now, rng)));
                    MotionState::Walk(walker)
                }
            };
            self.states.insert(node, state);
        }
        log::debug!("Installed {} mobility on {} nodes", config.model_name(), count);
        Ok(refreshes)
    }

    /// Position of `node` at `time`.
    ///
    /// Exact for static and constant-velocity nodes. Walkers extrapolate their
    /// current heading, clamped to their bounds.
    pub fn position_at(&self, node: NodeId, time: Duration) -> SimResult<Point> {
        match self.states.get(&node).ok_or(SimError::UnknownNode(node))? {
            MotionState::Static { position } => Ok(*position),
            MotionState::Linear { origin, velocity, since } => Ok(origin.advanced(*velocity, time.saturating_sub(*since))),
            MotionState::Walk(walker) => Ok(walker.position_at(time)),
        }
    }

    pub fn velocity_at(&self, node: NodeId) -> SimResult<Vector> {
        match self.states.get(&node).ok_or(SimError::UnknownNode(node))? {
            MotionState::Static { .. } => Ok(Vector::ZERO),
            MotionState::Linear { velocity, .. } => Ok(*velocity),
            MotionState::Walk(walker) => Ok(walker.velocity),
        }
    }

    /// Handle a refresh event for `node`. Returns the next refresh time, or
    /// `None` when the node does not need refreshing.
    pub fn refresh(&mut self, node: NodeId, now: Duration, rng: &mut SimRng) -> Option<Duration> {
        match self.states.get_mut(&node)? {
            MotionState::Walk(walker) => Some(walker.refresh(now, rng)),
            _ => None,
        }
    }

    pub fn has_position(&self, node: NodeId) -> bool {
        self.states.contains_key(&node)
    }

    pub fn state(&self, node: NodeId) -> Option<&MotionState> {
        self.states.get(&node)
    }
}
