//! Telescope offset patterns for search blocks

use serde::Serialize;

/// Shape of a search pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    /// Center plus the six vertices of a hexagon
    Hex,
    /// Spiral over a 5x5 grid, starting at the center
    Fxf,
}

impl PatternKind {
    pub fn keyword(self) -> &'static str {
        match self {
            PatternKind::Hex => "hex",
            PatternKind::Fxf => "fxf",
        }
    }
}

/// A sequence of pointing positions relative to the target
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub kind: PatternKind,
    pub ra_size: f64,
    pub dec_size: f64,
    /// Positions in units of the pattern size
    steps: Vec<(f64, f64)>,
}

impl Pattern {
    pub fn new(kind: PatternKind, ra_size: f64, dec_size: f64) -> Self {
        let steps = match kind {
            PatternKind::Hex => hex_steps(),
            PatternKind::Fxf => spiral_steps(5),
        };
        Self {
            kind,
            ra_size,
            dec_size,
            steps,
        }
    }

    /// Number of pattern positions, one block pass each
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Position of pass `index` in degrees
    pub fn position(&self, index: usize) -> Option<(f64, f64)> {
        self.steps
            .get(index)
            .map(|(ra, dec)| (ra * self.ra_size, dec * self.dec_size))
    }

    /// Offset that moves the telescope from the previous pass to pass `index`
    ///
    /// `None` when the pass does not move the telescope.
    pub fn offset_for_pass(&self, index: usize) -> Option<(f64, f64)> {
        let (ra, dec) = self.position(index)?;
        let (prev_ra, prev_dec) = match index {
            0 => (0.0, 0.0),
            i => self.position(i - 1)?,
        };
        let delta = (ra - prev_ra, dec - prev_dec);
        if delta.0.abs() < f64::EPSILON && delta.1.abs() < f64::EPSILON {
            None
        } else {
            Some(delta)
        }
    }
}

fn hex_steps() -> Vec<(f64, f64)> {
    std::iter::once((0.0, 0.0))
        .chain((0..6).map(|i| {
            let angle = (i as f64 * 60.0).to_radians();
            (angle.cos(), angle.sin())
        }))
        .collect()
}

/// Square spiral covering a `size` x `size` grid
fn spiral_steps(size: usize) -> Vec<(f64, f64)> {
    const DIRECTIONS: [(i32, i32); 4] = [(1, 0), (0, -1), (-1, 0), (0, 1)];
    let total = size * size;
    let mut steps = vec![(0.0, 0.0)];
    let (mut x, mut y) = (0i32, 0i32);
    let mut run = 1;
    let mut direction = 0;
    while steps.len() < total {
        for _ in 0..2 {
            let (dx, dy) = DIRECTIONS[direction % 4];
            for _ in 0..run {
                if steps.len() == total {
                    break;
                }
                x += dx;
                y += dy;
                steps.push((x as f64, y as f64));
            }
            direction += 1;
        }
        run += 1;
    }
    steps
}
