use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::piece::Piece;

/// The two subtree aggregates tracked at every node: total byte length and
/// total line-feed count. Kept as a pair so every place the tree updates
/// `size_left` also updates `lf_left` in lock-step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Metrics {
    pub len: u64,
    pub lf: u64,
}

impl Metrics {
    pub const ZERO: Metrics = Metrics { len: 0, lf: 0 };

    pub fn of(piece: &Piece) -> Metrics {
        Metrics {
            len: piece.length,
            lf: piece.line_feed_cnt,
        }
    }
}

impl Add for Metrics {
    type Output = Metrics;
    fn add(self, rhs: Metrics) -> Metrics {
        Metrics {
            len: self.len + rhs.len,
            lf: self.lf + rhs.lf,
        }
    }
}

impl AddAssign for Metrics {
    fn add_assign(&mut self, rhs: Metrics) {
        self.len += rhs.len;
        self.lf += rhs.lf;
    }
}

impl Sub for Metrics {
    type Output = Metrics;
    fn sub(self, rhs: Metrics) -> Metrics {
        Metrics {
            len: self.len - rhs.len,
            lf: self.lf - rhs.lf,
        }
    }
}

impl SubAssign for Metrics {
    fn sub_assign(&mut self, rhs: Metrics) {
        self.len -= rhs.len;
        self.lf -= rhs.lf;
    }
}
