//! Grid weighting policies.
//!
//! A weight is the fraction of the grid's value that should sit in cash when
//! the cursor is at a given step. Cursor 0 is the bottom of the ladder (all
//! in holdings), cursor `count` the top (all in cash).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::utils::decimal::{round_to_i64, safe_div};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridType {
    /// Linear in the cursor
    #[default]
    Normal,
    /// Normal-CDF-like lookup table
    #[serde(alias = "ktable")]
    KTable,
    /// Geometric decay away from the centre
    Geo,
    /// Triangular weighting with slope `arith_delta`
    Arith,
    /// Arith in the middle third, Geo outside
    #[serde(alias = "geoarith")]
    GeoArith,
    /// Each step moves one step's worth of value
    Blind,
}

impl GridType {
    /// Band-free variants never clamp the cursor to `[0, count]`.
    pub fn is_band_free(&self) -> bool {
        matches!(self, GridType::Geo | GridType::GeoArith | GridType::Blind)
    }
}

/// Cumulative normal-like weights in millionths.
const KTABLE: [u32; 201] = [
    0, 5932, 11865, 17799, 23735, 29672, 35609, 41546, 47484, 53421, 59358, 65294, 71230, 77163,
    83096, 89027, 94955, 100882, 106805, 112726, 118644, 124559, 130470, 136377, 142281, 148180,
    154074, 159964, 165849, 171728, 177603, 183471, 189333, 195190, 201040, 206883, 212720,
    218549, 224371, 230186, 235993, 241793, 247584, 253367, 259141, 264907, 270663, 276411,
    282149, 287878, 293598, 299307, 305006, 310696, 316374, 322043, 327700, 333347, 338983,
    344607, 350220, 355822, 361411, 366990, 372556, 378110, 383651, 389181, 394698, 400202,
    405693, 411172, 416637, 422090, 427529, 432954, 438367, 443765, 449150, 454522, 459879,
    465222, 470552, 475867, 481168, 486455, 491727, 496985, 502228, 507457, 512671, 517870,
    523055, 528224, 533379, 538519, 543644, 548754, 553849, 558929, 563994, 569043, 574078,
    579097, 584101, 589090, 594063, 599022, 603965, 608892, 613805, 618702, 623584, 628451,
    633302, 638138, 642959, 647765, 652556, 657331, 662091, 666837, 671567, 676282, 680982,
    685667, 690337, 694992, 699633, 704258, 708869, 713465, 718047, 722614, 727167, 731705,
    736228, 740738, 745233, 749714, 754180, 758633, 763072, 767497, 771908, 776305, 780689,
    785059, 789416, 793759, 798090, 802406, 806710, 811001, 815279, 819544, 823796, 828036,
    832263, 836478, 840681, 844871, 849050, 853216, 857370, 861513, 865644, 869763, 873871,
    877968, 882054, 886128, 890191, 894244, 898286, 902317, 906338, 910348, 914348, 918338,
    922318, 926288, 930249, 934199, 938140, 942072, 945994, 949907, 953812, 957707, 961593,
    965471, 969340, 973201, 977053, 980897, 984734, 988562, 992382, 996195, 1000000,
];

fn ktable(idx: usize) -> Decimal {
    let raw = KTABLE.get(idx).copied().unwrap_or(KTABLE[KTABLE.len() - 1]);
    Decimal::new(raw as i64, 6)
}

/// Target cash weights for one ladder.
#[derive(Debug, Clone, PartialEq)]
pub struct GridWeights {
    pub grid_type: GridType,
    pub count: u32,
    pub geo_ratio: Decimal,
    pub arith_delta: Decimal,
}

impl GridWeights {
    pub fn new(grid_type: GridType, count: u32, geo_ratio: Decimal, arith_delta: Decimal) -> Self {
        Self {
            grid_type,
            count,
            geo_ratio,
            arith_delta,
        }
    }

    fn half(&self) -> Decimal {
        Decimal::from(self.count) * dec!(0.5)
    }

    /// Cash weight at `cursor`. `Blind` has no absolute weight and falls
    /// back to the linear one.
    pub fn weight(&self, cursor: i64) -> Decimal {
        match self.grid_type {
            GridType::Normal | GridType::Blind => self.linear(cursor),
            GridType::KTable => self.ktable_weight(cursor),
            GridType::Geo => self.geo_weight(cursor),
            GridType::Arith => self.arith_weight(cursor),
            GridType::GeoArith => self.geo_arith_weight(cursor),
        }
    }

    /// Cash the grid should hold at `cursor` when worth `total`.
    ///
    /// `Blind` grids move relative to the current cursor and balance.
    pub fn want_balance(
        &self,
        cursor: i64,
        total: Decimal,
        current_cursor: i64,
        current_balance: Decimal,
    ) -> Decimal {
        match self.grid_type {
            GridType::Blind => {
                current_balance
                    + Decimal::from(cursor - current_cursor)
                        * safe_div(total, Decimal::from(self.count))
            }
            _ => total * self.weight(cursor),
        }
    }

    fn linear(&self, cursor: i64) -> Decimal {
        safe_div(Decimal::from(cursor), Decimal::from(self.count))
    }

    fn ktable_weight(&self, cursor: i64) -> Decimal {
        let len = KTABLE.len() as i64;
        let step = round_to_i64(safe_div(Decimal::from(len), self.half())).clamp(1, len - 1);
        let gnow = round_to_i64(Decimal::from(cursor) - self.half());
        let idx = gnow.unsigned_abs().saturating_mul(step as u64);
        let w = ktable(usize::try_from(idx).unwrap_or(usize::MAX));
        if gnow < 0 {
            (Decimal::ONE - w) / dec!(2)
        } else {
            (Decimal::ONE + w) / dec!(2)
        }
    }

    fn geo_weight(&self, cursor: i64) -> Decimal {
        let georatio = self.geo_ratio * self.half();
        if georatio <= Decimal::ONE {
            return self.linear(cursor);
        }

        let decay = (georatio - Decimal::ONE) / georatio;
        let gcur = round_to_i64(Decimal::from(cursor) - self.half());
        let mut geo = dec!(0.5);
        let mut weight = dec!(0.5);
        for _ in 0..gcur.max(0) {
            weight += geo / georatio;
            geo *= decay;
        }
        for _ in gcur.min(0)..0 {
            weight -= geo / georatio;
            geo *= decay;
        }
        weight
    }

    fn arith_weight(&self, cursor: i64) -> Decimal {
        let d = self.arith_delta;
        let high = self.half();
        let sum = (Decimal::ONE + d + (Decimal::ONE + high * d)) * high;
        let g = Decimal::from(cursor) - self.half();
        let tri = dec!(0.5) * (Decimal::ONE + d + (Decimal::ONE + g.abs() * d)) * g;
        safe_div(dec!(0.5) * sum + tri, sum)
    }

    fn geo_arith_weight(&self, cursor: i64) -> Decimal {
        let count = i64::from(self.count);
        if cursor * 6 >= count && cursor * 6 <= 5 * count {
            self.arith_weight(cursor)
        } else {
            self.geo_weight(cursor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(grid_type: GridType, count: u32) -> GridWeights {
        GridWeights::new(grid_type, count, dec!(0.6), dec!(-0.12))
    }

    fn assert_non_decreasing(w: &GridWeights) {
        let mut prev = w.weight(0);
        for c in 1..=i64::from(w.count) {
            let next = w.weight(c);
            assert!(
                next >= prev,
                "{:?} count={} not monotonic at {}: {} < {}",
                w.grid_type,
                w.count,
                c,
                next,
                prev
            );
            prev = next;
        }
    }

    #[test]
    fn test_normal_and_ktable_endpoints() {
        for count in [2, 5, 10, 20, 40] {
            let w = weights(GridType::Normal, count);
            assert_eq!(w.weight(0), Decimal::ZERO);
            assert_eq!(w.weight(i64::from(count)), Decimal::ONE);
        }
        // even counts whose stride lands exactly on the table end
        for count in [2, 10, 20, 40] {
            let w = weights(GridType::KTable, count);
            assert_eq!(w.weight(0), Decimal::ZERO, "count {}", count);
            assert_eq!(w.weight(i64::from(count)), Decimal::ONE, "count {}", count);
        }
    }

    #[test]
    fn test_monotonic_weights() {
        for count in [2, 3, 5, 10, 20, 40] {
            assert_non_decreasing(&weights(GridType::Normal, count));
            assert_non_decreasing(&weights(GridType::KTable, count));
        }
        for count in [6, 10, 14] {
            assert_non_decreasing(&weights(GridType::Arith, count));
        }
        assert_non_decreasing(&weights(GridType::GeoArith, 10));
    }

    #[test]
    fn test_arith_endpoints_and_centre() {
        let w = weights(GridType::Arith, 10);
        assert_eq!(w.weight(0), Decimal::ZERO);
        assert_eq!(w.weight(5), dec!(0.5));
        assert_eq!(w.weight(10), Decimal::ONE);
    }

    #[test]
    fn test_ktable_centre_and_sampling() {
        let w = weights(GridType::KTable, 10);
        assert_eq!(w.weight(5), dec!(0.5));
        // stride round(201 / 5) = 40, one step above centre
        assert_eq!(w.weight(6), (Decimal::ONE + dec!(0.235993)) / dec!(2));
        assert_eq!(w.weight(4), (Decimal::ONE - dec!(0.235993)) / dec!(2));
    }

    #[test]
    fn test_geo_decays_from_centre() {
        let w = weights(GridType::Geo, 10);
        assert_eq!(w.weight(5), dec!(0.5));
        // georatio = 3: first step adds 0.5/3, second adds (0.5*2/3)/3
        let first = w.weight(6) - w.weight(5);
        let second = w.weight(7) - w.weight(6);
        assert!(first > second);
        let symmetric = w.weight(4) + w.weight(6) - Decimal::ONE;
        assert!(symmetric.abs() < dec!(0.000000000001));
    }

    #[test]
    fn test_geo_falls_back_to_linear_for_small_ratio() {
        let w = GridWeights::new(GridType::Geo, 2, dec!(0.6), dec!(-0.12));
        assert_eq!(w.weight(1), dec!(0.5));
        assert_eq!(w.weight(2), Decimal::ONE);
    }

    #[test]
    fn test_want_balance() {
        let normal = weights(GridType::Normal, 10);
        assert_eq!(normal.want_balance(5, dec!(10000), 0, Decimal::ZERO), dec!(5000));

        let blind = weights(GridType::Blind, 10);
        assert_eq!(blind.want_balance(4, dec!(10000), 5, dec!(3000)), dec!(2000));
        assert_eq!(blind.want_balance(6, dec!(10000), 5, dec!(3000)), dec!(4000));
    }

    #[test]
    fn test_band_free_set() {
        assert!(GridType::Geo.is_band_free());
        assert!(GridType::GeoArith.is_band_free());
        assert!(GridType::Blind.is_band_free());
        assert!(!GridType::Normal.is_band_free());
        assert!(!GridType::KTable.is_band_free());
        assert!(!GridType::Arith.is_band_free());
    }
}
