//! Raw study statistics as extracted from primary reports

use meta_core::{ModeratorValue, SourceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which group an unsigned statistic (F, χ²) favours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Treatment outperforms control; positive g
    #[default]
    FavorsTreatment,
    /// Control outperforms treatment; negative g
    FavorsControl,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Self::FavorsTreatment => 1.0,
            Self::FavorsControl => -1.0,
        }
    }
}

/// One reported statistic, tagged by how it was reported
///
/// Group 1 is the treatment arm, group 2 the control arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawInput {
    MeansSds {
        mean1: f64,
        sd1: f64,
        n1: u32,
        mean2: f64,
        sd2: f64,
        n2: u32,
    },
    TStatistic {
        t: f64,
        n1: u32,
        n2: u32,
    },
    /// Only one-numerator-df F statistics are convertible
    FStatistic {
        f: f64,
        df_numerator: u32,
        n1: u32,
        n2: u32,
        direction: Direction,
    },
    /// Point-biserial correlation with total sample size
    Correlation {
        r: f64,
        n: u32,
    },
    /// 2x2 χ² (one df) with total sample size
    ChiSquare {
        chi2: f64,
        df: u32,
        n: u32,
        direction: Direction,
    },
    OddsRatio {
        odds_ratio: f64,
        n1: u32,
        n2: u32,
    },
    /// Author-reported Hedges' g; variance from `se` or else from the arm sizes
    ReportedG {
        g: f64,
        se: Option<f64>,
        n1: Option<u32>,
        n2: Option<u32>,
    },
    /// Author-reported Cohen's d
    ReportedD {
        d: f64,
        n1: u32,
        n2: u32,
    },
    /// Single-group pre/post design with assumed pre/post correlation
    PrePost {
        mean_pre: f64,
        sd_pre: f64,
        mean_post: f64,
        sd_post: f64,
        n: u32,
        r: f64,
    },
}

impl RawInput {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::MeansSds { .. } => SourceKind::MeansSds,
            Self::TStatistic { .. } => SourceKind::TStatistic,
            Self::FStatistic { .. } => SourceKind::FStatistic,
            Self::Correlation { .. } => SourceKind::Correlation,
            Self::ChiSquare { .. } => SourceKind::ChiSquare,
            Self::OddsRatio { .. } => SourceKind::OddsRatio,
            Self::ReportedG { .. } => SourceKind::ReportedG,
            Self::ReportedD { .. } => SourceKind::ReportedD,
            Self::PrePost { .. } => SourceKind::PrePost,
        }
    }

    /// Arm sizes when the input carries them; `n / 2` each for total-n inputs
    pub fn arm_sizes(&self) -> Option<(f64, f64)> {
        match *self {
            Self::MeansSds { n1, n2, .. }
            | Self::TStatistic { n1, n2, .. }
            | Self::FStatistic { n1, n2, .. }
            | Self::OddsRatio { n1, n2, .. }
            | Self::ReportedD { n1, n2, .. } => Some((f64::from(n1), f64::from(n2))),
            Self::ReportedG {
                n1: Some(n1),
                n2: Some(n2),
                ..
            } => Some((f64::from(n1), f64::from(n2))),
            Self::ReportedG { .. } => None,
            Self::Correlation { n, .. } | Self::ChiSquare { n, .. } => {
                let half = f64::from(n) / 2.0;
                Some((half, half))
            }
            Self::PrePost { n, .. } => Some((f64::from(n), f64::from(n))),
        }
    }

    /// Raw group means, when reported
    pub fn means(&self) -> Option<(f64, f64)> {
        match *self {
            Self::MeansSds { mean1, mean2, .. } => Some((mean1, mean2)),
            Self::PrePost {
                mean_pre,
                mean_post,
                ..
            } => Some((mean_post, mean_pre)),
            _ => None,
        }
    }
}

/// One extracted comparison before conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub study_id: String,
    pub effect_size_id: String,
    pub input: RawInput,
    /// Two-sided p-value as reported by the authors
    pub reported_p: Option<f64>,
    pub moderators: BTreeMap<String, ModeratorValue>,
}

impl RawRecord {
    pub fn new(
        study_id: impl Into<String>,
        effect_size_id: impl Into<String>,
        input: RawInput,
    ) -> Self {
        Self {
            study_id: study_id.into(),
            effect_size_id: effect_size_id.into(),
            input,
            reported_p: None,
            moderators: BTreeMap::new(),
        }
    }

    pub fn with_reported_p(mut self, p: f64) -> Self {
        self.reported_p = Some(p);
        self
    }

    pub fn with_moderator(mut self, name: impl Into<String>, value: ModeratorValue) -> Self {
        self.moderators.insert(name.into(), value);
        self
    }
}
