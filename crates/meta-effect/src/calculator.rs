//! Effect-size calculator: raw inputs to canonical records

use crate::conversions::{self, GEstimate};
use crate::input::{RawInput, RawRecord};
use crate::types::HedgesG;
use meta_core::math::distributions::z_critical;
use meta_core::{
    AnalysisConfig, ConfidenceInterval, EffectSizeBatch, EffectSizeRecord, Error, Result,
};
use tracing::{debug, instrument, warn};

/// A raw record that could not be converted
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub study_id: String,
    pub effect_size_id: String,
    pub error: Error,
}

/// Output of converting an ordered batch of raw rows
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalBatch {
    /// Converted records, in input order
    pub records: Vec<EffectSizeRecord>,
    /// Rows that failed conversion, in input order
    pub rejections: Vec<Rejection>,
}

impl CanonicalBatch {
    /// Hand the converted records to the model layer
    pub fn into_batch(self) -> EffectSizeBatch {
        EffectSizeBatch::new(self.records)
    }
}

/// Converts reported statistics to Hedges' g at a fixed confidence level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectSizeCalculator {
    confidence_level: f64,
    z: f64,
}

impl EffectSizeCalculator {
    /// Create a calculator for the configured confidence level
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        Self::with_confidence_level(config.confidence_level)
    }

    pub fn with_confidence_level(confidence_level: f64) -> Result<Self> {
        if !(confidence_level > 0.0 && confidence_level < 1.0) {
            return Err(Error::Configuration(format!(
                "confidence level {confidence_level} must be in (0, 1)"
            )));
        }
        Ok(Self {
            confidence_level,
            z: z_critical(confidence_level)?,
        })
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence_level
    }

    /// Convert one raw input
    pub fn compute(&self, input: &RawInput) -> Result<HedgesG> {
        let GEstimate { g, variance } = match *input {
            RawInput::MeansSds {
                mean1,
                sd1,
                n1,
                mean2,
                sd2,
                n2,
            } => conversions::from_means(mean1, sd1, f64::from(n1), mean2, sd2, f64::from(n2))?,
            RawInput::TStatistic { t, n1, n2 } => {
                conversions::from_t(t, f64::from(n1), f64::from(n2))?
            }
            RawInput::FStatistic {
                f,
                df_numerator,
                n1,
                n2,
                direction,
            } => conversions::from_f(f, df_numerator, f64::from(n1), f64::from(n2), direction)?,
            RawInput::Correlation { r, n } => conversions::from_correlation(r, f64::from(n))?,
            RawInput::ChiSquare {
                chi2,
                df,
                n,
                direction,
            } => conversions::from_chi_square(chi2, df, f64::from(n), direction)?,
            RawInput::OddsRatio { odds_ratio, n1, n2 } => {
                conversions::from_odds_ratio(odds_ratio, f64::from(n1), f64::from(n2))?
            }
            RawInput::ReportedG { g, se, .. } => {
                conversions::from_reported_g(g, se, input.arm_sizes())?
            }
            RawInput::ReportedD { d, n1, n2 } => {
                conversions::from_d(d, f64::from(n1), f64::from(n2))?
            }
            RawInput::PrePost {
                mean_pre,
                sd_pre,
                mean_post,
                sd_post,
                n,
                r,
            } => conversions::from_pre_post(mean_pre, sd_pre, mean_post, sd_post, f64::from(n), r)?,
        };

        if !(g.is_finite() && variance.is_finite() && variance > 0.0) {
            return Err(Error::Computation(format!(
                "conversion produced g = {g}, variance = {variance}"
            )));
        }

        let se = variance.sqrt();
        Ok(HedgesG {
            g,
            variance,
            se,
            ci: ConfidenceInterval::symmetric(g, se, self.z, self.confidence_level),
            source_kind: input.source_kind(),
        })
    }

    /// Convert one raw row into a canonical record
    pub fn canonicalize(&self, raw: &RawRecord) -> Result<EffectSizeRecord> {
        let converted = self.compute(&raw.input)?;
        Ok(EffectSizeRecord {
            study_id: raw.study_id.clone(),
            effect_size_id: raw.effect_size_id.clone(),
            source_kind: converted.source_kind,
            g: converted.g,
            variance_g: converted.variance,
            se_g: converted.se,
            ci_lower: converted.ci.lower,
            ci_upper: converted.ci.upper,
            moderators: raw.moderators.clone(),
        })
    }

    /// Convert an ordered batch, dropping and reporting rows that fail
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub fn canonicalize_batch(&self, rows: &[RawRecord]) -> CanonicalBatch {
        let (records, rejections): (Vec<_>, Vec<_>) = rows
            .iter()
            .map(|raw| {
                self.canonicalize(raw).map_err(|error| {
                    warn!(
                        study = %raw.study_id,
                        effect_size = %raw.effect_size_id,
                        "rejecting raw record: {error}"
                    );
                    Rejection {
                        study_id: raw.study_id.clone(),
                        effect_size_id: raw.effect_size_id.clone(),
                        error,
                    }
                })
            })
            .partition(|r| r.is_ok());

        let records: Vec<EffectSizeRecord> = records.into_iter().filter_map(|r| r.ok()).collect();
        let rejections: Vec<Rejection> = rejections.into_iter().filter_map(|r| r.err()).collect();
        debug!(
            converted = records.len(),
            rejected = rejections.len(),
            "canonicalised raw batch"
        );

        CanonicalBatch {
            records,
            rejections,
        }
    }
}
