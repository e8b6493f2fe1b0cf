//! Statistical Predictor
//!
//! A fixed-weight softmax classifier over a small feature vector derived
//! from the indicators. The weights are hand-tuned constants; nothing is
//! learned at runtime. Its output only adjusts confidence and reasoning,
//! the rule scorer's direction always wins.

use serde::{Deserialize, Serialize};

use super::indicators::Indicators;
use crate::types::{Prediction, SignalType};

pub const FEATURE_COUNT: usize = 9;

const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "rsi",
    "macd",
    "vwap",
    "ma_cross",
    "direction",
    "band_position",
    "momentum",
    "volume_intensity",
    "support_resistance",
];

/// Class order used by the weight table and probability arrays
const CLASSES: [SignalType; 3] = [SignalType::Buy, SignalType::Sell, SignalType::Hold];

#[rustfmt::skip]
const WEIGHTS: [[f64; FEATURE_COUNT]; 3] = [
    //  rsi   macd  vwap   ma    dir   band   mom   vol    s/r
    [  0.6,  0.8,  0.5,  0.7,  0.6, -0.3,  0.9,  0.2, -0.2], // BUY
    [ -0.6, -0.8, -0.5, -0.7, -0.6,  0.3, -0.9,  0.2,  0.2], // SELL
    [  0.0,  0.0,  0.0,  0.0,  0.0,  0.0,  0.0, -0.4,  0.0], // HOLD
];

const INTERCEPTS: [f64; 3] = [0.0, 0.0, 0.4];

const BOOST_THRESHOLD: f64 = 0.6;
const BOOST_CEILING: f64 = 0.95;

/// Signed, bounded projections of the indicators, each in [-1, 1].
/// Positive values lean bullish except `volume_intensity` (activity) and
/// `support_resistance` (+1 at window high, -1 at window low).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub rsi: f64,
    pub macd: f64,
    pub vwap: f64,
    pub ma_cross: f64,
    pub direction: f64,
    pub band_position: f64,
    pub momentum: f64,
    pub volume_intensity: f64,
    pub support_resistance: f64,
}

impl FeatureVector {
    pub fn from_indicators(ind: &Indicators) -> Self {
        let price = ind.price;

        let rsi = ind.rsi.map(|r| (50.0 - r) / 50.0).unwrap_or(0.0);
        let macd = ind
            .macd
            .filter(|_| price > 0.0)
            .map(|m| (m.histogram / price * 10_000.0).tanh())
            .unwrap_or(0.0);
        let vwap = ind
            .vwap
            .filter(|v| *v > 0.0)
            .map(|v| (price - v) / v * 100.0)
            .unwrap_or(0.0);
        let ma_cross = if ind.long_ma > 0.0 {
            (ind.short_ma - ind.long_ma) / ind.long_ma * 100.0
        } else {
            0.0
        };
        let band_position = ind
            .bollinger
            .filter(|b| b.upper > b.middle)
            .map(|b| (price - b.middle) / (b.upper - b.middle))
            .unwrap_or(0.0);
        let volume_intensity = ind.volume_ratio.map(|r| r - 1.0).unwrap_or(0.0);
        let range = ind.window_high - ind.window_low;
        let support_resistance = if range > 0.0 {
            2.0 * (price - ind.window_low) / range - 1.0
        } else {
            0.0
        };

        Self {
            rsi: bounded(rsi),
            macd: bounded(macd),
            vwap: bounded(vwap),
            ma_cross: bounded(ma_cross),
            direction: bounded(ind.price_direction),
            band_position: bounded(band_position),
            momentum: bounded(ind.momentum_pct / 2.0),
            volume_intensity: bounded(volume_intensity),
            support_resistance: bounded(support_resistance),
        }
    }

    pub fn as_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.rsi,
            self.macd,
            self.vwap,
            self.ma_cross,
            self.direction,
            self.band_position,
            self.momentum,
            self.volume_intensity,
            self.support_resistance,
        ]
    }
}

fn bounded(x: f64) -> f64 {
    if x.is_finite() {
        x.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Fixed-weight softmax classifier over [`FeatureVector`]
#[derive(Debug, Clone)]
pub struct StatisticalPredictor {
    boost: bool,
}

impl Default for StatisticalPredictor {
    fn default() -> Self {
        Self { boost: true }
    }
}

impl StatisticalPredictor {
    pub fn new(boost: bool) -> Self {
        Self { boost }
    }

    /// Class probabilities in BUY, SELL, HOLD order
    pub fn probabilities(&self, features: &FeatureVector) -> [f64; 3] {
        let x = features.as_array();
        let mut scores = [0.0; 3];
        for (class, score) in scores.iter_mut().enumerate() {
            *score = INTERCEPTS[class]
                + WEIGHTS[class].iter().zip(x.iter()).map(|(w, f)| w * f).sum::<f64>();
        }

        let probs = softmax(scores);
        if self.boost {
            boost_dominant(probs)
        } else {
            probs
        }
    }

    pub fn predict(&self, ind: &Indicators) -> Prediction {
        let features = FeatureVector::from_indicators(ind);
        let probs = self.probabilities(&features);

        let (best, probability) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        let predicted_type = CLASSES[best];
        Prediction {
            predicted_type,
            probability,
            explanation: explain(&features, best, probability),
        }
    }
}

fn softmax(scores: [f64; 3]) -> [f64; 3] {
    let max = scores.iter().copied().fold(f64::MIN, f64::max);
    let exps = scores.map(|s| (s - max).exp());
    let sum: f64 = exps.iter().sum();
    exps.map(|e| e / sum)
}

/// Push a dominant probability above the threshold toward the ceiling and
/// shrink the rest to match
fn boost_dominant(probs: [f64; 3]) -> [f64; 3] {
    let (best, p) = probs
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::MIN), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

    if p <= BOOST_THRESHOLD || p >= BOOST_CEILING {
        return probs;
    }

    let boosted = p + (BOOST_CEILING - p) * ((p - BOOST_THRESHOLD) / (1.0 - BOOST_THRESHOLD));
    let shrink = (1.0 - boosted) / (1.0 - p);

    let mut out = probs.map(|q| q * shrink);
    out[best] = boosted;

    let sum: f64 = out.iter().sum();
    out.map(|q| q / sum)
}

fn explain(features: &FeatureVector, class: usize, probability: f64) -> String {
    let x = features.as_array();
    let mut contributions: Vec<(usize, f64)> = x
        .iter()
        .zip(WEIGHTS[class].iter())
        .map(|(f, w)| f * w)
        .enumerate()
        .filter(|(_, c)| c.abs() > 1e-6)
        .collect();
    contributions.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));

    let signal = CLASSES[class];
    let phrases: Vec<String> = contributions
        .iter()
        .take(3)
        .map(|(i, c)| {
            let stance = if *c > 0.0 { "supports" } else { "weighs against" };
            format!("{} ({} {})", feature_phrase(*i, x[*i]), stance, signal)
        })
        .collect();

    let detail = if phrases.is_empty() {
        "no dominant features".to_string()
    } else {
        phrases.join("; ")
    };

    format!("{} {:.0}%: {}", signal, probability * 100.0, detail)
}

fn feature_phrase(index: usize, value: f64) -> &'static str {
    let up = value > 0.0;
    match (FEATURE_NAMES[index], up) {
        ("rsi", true) => "RSI points to oversold conditions",
        ("rsi", false) => "RSI points to overbought conditions",
        ("macd", true) => "MACD momentum is bullish",
        ("macd", false) => "MACD momentum is bearish",
        ("vwap", true) => "price trades above VWAP",
        ("vwap", false) => "price trades below VWAP",
        ("ma_cross", true) => "short average leads the long average",
        ("ma_cross", false) => "short average lags the long average",
        ("direction", true) => "recent ticks are mostly rising",
        ("direction", false) => "recent ticks are mostly falling",
        ("band_position", true) => "price is stretched toward the upper band",
        ("band_position", false) => "price is stretched toward the lower band",
        ("momentum", true) => "momentum is accelerating upward",
        ("momentum", false) => "momentum is accelerating downward",
        ("volume_intensity", true) => "volume is running above baseline",
        ("volume_intensity", false) => "volume is drying up",
        ("support_resistance", true) => "price is pressing resistance",
        _ => "price is sitting on support",
    }
}

/// Fold a prediction into the rule-based confidence and reasoning.
///
/// Agreement adds `round(probability × 10)` capped at 95. A confident
/// disagreement (> 0.7) is noted but leaves the confidence alone.
pub fn blend(rule_type: SignalType, confidence: u8, reasoning: &mut String, prediction: &Prediction) -> u8 {
    if prediction.predicted_type == rule_type {
        let bonus = (prediction.probability * 10.0).round() as u8;
        reasoning.push_str(&format!(
            ". Model agrees ({:.0}% probability)",
            prediction.probability * 100.0
        ));
        confidence.saturating_add(bonus).min(95)
    } else {
        if prediction.probability > 0.7 {
            reasoning.push_str(&format!(
                ". Model disagrees: predicts {} ({:.0}% probability)",
                prediction.predicted_type,
                prediction.probability * 100.0
            ));
        }
        confidence
    }
}
