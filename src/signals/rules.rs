//! Rule-based voting over indicators, plus stop/target placement

use serde::{Deserialize, Serialize};

use super::indicators::Indicators;
use super::window::TradeWindow;
use crate::config::{RiskRewardMode, SignalPolicy};
use crate::types::{Prediction, SignalType};

const RSI_OVERSOLD: f64 = 30.0;
const RSI_OVERBOUGHT: f64 = 70.0;
const MOMENTUM_THRESHOLD_PCT: f64 = 0.2;
const VOLUME_SURGE_RATIO: f64 = 1.2;
const BAND_PROXIMITY: f64 = 0.005;
const SQUEEZE_WIDTH: f64 = 0.03;
const SQUEEZE_BIAS: f64 = 0.6;

const WEIGHT_RSI: u32 = 15;
const WEIGHT_MACD: u32 = 10;
const WEIGHT_VWAP: u32 = 5;
const WEIGHT_MA: u32 = 10;
const WEIGHT_MOMENTUM: u32 = 10;
const WEIGHT_VOLUME: u32 = 8;
const WEIGHT_BAND: u32 = 10;
const WEIGHT_SQUEEZE: u32 = 7;

const BASE_CONFIDENCE: u32 = 50;
const MAX_RULE_CONFIDENCE: u32 = 90;

/// Stop sits this far beyond the recent extreme
const STOP_BUFFER: f64 = 0.002;
const FIXED_LOOKBACK: usize = 20;
const MAX_LOOKBACK: usize = 60;
const HOLD_BAND: f64 = 0.05;
const HOLD_BAND_MIN: f64 = 0.03;
const HOLD_BAND_MAX: f64 = 0.07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Default)]
struct Tally {
    count: usize,
    weight: u32,
    reasons: Vec<String>,
}

impl Tally {
    fn add(&mut self, weight: u32, reason: String) {
        self.count += 1;
        self.weight += weight;
        self.reasons.push(reason);
    }
}

/// Result of one scoring pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleScore {
    pub signal_type: SignalType,
    pub buy_count: usize,
    pub sell_count: usize,
    pub confidence: u8,
    pub reasoning: String,
}

impl RuleScore {
    /// Votes on the chosen side (0 for HOLD)
    pub fn confirmations(&self) -> usize {
        match self.signal_type {
            SignalType::Buy => self.buy_count,
            SignalType::Sell => self.sell_count,
            SignalType::Hold => 0,
        }
    }
}

/// Entry, stop and target for a signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevels {
    pub entry: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub risk_reward: f64,
}

/// Weighted multi-condition voter
#[derive(Debug, Clone)]
pub struct RuleScorer {
    margin_required: usize,
    min_confirmations: usize,
    risk_reward_mode: RiskRewardMode,
}

impl RuleScorer {
    pub fn new(policy: &SignalPolicy) -> Self {
        Self {
            margin_required: policy.margin_required,
            min_confirmations: policy.min_confirmations,
            risk_reward_mode: policy.risk_reward_mode,
        }
    }

    pub fn score(&self, ind: &Indicators) -> RuleScore {
        let mut buy = Tally::default();
        let mut sell = Tally::default();
        let price = ind.price;

        if let Some(rsi) = ind.rsi {
            if rsi < RSI_OVERSOLD {
                buy.add(WEIGHT_RSI, format!("RSI oversold at {:.1}", rsi));
            } else if rsi > RSI_OVERBOUGHT {
                sell.add(WEIGHT_RSI, format!("RSI overbought at {:.1}", rsi));
            }
        }

        if let Some(macd) = ind.macd {
            if macd.histogram > 0.0 && macd.line > 0.0 {
                buy.add(WEIGHT_MACD, format!("MACD bullish crossover ({:.4})", macd.histogram));
            } else if macd.histogram < 0.0 && macd.line < 0.0 {
                sell.add(WEIGHT_MACD, format!("MACD bearish crossover ({:.4})", macd.histogram));
            }
        }

        if let Some(vwap) = ind.vwap {
            if price > vwap {
                buy.add(WEIGHT_VWAP, format!("Price above VWAP ({:.2})", vwap));
            } else if price < vwap {
                sell.add(WEIGHT_VWAP, format!("Price below VWAP ({:.2})", vwap));
            }
        }

        if ind.short_ma > ind.long_ma {
            buy.add(WEIGHT_MA, "Short MA above long MA".to_string());
        } else if ind.short_ma < ind.long_ma {
            sell.add(WEIGHT_MA, "Short MA below long MA".to_string());
        }

        if ind.momentum_pct > MOMENTUM_THRESHOLD_PCT {
            buy.add(WEIGHT_MOMENTUM, format!("Strong upward momentum (+{:.2}%)", ind.momentum_pct));
        } else if ind.momentum_pct < -MOMENTUM_THRESHOLD_PCT {
            sell.add(WEIGHT_MOMENTUM, format!("Strong downward momentum ({:.2}%)", ind.momentum_pct));
        }

        if let Some(ratio) = ind.volume_ratio {
            if ratio > VOLUME_SURGE_RATIO {
                if ind.price_direction > 0.0 {
                    buy.add(WEIGHT_VOLUME, format!("Volume {:.1}x baseline confirms rise", ratio));
                } else if ind.price_direction < 0.0 {
                    sell.add(WEIGHT_VOLUME, format!("Volume {:.1}x baseline confirms drop", ratio));
                }
            }
        }

        if let Some(bb) = ind.bollinger.filter(|b| b.width > 0.0) {
            if price <= bb.lower * (1.0 + BAND_PROXIMITY) && ind.price_direction >= 0.0 {
                buy.add(WEIGHT_BAND, format!("Price holding at lower Bollinger band ({:.2})", bb.lower));
            } else if price >= bb.upper * (1.0 - BAND_PROXIMITY) && ind.price_direction <= 0.0 {
                sell.add(WEIGHT_BAND, format!("Price rejected at upper Bollinger band ({:.2})", bb.upper));
            }

            if bb.width < SQUEEZE_WIDTH {
                if ind.price_direction >= SQUEEZE_BIAS {
                    buy.add(WEIGHT_SQUEEZE, "Bollinger squeeze breaking upward".to_string());
                } else if ind.price_direction <= -SQUEEZE_BIAS {
                    sell.add(WEIGHT_SQUEEZE, "Bollinger squeeze breaking downward".to_string());
                }
            }
        }

        self.decide(buy, sell)
    }

    fn decide(&self, buy: Tally, sell: Tally) -> RuleScore {
        let winner = if self.wins(&buy, &sell) {
            Some(Side::Buy)
        } else if self.wins(&sell, &buy) {
            Some(Side::Sell)
        } else {
            None
        };

        let (signal_type, confidence, reasoning) = match winner {
            Some(Side::Buy) => (
                SignalType::Buy,
                (BASE_CONFIDENCE + buy.weight).min(MAX_RULE_CONFIDENCE),
                format!(
                    "Bullish ({} vs {}): {}",
                    buy.count,
                    sell.count,
                    buy.reasons.join(", ")
                ),
            ),
            Some(Side::Sell) => (
                SignalType::Sell,
                (BASE_CONFIDENCE + sell.weight).min(MAX_RULE_CONFIDENCE),
                format!(
                    "Bearish ({} vs {}): {}",
                    sell.count,
                    buy.count,
                    sell.reasons.join(", ")
                ),
            ),
            None => {
                let mut notes: Vec<String> = buy.reasons.clone();
                notes.extend(sell.reasons.iter().cloned());
                let detail = if notes.is_empty() {
                    "no indicator conditions triggered".to_string()
                } else {
                    notes.join(", ")
                };
                (
                    SignalType::Hold,
                    BASE_CONFIDENCE,
                    format!(
                        "No clear direction ({} bullish vs {} bearish): {}",
                        buy.count, sell.count, detail
                    ),
                )
            }
        };

        RuleScore {
            signal_type,
            buy_count: buy.count,
            sell_count: sell.count,
            confidence: confidence as u8,
            reasoning,
        }
    }

    fn wins(&self, side: &Tally, other: &Tally) -> bool {
        side.count >= self.min_confirmations && side.count >= other.count + self.margin_required
    }

    /// Stop and target around the current price.
    ///
    /// BUY stops below the recent low and SELL above the recent high, each
    /// with a small buffer; the target sits `risk × multiple` away on the other
    /// side. HOLD brackets the entry symmetrically.
    pub fn price_levels(
        &self,
        window: &TradeWindow,
        ind: &Indicators,
        score: &RuleScore,
        prediction: Option<&Prediction>,
    ) -> PriceLevels {
        let entry = ind.price;
        let width = ind.bollinger.map(|b| b.width);

        match score.signal_type {
            SignalType::Hold => {
                let band = self.hold_band(prediction);
                PriceLevels {
                    entry,
                    stop_loss: entry * (1.0 - band),
                    target: entry * (1.0 + band),
                    risk_reward: 1.0,
                }
            }
            SignalType::Buy | SignalType::Sell => {
                let lookback = self.lookback(width);
                let (low, high) = window.recent_range(lookback).unwrap_or((entry, entry));
                let rr = self.risk_reward(score, width, prediction);

                if score.signal_type == SignalType::Buy {
                    let stop_loss = low.min(entry) * (1.0 - STOP_BUFFER);
                    let target = entry + (entry - stop_loss) * rr;
                    PriceLevels { entry, stop_loss, target, risk_reward: rr }
                } else {
                    let stop_loss = high.max(entry) * (1.0 + STOP_BUFFER);
                    let target = (entry - (stop_loss - entry) * rr).max(entry * 0.01);
                    PriceLevels { entry, stop_loss, target, risk_reward: rr }
                }
            }
        }
    }

    /// Trades scanned for the stop extreme; widens with volatility in adaptive mode
    fn lookback(&self, width: Option<f64>) -> usize {
        match (self.risk_reward_mode, width) {
            (RiskRewardMode::Adaptive { .. }, Some(width)) => {
                let scaled = (FIXED_LOOKBACK as f64 * (1.0 + width * 25.0)).round() as usize;
                scaled.clamp(FIXED_LOOKBACK, MAX_LOOKBACK)
            }
            _ => FIXED_LOOKBACK,
        }
    }

    fn risk_reward(&self, score: &RuleScore, width: Option<f64>, prediction: Option<&Prediction>) -> f64 {
        let (min, max) = match self.risk_reward_mode {
            RiskRewardMode::Fixed { multiple } => return multiple,
            RiskRewardMode::Adaptive { min, max } => (min, max),
        };

        let mut rr = 2.0;

        // Each confirmation past the minimum adds a quarter, up to +1
        let extra = score.confirmations().saturating_sub(self.min_confirmations) as f64;
        rr += (extra * 0.25).min(1.0);

        if let Some(p) = prediction {
            if p.predicted_type == score.signal_type {
                rr += ((p.probability - 0.5) * 2.0).clamp(0.0, 1.0);
            } else if p.probability > 0.7 {
                rr -= 0.5;
            }
        }

        match width {
            Some(w) if w > 0.05 => rr -= 0.5,
            Some(w) if w < 0.015 => rr += 0.5,
            _ => {}
        }

        rr.clamp(min, max)
    }

    fn hold_band(&self, prediction: Option<&Prediction>) -> f64 {
        match (self.risk_reward_mode, prediction) {
            (RiskRewardMode::Adaptive { .. }, Some(p)) if p.predicted_type == SignalType::Hold => {
                (HOLD_BAND_MAX - 0.04 * p.probability).clamp(HOLD_BAND_MIN, HOLD_BAND_MAX)
            }
            _ => HOLD_BAND,
        }
    }
}
