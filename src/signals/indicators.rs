//! Indicator Engine
//!
//! Computes rolling technical indicators from a [`TradeWindow`]:
//! - SMA / EMA (short and long)
//! - RSI(14)
//! - MACD(12, 26) with an approximated signal line
//! - Bollinger Bands(20, 2σ)
//! - VWAP over the whole window
//! - Price direction over the last 5 transitions, momentum and volume trend
//!
//! Nothing is computed until the window holds [`MIN_TRADES`] trades. An
//! indicator that needs more history than is available is `None`, never 0.

use serde::{Deserialize, Serialize};

use super::window::TradeWindow;

/// Trades required before any indicator is produced
pub const MIN_TRADES: usize = 20;

const RSI_PERIOD: usize = 14;
const SHORT_MA_PERIOD: usize = 5;
const LONG_MA_PERIOD: usize = 20;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_STD_DEV: f64 = 2.0;
const DIRECTION_PAIRS: usize = 5;
const MOMENTUM_PERIOD: usize = 10;
const VOLUME_RECENT: usize = 5;
const VOLUME_BASELINE: usize = 15;

/// The signal line is 0.9 × the MACD line rather than a 9-period EMA of it.
/// This keeps the histogram's sign equal to the line's sign.
pub const MACD_SIGNAL_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle
    pub width: f64,
}

/// Snapshot of all indicators for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    /// Most recent price
    pub price: f64,
    pub rsi: Option<f64>,
    pub macd: Option<Macd>,
    pub vwap: Option<f64>,
    pub short_ma: f64,
    pub long_ma: f64,
    /// (rising - falling transitions) / 5, in [-1, 1]
    pub price_direction: f64,
    pub bollinger: Option<Bollinger>,
    /// Percent change over the last 10 trades
    pub momentum_pct: f64,
    /// Average volume of the 5 latest trades over the 15 before them
    pub volume_ratio: Option<f64>,
    /// Lowest and highest price in the window
    pub window_low: f64,
    pub window_high: f64,
    pub trade_count: usize,
}

/// Compute indicators, or None while the window is below [`MIN_TRADES`]
pub fn compute(window: &TradeWindow) -> Option<Indicators> {
    if window.len() < MIN_TRADES {
        return None;
    }

    let prices = window.prices_chronological();
    let volumes: Vec<f64> = window.volumes().iter().rev().copied().collect();
    let price = *prices.last()?;

    let (window_low, window_high) = window.recent_range(window.len())?;

    Some(Indicators {
        price,
        rsi: rsi(&prices, RSI_PERIOD),
        macd: macd(&prices),
        vwap: vwap(&prices, &volumes),
        short_ma: sma(&prices, SHORT_MA_PERIOD)?,
        long_ma: sma(&prices, LONG_MA_PERIOD)?,
        price_direction: price_direction(&prices, DIRECTION_PAIRS)?,
        bollinger: bollinger(&prices, BOLLINGER_PERIOD, BOLLINGER_STD_DEV),
        momentum_pct: momentum(&prices, MOMENTUM_PERIOD)?,
        volume_ratio: volume_ratio(&volumes),
        window_low,
        window_high,
        trade_count: prices.len(),
    })
}

/// Mean of the `period` most recent prices (input oldest → newest)
pub fn sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// EMA seeded with the SMA of the last `period` prices, then walked
/// oldest → newest over that same window
pub fn ema(prices: &[f64], period: usize) -> Option<f64> {
    let seed = sma(prices, period)?;
    let multiplier = 2.0 / (period as f64 + 1.0);
    let window = &prices[prices.len() - period..];

    Some(window.iter().fold(seed, |ema, p| (p - ema) * multiplier + ema))
}

/// RSI over `period` successive deltas
pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let window = &prices[prices.len() - period - 1..];
    let (gains, losses) = window.windows(2).fold((0.0, 0.0), |(g, l), pair| {
        let delta = pair[1] - pair[0];
        if delta > 0.0 {
            (g + delta, l)
        } else {
            (g, l - delta)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;
    let rs = if avg_loss == 0.0 { 100.0 } else { avg_gain / avg_loss };

    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD(12, 26) with the approximated signal line
pub fn macd(prices: &[f64]) -> Option<Macd> {
    let line = ema(prices, MACD_FAST)? - ema(prices, MACD_SLOW)?;
    let signal = line * MACD_SIGNAL_FACTOR;
    Some(Macd {
        line,
        signal,
        histogram: line - signal,
    })
}

/// Bollinger Bands using the population standard deviation
pub fn bollinger(prices: &[f64], period: usize, std_devs: f64) -> Option<Bollinger> {
    let middle = sma(prices, period)?;
    let window = &prices[prices.len() - period..];
    let variance = window.iter().map(|p| (p - middle).powi(2)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();

    let upper = middle + std_devs * sigma;
    let lower = middle - std_devs * sigma;
    let width = if middle != 0.0 { (upper - lower) / middle } else { 0.0 };

    Some(Bollinger {
        upper,
        middle,
        lower,
        width,
    })
}

/// Volume weighted price over all provided trades
pub fn vwap(prices: &[f64], volumes: &[f64]) -> Option<f64> {
    let (pv, v) = prices
        .iter()
        .zip(volumes)
        .fold((0.0, 0.0), |(pv, v), (p, q)| (pv + p * q, v + q));

    if v > 0.0 {
        Some(pv / v)
    } else {
        None
    }
}

/// Net share of rising transitions among the last `pairs` price pairs
pub fn price_direction(prices: &[f64], pairs: usize) -> Option<f64> {
    if pairs == 0 || prices.len() < pairs + 1 {
        return None;
    }
    let window = &prices[prices.len() - pairs - 1..];
    let net: i32 = window
        .windows(2)
        .map(|pair| {
            if pair[1] > pair[0] {
                1
            } else if pair[1] < pair[0] {
                -1
            } else {
                0
            }
        })
        .sum();

    Some(net as f64 / pairs as f64)
}

/// Percent change between the price `period` trades ago and now
pub fn momentum(prices: &[f64], period: usize) -> Option<f64> {
    if prices.len() < period + 1 {
        return None;
    }
    let past = prices[prices.len() - period - 1];
    let now = *prices.last()?;
    if past == 0.0 {
        return None;
    }
    Some((now - past) / past * 100.0)
}

fn volume_ratio(volumes: &[f64]) -> Option<f64> {
    if volumes.len() < VOLUME_RECENT + VOLUME_BASELINE {
        return None;
    }
    let recent = sma(volumes, VOLUME_RECENT)?;
    let baseline_end = volumes.len() - VOLUME_RECENT;
    let baseline = sma(&volumes[..baseline_end], VOLUME_BASELINE)?;

    if baseline > 0.0 {
        Some(recent / baseline)
    } else {
        None
    }
}
