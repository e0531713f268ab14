//! Technical indicator math over plain f64 series
//!
//! Every function reads the tail of its input series, oldest value first,
//! and returns `None` when the series is shorter than the indicator's
//! minimum window. No function looks past the last element it is given.

/// Simple moving average of the last `period` values
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// EMA series seeded with the SMA of the first `period` values.
/// Element `i` of the result lines up with `values[i + period - 1]`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(ema);
    for value in &values[period..] {
        ema = (value - ema) * k + ema;
        out.push(ema);
    }
    out
}

/// Population standard deviation
pub fn population_std(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

/// Wilder's RSI; needs `period + 1` closes
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let p = period as f64;
    let diffs: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (mut avg_gain, mut avg_loss) = diffs[..period]
        .iter()
        .fold((0.0, 0.0), |(gain, loss), d| {
            if *d > 0.0 {
                (gain + d, loss)
            } else {
                (gain, loss - d)
            }
        });
    avg_gain /= p;
    avg_loss /= p;

    for d in &diffs[period..] {
        let (gain, loss) = if *d > 0.0 { (*d, 0.0) } else { (0.0, -d) };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
    }

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// MACD line, signal and histogram; needs `slow + signal - 1` closes
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || fast >= slow || signal == 0 || closes.len() < slow + signal - 1 {
        return None;
    }
    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);
    let offset = slow - fast;

    let line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow_value)| fast_ema[i + offset] - slow_value)
        .collect();
    let signal_line = *ema_series(&line, signal).last()?;
    let last_line = *line.last()?;

    Some(Macd {
        line: last_line,
        signal: signal_line,
        histogram: last_line - signal_line,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

/// SMA(period) ± width × population σ of the same window
pub fn bollinger(closes: &[f64], period: usize, width: f64) -> Option<Bollinger> {
    let middle = sma(closes, period)?;
    let sigma = population_std(&closes[closes.len() - period..])?;
    Some(Bollinger {
        upper: middle + width * sigma,
        middle,
        lower: middle - width * sigma,
    })
}

/// Wilder's average true range; needs `period + 1` bars
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
    let n = closes.len();
    if period == 0 || n < period + 1 || highs.len() != n || lows.len() != n {
        return None;
    }
    let true_ranges: Vec<f64> = (1..n)
        .map(|i| {
            let prev_close = closes[i - 1];
            (highs[i] - lows[i])
                .max((highs[i] - prev_close).abs())
                .max((lows[i] - prev_close).abs())
        })
        .collect();

    let p = period as f64;
    let mut atr = true_ranges[..period].iter().sum::<f64>() / p;
    for tr in &true_ranges[period..] {
        atr = (atr * (p - 1.0) + tr) / p;
    }
    Some(atr)
}

/// Population σ of the last `returns` simple returns; needs `returns + 1` closes
pub fn return_volatility(closes: &[f64], returns: usize) -> Option<f64> {
    if returns == 0 || closes.len() < returns + 1 {
        return None;
    }
    let tail = &closes[closes.len() - returns - 1..];
    let simple: Vec<f64> = tail.windows(2).map(|w| w[1] / w[0] - 1.0).collect();
    population_std(&simple)
}

/// Percent change of the last value against the value `bars_back` earlier.
/// A zero base yields 0.
pub fn percent_change(values: &[f64], bars_back: usize) -> Option<f64> {
    if bars_back == 0 || values.len() < bars_back + 1 {
        return None;
    }
    let current = values[values.len() - 1];
    let base = values[values.len() - 1 - bars_back];
    if base == 0.0 {
        return Some(0.0);
    }
    Some((current - base) / base * 100.0)
}

/// Taker order-flow imbalance in [-1, 1]: (buy - sell) / volume
pub fn order_flow_imbalance(taker_buy_volume: f64, volume: f64) -> Option<f64> {
    if !taker_buy_volume.is_finite() || !volume.is_finite() || volume < 0.0 {
        return None;
    }
    if volume == 0.0 {
        return Some(0.0);
    }
    Some(((2.0 * taker_buy_volume - volume) / volume).clamp(-1.0, 1.0))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Directional {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Wilder's ADX with the +DI/-DI lines; needs `2 * period` bars
pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<Directional> {
    let n = closes.len();
    if period == 0 || n < 2 * period || highs.len() != n || lows.len() != n {
        return None;
    }
    let p = period as f64;

    let mut true_ranges = Vec::with_capacity(n - 1);
    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for i in 1..n {
        let prev_close = closes[i - 1];
        true_ranges.push(
            (highs[i] - lows[i])
                .max((highs[i] - prev_close).abs())
                .max((lows[i] - prev_close).abs()),
        );
        let up = highs[i] - highs[i - 1];
        let down = lows[i - 1] - lows[i];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let ratio = |num: f64, den: f64| if den == 0.0 { 0.0 } else { 100.0 * num / den };

    let mut tr_sum: f64 = true_ranges[..period].iter().sum();
    let mut plus_sum: f64 = plus_dm[..period].iter().sum();
    let mut minus_sum: f64 = minus_dm[..period].iter().sum();

    let mut dx = Vec::with_capacity(n - period);
    let mut plus_di = ratio(plus_sum, tr_sum);
    let mut minus_di = ratio(minus_sum, tr_sum);
    dx.push(ratio((plus_di - minus_di).abs(), plus_di + minus_di));

    for i in period..true_ranges.len() {
        tr_sum = tr_sum - tr_sum / p + true_ranges[i];
        plus_sum = plus_sum - plus_sum / p + plus_dm[i];
        minus_sum = minus_sum - minus_sum / p + minus_dm[i];
        plus_di = ratio(plus_sum, tr_sum);
        minus_di = ratio(minus_sum, tr_sum);
        dx.push(ratio((plus_di - minus_di).abs(), plus_di + minus_di));
    }

    let mut adx = dx[..period].iter().sum::<f64>() / p;
    for value in &dx[period..] {
        adx = (adx * (p - 1.0) + value) / p;
    }

    Some(Directional {
        adx,
        plus_di,
        minus_di,
    })
}

/// ADX signed toward the dominant directional line, in [-100, 100]
pub fn trend_strength(directional: &Directional) -> f64 {
    let total = directional.plus_di + directional.minus_di;
    if total == 0.0 {
        return 0.0;
    }
    directional.adx * (directional.plus_di - directional.minus_di) / total
}

/// Relative gap of EMA(period / 4) over SMA(period), both over the last `period` closes
pub fn ma_spread(closes: &[f64], period: usize) -> Option<f64> {
    let short = period / 4;
    if short == 0 || closes.len() < period {
        return None;
    }
    let tail = &closes[closes.len() - period..];
    let fast = *ema_series(tail, short).last()?;
    let slow = sma(tail, period)?;
    if slow == 0.0 {
        return Some(0.0);
    }
    Some((fast - slow) / slow)
}

/// Strict swing lows and highs over `window` bars on each side, merged into
/// levels no more than `tolerance` (relative) apart. Both lists ascend.
pub fn support_resistance(
    highs: &[f64],
    lows: &[f64],
    window: usize,
    tolerance: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n = lows.len();
    if window == 0 || highs.len() != n || n < 2 * window + 1 {
        return (Vec::new(), Vec::new());
    }

    let mut supports = Vec::new();
    let mut resistances = Vec::new();
    for i in window..n - window {
        let neighbours = || (i - window..=i + window).filter(move |&j| j != i);
        if neighbours().all(|j| lows[j] > lows[i]) {
            supports.push(lows[i]);
        }
        if neighbours().all(|j| highs[j] < highs[i]) {
            resistances.push(highs[i]);
        }
    }
    (cluster_levels(supports, tolerance), cluster_levels(resistances, tolerance))
}

fn cluster_levels(mut levels: Vec<f64>, tolerance: f64) -> Vec<f64> {
    levels.sort_by(f64::total_cmp);
    let mut clustered: Vec<f64> = Vec::new();
    let mut cluster: Vec<f64> = Vec::new();
    for level in levels {
        if let Some(&base) = cluster.first() {
            if base == 0.0 || (level - base) / base > tolerance {
                clustered.push(cluster.iter().sum::<f64>() / cluster.len() as f64);
                cluster.clear();
            }
        }
        cluster.push(level);
    }
    if !cluster.is_empty() {
        clustered.push(cluster.iter().sum::<f64>() / cluster.len() as f64);
    }
    clustered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_sma_and_ema_seed() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&values, 5), Some(3.0));
        assert_eq!(sma(&values, 2), Some(4.5));
        assert_eq!(sma(&values, 6), None);

        let ema = ema_series(&values, 3);
        assert_eq!(ema.len(), 3);
        assert!(approx(ema[0], 2.0));
        // k = 0.5: (4 - 2) * 0.5 + 2 = 3, then (5 - 3) * 0.5 + 3 = 4
        assert!(approx(ema[1], 3.0));
        assert!(approx(ema[2], 4.0));
    }

    #[test]
    fn test_rsi_bounds() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert!(approx(rsi(&falling, 14).unwrap(), 0.0));

        let flat = vec![100.0; 15];
        assert_eq!(rsi(&flat, 14), Some(50.0));

        assert_eq!(rsi(&rising[..14], 14), None, "needs period + 1 closes");
    }

    #[test]
    fn test_rsi_alternating_is_balanced() {
        let closes: Vec<f64> = (0..15)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        // 7 gains and 7 losses of equal size
        assert!(approx(rsi(&closes, 14).unwrap(), 50.0));
    }

    #[test]
    fn test_macd_minimum_window() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        assert!(macd(&closes[..33], 12, 26, 9).is_none());
        let result = macd(&closes[..34], 12, 26, 9).unwrap();
        assert!(approx(result.histogram, result.line - result.signal));
    }

    #[test]
    fn test_macd_flat_series_is_zero() {
        let closes = vec![50.0; 40];
        let result = macd(&closes, 12, 26, 9).unwrap();
        assert!(approx(result.line, 0.0));
        assert!(approx(result.signal, 0.0));
    }

    #[test]
    fn test_bollinger_band_width() {
        let mut closes = vec![10.0; 10];
        closes.extend(vec![12.0; 10]);
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert!(approx(bands.middle, 11.0));
        assert!(approx(bands.upper, 13.0));
        assert!(approx(bands.lower, 9.0));
    }

    #[test]
    fn test_atr_constant_range() {
        let highs = vec![11.0; 16];
        let lows = vec![9.0; 16];
        let closes = vec![10.0; 16];
        assert!(approx(atr(&highs, &lows, &closes, 14).unwrap(), 2.0));
        assert!(atr(&highs[..14], &lows[..14], &closes[..14], 14).is_none());
    }

    #[test]
    fn test_atr_includes_gaps() {
        // Second bar gaps up: TR = |high - prev close| = 15 - 10
        let highs = [10.0, 15.0];
        let lows = [10.0, 14.0];
        let closes = [10.0, 14.5];
        assert!(approx(atr(&highs, &lows, &closes, 1).unwrap(), 5.0));
    }

    #[test]
    fn test_return_volatility() {
        let flat = vec![100.0; 6];
        assert_eq!(return_volatility(&flat, 5), Some(0.0));

        // Returns +10% and -10% alternate: σ = 0.1
        let closes = [100.0, 110.0, 99.0];
        assert!(approx(return_volatility(&closes, 2).unwrap(), 0.1));
        assert!(return_volatility(&closes, 3).is_none());
    }

    #[test]
    fn test_percent_change() {
        let values = [50.0, 80.0, 100.0];
        assert_eq!(percent_change(&values, 2), Some(100.0));
        assert_eq!(percent_change(&values, 1), Some(25.0));
        assert_eq!(percent_change(&values, 3), None);
        assert_eq!(percent_change(&[0.0, 5.0], 1), Some(0.0));
    }

    #[test]
    fn test_order_flow_imbalance() {
        assert_eq!(order_flow_imbalance(75.0, 100.0), Some(0.5));
        assert_eq!(order_flow_imbalance(0.0, 100.0), Some(-1.0));
        assert_eq!(order_flow_imbalance(0.0, 0.0), Some(0.0));
        assert_eq!(order_flow_imbalance(f64::NAN, 1.0), None);
    }

    #[test]
    fn test_adx_steady_uptrend() {
        let highs: Vec<f64> = (0..40).map(|i| 101.0 + i as f64).collect();
        let lows: Vec<f64> = (0..40).map(|i| 99.0 + i as f64).collect();
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let result = adx(&highs, &lows, &closes, 14).unwrap();
        // Every bar is a pure up move: -DM never fires, DX is 100 throughout
        assert!(approx(result.adx, 100.0));
        assert!(approx(result.minus_di, 0.0));
        assert!(result.plus_di > 0.0);
        assert!(approx(trend_strength(&result), 100.0));

        assert!(adx(&highs[..27], &lows[..27], &closes[..27], 14).is_none());
        assert!(adx(&highs[..28], &lows[..28], &closes[..28], 14).is_some());
    }

    #[test]
    fn test_adx_flat_series_is_zero() {
        let flat = vec![100.0; 30];
        let result = adx(&flat, &flat, &flat, 14).unwrap();
        assert_eq!(result.adx, 0.0);
        assert_eq!(trend_strength(&result), 0.0);
    }

    #[test]
    fn test_ma_spread_direction() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert!(ma_spread(&rising, 20).unwrap() > 0.001);
        let falling: Vec<f64> = rising.iter().rev().copied().collect();
        assert!(ma_spread(&falling, 20).unwrap() < -0.001);
        assert_eq!(ma_spread(&[50.0; 20], 20), Some(0.0));
        assert!(ma_spread(&rising[..19], 20).is_none());
    }

    #[test]
    fn test_support_resistance_clusters_swings() {
        // Two dips near 90 and one peak at 110 around a 100 baseline
        let mut lows = vec![99.0; 21];
        let mut highs = vec![101.0; 21];
        lows[5] = 90.0;
        lows[15] = 90.9;
        highs[10] = 110.0;
        let (supports, resistances) = support_resistance(&highs, &lows, 3, 0.02);
        assert_eq!(supports.len(), 1);
        assert!(approx(supports[0], 90.45));
        assert_eq!(resistances, vec![110.0]);

        let (supports, _) = support_resistance(&highs, &lows, 3, 0.005);
        assert_eq!(supports, vec![90.0, 90.9]);
    }

    #[test]
    fn test_support_resistance_ignores_unconfirmed_tail() {
        // A new low on the last bar has no bars after it yet
        let mut lows = vec![99.0; 10];
        let highs = vec![101.0; 10];
        lows[9] = 80.0;
        let (supports, _) = support_resistance(&highs, &lows, 3, 0.02);
        assert!(supports.iter().all(|level| *level > 80.0));
    }
}
