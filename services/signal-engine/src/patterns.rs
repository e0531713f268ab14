//! Candlestick and chart pattern recognition
//!
//! The last candle is the current bar. Chart patterns only count swing
//! points that already have two confirming candles on each side.

use market_data::PricePattern;

const DOJI_BODY_RATIO: f64 = 0.1;
const SWING_SPAN: usize = 2;
const MIN_SWING_DISTANCE: usize = 5;
const DOUBLE_WINDOW: usize = 20;
const DOUBLE_SIMILARITY: f64 = 0.02;
const DOUBLE_RETRACE: f64 = 0.03;
const SHOULDERS_WINDOW: usize = 30;
const SHOULDER_SIMILARITY: f64 = 0.03;
const HEAD_PROMINENCE: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    fn bullish(&self) -> bool {
        self.close > self.open
    }

    fn bearish(&self) -> bool {
        self.close < self.open
    }

    fn doji(&self) -> bool {
        let range = self.high - self.low;
        if range <= 0.0 {
            return true;
        }
        (self.close - self.open).abs() / range < DOJI_BODY_RATIO
    }
}

/// Patterns completed by the last candle of `candles`
pub fn detect(candles: &[Candle]) -> Vec<PricePattern> {
    let mut found = Vec::new();
    let n = candles.len();
    let Some(current) = candles.last() else {
        return found;
    };

    if n >= 2 {
        let prev = &candles[n - 2];
        if prev.bearish()
            && current.bullish()
            && current.open < prev.close
            && current.close > prev.open
        {
            found.push(PricePattern::BullishEngulfing);
        }
        if prev.bullish()
            && current.bearish()
            && current.open > prev.close
            && current.close < prev.open
        {
            found.push(PricePattern::BearishEngulfing);
        }
    }

    if current.doji() {
        found.push(PricePattern::Doji);
    }

    if n >= 3 {
        let first = &candles[n - 3];
        let star = &candles[n - 2];
        if star.doji() {
            if first.bearish() && current.bullish() {
                found.push(PricePattern::MorningStar);
            }
            if first.bullish() && current.bearish() {
                found.push(PricePattern::EveningStar);
            }
        }
    }

    if n >= DOUBLE_WINDOW {
        let window = &candles[n - DOUBLE_WINDOW..];
        let (highs, lows) = split(window);
        if double_top(&highs, &lows) {
            found.push(PricePattern::DoubleTop);
        }
        if double_bottom(&highs, &lows) {
            found.push(PricePattern::DoubleBottom);
        }
    }

    if n >= SHOULDERS_WINDOW {
        let window = &candles[n - SHOULDERS_WINDOW..];
        let (highs, lows) = split(window);
        if head_and_shoulders(&highs, &lows) {
            found.push(PricePattern::HeadAndShoulders);
        }
        if inverse_head_and_shoulders(&highs, &lows) {
            found.push(PricePattern::InverseHeadAndShoulders);
        }
    }

    found
}

fn split(candles: &[Candle]) -> (Vec<f64>, Vec<f64>) {
    candles.iter().map(|c| (c.high, c.low)).unzip()
}

/// Strict local extremes: `peaks` selects maxima, otherwise minima
fn swings(values: &[f64], peaks: bool) -> Vec<(usize, f64)> {
    if values.len() < 2 * SWING_SPAN + 1 {
        return Vec::new();
    }
    (SWING_SPAN..values.len() - SWING_SPAN)
        .filter(|&i| {
            (i - SWING_SPAN..=i + SWING_SPAN)
                .filter(|&j| j != i)
                .all(|j| if peaks { values[j] < values[i] } else { values[j] > values[i] })
        })
        .map(|i| (i, values[i]))
        .collect()
}

fn lowest(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn highest(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn relative_gap(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        return f64::INFINITY;
    }
    (a - b).abs() / a.abs()
}

fn double_top(highs: &[f64], lows: &[f64]) -> bool {
    let peaks = swings(highs, true);
    peaks.iter().enumerate().any(|(a, &(i1, p1))| {
        peaks[a + 1..].iter().any(|&(i2, p2)| {
            if i2 - i1 < MIN_SWING_DISTANCE || relative_gap(p1, p2) > DOUBLE_SIMILARITY {
                return false;
            }
            let avg = (p1 + p2) / 2.0;
            (avg - lowest(&lows[i1 + 1..i2])) / avg >= DOUBLE_RETRACE
        })
    })
}

fn double_bottom(highs: &[f64], lows: &[f64]) -> bool {
    let troughs = swings(lows, false);
    troughs.iter().enumerate().any(|(a, &(i1, t1))| {
        troughs[a + 1..].iter().any(|&(i2, t2)| {
            if i2 - i1 < MIN_SWING_DISTANCE || relative_gap(t1, t2) > DOUBLE_SIMILARITY {
                return false;
            }
            let avg = (t1 + t2) / 2.0;
            avg > 0.0 && (highest(&highs[i1 + 1..i2]) - avg) / avg >= DOUBLE_RETRACE
        })
    })
}

fn head_and_shoulders(highs: &[f64], lows: &[f64]) -> bool {
    let peaks = swings(highs, true);
    let found = triples(&peaks).any(|[(l, left), (h, head), (r, right)]| {
        if relative_gap(left, right) > SHOULDER_SIMILARITY {
            return false;
        }
        let shoulders = (left + right) / 2.0;
        if shoulders <= 0.0 || (head - shoulders) / shoulders < HEAD_PROMINENCE {
            return false;
        }
        relative_gap(lowest(&lows[l + 1..h]), lowest(&lows[h + 1..r])) <= SHOULDER_SIMILARITY
    });
    found
}

fn inverse_head_and_shoulders(highs: &[f64], lows: &[f64]) -> bool {
    let troughs = swings(lows, false);
    let found = triples(&troughs).any(|[(l, left), (h, head), (r, right)]| {
        if relative_gap(left, right) > SHOULDER_SIMILARITY {
            return false;
        }
        let shoulders = (left + right) / 2.0;
        if shoulders <= 0.0 || (shoulders - head) / shoulders < HEAD_PROMINENCE {
            return false;
        }
        relative_gap(highest(&highs[l + 1..h]), highest(&highs[h + 1..r])) <= SHOULDER_SIMILARITY
    });
    found
}

/// Ordered swing triples spaced at least `MIN_SWING_DISTANCE` apart
fn triples(points: &[(usize, f64)]) -> impl Iterator<Item = [(usize, f64); 3]> + '_ {
    (0..points.len()).flat_map(move |i| {
        (i + 1..points.len()).flat_map(move |j| {
            (j + 1..points.len()).filter_map(move |k| {
                let (a, b, c) = (points[i], points[j], points[k]);
                (b.0 - a.0 >= MIN_SWING_DISTANCE && c.0 - b.0 >= MIN_SWING_DISTANCE)
                    .then_some([a, b, c])
            })
        })
    })
}
