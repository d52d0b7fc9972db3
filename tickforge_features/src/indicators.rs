//! Indicator kernels.
//!
//! Every kernel is a pure function over `f64` slices. The output always
//! has the same length as the input; bars inside an indicator's warm-up
//! window, and bars where a divisor is zero or undefined, carry
//! `f64::NAN`. NaN is the only "no value" representation at this layer;
//! the sanitizer turns it into SQL NULL on the way to the store.
//! ±infinity must never escape a kernel.

/// NaN-safe division. Any zero, subnormal-zero, or non-finite divisor
/// yields the sentinel instead of ±inf.
pub(crate) fn safe_div(num: f64, den: f64) -> f64 {
    if !num.is_finite() || !den.is_finite() || den.abs() < f64::EPSILON {
        return f64::NAN;
    }
    let quotient = num / den;
    if quotient.is_finite() {
        quotient
    } else {
        f64::NAN
    }
}

fn nan_vec(len: usize) -> Vec<f64> {
    vec![f64::NAN; len]
}

/// Simple moving average. A window containing any non-finite value
/// produces NaN for that bar.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = nan_vec(n);
    if period == 0 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        if window.iter().all(|v| v.is_finite()) {
            out[i] = window.iter().sum::<f64>() / period as f64;
        }
    }
    out
}

/// Exponential moving average seeded with the SMA of the first full
/// window, alpha = 2/(period+1).
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = nan_vec(n);
    if period == 0 || n < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = prev;
    for i in period..n {
        prev = alpha * values[i] + (1.0 - alpha) * prev;
        out[i] = prev;
    }
    out
}

/// EMA of a series with a NaN warm-up prefix: the recursion starts at
/// the first finite value. Used for signal lines and multi-pass EMAs.
pub(crate) fn ema_over_tail(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    match values.iter().position(|v| v.is_finite()) {
        Some(start) if n - start >= period => {
            let mut out = nan_vec(n);
            let tail = ema(&values[start..], period);
            out[start..].copy_from_slice(&tail);
            out
        }
        _ => nan_vec(n),
    }
}

/// Wilder smoothing, alpha = 1/period, seeded with the mean of the
/// first full window after the leading NaN prefix. A NaN after the seed
/// carries the previous smoothed value forward.
pub fn rma(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = nan_vec(n);
    if period == 0 {
        return out;
    }
    let start = match values.iter().position(|v| v.is_finite()) {
        Some(s) if n - s >= period => s,
        _ => return out,
    };
    let seed_end = start + period;
    if values[start..seed_end].iter().any(|v| !v.is_finite()) {
        return out;
    }
    let alpha = 1.0 / period as f64;
    let mut prev = values[start..seed_end].iter().sum::<f64>() / period as f64;
    out[seed_end - 1] = prev;
    for i in seed_end..n {
        if values[i].is_finite() {
            prev = alpha * values[i] + (1.0 - alpha) * prev;
        }
        out[i] = prev;
    }
    out
}

/// Sample standard deviation over a rolling window, (n-1) denominator.
pub fn rolling_std(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = nan_vec(n);
    if period < 2 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        let window = &values[i + 1 - period..=i];
        if window.iter().any(|v| !v.is_finite()) {
            continue;
        }
        let mean = window.iter().sum::<f64>() / period as f64;
        let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (period as f64 - 1.0);
        out[i] = var.sqrt();
    }
    out
}

/// Rolling z-score; a flat window (zero stddev) yields NaN.
pub fn rolling_zscore(values: &[f64], period: usize) -> Vec<f64> {
    let mean = sma(values, period);
    let std = rolling_std(values, period);
    values
        .iter()
        .zip(mean.iter().zip(std.iter()))
        .map(|(v, (m, s))| safe_div(v - m, *s))
        .collect()
}

/// Difference against the value `period` bars back.
pub fn delta(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = nan_vec(n);
    for i in period..n {
        if values[i].is_finite() && values[i - period].is_finite() {
            out[i] = values[i] - values[i - period];
        }
    }
    out
}

/// Per-bar slope over `period` bars: delta / period.
pub fn slope(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 {
        return nan_vec(values.len());
    }
    delta(values, period)
        .into_iter()
        .map(|d| d / period as f64)
        .collect()
}

/// Rate of change in percent against `period` bars back.
pub fn roc(values: &[f64], period: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = nan_vec(n);
    for i in period..n {
        out[i] = safe_div((values[i] - values[i - period]) * 100.0, values[i - period]);
    }
    out
}

/// Relative Strength Index over Wilder-smoothed gains and losses.
/// A zero average loss pins RSI at 100.
pub fn rsi(close: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    if n < 2 {
        return out;
    }
    let mut gains = nan_vec(n);
    let mut losses = nan_vec(n);
    for i in 1..n {
        let diff = close[i] - close[i - 1];
        gains[i] = diff.max(0.0);
        losses[i] = (-diff).max(0.0);
    }
    let avg_gain = rma(&gains, period);
    let avg_loss = rma(&losses, period);
    for i in 0..n {
        let (g, l) = (avg_gain[i], avg_loss[i]);
        if !g.is_finite() || !l.is_finite() {
            continue;
        }
        out[i] = if l == 0.0 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + g / l)
        };
    }
    out
}

/// MACD line, signal line, histogram.
pub fn macd(close: &[f64], fast: usize, slow: usize, signal: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast_ema = ema(close, fast);
    let slow_ema = ema(close, slow);
    let line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| if f.is_finite() && s.is_finite() { f - s } else { f64::NAN })
        .collect();
    let signal_line = ema_over_tail(&line, signal);
    let hist: Vec<f64> = line
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| if m.is_finite() && s.is_finite() { m - s } else { f64::NAN })
        .collect();
    (line, signal_line, hist)
}

/// Stochastic oscillator %K (raw, clamped to [0, 100]) and %D
/// (SMA-smoothed %K). A flat high-low window yields NaN.
pub fn stochastic(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    smooth: usize,
) -> (Vec<f64>, Vec<f64>) {
    let n = close.len();
    let mut k = nan_vec(n);
    if period == 0 || n < period {
        return (k.clone(), k);
    }
    for i in (period - 1)..n {
        let hh = high[i + 1 - period..=i].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[i + 1 - period..=i].iter().cloned().fold(f64::MAX, f64::min);
        k[i] = safe_div((close[i] - ll) * 100.0, hh - ll).clamp(0.0, 100.0);
    }
    let d = sma(&k, smooth);
    (k, d)
}

/// Williams %R over the high-low range, in [-100, 0].
pub fn williams_r(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    if period == 0 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        let hh = high[i + 1 - period..=i].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[i + 1 - period..=i].iter().cloned().fold(f64::MAX, f64::min);
        out[i] = safe_div((hh - close[i]) * -100.0, hh - ll).clamp(-100.0, 0.0);
    }
    out
}

/// Commodity Channel Index over the typical price, 0.015 scaling.
pub fn cci(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    let tp: Vec<f64> = (0..n).map(|i| (high[i] + low[i] + close[i]) / 3.0).collect();
    let tp_sma = sma(&tp, period);
    let mut out = nan_vec(n);
    if period == 0 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        if !tp_sma[i].is_finite() {
            continue;
        }
        let mean_dev = tp[i + 1 - period..=i]
            .iter()
            .map(|v| (v - tp_sma[i]).abs())
            .sum::<f64>()
            / period as f64;
        out[i] = safe_div(tp[i] - tp_sma[i], 0.015 * mean_dev);
    }
    out
}

/// Percentage price oscillator: fast vs slow EMA, normalized by slow.
pub fn ppo(values: &[f64], fast: usize, slow: usize) -> Vec<f64> {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| safe_div((f - s) * 100.0, *s))
        .collect()
}

/// Percentage volume oscillator with its signal line.
pub fn pvo(volume: &[f64], fast: usize, slow: usize, signal: usize) -> (Vec<f64>, Vec<f64>) {
    let line = ppo(volume, fast, slow);
    let signal_line = ema_over_tail(&line, signal);
    (line, signal_line)
}

/// Kaufman adaptive moving average. Efficiency ratio selects a
/// smoothing constant between the fast and slow EMA constants.
pub fn kama(values: &[f64], period: usize, fast: usize, slow: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = nan_vec(n);
    if period == 0 || n <= period {
        return out;
    }
    let fast_sc = 2.0 / (fast as f64 + 1.0);
    let slow_sc = 2.0 / (slow as f64 + 1.0);
    let mut prev = values[period - 1];
    out[period - 1] = prev;
    for i in period..n {
        let change = (values[i] - values[i - period]).abs();
        let volatility: f64 = (i + 1 - period..=i)
            .map(|j| (values[j] - values[j - 1]).abs())
            .sum();
        let er = if volatility < f64::EPSILON {
            0.0
        } else {
            change / volatility
        };
        let sc = (er * (fast_sc - slow_sc) + slow_sc).powi(2);
        prev += sc * (values[i] - prev);
        out[i] = prev;
    }
    out
}

/// Triple exponential moving average, 3*E1 - 3*E2 + E3.
pub fn tema(values: &[f64], period: usize) -> Vec<f64> {
    let e1 = ema(values, period);
    let e2 = ema_over_tail(&e1, period);
    let e3 = ema_over_tail(&e2, period);
    (0..values.len())
        .map(|i| {
            if e1[i].is_finite() && e2[i].is_finite() && e3[i].is_finite() {
                3.0 * e1[i] - 3.0 * e2[i] + e3[i]
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// 1-bar percent rate of change of a triple-smoothed EMA.
pub fn trix(values: &[f64], period: usize) -> Vec<f64> {
    let e1 = ema(values, period);
    let e2 = ema_over_tail(&e1, period);
    let e3 = ema_over_tail(&e2, period);
    let n = values.len();
    let mut out = nan_vec(n);
    for i in 1..n {
        if e3[i].is_finite() && e3[i - 1].is_finite() {
            out[i] = safe_div((e3[i] - e3[i - 1]) * 100.0, e3[i - 1]);
        }
    }
    out
}

/// Bollinger bands plus the derived bandwidth and %B position.
pub struct Bollinger {
    pub middle: Vec<f64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
    pub bandwidth: Vec<f64>,
    pub position: Vec<f64>,
}

pub fn bollinger(close: &[f64], period: usize, mult: f64) -> Bollinger {
    let middle = sma(close, period);
    let std = rolling_std(close, period);
    let n = close.len();
    let mut upper = nan_vec(n);
    let mut lower = nan_vec(n);
    let mut bandwidth = nan_vec(n);
    let mut position = nan_vec(n);
    for i in 0..n {
        if !middle[i].is_finite() || !std[i].is_finite() {
            continue;
        }
        upper[i] = middle[i] + mult * std[i];
        lower[i] = middle[i] - mult * std[i];
        bandwidth[i] = safe_div(upper[i] - lower[i], middle[i]);
        position[i] = safe_div(close[i] - lower[i], upper[i] - lower[i]);
    }
    Bollinger {
        middle,
        upper,
        lower,
        bandwidth,
        position,
    }
}

/// Wilder true range: the first bar uses high-low only.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    if n == 0 {
        return out;
    }
    out[0] = high[0] - low[0];
    for i in 1..n {
        out[i] = (high[i] - low[i])
            .max((high[i] - close[i - 1]).abs())
            .max((low[i] - close[i - 1]).abs());
    }
    out
}

/// Average true range, Wilder-smoothed.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    rma(&true_range(high, low, close), period)
}

pub struct Adx {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// Wilder directional movement system. A zero ATR pins the DI values at
/// 0 rather than NaN so DX stays well-defined on dead-flat stretches.
pub fn adx(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Adx {
    let n = close.len();
    let mut plus_dm = nan_vec(n);
    let mut minus_dm = nan_vec(n);
    for i in 1..n {
        let up = high[i] - high[i - 1];
        let down = low[i - 1] - low[i];
        plus_dm[i] = if up > down && up > 0.0 { up } else { 0.0 };
        minus_dm[i] = if down > up && down > 0.0 { down } else { 0.0 };
    }
    let smoothed_atr = atr(high, low, close, period);
    let smoothed_plus = rma(&plus_dm, period);
    let smoothed_minus = rma(&minus_dm, period);

    let mut plus_di = nan_vec(n);
    let mut minus_di = nan_vec(n);
    let mut dx = nan_vec(n);
    for i in 0..n {
        let (a, p, m) = (smoothed_atr[i], smoothed_plus[i], smoothed_minus[i]);
        if !a.is_finite() || !p.is_finite() || !m.is_finite() {
            continue;
        }
        if a.abs() < f64::EPSILON {
            plus_di[i] = 0.0;
            minus_di[i] = 0.0;
        } else {
            plus_di[i] = 100.0 * p / a;
            minus_di[i] = 100.0 * m / a;
        }
        let di_sum = plus_di[i] + minus_di[i];
        dx[i] = if di_sum.abs() < f64::EPSILON {
            0.0
        } else {
            100.0 * (plus_di[i] - minus_di[i]).abs() / di_sum
        };
    }
    Adx {
        adx: rma(&dx, period),
        plus_di,
        minus_di,
    }
}

/// SuperTrend line and direction (+1 up, -1 down).
pub fn supertrend(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    mult: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n = close.len();
    let atr_v = atr(high, low, close, period);
    let mut line = nan_vec(n);
    let mut direction = nan_vec(n);
    let mut upper_band = f64::NAN;
    let mut lower_band = f64::NAN;
    let mut dir = 1.0;
    let mut started = false;
    for i in 0..n {
        if !atr_v[i].is_finite() {
            continue;
        }
        let hl2 = (high[i] + low[i]) / 2.0;
        let raw_upper = hl2 + mult * atr_v[i];
        let raw_lower = hl2 - mult * atr_v[i];
        if !started {
            upper_band = raw_upper;
            lower_band = raw_lower;
            started = true;
        } else {
            // Bands only ratchet toward price until a flip.
            if raw_upper < upper_band || close[i - 1] > upper_band {
                upper_band = raw_upper;
            }
            if raw_lower > lower_band || close[i - 1] < lower_band {
                lower_band = raw_lower;
            }
            if dir > 0.0 && close[i] < lower_band {
                dir = -1.0;
                upper_band = raw_upper;
            } else if dir < 0.0 && close[i] > upper_band {
                dir = 1.0;
                lower_band = raw_lower;
            }
        }
        direction[i] = dir;
        line[i] = if dir > 0.0 { lower_band } else { upper_band };
    }
    (line, direction)
}

/// Commodity Selection Index, ADX x ATR x (close/ATR). The close/ATR
/// term must not be simplified away: a zero or undefined ATR yields the
/// sentinel so a dead data feed cannot masquerade as ADX x close.
pub fn csi(adx_values: &[f64], atr_values: &[f64], close: &[f64]) -> Vec<f64> {
    (0..close.len())
        .map(|i| {
            let normalized = safe_div(close[i], atr_values[i]);
            if !adx_values[i].is_finite() || !atr_values[i].is_finite() || !normalized.is_finite() {
                f64::NAN
            } else {
                adx_values[i] * atr_values[i] * normalized
            }
        })
        .collect()
}

/// On-balance volume, cumulative from the first bar.
pub fn obv(close: &[f64], volume: &[f64]) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    if n == 0 {
        return out;
    }
    let mut acc = 0.0;
    out[0] = 0.0;
    for i in 1..n {
        if close[i] > close[i - 1] {
            acc += volume[i];
        } else if close[i] < close[i - 1] {
            acc -= volume[i];
        }
        out[i] = acc;
    }
    out
}

/// Money Flow Index over the typical price, in [0, 100].
pub fn mfi(high: &[f64], low: &[f64], close: &[f64], volume: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    if period == 0 || n <= period {
        return out;
    }
    let tp: Vec<f64> = (0..n).map(|i| (high[i] + low[i] + close[i]) / 3.0).collect();
    let mut positive = vec![0.0; n];
    let mut negative = vec![0.0; n];
    for i in 1..n {
        let flow = tp[i] * volume[i];
        if tp[i] > tp[i - 1] {
            positive[i] = flow;
        } else if tp[i] < tp[i - 1] {
            negative[i] = flow;
        }
    }
    for i in period..n {
        let pos: f64 = positive[i + 1 - period..=i].iter().sum();
        let neg: f64 = negative[i + 1 - period..=i].iter().sum();
        out[i] = if neg < f64::EPSILON {
            if pos < f64::EPSILON { 50.0 } else { 100.0 }
        } else {
            100.0 - 100.0 / (1.0 + pos / neg)
        };
    }
    out
}

/// Chaikin money flow: volume-weighted close location over a window.
pub fn cmf(high: &[f64], low: &[f64], close: &[f64], volume: &[f64], period: usize) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    if period == 0 || n < period {
        return out;
    }
    let mfv: Vec<f64> = (0..n)
        .map(|i| {
            let range = high[i] - low[i];
            if range.abs() < f64::EPSILON {
                0.0
            } else {
                ((close[i] - low[i]) - (high[i] - close[i])) / range * volume[i]
            }
        })
        .collect();
    for i in (period - 1)..n {
        let vol_sum: f64 = volume[i + 1 - period..=i].iter().sum();
        let mfv_sum: f64 = mfv[i + 1 - period..=i].iter().sum();
        out[i] = safe_div(mfv_sum, vol_sum);
    }
    out
}

/// Volume-weighted average price, resetting whenever the session id
/// changes. Session ids are day or week ordinals supplied by the
/// composer.
pub fn vwap(high: &[f64], low: &[f64], close: &[f64], volume: &[f64], session: &[i64]) -> Vec<f64> {
    let n = close.len();
    let mut out = nan_vec(n);
    let mut pv_sum = 0.0;
    let mut vol_sum = 0.0;
    let mut current = None;
    for i in 0..n {
        if current != Some(session[i]) {
            current = Some(session[i]);
            pv_sum = 0.0;
            vol_sum = 0.0;
        }
        let tp = (high[i] + low[i] + close[i]) / 3.0;
        pv_sum += tp * volume[i];
        vol_sum += volume[i];
        out[i] = safe_div(pv_sum, vol_sum);
    }
    out
}

pub struct VolumeProfile {
    pub poc: Vec<f64>,
    pub vah: Vec<f64>,
    pub val: Vec<f64>,
}

/// Rolling volume profile over `window` bars bucketed into `bins`
/// price levels: point of control plus the 70% value-area bounds.
pub fn volume_profile(close: &[f64], volume: &[f64], window: usize, bins: usize) -> VolumeProfile {
    let n = close.len();
    let mut poc = nan_vec(n);
    let mut vah = nan_vec(n);
    let mut val = nan_vec(n);
    if window == 0 || bins == 0 || n < window {
        return VolumeProfile { poc, vah, val };
    }
    for i in (window - 1)..n {
        let prices = &close[i + 1 - window..=i];
        let vols = &volume[i + 1 - window..=i];
        let total: f64 = vols.iter().sum();
        if total < f64::EPSILON {
            continue;
        }
        let lo = prices.iter().cloned().fold(f64::MAX, f64::min);
        let hi = prices.iter().cloned().fold(f64::MIN, f64::max);
        if (hi - lo).abs() < f64::EPSILON {
            poc[i] = close[i];
            vah[i] = close[i];
            val[i] = close[i];
            continue;
        }
        let bin_width = (hi - lo) / bins as f64;
        let mut histogram = vec![0.0; bins];
        for (p, v) in prices.iter().zip(vols.iter()) {
            let idx = (((p - lo) / bin_width) as usize).min(bins - 1);
            histogram[idx] += v;
        }
        let poc_bin = histogram
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        // Expand from the point of control toward the heavier neighbor
        // until the value area holds 70% of traded volume.
        let mut covered = histogram[poc_bin];
        let (mut lo_bin, mut hi_bin) = (poc_bin, poc_bin);
        while covered < 0.70 * total {
            let below = if lo_bin > 0 { histogram[lo_bin - 1] } else { -1.0 };
            let above = if hi_bin + 1 < bins { histogram[hi_bin + 1] } else { -1.0 };
            if below < 0.0 && above < 0.0 {
                break;
            }
            if above >= below {
                hi_bin += 1;
                covered += histogram[hi_bin];
            } else {
                lo_bin -= 1;
                covered += histogram[lo_bin];
            }
        }
        poc[i] = lo + (poc_bin as f64 + 0.5) * bin_width;
        vah[i] = lo + (hi_bin as f64 + 1.0) * bin_width;
        val[i] = lo + lo_bin as f64 * bin_width;
    }
    VolumeProfile { poc, vah, val }
}

pub struct Ichimoku {
    pub tenkan: Vec<f64>,
    pub kijun: Vec<f64>,
    pub senkou_a: Vec<f64>,
    pub senkou_b: Vec<f64>,
    pub chikou: Vec<f64>,
}

fn midpoint(high: &[f64], low: &[f64], period: usize) -> Vec<f64> {
    let n = high.len();
    let mut out = nan_vec(n);
    if period == 0 || n < period {
        return out;
    }
    for i in (period - 1)..n {
        let hh = high[i + 1 - period..=i].iter().cloned().fold(f64::MIN, f64::max);
        let ll = low[i + 1 - period..=i].iter().cloned().fold(f64::MAX, f64::min);
        out[i] = (hh + ll) / 2.0;
    }
    out
}

/// Ichimoku components with a configurable cloud shift. The senkou
/// spans are displaced `shift` bars forward and the chikou line `shift`
/// bars back; displaced-off-the-edge bars carry the sentinel.
pub fn ichimoku(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    tenkan_period: usize,
    kijun_period: usize,
    senkou_b_period: usize,
    shift: usize,
) -> Ichimoku {
    let n = close.len();
    let tenkan = midpoint(high, low, tenkan_period);
    let kijun = midpoint(high, low, kijun_period);
    let senkou_b_raw = midpoint(high, low, senkou_b_period);
    let senkou_a_raw: Vec<f64> = tenkan
        .iter()
        .zip(kijun.iter())
        .map(|(t, k)| {
            if t.is_finite() && k.is_finite() {
                (t + k) / 2.0
            } else {
                f64::NAN
            }
        })
        .collect();

    let mut senkou_a = nan_vec(n);
    let mut senkou_b = nan_vec(n);
    let mut chikou = nan_vec(n);
    for i in 0..n {
        if i >= shift {
            senkou_a[i] = senkou_a_raw[i - shift];
            senkou_b[i] = senkou_b_raw[i - shift];
        }
        if i + shift < n {
            chikou[i] = close[i + shift];
        }
    }
    Ichimoku {
        tenkan,
        kijun,
        senkou_a,
        senkou_b,
        chikou,
    }
}

/// Pivot flags: a bar is a pivot high when its high strictly dominates
/// the `window` bars on each side. Bars whose right side is not fully
/// observable yet are undefined (`None`), never `false`.
pub fn pivot_flags(values: &[f64], window: usize, find_high: bool) -> Vec<Option<bool>> {
    let n = values.len();
    let mut out = vec![None; n];
    if window == 0 || n < 2 * window + 1 {
        return out;
    }
    for i in window..(n - window) {
        let center = values[i];
        let dominated = (i - window..=i + window).filter(|&j| j != i).all(|j| {
            if find_high {
                center > values[j]
            } else {
                center < values[j]
            }
        });
        out[i] = Some(dominated);
    }
    out
}

/// Bar-over-bar comparison flags, undefined on the first bar.
pub fn sequential_compare(values: &[f64], greater: bool) -> Vec<Option<bool>> {
    let n = values.len();
    let mut out = vec![None; n];
    for i in 1..n {
        out[i] = Some(if greater {
            values[i] > values[i - 1]
        } else {
            values[i] < values[i - 1]
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() < tol, "{a} vs {b}");
    }

    #[test]
    fn sma_warm_up_and_values() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert_close(out[2], 2.0, 1e-12);
        assert_close(out[4], 4.0, 1e-12);
    }

    #[test]
    fn ema_seeds_with_sma() {
        let out = ema(&[2.0, 4.0, 6.0, 8.0], 3);
        assert!(out[1].is_nan());
        assert_close(out[2], 4.0, 1e-12);
        // alpha = 0.5: 0.5*8 + 0.5*4
        assert_close(out[3], 6.0, 1e-12);
    }

    #[test]
    fn rma_carries_over_nan_gaps() {
        let out = rma(&[f64::NAN, 3.0, 3.0, 3.0, f64::NAN, 3.0], 3);
        assert!(out[0].is_nan());
        assert_close(out[3], 3.0, 1e-12);
        assert_close(out[4], 3.0, 1e-12);
    }

    #[test]
    fn rsi_monotonic_rise_hits_100() {
        let close: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        let out = rsi(&close, 14);
        for value in &out[..14] {
            assert!(value.is_nan());
        }
        assert_close(out[14], 100.0, 1e-9);
    }

    #[test]
    fn rsi_mixed_series_stays_inside_bounds() {
        let close = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 45.61, 46.28, 46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ];
        let out = rsi(&close, 14);
        for value in out.iter().filter(|v| v.is_finite()) {
            assert!((0.0..=100.0).contains(value));
        }
        // Mostly gains over the warm-up window puts RSI above 50.
        assert!(out[14] > 50.0 && out[14] < 100.0);
    }

    #[test]
    fn macd_warm_up_tracks_slow_period() {
        let close: Vec<f64> = (1..=60).map(|v| v as f64).collect();
        let (line, signal, hist) = macd(&close, 12, 26, 9);
        assert!(line[24].is_nan());
        assert!(line[25].is_finite());
        assert!(signal[32].is_nan());
        assert!(signal[33].is_finite());
        assert!(hist[33].is_finite());
    }

    #[test]
    fn stochastic_flat_window_is_undefined() {
        let flat = [5.0; 10];
        let (k, _) = stochastic(&flat, &flat, &flat, 5, 3);
        assert!(k[9].is_nan());
    }

    #[test]
    fn roc_zero_base_is_undefined() {
        let out = roc(&[0.0, 1.0, 2.0], 1);
        assert!(out[0].is_nan());
        assert!(out[1].is_nan());
        assert_close(out[2], 100.0, 1e-12);
    }

    #[test]
    fn atr_flat_bars_is_zero() {
        let flat = [10.0; 20];
        let out = atr(&flat, &flat, &flat, 14);
        assert_close(out[14], 0.0, 1e-12);
    }

    #[test]
    fn csi_short_circuits_on_zero_atr() {
        let adx_v = [20.0, 20.0];
        let atr_v = [0.0, 1.0];
        let close = [10.0, 10.0];
        let out = csi(&adx_v, &atr_v, &close);
        assert!(out[0].is_nan(), "zero ATR must not simplify to ADX*close");
        assert_close(out[1], 20.0 * 1.0 * 10.0, 1e-9);
    }

    #[test]
    fn adx_stays_defined_on_flat_data() {
        let flat = [10.0; 40];
        let result = adx(&flat, &flat, &flat, 14);
        assert_close(result.plus_di[20], 0.0, 1e-12);
        assert_close(result.adx[30], 0.0, 1e-12);
    }

    #[test]
    fn bollinger_position_undefined_on_flat_window() {
        let flat = [7.0; 25];
        let bands = bollinger(&flat, 20, 2.0);
        assert_close(bands.middle[20], 7.0, 1e-12);
        assert!(bands.position[20].is_nan());
        assert!(bands.bandwidth[20].is_finite());
    }

    #[test]
    fn obv_accumulates_signed_volume() {
        let close = [10.0, 11.0, 10.5, 10.5, 12.0];
        let volume = [100.0, 200.0, 50.0, 75.0, 300.0];
        let out = obv(&close, &volume);
        assert_eq!(out, vec![0.0, 200.0, 150.0, 150.0, 450.0]);
    }

    #[test]
    fn vwap_resets_on_session_change() {
        let price = [10.0, 20.0, 30.0];
        let volume = [1.0, 1.0, 1.0];
        let session = [1, 1, 2];
        let out = vwap(&price, &price, &price, &volume, &session);
        assert_close(out[1], 15.0, 1e-12);
        assert_close(out[2], 30.0, 1e-12);
    }

    #[test]
    fn ichimoku_shift_pushes_cloud_forward() {
        let n = 80;
        let high: Vec<f64> = (0..n).map(|i| 10.0 + i as f64).collect();
        let low: Vec<f64> = high.iter().map(|v| v - 1.0).collect();
        let close: Vec<f64> = high.iter().map(|v| v - 0.5).collect();
        let cloud = ichimoku(&high, &low, &close, 9, 26, 52, 26);
        // senkou_a needs kijun warm-up (26) plus the 26-bar shift.
        assert!(cloud.senkou_a[50].is_nan());
        assert!(cloud.senkou_a[51].is_finite());
        // chikou runs off the right edge for the last `shift` bars.
        assert!(cloud.chikou[n - 26].is_nan());
        assert!(cloud.chikou[n - 27].is_finite());
    }

    #[test]
    fn pivot_right_edge_is_undefined_not_false() {
        let highs = [1.0, 2.0, 5.0, 2.0, 1.0, 1.5, 1.2, 1.1];
        let out = pivot_flags(&highs, 2, true);
        assert_eq!(out[0], None);
        assert_eq!(out[2], Some(true));
        assert_eq!(out[3], Some(false));
        assert_eq!(out[6], None);
        assert_eq!(out[7], None);
    }

    #[test]
    fn zscore_flat_window_is_undefined() {
        let flat = [3.0; 25];
        let out = rolling_zscore(&flat, 20);
        assert!(out[24].is_nan());
    }

    #[test]
    fn volume_profile_poc_lands_on_heavy_price() {
        let close = [10.0, 10.1, 10.0, 20.0, 10.05];
        let volume = [100.0, 100.0, 100.0, 1.0, 100.0];
        let profile = volume_profile(&close, &volume, 5, 10);
        // Nearly all volume traded around 10.
        assert!(profile.poc[4] < 12.0);
        assert!(profile.val[4] <= profile.poc[4]);
        assert!(profile.vah[4] >= profile.poc[4]);
    }

    #[test]
    fn kernels_never_emit_infinity() {
        let close = [0.0, 0.0, 1e308, 1e308, 0.0, 5.0, 5.0, 5.0, 5.0, 5.0];
        for out in [
            roc(&close, 1),
            rsi(&close, 3),
            rolling_zscore(&close, 3),
            trix(&close, 2),
        ] {
            assert!(out.iter().all(|v| !v.is_infinite()));
        }
    }
}
