//! Statistics scraped from program output.
//!
//! A [`Statistics`] instance holds a set of [`StatRule`]s. Each rule matches
//! output lines with a regex, converts the captured groups to numbers and
//! folds them into a running value with the rule's [`Combine`] function.
//! The running values are kept as string maps in task state so that they
//! survive restarts.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

use crate::error::FlowError;

/// Numeric type of one captured group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    Int(i64),
    Float(f64),
}

impl StatValue {
    fn parse(text: &str, ty: ValueType) -> Result<Self, FlowError> {
        match ty {
            ValueType::Int => text
                .parse::<i64>()
                .map(StatValue::Int)
                .map_err(|e| FlowError::Statistics(format!("cannot parse '{text}' as int: {e}"))),
            ValueType::Float => text
                .parse::<f64>()
                .map(StatValue::Float)
                .map_err(|e| FlowError::Statistics(format!("cannot parse '{text}' as float: {e}"))),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            StatValue::Int(i) => i as f64,
            StatValue::Float(f) => f,
        }
    }

    fn zero_like(self) -> Self {
        match self {
            StatValue::Int(_) => StatValue::Int(0),
            StatValue::Float(_) => StatValue::Float(0.0),
        }
    }

    fn add(self, other: Self) -> Self {
        match (self, other) {
            (StatValue::Int(a), StatValue::Int(b)) => StatValue::Int(a + b),
            (a, b) => StatValue::Float(a.as_f64() + b.as_f64()),
        }
    }

    fn max(self, other: Self) -> Self {
        match (self, other) {
            (StatValue::Int(a), StatValue::Int(b)) => StatValue::Int(a.max(b)),
            (a, b) => StatValue::Float(a.as_f64().max(b.as_f64())),
        }
    }
}

impl fmt::Display for StatValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, f.precision()) {
            (StatValue::Int(i), _) => write!(f, "{i}"),
            (StatValue::Float(x), Some(p)) => write!(f, "{x:.p$}"),
            (StatValue::Float(x), None) => write!(f, "{x}"),
        }
    }
}

/// How a newly scraped value list is folded into the running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    /// Elementwise sum, the shorter list padded with zeros.
    Sum,
    /// Elementwise maximum.
    Max,
    /// `[mean, weight]` pairs folded into `[weighted mean, total weight]`.
    WeightedMean,
    /// `[count, mean, stddev]` triples folded into one sample description.
    MeanStddev,
    /// The n smallest values seen so far, ascending.
    Smallest(usize),
}

impl Combine {
    pub fn apply(self, old: &[StatValue], new: &[StatValue]) -> Result<Vec<StatValue>, FlowError> {
        match self {
            Combine::Sum => Ok(add_list(old, new)),
            Combine::Max => Ok(zip_padded(old, new, StatValue::max)),
            Combine::WeightedMean => zip_combine_mean(old, new),
            Combine::MeanStddev => combine_stats(old, new),
            Combine::Smallest(n) => Ok(smallest_n(old, new, n)),
        }
    }
}

fn zip_padded(
    a: &[StatValue],
    b: &[StatValue],
    op: impl Fn(StatValue, StatValue) -> StatValue,
) -> Vec<StatValue> {
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| match (a.get(i), b.get(i)) {
            (Some(&x), Some(&y)) => op(x, y),
            (Some(&x), None) => op(x, x.zero_like()),
            (None, Some(&y)) => op(y.zero_like(), y),
            (None, None) => StatValue::Int(0),
        })
        .collect()
}

/// Elementwise sum with zero padding.
pub fn add_list(a: &[StatValue], b: &[StatValue]) -> Vec<StatValue> {
    zip_padded(a, b, StatValue::add)
}

/// Combine two `[mean, weight]` pairs.
pub fn zip_combine_mean(a: &[StatValue], b: &[StatValue]) -> Result<Vec<StatValue>, FlowError> {
    let [m1, w1] = pair(a)?;
    let [m2, w2] = pair(b)?;
    let total = w1 + w2;
    let mean = if total == 0.0 { 0.0 } else { (m1 * w1 + m2 * w2) / total };
    let total = match (a[1], b[1]) {
        (StatValue::Int(x), StatValue::Int(y)) => StatValue::Int(x + y),
        _ => StatValue::Float(total),
    };
    Ok(vec![StatValue::Float(mean), total])
}

/// Combine two `[count, mean, stddev]` sample descriptions.
///
/// Each side is turned into `E[X^2] = stddev^2 + mean^2`, the second moments
/// are weighted by count, and the combined variance is back-solved from the
/// combined mean.
pub fn combine_stats(a: &[StatValue], b: &[StatValue]) -> Result<Vec<StatValue>, FlowError> {
    let [n1, mean1, sd1] = triple(a)?;
    let [n2, mean2, sd2] = triple(b)?;
    let n = n1 + n2;
    if n == 0.0 {
        return Ok(vec![StatValue::Int(0), StatValue::Float(0.0), StatValue::Float(0.0)]);
    }
    let mean = (n1 * mean1 + n2 * mean2) / n;
    let ex2 = (n1 * (sd1 * sd1 + mean1 * mean1) + n2 * (sd2 * sd2 + mean2 * mean2)) / n;
    let var = (ex2 - mean * mean).max(0.0);
    Ok(vec![
        StatValue::Int(n as i64),
        StatValue::Float(mean),
        StatValue::Float(var.sqrt()),
    ])
}

/// The `n` smallest values of both lists, ascending.
pub fn smallest_n(a: &[StatValue], b: &[StatValue], n: usize) -> Vec<StatValue> {
    let mut all: Vec<StatValue> = a.iter().chain(b).copied().collect();
    all.sort_by(|x, y| x.as_f64().total_cmp(&y.as_f64()));
    all.truncate(n);
    all
}

fn pair(v: &[StatValue]) -> Result<[f64; 2], FlowError> {
    match v {
        [a, b] => Ok([a.as_f64(), b.as_f64()]),
        _ => Err(FlowError::Statistics(format!("expected 2 values, got {}", v.len()))),
    }
}

fn triple(v: &[StatValue]) -> Result<[f64; 3], FlowError> {
    match v {
        [a, b, c] => Ok([a.as_f64(), b.as_f64(), c.as_f64()]),
        _ => Err(FlowError::Statistics(format!("expected 3 values, got {}", v.len()))),
    }
}

// ── Rules ────────────────────────────────────────────────────────────

/// One scraping rule.
#[derive(Debug, Clone)]
pub struct StatRule {
    pub key: String,
    /// Types of the captured groups; the last entry repeats for extra groups.
    pub types: Vec<ValueType>,
    /// Printed when the key was never seen.
    pub default: Option<String>,
    pub combine: Combine,
    pub pattern: Regex,
    /// Whether the key may appear more than once in one output.
    pub allow_several: bool,
}

impl StatRule {
    pub fn new(
        key: &str,
        types: &[ValueType],
        combine: Combine,
        pattern: &str,
        allow_several: bool,
    ) -> Result<Self, FlowError> {
        Ok(Self {
            key: key.to_string(),
            types: types.to_vec(),
            default: None,
            combine,
            pattern: Regex::new(pattern)?,
            allow_several,
        })
    }

    pub fn with_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }

    fn type_at(&self, i: usize) -> ValueType {
        self.types
            .get(i)
            .or(self.types.last())
            .copied()
            .unwrap_or(ValueType::Float)
    }

    fn parse_values(&self, fields: &[&str]) -> Result<Vec<StatValue>, FlowError> {
        fields
            .iter()
            .enumerate()
            .map(|(i, f)| StatValue::parse(f, self.type_at(i)))
            .collect()
    }
}

// ── Aggregator ───────────────────────────────────────────────────────

/// Running statistics for one task.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    rules: Vec<StatRule>,
    values: BTreeMap<String, Vec<StatValue>>,
}

impl Statistics {
    pub fn new(rules: Vec<StatRule>) -> Self {
        Self {
            rules,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[StatValue]> {
        self.values.get(key).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn rule(&self, key: &str) -> Option<&StatRule> {
        self.rules.iter().find(|r| r.key == key)
    }

    /// Scrape one line into `target`, which collects a single output's values.
    fn scrape_line(
        &self,
        line: &str,
        target: &mut BTreeMap<String, Vec<StatValue>>,
    ) -> Result<(), FlowError> {
        for rule in &self.rules {
            let Some(caps) = rule.pattern.captures(line) else {
                continue;
            };
            let fields: Vec<&str> = caps.iter().skip(1).flatten().map(|m| m.as_str()).collect();
            let values = rule.parse_values(&fields)?;
            match target.get_mut(&rule.key) {
                Some(existing) if rule.allow_several => {
                    *existing = rule.combine.apply(existing, &values)?;
                }
                Some(_) => {
                    return Err(FlowError::Statistics(format!(
                        "key {} occurs more than once in one output",
                        rule.key
                    )));
                }
                None => {
                    target.insert(rule.key.clone(), values);
                }
            }
        }
        Ok(())
    }

    /// Parse one program output and merge it into the running values.
    pub fn parse_output(&mut self, text: &str) -> Result<(), FlowError> {
        let mut found = BTreeMap::new();
        for line in text.lines() {
            self.scrape_line(line, &mut found)?;
        }
        self.merge_values(found)
    }

    /// Parse a single line directly into the running values.
    pub fn parse_line(&mut self, line: &str) -> Result<(), FlowError> {
        let mut found = BTreeMap::new();
        self.scrape_line(line, &mut found)?;
        self.merge_values(found)
    }

    fn merge_values(&mut self, found: BTreeMap<String, Vec<StatValue>>) -> Result<(), FlowError> {
        for (key, values) in found {
            let merged = match (self.values.get(&key), self.rule(&key)) {
                (Some(old), Some(rule)) => rule.combine.apply(old, &values)?,
                _ => values,
            };
            self.values.insert(key, merged);
        }
        Ok(())
    }

    /// Fold another aggregator's values into this one.
    pub fn merge(&mut self, other: &Statistics) -> Result<(), FlowError> {
        self.merge_values(other.values.clone())
    }

    /// Space-joined string form of every value, for persisting in task state.
    pub fn as_dict(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| {
                let joined = v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(" ");
                (k.clone(), joined)
            })
            .collect()
    }

    /// Restore values from [`Statistics::as_dict`] output. Keys without a rule are ignored.
    pub fn from_dict(&mut self, dict: &BTreeMap<String, String>) -> Result<(), FlowError> {
        for (key, text) in dict {
            let Some(rule) = self.rule(key) else {
                continue;
            };
            let fields: Vec<&str> = text.split_whitespace().collect();
            let values = rule.parse_values(&fields)?;
            self.values.insert(key.clone(), values);
        }
        Ok(())
    }

    /// Render format templates such as `"Total {stats_total_cpu_time[0]:.1}s"`.
    ///
    /// A line referencing a key that was never seen and has no default is skipped.
    pub fn as_strings(&self, formats: &[&str]) -> Vec<String> {
        formats
            .iter()
            .filter_map(|fmt| self.render(fmt))
            .collect()
    }

    fn render(&self, template: &str) -> Option<String> {
        let placeholder = Regex::new(PLACEHOLDER).ok()?;
        let mut out = String::new();
        let mut last = 0;
        for caps in placeholder.captures_iter(template) {
            let whole = caps.get(0)?;
            out.push_str(&template[last..whole.start()]);
            last = whole.end();

            let key = &caps[1];
            let index = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());
            let precision = caps.get(3).and_then(|m| m.as_str().parse::<usize>().ok());

            let rendered = match self.values.get(key) {
                Some(values) => match index {
                    Some(i) => format_value(*values.get(i)?, precision),
                    None => values
                        .iter()
                        .map(|v| format_value(*v, precision))
                        .collect::<Vec<_>>()
                        .join(" "),
                },
                None => self.rule(key)?.default.clone()?,
            };
            out.push_str(&rendered);
        }
        out.push_str(&template[last..]);
        Some(out)
    }
}

fn format_value(value: StatValue, precision: Option<usize>) -> String {
    match precision {
        Some(p) => format!("{value:.p$}"),
        None => value.to_string(),
    }
}

/// `{key}`, `{key[index]}` or `{key[index]:.precision}`.
const PLACEHOLDER: &str = r"\{([A-Za-z_][A-Za-z0-9_]*)(?:\[(\d+)\])?(?::\.(\d+))?\}";
