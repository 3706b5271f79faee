//! Threshold expressions and their validation against the metric registry.
//!
//! A threshold is written as `<method> <op> <number>`, e.g. `p(95) < 200` or
//! `rate<0.01`, and attached to a metric key which may carry a submetric
//! selector: `http_req_duration{status:200}`.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    config::duration,
    error::ConfigError,
    metric::{Metric, MetricKind, Registry},
    tags::TagSet,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AggregationMethod {
    Count,
    Rate,
    Value,
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
}

impl AggregationMethod {
    /// Whether a metric of `kind` can answer this method in a threshold.
    pub fn supported_by(&self, kind: MetricKind) -> bool {
        use AggregationMethod::*;
        match kind {
            MetricKind::Counter => matches!(self, Count | Rate),
            MetricKind::Gauge => matches!(self, Value),
            MetricKind::Rate => matches!(self, Rate),
            MetricKind::Trend => matches!(self, Avg | Min | Max | Med | Percentile(_)),
        }
    }
}

impl FromStr for AggregationMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let method = match s {
            "count" => Self::Count,
            "rate" => Self::Rate,
            "value" => Self::Value,
            "avg" => Self::Avg,
            "min" => Self::Min,
            "max" => Self::Max,
            "med" => Self::Med,
            _ => {
                let inner = s
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown aggregation method `{s}`"))?;
                let pct: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{inner}`"))?;
                if !(0.0..=100.0).contains(&pct) {
                    return Err(format!("percentile {pct} is outside [0, 100]"));
                }
                Self::Percentile(pct)
            }
        };
        Ok(method)
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Value => f.write_str("value"),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    StrictEq,
    Ne,
}

impl Operator {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            "===" => Self::StrictEq,
            "!=" => Self::Ne,
            _ => return None,
        })
    }

    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Eq | Self::StrictEq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::StrictEq => "===",
            Self::Ne => "!=",
        }
    }
}

/// Parsed form of `p(95) < 200`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpression {
    pub method: AggregationMethod,
    pub op: Operator,
    pub value: f64,
}

impl ThresholdExpression {
    /// True when the observed statistic satisfies the expression.
    pub fn passes(&self, observed: f64) -> bool {
        self.op.holds(observed, self.value)
    }
}

impl FromStr for ThresholdExpression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let is_op = |c: char| matches!(c, '<' | '>' | '=' | '!');
        let start = s
            .find(is_op)
            .ok_or_else(|| "missing comparison operator".to_string())?;
        let len = s[start..]
            .find(|c: char| !is_op(c))
            .unwrap_or(s.len() - start);
        let (lhs, rest) = s.split_at(start);
        let (op, rhs) = rest.split_at(len);

        let op = Operator::parse(op).ok_or_else(|| format!("unknown operator `{op}`"))?;
        let method = lhs.parse()?;
        let rhs = rhs.trim();
        let value: f64 = rhs
            .parse()
            .map_err(|_| format!("right-hand side `{rhs}` is not a number"))?;
        Ok(Self { method, op, value })
    }
}

impl fmt::Display for ThresholdExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.method, self.op.symbol(), self.value)
    }
}

/// One threshold as written in the options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdDefinition {
    Expression(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        threshold: String,
        #[serde(default)]
        abort_on_fail: bool,
        #[serde(default, with = "duration::option")]
        delay_abort_eval: Option<Duration>,
    },
}

impl ThresholdDefinition {
    pub fn source(&self) -> &str {
        match self {
            Self::Expression(s) => s,
            Self::Detailed { threshold, .. } => threshold,
        }
    }
}

impl From<&str> for ThresholdDefinition {
    fn from(value: &str) -> Self {
        Self::Expression(value.to_string())
    }
}

/// The value side of a `thresholds` entry: one definition or a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    One(ThresholdDefinition),
    Many(Vec<ThresholdDefinition>),
}

impl ThresholdSpec {
    pub fn definitions(&self) -> &[ThresholdDefinition] {
        match self {
            Self::One(d) => std::slice::from_ref(d),
            Self::Many(list) => list,
        }
    }
}

impl From<Vec<&str>> for ThresholdSpec {
    fn from(value: Vec<&str>) -> Self {
        Self::Many(value.into_iter().map(ThresholdDefinition::from).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    pub source: String,
    pub expression: ThresholdExpression,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<Duration>,
}

/// Every threshold attached to one metric key.
#[derive(Debug, Clone)]
pub struct MetricThresholds {
    pub key: String,
    pub metric: Arc<Metric>,
    /// Set for submetric keys such as `http_req_duration{status:200}`.
    pub selector: Option<TagSet>,
    pub thresholds: Vec<Threshold>,
}

/// Splits `name{k:v,...}` into the metric name and its selector.
pub fn parse_metric_key(key: &str) -> Result<(String, Option<TagSet>), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidMetricKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let key_trimmed = key.trim();
    let Some(open) = key_trimmed.find('{') else {
        if key_trimmed.contains('}') {
            return Err(invalid("unbalanced `}`"));
        }
        return Ok((key_trimmed.to_string(), None));
    };
    let name = key_trimmed[..open].trim();
    let body = key_trimmed[open + 1..]
        .strip_suffix('}')
        .ok_or_else(|| invalid("selector must end with `}`"))?;
    if name.is_empty() {
        return Err(invalid("missing metric name"));
    }
    if body.trim().is_empty() {
        return Err(invalid("empty selector"));
    }

    let mut selector = TagSet::new();
    for pair in body.split(',') {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| invalid("selector entries must be `key:value`"))?;
        let k = k.trim();
        let v = v.trim().trim_matches(|c| c == '"' || c == '\'');
        if k.is_empty() {
            return Err(invalid("empty tag key"));
        }
        selector = selector.with(k, v);
    }
    Ok((name.to_string(), Some(selector)))
}

/// Parses and validates every configured threshold.
///
/// Fails on the first malformed expression, unknown metric or aggregation
/// method the metric's kind cannot answer.
pub fn build(
    registry: &Registry,
    config: &BTreeMap<String, ThresholdSpec>,
) -> Result<Vec<MetricThresholds>, ConfigError> {
    config
        .iter()
        .map(|(key, spec)| {
            let (name, selector) = parse_metric_key(key)?;
            let metric = registry
                .get(&name)
                .ok_or_else(|| ConfigError::UnknownMetric(name.clone()))?;
            let thresholds = spec
                .definitions()
                .iter()
                .map(|def| parse_definition(&metric, def))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MetricThresholds {
                key: key.clone(),
                metric,
                selector,
                thresholds,
            })
        })
        .collect()
}

fn parse_definition(metric: &Metric, def: &ThresholdDefinition) -> Result<Threshold, ConfigError> {
    let source = def.source().trim().to_string();
    let expression: ThresholdExpression =
        source
            .parse()
            .map_err(|reason| ConfigError::InvalidThreshold {
                metric: metric.name.clone(),
                expression: source.clone(),
                reason,
            })?;
    if !expression.method.supported_by(metric.kind) {
        return Err(ConfigError::UnsupportedAggregation {
            metric: metric.name.clone(),
            expression: source,
            method: expression.method.to_string(),
            kind: metric.kind.to_string(),
        });
    }
    let (abort_on_fail, delay_abort_eval) = match def {
        ThresholdDefinition::Expression(_) => (false, None),
        ThresholdDefinition::Detailed {
            abort_on_fail,
            delay_abort_eval,
            ..
        } => (*abort_on_fail, *delay_abort_eval),
    };
    Ok(Threshold {
        source,
        expression,
        abort_on_fail,
        delay_abort_eval,
    })
}
