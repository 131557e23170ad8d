//! Seeded input generation from declared parameter types.

use std::cmp::Ordering;
use std::fmt;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use crate::config::PropertyTestConfig;

/// Characters drawn for random strings; includes multi-byte code points
const STRING_ALPHABET: &[char] = &[
    'a', 'b', 'c', 'x', 'y', 'z', 'A', 'Z', '0', '9', ' ', '_', '-', '.', 'é', 'ß', 'π', 'ж',
    '中', '✓',
];

/// A parameter type the generator can produce values for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamType {
    /// `bool`
    Bool,
    /// `int`, bounded by the configuration
    Int,
    /// `float`, bounded and finite
    Float,
    /// `str`, bounded length
    Str,
    /// `list[T]`, bounded length
    List(Box<ParamType>),
}

impl ParamType {
    /// Parse a rendered annotation (`int`, `list[str]`, `List[int]`, ...).
    ///
    /// Returns `None` for anything the generator cannot produce.
    #[must_use]
    pub fn parse(annotation: &str) -> Option<Self> {
        let annotation = annotation.trim();
        let annotation = annotation.strip_prefix("typing.").unwrap_or(annotation);
        match annotation {
            "bool" => return Some(Self::Bool),
            "int" => return Some(Self::Int),
            "float" => return Some(Self::Float),
            "str" => return Some(Self::Str),
            "list" | "List" => return Some(Self::List(Box::new(Self::Int))),
            _ => {}
        }
        let inner = annotation
            .strip_prefix("list[")
            .or_else(|| annotation.strip_prefix("List["))?
            .strip_suffix(']')?;
        Self::parse(inner).map(|t| Self::List(Box::new(t)))
    }

    /// Whether `value` has this type's shape
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Bool, Value::Bool(_)) | (Self::Str, Value::String(_)) => true,
            (Self::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::List(inner), Value::Array(items)) => items.iter().all(|v| inner.accepts(v)),
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Str => f.write_str("str"),
            Self::List(inner) => write!(f, "list[{inner}]"),
        }
    }
}

/// Deterministic input generator; the same seed yields the same inputs
pub struct InputGenerator<'a> {
    config: &'a PropertyTestConfig,
    rng: ChaCha8Rng,
}

impl<'a> InputGenerator<'a> {
    /// Create a generator
    #[must_use]
    pub fn new(config: &'a PropertyTestConfig, seed: u64) -> Self {
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Boundary values tried before random ones, all within the configured bounds
    #[must_use]
    pub fn edge_values(&self, ty: &ParamType) -> Vec<Value> {
        let config = self.config;
        let edges = match ty {
            ParamType::Bool => vec![Value::Bool(false), Value::Bool(true)],
            ParamType::Int => [0, 1, -1, config.int_min, config.int_max]
                .into_iter()
                .filter(|n| (config.int_min..=config.int_max).contains(n))
                .map(Value::from)
                .collect(),
            ParamType::Float => [0.0, 1.0, -1.0, config.float_min, config.float_max]
                .into_iter()
                .filter(|x| (config.float_min..=config.float_max).contains(x))
                .map(Value::from)
                .collect(),
            ParamType::Str => {
                let max = config.max_string_len;
                let mut edges = vec![Value::from("")];
                if max >= 1 {
                    edges.push(Value::from("a"));
                    edges.push(Value::from("é"));
                }
                if max > 1 {
                    edges.push(Value::from("z".repeat(max)));
                }
                edges
            }
            ParamType::List(inner) => {
                let mut edges = vec![Value::Array(Vec::new())];
                if config.max_list_len >= 1 {
                    if let Some(first) = self.edge_values(inner).into_iter().next() {
                        edges.push(Value::Array(vec![first]));
                    }
                }
                edges
            }
        };
        let mut unique = Vec::with_capacity(edges.len());
        for edge in edges {
            if !unique.contains(&edge) {
                unique.push(edge);
            }
        }
        unique
    }

    /// A uniformly drawn value within the configured bounds
    pub fn random_value(&mut self, ty: &ParamType) -> Value {
        match ty {
            ParamType::Bool => Value::Bool(self.rng.gen()),
            ParamType::Int => Value::from(
                self.rng
                    .gen_range(self.config.int_min..=self.config.int_max),
            ),
            ParamType::Float => Value::from(
                self.rng
                    .gen_range(self.config.float_min..=self.config.float_max),
            ),
            ParamType::Str => {
                let len = self.rng.gen_range(0..=self.config.max_string_len);
                let text: String = (0..len)
                    .map(|_| STRING_ALPHABET[self.rng.gen_range(0..STRING_ALPHABET.len())])
                    .collect();
                Value::String(text)
            }
            ParamType::List(inner) => {
                let len = self.rng.gen_range(0..=self.config.max_list_len);
                Value::Array((0..len).map(|_| self.random_value(inner)).collect())
            }
        }
    }

    /// `trials` argument tuples: edge values first, then random draws
    pub fn generate(&mut self, params: &[ParamType], trials: usize) -> Vec<Vec<Value>> {
        let edges: Vec<Vec<Value>> = params.iter().map(|ty| self.edge_values(ty)).collect();
        (0..trials)
            .map(|trial| {
                params
                    .iter()
                    .zip(&edges)
                    .map(|(ty, edges)| match edges.get(trial) {
                        Some(edge) => edge.clone(),
                        None => self.random_value(ty),
                    })
                    .collect()
            })
            .collect()
    }
}

/// Structural size and numeric magnitude of a value
fn weight(value: &Value) -> (usize, f64) {
    match value {
        Value::Null => (0, 0.0),
        Value::Bool(b) => (0, f64::from(u8::from(*b))),
        Value::Number(n) => (0, n.as_f64().map_or(f64::MAX, f64::abs)),
        Value::String(s) => (s.chars().count(), 0.0),
        Value::Array(items) => items.iter().map(weight).fold((items.len(), 0.0), |acc, w| {
            (acc.0 + w.0, acc.1 + w.1)
        }),
        Value::Object(map) => (map.len(), 0.0),
    }
}

/// Total order used to put the smallest counter-example first
pub(crate) fn compare_inputs(a: &[Value], b: &[Value]) -> Ordering {
    let total = |input: &[Value]| {
        input
            .iter()
            .map(weight)
            .fold((0usize, 0.0f64), |acc, w| (acc.0 + w.0, acc.1 + w.1))
    };
    let (size_a, mag_a) = total(a);
    let (size_b, mag_b) = total(b);
    size_a
        .cmp(&size_b)
        .then_with(|| mag_a.total_cmp(&mag_b))
        .then_with(|| {
            let render = |input: &[Value]| serde_json::to_string(input).unwrap_or_default();
            render(a).cmp(&render(b))
        })
}
