use anyhow::Context;
use bigdecimal::BigDecimal;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Value is a point of the one-dimensional key space: an arbitrary precision decimal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(BigDecimal);

impl Value {
    /// Parses a decimal literal such as `"12"`, `"-0.5"` or `"1e300"`.
    pub fn parse(s: &str) -> anyhow::Result<Value> {
        let decimal =
            BigDecimal::from_str(s).with_context(|| format!("invalid decimal value {:?}", s))?;
        Ok(Value(decimal))
    }

    pub fn from_i64(v: i64) -> Value {
        Value(BigDecimal::from(v))
    }

    pub fn as_decimal(&self) -> &BigDecimal {
        &self.0
    }

    /// Approximate wire size: the decimal literal's length.
    pub fn size_bytes(&self) -> usize {
        self.0.to_string().len()
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::from_i64(v)
    }
}

impl From<BigDecimal> for Value {
    fn from(v: BigDecimal) -> Self {
        Value(v)
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
