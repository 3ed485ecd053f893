use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use indexmap::IndexMap;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters escaped in classnames, labels and string values.
///
/// Everything outside `[A-Za-z0-9._~-]` is percent-encoded. A space becomes
/// `%20` directly: since Warp10 2.3.0 the sink no longer decodes `+` back to
/// a space, so `+` must never stand for one.
const SENSISION: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_MILLI: i64 = 1_000_000;

/// Typed sample value. OpenTSDB payloads may carry anything JSON allows,
/// hence the `Other` escape hatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Other(serde_json::Value),
}

impl Value {
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(boolean) => Value::Bool(boolean),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(integer) => Value::Int(integer),
                None => Value::Float(number.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(string) => Value::Str(string),
            other => Value::Other(other),
        }
    }
}

/// One timestamped, named, labelled sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Microseconds since epoch. NaN means "no timestamp".
    pub ts: f64,
    pub name: String,
    pub labels: IndexMap<String, String>,
    pub value: Value,
}

impl Point {
    /// Serialize to one line of the sink input format:
    /// `TS// NAME{LABELS} VALUE\r\n`.
    ///
    /// The `//` separator stands for the (unused) lat:lon/elev part of the
    /// full sink syntax and must be kept as is.
    pub fn encode(&self) -> Bytes {
        let mut line = String::new();

        if !self.ts.is_nan() {
            let _ = write!(line, "{}", self.ts as i64);
        }

        let _ = write!(line, "// {}{{", utf8_percent_encode(&self.name, SENSISION));

        let mut sep = "";
        for (key, value) in &self.labels {
            let _ = write!(
                line,
                "{sep}{}={}",
                utf8_percent_encode(key, SENSISION),
                utf8_percent_encode(value, SENSISION)
            );
            sep = ",";
        }
        line.push_str("} ");

        match &self.value {
            Value::Bool(true) => line.push('T'),
            Value::Bool(false) => line.push('F'),
            Value::Int(integer) => {
                let _ = write!(line, "{integer}");
            }
            Value::Float(float) => {
                let _ = write!(line, "{float:.6}");
            }
            Value::Str(string) => {
                let _ = write!(line, "'{}'", utf8_percent_encode(string, SENSISION));
            }
            Value::Other(other) => {
                let _ = write!(line, "{}", utf8_percent_encode(&other.to_string(), SENSISION));
            }
        }
        line.push_str("\r\n");

        Bytes::from(line)
    }
}

/// Convert an epoch number expressed either in seconds or milliseconds into
/// microseconds. Zero means "now". Values below 2^32 are seconds: in
/// milliseconds that would still be February 1970.
pub fn epoch_micros(timestamp: i64) -> f64 {
    if timestamp == 0 {
        return now_micros();
    }

    let nanos = if timestamp < 1_i64 << 32 {
        timestamp.saturating_mul(NANOS_PER_SEC)
    } else {
        timestamp.saturating_mul(NANOS_PER_MILLI)
    };

    (nanos / 1_000) as f64
}

pub fn now_micros() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as f64)
        .unwrap_or(0.0)
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn encode(point: &Point) -> String {
        String::from_utf8(point.encode().to_vec()).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[rstest]
    #[case(Value::Float(0.5), "0.500000")]
    #[case(Value::Float(82.0), "82.000000")]
    #[case(Value::Int(42), "42")]
    #[case(Value::Int(-7), "-7")]
    #[case(Value::Bool(true), "T")]
    #[case(Value::Bool(false), "F")]
    #[case(Value::Str("up".to_owned()), "'up'")]
    fn value_rendering(#[case] value: Value, #[case] expected: &str) {
        let point = Point {
            ts: 1_700_000_000_000_000.0,
            name: "cpu.load".to_owned(),
            labels: IndexMap::new(),
            value,
        };
        assert_eq!(encode(&point), format!("1700000000000000// cpu.load{{}} {expected}\r\n"));
    }

    #[test]
    fn name_labels_and_strings_are_url_encoded() {
        let point = Point {
            ts: 10.0,
            name: "cpu load".to_owned(),
            labels: labels(&[("host name", "a+b")]),
            value: Value::Str("hello world".to_owned()),
        };
        assert_eq!(encode(&point), "10// cpu%20load{host%20name=a%2Bb} 'hello%20world'\r\n");
    }

    #[test]
    fn labels_are_comma_separated_in_insertion_order() {
        let point = Point {
            ts: 1.0,
            name: "m".to_owned(),
            labels: labels(&[("0", "cpu"), ("1", "load"), ("dc", "gra")]),
            value: Value::Int(1),
        };
        assert_eq!(encode(&point), "1// m{0=cpu,1=load,dc=gra} 1\r\n");
    }

    #[test]
    fn nan_timestamp_is_omitted() {
        let point = Point {
            ts: f64::NAN,
            name: "m".to_owned(),
            labels: IndexMap::new(),
            value: Value::Int(1),
        };
        assert_eq!(encode(&point), "// m{} 1\r\n");
    }

    #[test]
    fn fractional_timestamp_keeps_integer_part() {
        let point = Point {
            ts: 1234.9,
            name: "m".to_owned(),
            labels: IndexMap::new(),
            value: Value::Int(1),
        };
        assert_eq!(encode(&point), "1234// m{} 1\r\n");
    }

    #[rstest]
    #[case(1, 1_000_000.0)]
    #[case(1_700_000_000, 1_700_000_000_000_000.0)]
    #[case(4_294_967_295, 4_294_967_295_000_000.0)]
    #[case(4_294_967_296, 4_294_967_296_000.0)]
    #[case(1_700_000_000_000, 1_700_000_000_000_000.0)]
    fn epoch_heuristic(#[case] input: i64, #[case] expected: f64) {
        assert_eq!(epoch_micros(input), expected);
    }

    #[test]
    fn epoch_zero_is_now() {
        let before = now_micros();
        let resolved = epoch_micros(0);
        let after = now_micros();
        assert!(resolved >= before && resolved <= after);
    }
}
