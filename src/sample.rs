use serde::{Deserialize, Serialize};

/// One parsed sensor reading. `timestamp` is seconds since the first sample
/// of the current reader run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub value: i64,
}

impl Sample {
    pub fn new(timestamp: f64, value: i64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(f64, i64)> for Sample {
    fn from(v: (f64, i64)) -> Self {
        Sample {
            timestamp: v.0,
            value: v.1,
        }
    }
}

impl From<Sample> for (f64, i64) {
    fn from(s: Sample) -> Self {
        (s.timestamp, s.value)
    }
}

/// Parses one line of sensor output. The device sends a single decimal
/// integer per line; surrounding whitespace is ignored.
pub fn parse_line(line: &str) -> Option<i64> {
    line.trim().parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_padded_integers() {
        assert_eq!(parse_line("512"), Some(512));
        assert_eq!(parse_line("  87\r\n"), Some(87));
        assert_eq!(parse_line("-3"), Some(-3));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("\r\n"), None);
        assert_eq!(parse_line("12.5"), None);
        assert_eq!(parse_line("ok"), None);
    }

    #[test]
    fn tuple_conversions() {
        let s: Sample = (1.5, 42).into();
        assert_eq!(s, Sample::new(1.5, 42));
        let t: (f64, i64) = s.into();
        assert_eq!(t, (1.5, 42));
    }
}
