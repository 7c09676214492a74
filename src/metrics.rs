//! Per-request metrics lines.
//!
//! One line is emitted per completed request:
//!
//! ```text
//! seq N: rws rwe rrs rre sws swe srs sre +/- lower upper
//! ```
//!
//! where the first four timestamps describe the request leg and the next
//! four the response leg. Downstream aggregation parses this grammar.

use crate::client::slots::Leg;
use crate::clock::{now_micros, OffsetBounds};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsLine {
    pub seq: u64,
    pub request: Leg,
    pub response: Leg,
    pub lower: i64,
    pub upper: i64,
}

impl MetricsLine {
    pub fn new(seq: u64, request: Leg, response: Leg, bounds: OffsetBounds) -> Self {
        Self {
            seq,
            request,
            response,
            lower: bounds.lower(),
            upper: bounds.upper(),
        }
    }

    /// Local round trip, from the start of the request write to the end of
    /// the response read.
    pub fn round_trip(&self) -> u64 {
        self.response.read_end.saturating_sub(self.request.write_start)
    }
}

impl fmt::Display for MetricsLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq {}: {} {} {} {} {} {} {} {} +/- {} {}",
            self.seq,
            self.request.write_start,
            self.request.write_end,
            self.request.read_start,
            self.request.read_end,
            self.response.write_start,
            self.response.write_end,
            self.response.read_start,
            self.response.read_end,
            self.lower,
            self.upper
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMetricsError(String);

impl fmt::Display for ParseMetricsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed metrics line: {}", self.0)
    }
}

impl std::error::Error for ParseMetricsError {}

impl FromStr for MetricsLine {
    type Err = ParseMetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |what: &str| ParseMetricsError(what.to_string());

        let rest = s.trim().strip_prefix("seq ").ok_or_else(|| err("missing seq"))?;
        let (seq, rest) = rest.split_once(':').ok_or_else(|| err("missing ':'"))?;
        let seq = seq.trim().parse().map_err(|_| err("bad seq"))?;
        let (stamps, offsets) = rest.split_once("+/-").ok_or_else(|| err("missing '+/-'"))?;

        let stamps = stamps
            .split_whitespace()
            .map(u64::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| err("bad timestamp"))?;
        let offsets = offsets
            .split_whitespace()
            .map(i64::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| err("bad offset"))?;

        match (stamps.as_slice(), offsets.as_slice()) {
            ([rws, rwe, rrs, rre, sws, swe, srs, sre], [lower, upper]) => Ok(Self {
                seq,
                request: Leg {
                    write_start: *rws,
                    write_end: *rwe,
                    read_start: *rrs,
                    read_end: *rre,
                },
                response: Leg {
                    write_start: *sws,
                    write_end: *swe,
                    read_start: *srs,
                    read_end: *sre,
                },
                lower: *lower,
                upper: *upper,
            }),
            _ => Err(err("wrong number of fields")),
        }
    }
}

/// Destination for completed metrics lines.
pub trait MetricsSink {
    fn record(&mut self, line: &MetricsLine) -> io::Result<()>;
}

impl MetricsSink for Vec<MetricsLine> {
    fn record(&mut self, line: &MetricsLine) -> io::Result<()> {
        self.push(*line);
        Ok(())
    }
}

/// Writes each line to stdout and, if configured, appends it to a file.
///
/// Lines are prefixed with the emission time and a role label, e.g.
/// `1700000000000000 client: seq 1: ...`.
pub struct LineWriter {
    label: &'static str,
    file: Option<File>,
}

impl LineWriter {
    pub fn new(label: &'static str, file: Option<File>) -> Self {
        Self { label, file }
    }
}

impl MetricsSink for LineWriter {
    fn record(&mut self, line: &MetricsLine) -> io::Result<()> {
        let text = format!("{} {}: {}\n", now_micros(), self.label, line);
        let mut stdout = io::stdout().lock();
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(text.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricsLine {
        MetricsLine {
            seq: 3,
            request: Leg {
                write_start: 100,
                write_end: 101,
                read_start: 150,
                read_end: 151,
            },
            response: Leg {
                write_start: 160,
                write_end: 161,
                read_start: 210,
                read_end: 212,
            },
            lower: -40,
            upper: 55,
        }
    }

    #[test]
    fn test_display_format() {
        assert_eq!(
            sample().to_string(),
            "seq 3: 100 101 150 151 160 161 210 212 +/- -40 55"
        );
    }

    #[test]
    fn test_parse_display_output() {
        let line = sample();
        assert_eq!(line.to_string().parse::<MetricsLine>().unwrap(), line);
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!("seq 3: 1 2 3 +/- 0 0".parse::<MetricsLine>().is_err());
        assert!("seq 3: 1 2 3 4 5 6 7 8 0 0".parse::<MetricsLine>().is_err());
        assert!("3: 1 2 3 4 5 6 7 8 +/- 0 0".parse::<MetricsLine>().is_err());
    }

    #[test]
    fn test_round_trip() {
        assert_eq!(sample().round_trip(), 112);
    }

    #[test]
    fn test_vec_sink_collects() {
        let mut sink: Vec<MetricsLine> = Vec::new();
        sink.record(&sample()).unwrap();
        assert_eq!(sink, vec![sample()]);
    }
}
