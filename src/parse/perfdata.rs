//! Turns a tokenized check result into metric points.

use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};
use tracing::{debug, error, info, warn};

use perfflux_types::MetricPoint;

use super::range::{normalize_number, Threshold};
use super::sanitize::sanitize;
use super::tokenizer::RawRecord;
use super::ParseError;
use crate::downtime::DowntimeLookup;

/// `label=value[unit];warn;crit;min;max`, repeated.
static PERFDATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([^=]+)=(U|-?[\d.,]*\d[\d.,]*)([\pL/%]*);?([\d\.,\-:~@]+)?;?([\d\.,\-:~@]+)?;?(-?[\d.,]*\d[\d.,]*)?;?(-?[\d.,]*\d[\d.,]*)?;?\s*",
    )
    .expect("valid perfdata pattern")
});

/// A trailing `[command]` in the perfdata overrides the check command.
static ALT_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".*\[(.*)\]\s?$").expect("valid command pattern"));

/// Reserved record key holding custom tags (`key=value key=value`).
pub const CUSTOM_TAG_KEY: &str = "PERFFLUX:TAG";
/// Reserved record key holding custom numeric fields.
pub const CUSTOM_FIELD_KEY: &str = "PERFFLUX:FIELD";

const UNKNOWN_VALUE: &str = "U";

/// Whether a record describes a host or a service check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Host,
    Service,
}

impl CheckKind {
    pub fn from_record(record: &RawRecord) -> Option<Self> {
        match record.get("DATATYPE").map(|s| s.trim()) {
            Some("HOSTPERFDATA") => Some(CheckKind::Host),
            Some("SERVICEPERFDATA") => Some(CheckKind::Service),
            _ => None,
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            CheckKind::Host => "HOST",
            CheckKind::Service => "SERVICE",
        }
    }
}

/// Numeric slot a capture group feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Value,
    Warn,
    Crit,
    Min,
    Max,
}

impl Slot {
    /// Capture groups that carry numbers, in output order. Group 3 is the
    /// unit.
    const GROUPS: [usize; 5] = [2, 4, 5, 6, 7];

    fn from_group(index: usize) -> Option<Self> {
        match index {
            2 => Some(Slot::Value),
            4 => Some(Slot::Warn),
            5 => Some(Slot::Crit),
            6 => Some(Slot::Min),
            7 => Some(Slot::Max),
            _ => None,
        }
    }
}

/// Parser for perfdata records.
///
/// Stateless apart from the optional downtime lookup, so one instance can
/// be shared by every worker.
#[derive(Clone, Default)]
pub struct PerfdataParser {
    downtime: Option<Arc<dyn DowntimeLookup>>,
}

impl std::fmt::Debug for PerfdataParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfdataParser")
            .field("downtime", &self.downtime.is_some())
            .finish()
    }
}

impl PerfdataParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag `value` fields with `downtime=1` using this lookup.
    pub fn with_downtime(mut self, lookup: Arc<dyn DowntimeLookup>) -> Self {
        self.downtime = Some(lookup);
        self
    }

    /// Parse a record, logging and skipping it when it is malformed.
    pub fn points(&self, record: &RawRecord) -> Vec<MetricPoint> {
        match self.parse(record) {
            Ok(points) => points,
            Err(e) => {
                warn!(error = %e, "Skipping perfdata record");
                Vec::new()
            }
        }
    }

    /// Parse a record into one point per performance label.
    ///
    /// Records that are not host or service perfdata give no points.
    pub fn parse(&self, record: &RawRecord) -> Result<Vec<MetricPoint>, ParseError> {
        let Some(kind) = CheckKind::from_record(record) else {
            if record.len() > 1 {
                info!(
                    datatype = record.get("DATATYPE").map(String::as_str).unwrap_or(""),
                    "Ignoring record without host or service perfdata"
                );
            }
            return Ok(Vec::new());
        };

        let prefix = kind.prefix();
        let field = |name: &str| {
            record
                .get(&format!("{}{}", prefix, name))
                .map(String::as_str)
                .unwrap_or("")
        };

        let time_ms = parse_time(record.get("TIMET").map(String::as_str).unwrap_or(""))?;
        let hostname = sanitize(record.get("HOSTNAME").map(String::as_str).unwrap_or(""));
        let service = match kind {
            CheckKind::Host => String::new(),
            CheckKind::Service => {
                sanitize(record.get("SERVICEDESC").map(String::as_str).unwrap_or(""))
            }
        };

        let mut perfdata = field("PERFDATA");
        let mut command = command_name(field("CHECKCOMMAND"));
        if let Some(alt) = ALT_COMMAND.captures(perfdata).and_then(|c| c.get(1)) {
            command = command_name(alt.as_str());
            perfdata = perfdata[..alt.start() - 1].trim_end();
        }

        let template = MetricPoint::builder()
            .hostname(hostname)
            .service(service)
            .command(command)
            .time_ms(time_ms)
            .build();

        let mut points: Vec<MetricPoint> = Vec::new();
        for caps in PERFDATA.captures_iter(perfdata) {
            let label = sanitize(&caps[1]);
            if label.is_empty() {
                continue;
            }

            let index = match points.iter().position(|p| p.label == label) {
                Some(index) => index,
                None => {
                    let mut point = template.clone();
                    point.label = label;
                    points.push(point);
                    points.len() - 1
                }
            };
            self.fill_point(&mut points[index], &caps);
        }

        let custom_tags = key_values(record.get(CUSTOM_TAG_KEY));
        let custom_fields: Vec<(String, String)> = key_values(record.get(CUSTOM_FIELD_KEY))
            .into_iter()
            .filter_map(|(key, value)| {
                let number = normalize_number(&value);
                let numeric = value.contains(|c: char| c.is_ascii_digit());
                if numeric && number.parse::<f64>().is_ok() {
                    Some((key, number))
                } else {
                    debug!(field = %key, value = %value, "Skipping non-numeric custom field");
                    None
                }
            })
            .collect();
        points.retain(|p| !p.fields.is_empty());
        for point in &mut points {
            for (key, value) in &custom_tags {
                point.tags.insert(key.clone(), value.clone());
            }
            for (key, value) in &custom_fields {
                point.fields.insert(key.clone(), value.clone());
            }
        }

        Ok(points)
    }

    fn fill_point(&self, point: &mut MetricPoint, caps: &Captures<'_>) {
        if let Some(unit) = caps.get(3) {
            if !unit.as_str().is_empty() {
                point.unit = unit.as_str().to_string();
            }
        }

        for group in Slot::GROUPS {
            let Some(raw) = caps.get(group).map(|m| m.as_str()) else {
                continue;
            };
            let Some(slot) = Slot::from_group(group) else {
                error!(group, "Perfdata capture group has no field mapping");
                continue;
            };

            match slot {
                Slot::Value => {
                    if raw == UNKNOWN_VALUE {
                        continue;
                    }
                    point
                        .fields
                        .insert("value".to_string(), normalize_number(raw));
                    if self.in_downtime(point) {
                        point.tags.insert("downtime".to_string(), "1".to_string());
                    }
                }
                Slot::Warn | Slot::Crit => {
                    let kind = if slot == Slot::Warn { "warn" } else { "crit" };
                    match Threshold::resolve(raw) {
                        Ok(threshold) => threshold.apply(kind, &mut point.fields, &mut point.tags),
                        Err(hits) => warn!(
                            label = %point.label,
                            threshold = kind,
                            raw,
                            ?hits,
                            "Threshold must contain one or two numbers"
                        ),
                    }
                }
                Slot::Min => {
                    point.fields.insert("min".to_string(), normalize_number(raw));
                }
                Slot::Max => {
                    point.fields.insert("max".to_string(), normalize_number(raw));
                }
            }
        }
    }

    fn in_downtime(&self, point: &MetricPoint) -> bool {
        self.downtime.as_ref().is_some_and(|lookup| {
            lookup.in_downtime(&point.hostname, &point.service, point.time_secs())
        })
    }
}

/// Seconds to milliseconds by appending three zeros.
fn parse_time(timet: &str) -> Result<u64, ParseError> {
    let timet = timet.trim();
    format!("{}000", timet)
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidTime(timet.to_string()))
}

/// Check command without its `!`-separated arguments.
fn command_name(raw: &str) -> String {
    sanitize(raw.split('!').next().unwrap_or(""))
}

/// `key=value key=value` pairs of the custom tag and field keys.
fn key_values(raw: Option<&String>) -> Vec<(String, String)> {
    raw.map(|raw| {
        raw.split_whitespace()
            .filter_map(|pair| pair.split_once('='))
            .filter(|(key, value)| !key.is_empty() && !value.is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::tokenize;
    use std::collections::BTreeMap;

    fn service_line(perfdata: &str) -> String {
        format!(
            "DATATYPE::SERVICEPERFDATA\tTIMET::1441791000\tHOSTNAME::xxx\tSERVICEDESC::range\t\
             SERVICEPERFDATA::{}\tSERVICECHECKCOMMAND::check_ranges!-w 3: -c 4:",
            perfdata
        )
    }

    fn parse(line: &str) -> Vec<MetricPoint> {
        PerfdataParser::new()
            .parse(&tokenize(line, "\t", "::"))
            .unwrap()
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    struct Always(u64);

    impl DowntimeLookup for Always {
        fn in_downtime(&self, host: &str, service: &str, time_secs: u64) -> bool {
            host == "xxx" && service == "range" && self.0 <= time_secs
        }
    }

    #[test]
    fn plain_value() {
        let points = parse(&service_line("a used=4"));
        assert_eq!(points.len(), 1);

        let point = &points[0];
        assert_eq!(point.hostname, "xxx");
        assert_eq!(point.service, "range");
        assert_eq!(point.command, "check_ranges");
        assert_eq!(point.label, "a used");
        assert_eq!(point.time_ms, 1_441_791_000_000);
        assert_eq!(point.fields, map(&[("value", "4.0")]));
        assert!(point.tags.is_empty());
    }

    #[test]
    fn outer_ranges() {
        let points = parse(&service_line("a used=4;2:4;8:10;1;4"));
        assert_eq!(points.len(), 1);
        assert_eq!(
            points[0].fields,
            map(&[
                ("value", "4.0"),
                ("warn-min", "2.0"),
                ("warn-max", "4.0"),
                ("crit-min", "8.0"),
                ("crit-max", "10.0"),
                ("min", "1.0"),
                ("max", "4.0"),
            ])
        );
        assert_eq!(
            points[0].tags,
            map(&[("warn-fill", "outer"), ("crit-fill", "outer")])
        );
    }

    #[test]
    fn inner_ranges() {
        let points = parse(&service_line("a used=4;@2:4;@8:10;1;4"));
        assert_eq!(points[0].fields["warn-min"], "2.0");
        assert_eq!(points[0].fields["crit-max"], "10.0");
        assert_eq!(
            points[0].tags,
            map(&[("warn-fill", "inner"), ("crit-fill", "inner")])
        );
    }

    #[test]
    fn other_datatypes_give_nothing() {
        let line = "DATATYPE::HOSTCHECK\tTIMET::1441791000\tHOSTNAME::xxx\tHOSTPERFDATA::a=1";
        assert!(parse(line).is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn empty_separator_gives_nothing() {
        let record = tokenize(&service_line("a used=4"), "", "::");
        assert!(PerfdataParser::new().parse(&record).unwrap().is_empty());
    }

    #[test]
    fn simple_thresholds_and_units() {
        let points = parse(&service_line("rta=0.5ms;100;500;0 pl=0%;20;60;0;100"));
        assert_eq!(points.len(), 2);

        let rta = &points[0];
        assert_eq!(rta.label, "rta");
        assert_eq!(rta.unit, "ms");
        assert_eq!(
            rta.fields,
            map(&[("value", "0.5"), ("warn", "100.0"), ("crit", "500.0"), ("min", "0.0")])
        );
        assert_eq!(rta.tags, map(&[("warn-fill", "none"), ("crit-fill", "none")]));

        let pl = &points[1];
        assert_eq!(pl.unit, "%");
        assert_eq!(pl.fields["max"], "100.0");
    }

    #[test]
    fn host_perfdata() {
        let line = "DATATYPE::HOSTPERFDATA\tTIMET::1441791000\tHOSTNAME::web01\t\
                    HOSTPERFDATA::rta=1.2ms\tHOSTCHECKCOMMAND::check-host-alive!3000";
        let points = parse(line);
        assert_eq!(points.len(), 1);
        assert!(points[0].is_host_point());
        assert_eq!(points[0].command, "check-host-alive");
    }

    #[test]
    fn bracketed_command_override() {
        let points = parse(&service_line("a used=4 [check_other!arg]"));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].command, "check_other");
        assert_eq!(points[0].fields, map(&[("value", "4.0")]));
    }

    #[test]
    fn quoted_labels_and_unknown_values() {
        let points = parse(&service_line("'/var used'=U;80;90 'load'=1,5"));
        // The first label has thresholds, so it survives without a value.
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label, "/var used");
        assert!(points[0].field("value").is_none());
        assert_eq!(points[0].field("warn"), Some("80.0"));
        assert_eq!(points[1].label, "load");
        assert_eq!(points[1].field("value"), Some("1.5"));
    }

    #[test]
    fn unknown_value_alone_is_dropped() {
        assert!(parse(&service_line("a=U")).is_empty());
    }

    #[test]
    fn repeated_label_merges() {
        let points = parse(&service_line("a=1 a=2;5"));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].fields, map(&[("value", "2.0"), ("warn", "5.0")]));
    }

    #[test]
    fn bad_threshold_is_skipped() {
        let points = parse(&service_line("a=1;1:2:3;4"));
        assert_eq!(points[0].fields, map(&[("value", "1.0"), ("crit", "4.0")]));
        assert!(points[0].tag("warn-fill").is_none());
    }

    #[test]
    fn invalid_time_is_an_error() {
        let line = service_line("a=1").replace("1441791000", "soon");
        let record = tokenize(&line, "\t", "::");
        let parser = PerfdataParser::new();
        assert!(matches!(
            parser.parse(&record),
            Err(ParseError::InvalidTime(t)) if t == "soon"
        ));
        assert!(parser.points(&record).is_empty());
    }

    #[test]
    fn custom_tags_and_fields() {
        let line = format!(
            "{}\t{}::env=prod team=ops\t{}::weight=2",
            service_line("a=1"),
            CUSTOM_TAG_KEY,
            CUSTOM_FIELD_KEY
        );
        let points = parse(&line);
        assert_eq!(points[0].tag("env"), Some("prod"));
        assert_eq!(points[0].tag("team"), Some("ops"));
        assert_eq!(points[0].field("weight"), Some("2.0"));
    }

    #[test]
    fn non_numeric_custom_fields_are_skipped() {
        let line = format!(
            "{}\t{}::weight=abc ratio=0,5 size=-",
            service_line("a=1"),
            CUSTOM_FIELD_KEY
        );
        let points = parse(&line);
        assert_eq!(
            points[0].fields,
            map(&[("value", "1.0"), ("ratio", "0.5")])
        );
    }

    #[test]
    fn values_need_a_digit() {
        assert!(parse(&service_line("a=-")).is_empty());
        assert!(parse(&service_line("a=.")).is_empty());

        let points = parse(&service_line("a=-.5;;;0;1"));
        assert_eq!(
            points[0].fields,
            map(&[("value", "-.5"), ("min", "0.0"), ("max", "1.0")])
        );
    }

    #[test]
    fn downtime_tag_on_value() {
        let record = tokenize(&service_line("a=1;2"), "\t", "::");

        let parser = PerfdataParser::new().with_downtime(Arc::new(Always(1_441_791_000)));
        let points = parser.parse(&record).unwrap();
        assert_eq!(points[0].tag("downtime"), Some("1"));

        let parser = PerfdataParser::new().with_downtime(Arc::new(Always(1_441_791_001)));
        let points = parser.parse(&record).unwrap();
        assert!(points[0].tag("downtime").is_none());
    }
}
