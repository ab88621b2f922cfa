//! Test report ingestor
//!
//! Parses a JUnit-style XML test report into normalized [`TestOutcome`]
//! records. The parser is tolerant by design: optional attributes may be
//! absent, a report with no test-suite element is a legitimate empty run,
//! and a test reported more than once (framework retries) keeps its
//! last-seen status. Only genuinely malformed XML is an error.

use crate::error::{AnamnesisError, Result};
use crate::types::{TestOutcome, TestStatus};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use tracing::debug;

/// Partially parsed testcase element
struct PendingCase {
    test_id: String,
    duration_ms: u64,
    explicit_status: Option<TestStatus>,
    child_status: Option<TestStatus>,
    failure_message: Option<String>,
    /// True while inside a failure/error child, so text nodes are captured
    in_failure_child: bool,
}

impl PendingCase {
    fn into_outcome(self, report_timestamp: DateTime<Utc>) -> TestOutcome {
        // Explicit status attribute wins; otherwise the failure/error/skipped
        // child decides; a bare testcase is a pass.
        let status = self
            .explicit_status
            .or(self.child_status)
            .unwrap_or(TestStatus::Pass);
        TestOutcome {
            test_id: self.test_id,
            status,
            duration_ms: self.duration_ms,
            failure_message: self.failure_message,
            report_timestamp,
        }
    }
}

/// Parse one JUnit-style XML report into test outcomes
///
/// `captured_at` stamps every outcome with the time the report was taken.
/// Returns an empty list when the document contains no test-suite element
/// (partial runs can legitimately report nothing). Malformed XML fails with
/// [`AnamnesisError::ReportParse`] carrying the byte offset of the fault.
pub fn parse_report(bytes: &[u8], captured_at: DateTime<Utc>) -> Result<Vec<TestOutcome>> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut saw_suite = false;
    let mut current: Option<PendingCase> = None;
    // Open-element depth; a document that ends mid-element is truncated
    let mut depth: usize = 0;

    // Last-seen status wins for duplicate test IDs
    let mut order: Vec<String> = Vec::new();
    let mut outcomes: HashMap<String, TestOutcome> = HashMap::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            AnamnesisError::ReportParse {
                position: reader.buffer_position() as u64,
                message: e.to_string(),
            }
        })?;

        match event {
            Event::Start(ref e) => {
                depth += 1;
                match e.local_name().as_ref() {
                    b"testsuite" | b"testsuites" => saw_suite = true,
                    b"testcase" => {
                        current = Some(begin_case(&reader, e)?);
                    }
                    b"failure" => {
                        if let Some(case) = current.as_mut() {
                            case.child_status = Some(TestStatus::Fail);
                            case.failure_message = attr(&reader, e, "message")?;
                            case.in_failure_child = true;
                        }
                    }
                    b"error" => {
                        if let Some(case) = current.as_mut() {
                            case.child_status = Some(TestStatus::Error);
                            case.failure_message = attr(&reader, e, "message")?;
                            case.in_failure_child = true;
                        }
                    }
                    b"skipped" => {
                        if let Some(case) = current.as_mut() {
                            case.child_status = Some(TestStatus::Skipped);
                            case.in_failure_child = true;
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(ref e) => match e.local_name().as_ref() {
                b"testsuite" | b"testsuites" => saw_suite = true,
                b"testcase" => {
                    let case = begin_case(&reader, e)?;
                    record(case.into_outcome(captured_at), &mut order, &mut outcomes);
                }
                b"failure" => {
                    if let Some(case) = current.as_mut() {
                        case.child_status = Some(TestStatus::Fail);
                        case.failure_message = attr(&reader, e, "message")?;
                    }
                }
                b"error" => {
                    if let Some(case) = current.as_mut() {
                        case.child_status = Some(TestStatus::Error);
                        case.failure_message = attr(&reader, e, "message")?;
                    }
                }
                b"skipped" => {
                    if let Some(case) = current.as_mut() {
                        case.child_status = Some(TestStatus::Skipped);
                    }
                }
                _ => {}
            },
            Event::Text(ref t) => {
                // Failure details are often in the element body, not the
                // message attribute
                if let Some(case) = current.as_mut() {
                    if case.in_failure_child && case.failure_message.is_none() {
                        let text = t.unescape().map_err(|e| AnamnesisError::ReportParse {
                            position: reader.buffer_position() as u64,
                            message: e.to_string(),
                        })?;
                        if !text.trim().is_empty() {
                            case.failure_message = Some(text.trim().to_string());
                        }
                    }
                }
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                match e.local_name().as_ref() {
                    b"testcase" => {
                        if let Some(case) = current.take() {
                            record(case.into_outcome(captured_at), &mut order, &mut outcomes);
                        }
                    }
                    b"failure" | b"error" | b"skipped" => {
                        if let Some(case) = current.as_mut() {
                            case.in_failure_child = false;
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => {
                if depth > 0 || current.is_some() {
                    return Err(AnamnesisError::ReportParse {
                        position: reader.buffer_position() as u64,
                        message: "unexpected end of document".to_string(),
                    });
                }
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    if !saw_suite {
        debug!("Report has no test-suite element; treating as empty run");
        return Ok(Vec::new());
    }

    Ok(order
        .into_iter()
        .filter_map(|id| outcomes.remove(&id))
        .collect())
}

/// Keep first-seen position but last-seen outcome for duplicate test IDs
fn record(
    outcome: TestOutcome,
    order: &mut Vec<String>,
    outcomes: &mut HashMap<String, TestOutcome>,
) {
    if !outcomes.contains_key(&outcome.test_id) {
        order.push(outcome.test_id.clone());
    }
    outcomes.insert(outcome.test_id.clone(), outcome);
}

/// Start parsing a testcase element from its attributes
fn begin_case(reader: &Reader<&[u8]>, e: &BytesStart<'_>) -> Result<PendingCase> {
    let name = attr(reader, e, "name")?.unwrap_or_default();
    let classname = attr(reader, e, "classname")?;

    let test_id = match classname {
        Some(class) if !class.is_empty() => format!("{}::{}", class, name),
        _ => name,
    };

    // `time` is seconds as a float per the JUnit convention; absent means 0
    let duration_ms = attr(reader, e, "time")?
        .and_then(|t| t.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round().max(0.0) as u64)
        .unwrap_or(0);

    let explicit_status = attr(reader, e, "status")?.and_then(|s| parse_status(&s));

    Ok(PendingCase {
        test_id,
        duration_ms,
        explicit_status,
        child_status: None,
        failure_message: None,
        in_failure_child: false,
    })
}

/// Read one attribute value, surfacing malformed attributes as parse errors
fn attr(reader: &Reader<&[u8]>, e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    let attribute = e
        .try_get_attribute(name)
        .map_err(|err| AnamnesisError::ReportParse {
            position: reader.buffer_position() as u64,
            message: err.to_string(),
        })?;

    match attribute {
        Some(a) => {
            let value = a
                .unescape_value()
                .map_err(|err| AnamnesisError::ReportParse {
                    position: reader.buffer_position() as u64,
                    message: err.to_string(),
                })?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

/// Map the textual status attribute values frameworks actually emit
fn parse_status(s: &str) -> Option<TestStatus> {
    match s.to_ascii_lowercase().as_str() {
        "pass" | "passed" | "success" | "ok" => Some(TestStatus::Pass),
        "fail" | "failed" | "failure" => Some(TestStatus::Fail),
        "error" => Some(TestStatus::Error),
        "skip" | "skipped" | "disabled" | "notrun" => Some(TestStatus::Skipped),
        _ => None,
    }
}
