use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::config::BrowserDescriptor;

/// One normalized test outcome harvested from a loaded page.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl TestResult {
    fn from_value(value: &Value) -> Self {
        Self {
            name: string_field(value, "name").unwrap_or_else(|| "Unnamed test".to_string()),
            result: value.get("result").and_then(Value::as_bool).unwrap_or(false),
            message: string_field(value, "message"),
            duration: value.get("duration").and_then(Value::as_u64),
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Aggregated outcome for one or more visited URLs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuiteResult {
    pub passed: u64,
    pub failed: u64,
    pub total: u64,
    pub duration: u64,
    pub tests: Vec<TestResult>,
}

impl SuiteResult {
    /// Normalizes the loosely shaped results object a test page publishes.
    /// A bare boolean counts as a single pass or fail; anything that is not
    /// an object contributes nothing. An explicit `total` is passed through
    /// even when it disagrees with `passed + failed`.
    pub fn from_value(value: &Value, default_duration: u64) -> Self {
        if let Value::Bool(passed) = value {
            return Self {
                passed: u64::from(*passed),
                failed: u64::from(!*passed),
                total: 1,
                duration: default_duration,
                tests: Vec::new(),
            };
        }
        let Value::Object(map) = value else {
            return Self {
                duration: default_duration,
                ..Self::default()
            };
        };
        let passed = map.get("passed").and_then(Value::as_u64).unwrap_or(0);
        let failed = map.get("failed").and_then(Value::as_u64).unwrap_or(0);
        Self {
            passed,
            failed,
            total: map
                .get("total")
                .and_then(Value::as_u64)
                .unwrap_or(passed + failed),
            duration: map
                .get("duration")
                .and_then(Value::as_u64)
                .unwrap_or(default_duration),
            tests: map
                .get("tests")
                .and_then(Value::as_array)
                .map(|entries| entries.iter().map(TestResult::from_value).collect())
                .unwrap_or_default(),
        }
    }

    /// The failure report used when a browser run dies before producing a
    /// score of its own.
    pub fn from_failure(message: impl Into<String>) -> Self {
        Self {
            passed: 0,
            failed: 1,
            total: 1,
            duration: 0,
            tests: vec![TestResult {
                name: "browser run".to_string(),
                result: false,
                message: Some(message.into()),
                duration: None,
            }],
        }
    }

    /// In-place merge: sums the counters, concatenates the test lists.
    pub fn add(&mut self, other: SuiteResult) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.total += other.total;
        self.duration += other.duration;
        self.tests.extend(other.tests);
    }

    pub fn combine<I>(results: I) -> SuiteResult
    where
        I: IntoIterator<Item = SuiteResult>,
    {
        let mut out = SuiteResult::default();
        for result in results {
            out.add(result);
        }
        out
    }

    /// Logs this browser's report as soon as it finishes, independent of the
    /// other browsers' progress.
    pub fn report(&self, browser: &BrowserDescriptor) {
        let readable = browser.readable();
        if self.total == 0 {
            info!(browser = %readable, "completed");
        } else if self.failed == 0 {
            info!(browser = %readable, passed = self.passed, total = self.total, "passed");
        } else {
            let lines: Vec<String> = self
                .tests
                .iter()
                .map(|test| match &test.message {
                    Some(message) => format!("{}\n    > {}", test.name.trim(), message),
                    None => test.name.trim().to_string(),
                })
                .collect();
            error!(
                browser = %readable,
                failures = self.failed,
                report = %lines.join("\n  * "),
                "failures"
            );
        }
    }
}

/// The final outcome of a run: one suite result per browser, in the order
/// the browsers were configured.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserResults {
    entries: Vec<(BrowserDescriptor, SuiteResult)>,
}

impl BrowserResults {
    pub fn new(entries: Vec<(BrowserDescriptor, SuiteResult)>) -> Self {
        Self { entries }
    }

    /// True iff every browser finished with a zero failure counter.
    pub fn passed(&self) -> bool {
        self.entries.iter().all(|(_, suite)| suite.failed == 0)
    }

    pub fn entries(&self) -> &[(BrowserDescriptor, SuiteResult)] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn counts_round_trip() {
        let suite = SuiteResult::from_value(&json!({ "passed": 2, "failed": 1 }), 0);
        assert_eq!(suite.total, 3);

        let passed = SuiteResult::from_value(&json!(true), 7);
        assert_eq!((passed.passed, passed.failed, passed.total), (1, 0, 1));
        assert_eq!(passed.duration, 7);

        let failed = SuiteResult::from_value(&json!(false), 0);
        assert_eq!((failed.passed, failed.failed, failed.total), (0, 1, 1));
    }

    #[test]
    fn inconsistent_total_is_passed_through() {
        let suite = SuiteResult::from_value(&json!({ "passed": 2, "failed": 1, "total": 9 }), 0);
        assert_eq!(suite.total, 9);
    }

    #[test]
    fn non_object_values_score_nothing() {
        let suite = SuiteResult::from_value(&json!("garbage"), 42);
        assert_eq!((suite.passed, suite.failed, suite.total), (0, 0, 0));
        assert_eq!(suite.duration, 42);
        assert!(suite.tests.is_empty());

        let null = SuiteResult::from_value(&Value::Null, 0);
        assert_eq!(null.total, 0);
    }

    #[test]
    fn tests_are_normalized() {
        let suite = SuiteResult::from_value(
            &json!({
                "passed": 1,
                "failed": 1,
                "tests": [
                    { "name": "adds", "result": true, "duration": 12 },
                    { "message": "expected 2, got 3" },
                ],
            }),
            0,
        );
        assert_eq!(suite.tests.len(), 2);
        assert_eq!(suite.tests[0].name, "adds");
        assert!(suite.tests[0].result);
        assert_eq!(suite.tests[1].name, "Unnamed test");
        assert!(!suite.tests[1].result);
        assert_eq!(suite.tests[1].message.as_deref(), Some("expected 2, got 3"));
    }

    #[test]
    fn combine_is_order_independent_for_counters() {
        let a = SuiteResult::from_value(&json!({ "passed": 1, "failed": 0, "duration": 5 }), 0);
        let b = SuiteResult::from_value(&json!({ "passed": 2, "failed": 1, "duration": 7 }), 0);
        let c = SuiteResult::from_value(&json!(true), 3);

        let abc = SuiteResult::combine([a.clone(), b.clone(), c.clone()]);
        let cab = SuiteResult::combine([c, a, b]);
        assert_eq!(abc.passed, cab.passed);
        assert_eq!(abc.failed, cab.failed);
        assert_eq!(abc.total, cab.total);
        assert_eq!(abc.duration, cab.duration);
    }

    #[test]
    fn browser_results_pass_only_when_no_failures() {
        let chrome = BrowserDescriptor {
            browser_name: Some("chrome".to_string()),
            ..BrowserDescriptor::default()
        };
        let firefox = BrowserDescriptor {
            browser_name: Some("firefox".to_string()),
            ..BrowserDescriptor::default()
        };

        let green = BrowserResults::new(vec![
            (chrome.clone(), SuiteResult::from_value(&json!(true), 0)),
            (firefox.clone(), SuiteResult::default()),
        ]);
        assert!(green.passed());

        let red = BrowserResults::new(vec![
            (chrome, SuiteResult::from_value(&json!(true), 0)),
            (firefox, SuiteResult::from_failure("boom")),
        ]);
        assert!(!red.passed());
    }
}
