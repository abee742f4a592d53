use serde::Serialize;
use std::str::FromStr;

use crate::invoke::RawResult;

const STATUS_LINE: usize = 0;
const ELAPSED_LINE: usize = 1;
const ITERATIONS_LINE: usize = 2;

/// Parsed result of one solver invocation.
///
/// `elapsed` and `iterations` are only ever set on solved outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Outcome {
    pub solved: bool,
    pub elapsed: Option<f64>,
    pub iterations: Option<u64>,
}

impl Outcome {
    pub fn failed() -> Self {
        Self {
            solved: false,
            elapsed: None,
            iterations: None,
        }
    }

    pub fn solved(elapsed: Option<f64>, iterations: Option<u64>) -> Self {
        Self {
            solved: true,
            elapsed,
            iterations,
        }
    }
}

/// Interprets solver output: line 0 echoes the status, line 1 carries the
/// solve time in seconds, line 2 the iteration count.
pub fn parse_outcome(raw: &RawResult, success_exit_code: i32) -> Outcome {
    if raw.exit_code != success_exit_code {
        return Outcome::failed();
    }
    let lines = stdout_lines(&raw.stdout);
    let elapsed = line_field::<f64>(&lines, ELAPSED_LINE).filter(|t| t.is_finite() && *t >= 0.0);
    let iterations = line_field::<u64>(&lines, ITERATIONS_LINE);
    Outcome::solved(elapsed, iterations)
}

/// The status code the solver echoed on its first line, if any.
pub fn status_echo(raw: &RawResult) -> Option<i64> {
    line_field::<i64>(&stdout_lines(&raw.stdout), STATUS_LINE)
}

fn stdout_lines(stdout: &str) -> Vec<&str> {
    stdout.trim().lines().map(str::trim).collect()
}

fn line_field<T: FromStr>(lines: &[&str], idx: usize) -> Option<T> {
    lines.get(idx).and_then(|line| line.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(exit_code: i32, stdout: &str) -> RawResult {
        RawResult {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
            wall_time: Duration::from_millis(1),
        }
    }

    #[test]
    fn full_contract_yields_all_fields() {
        let outcome = parse_outcome(&raw(0, "0\n0.012345\n8812\n"), 0);
        assert_eq!(outcome, Outcome::solved(Some(0.012345), Some(8812)));
    }

    #[test]
    fn status_line_only_is_solved_without_fields() {
        let outcome = parse_outcome(&raw(0, "0"), 0);
        assert!(outcome.solved);
        assert_eq!(outcome.elapsed, None);
        assert_eq!(outcome.iterations, None);
    }

    #[test]
    fn failure_ignores_stdout() {
        let outcome = parse_outcome(&raw(1, "1\n0.5\n77\n"), 0);
        assert_eq!(outcome, Outcome::failed());
    }

    #[test]
    fn success_code_is_taken_from_configuration() {
        let out = "0\n1.5\n9\n";
        assert!(parse_outcome(&raw(1, out), 1).solved);
        assert!(!parse_outcome(&raw(0, out), 1).solved);
    }

    #[test]
    fn malformed_fields_degrade_individually() {
        let outcome = parse_outcome(&raw(0, "0\nfast\n12\n"), 0);
        assert_eq!(outcome, Outcome::solved(None, Some(12)));

        let outcome = parse_outcome(&raw(0, "0\n0.75\n12.5\n"), 0);
        assert_eq!(outcome, Outcome::solved(Some(0.75), None));

        let outcome = parse_outcome(&raw(0, "0\n-0.2\nNaN\n"), 0);
        assert_eq!(outcome, Outcome::solved(None, None));
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        let outcome = parse_outcome(&raw(0, "\n\n0\r\n 2.5 \r\n 31\r\n\n"), 0);
        assert_eq!(outcome, Outcome::solved(Some(2.5), Some(31)));
    }

    #[test]
    fn status_echo_reads_first_line() {
        assert_eq!(status_echo(&raw(0, "0\n0.1\n3\n")), Some(0));
        assert_eq!(status_echo(&raw(1, "1\n")), Some(1));
        assert_eq!(status_echo(&raw(0, "Solution:\n")), None);
        assert_eq!(status_echo(&raw(0, "")), None);
    }
}
