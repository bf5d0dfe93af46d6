//! Progress extraction from compute log lines
//!
//! The compute process reports progress through well-known log formats.
//! All patterns live in one table so new formats are a one-line change.
//! Deltas are composed monotonically: a stale or repeated line never moves
//! progress backwards.

use regex::Regex;
use std::sync::OnceLock;

use super::Progress;

/// A parsed increment to a run's progress vector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressDelta {
    pub generation: Option<u64>,
    pub coverage: Option<f64>,
    pub qd_score: Option<f64>,
    pub best_fitness: Option<f64>,
    pub completion_percent: Option<f64>,
}

impl ProgressDelta {
    fn is_empty(&self) -> bool {
        *self == ProgressDelta::default()
    }
}

struct Patterns {
    generation: Regex,
    coverage_percentage: Regex,
    coverage_colon: Regex,
    qd_score: Regex,
    best_fitness: Regex,
    completed: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        generation: Regex::new(r"\bgeneration\s+(\d+)").unwrap(),
        coverage_percentage: Regex::new(r"coveragePercentage\s+([0-9]+(?:\.[0-9]+)?)").unwrap(),
        coverage_colon: Regex::new(r"Coverage:\s*([0-9]+(?:\.[0-9]+)?)%").unwrap(),
        qd_score: Regex::new(r"QD [Ss]core:\s*(-?[0-9]+(?:\.[0-9]+)?)").unwrap(),
        best_fitness: Regex::new(r"[Bb]est fitness:?\s*(-?[0-9]+(?:\.[0-9]+)?)").unwrap(),
        completed: Regex::new(r"%\s*completed:\s*([0-9]+(?:\.[0-9]+)?)").unwrap(),
    })
}

/// Stateless parser over single log lines
pub struct ProgressParser;

impl ProgressParser {
    /// Extract a progress delta from one log line, if it carries one
    pub fn parse(line: &str) -> Option<ProgressDelta> {
        let p = patterns();
        let mut delta = ProgressDelta::default();

        if let Some(c) = p.generation.captures(line) {
            delta.generation = c[1].parse().ok();
        }
        if let Some(c) = p.coverage_percentage.captures(line) {
            delta.coverage = c[1].parse::<f64>().ok().map(|v| v / 100.0);
        } else if let Some(c) = p.coverage_colon.captures(line) {
            delta.coverage = c[1].parse::<f64>().ok().map(|v| v / 100.0);
        }
        if let Some(c) = p.qd_score.captures(line) {
            delta.qd_score = c[1].parse().ok();
        }
        if let Some(c) = p.best_fitness.captures(line) {
            delta.best_fitness = c[1].parse().ok();
        }
        if let Some(c) = p.completed.captures(line) {
            delta.completion_percent = c[1].parse().ok();
        }

        (!delta.is_empty()).then_some(delta)
    }
}

impl Progress {
    /// Fold a delta into the vector. Counters only move forward; score
    /// fields take the latest parsed value. Returns whether anything
    /// changed.
    pub fn apply(&mut self, delta: &ProgressDelta) -> bool {
        let mut changed = false;

        if let Some(generation) = delta.generation {
            if self.generation.map_or(true, |g| generation > g) {
                self.generation = Some(generation);
                changed = true;
            }
        }
        if let Some(coverage) = delta.coverage {
            if self.coverage.map_or(true, |c| coverage > c) {
                self.coverage = Some(coverage);
                changed = true;
            }
        }
        if let Some(completion) = delta.completion_percent {
            if self.completion_percent.map_or(true, |c| completion > c) {
                self.completion_percent = Some(completion);
                changed = true;
            }
        }
        if let Some(qd) = delta.qd_score {
            if self.qd_score != Some(qd) {
                self.qd_score = Some(qd);
                changed = true;
            }
        }
        if let Some(best) = delta.best_fitness {
            if self.best_fitness != Some(best) {
                self.best_fitness = Some(best);
                changed = true;
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_line() {
        let delta = ProgressParser::parse("starting generation 42 with 32 offspring").unwrap();
        assert_eq!(delta.generation, Some(42));
    }

    #[test]
    fn test_coverage_variants() {
        let delta = ProgressParser::parse("coveragePercentage 12.5").unwrap();
        assert_eq!(delta.coverage, Some(0.125));

        let delta = ProgressParser::parse("Coverage: 80%").unwrap();
        assert_eq!(delta.coverage, Some(0.8));
    }

    #[test]
    fn test_qd_score_and_completion() {
        let delta = ProgressParser::parse("QD Score: 1234.5, % completed: 10").unwrap();
        assert_eq!(delta.qd_score, Some(1234.5));
        assert_eq!(delta.completion_percent, Some(10.0));
    }

    #[test]
    fn test_unrelated_lines_yield_nothing() {
        assert!(ProgressParser::parse("connecting to ws://localhost:50051").is_none());
        assert!(ProgressParser::parse("").is_none());
    }

    #[test]
    fn test_apply_is_monotonic() {
        let mut progress = Progress::default();

        assert!(progress.apply(&ProgressParser::parse("generation 10").unwrap()));
        assert_eq!(progress.generation, Some(10));

        // A replayed older line never moves the counter backwards
        assert!(!progress.apply(&ProgressParser::parse("generation 7").unwrap()));
        assert_eq!(progress.generation, Some(10));

        assert!(progress.apply(&ProgressParser::parse("generation 11").unwrap()));
        assert_eq!(progress.generation, Some(11));
    }

    #[test]
    fn test_apply_scores_take_latest() {
        let mut progress = Progress::default();
        progress.apply(&ProgressParser::parse("QD Score: 10.0").unwrap());
        progress.apply(&ProgressParser::parse("QD Score: 9.5").unwrap());
        assert_eq!(progress.qd_score, Some(9.5));
    }
}
