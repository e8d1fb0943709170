use serde::{Deserialize, Serialize};

/// Upper bound on the number of phases a plan may carry.
pub const MAX_PHASES: usize = 3;

/// Smallest sampling interval the capture panel has ever accepted.
pub const MIN_INTERVAL_SECS: f64 = 0.25;

/// One span of the session with its own sampling interval.
///
/// `end_point` is absolute elapsed time since capture start, not a duration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub end_point: f64,
    pub interval: f64,
}

/// Start delay plus an ordered list of capture phases.
///
/// The last phase's `end_point` is the total session duration. Deserializes
/// from either the phase list or the panel's start/middle/end form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TimingInput")]
pub struct TimingPlan {
    pub start_delay: f64,
    pub phases: Vec<Phase>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimingInput {
    Phases {
        #[serde(default)]
        start_delay: f64,
        phases: Vec<Phase>,
    },
    Panel {
        start: f64,
        interval_1: f64,
        middle: f64,
        interval_2: f64,
        end: f64,
    },
}

impl From<TimingInput> for TimingPlan {
    fn from(input: TimingInput) -> Self {
        match input {
            TimingInput::Phases {
                start_delay,
                phases,
            } => Self {
                start_delay,
                phases,
            },
            TimingInput::Panel {
                start,
                interval_1,
                middle,
                interval_2,
                end,
            } => Self::two_phase(start, interval_1, middle, interval_2, end),
        }
    }
}

impl Default for TimingPlan {
    fn default() -> Self {
        Self {
            start_delay: 0.0,
            phases: vec![Phase {
                end_point: 900.0,
                interval: 1.0,
            }],
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("timing plan has no phases")]
    Empty,
    #[error("timing plan has {0} phases, at most {MAX_PHASES} are supported")]
    TooManyPhases(usize),
    #[error("start delay must be a non-negative number, got {0}")]
    InvalidStartDelay(f64),
    #[error("phase {index}: interval {interval}s is below the {MIN_INTERVAL_SECS}s minimum")]
    IntervalTooShort { index: usize, interval: f64 },
    #[error("phase {index}: end point {end_point}s must exceed {previous}s")]
    NotIncreasing {
        index: usize,
        end_point: f64,
        previous: f64,
    },
}

impl TimingPlan {
    /// A start/middle/end plan with two sampling intervals.
    ///
    /// Collapses to a single phase when `end <= middle`, which is how the panel
    /// expressed "one interval for the whole run".
    pub fn two_phase(start: f64, interval_1: f64, middle: f64, interval_2: f64, end: f64) -> Self {
        let mut phases = vec![Phase {
            end_point: middle,
            interval: interval_1,
        }];
        if end > middle {
            phases.push(Phase {
                end_point: end,
                interval: interval_2,
            });
        }
        Self {
            start_delay: start,
            phases,
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.phases.is_empty() {
            return Err(PlanError::Empty);
        }
        if self.phases.len() > MAX_PHASES {
            return Err(PlanError::TooManyPhases(self.phases.len()));
        }
        if !self.start_delay.is_finite() || self.start_delay < 0.0 {
            return Err(PlanError::InvalidStartDelay(self.start_delay));
        }

        let mut previous = self.start_delay;
        for (index, phase) in self.phases.iter().enumerate() {
            // NaN fails both comparisons, so it lands in the error arms.
            if !(phase.interval >= MIN_INTERVAL_SECS) || !phase.interval.is_finite() {
                return Err(PlanError::IntervalTooShort {
                    index,
                    interval: phase.interval,
                });
            }
            if !(phase.end_point > previous) || !phase.end_point.is_finite() {
                return Err(PlanError::NotIncreasing {
                    index,
                    end_point: phase.end_point,
                    previous,
                });
            }
            previous = phase.end_point;
        }
        Ok(())
    }

    /// Validate and lay the phases out back to back on the elapsed-time axis.
    ///
    /// `epsilon` widens the inclusive end of the last phase so a final sample
    /// taken one polling quantum late is still admitted.
    pub fn resolve(&self, epsilon: f64) -> Result<ResolvedPlan, PlanError> {
        self.validate()?;

        let mut start = self.start_delay;
        let phases = self
            .phases
            .iter()
            .map(|p| {
                let resolved = ResolvedPhase {
                    start,
                    end: p.end_point,
                    interval: p.interval,
                    next_scheduled: start,
                };
                start = p.end_point;
                resolved
            })
            .collect();

        Ok(ResolvedPlan {
            phases,
            epsilon: epsilon.max(0.0),
        })
    }
}

/// A phase placed on the elapsed-time axis, with its scheduling cursor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPhase {
    pub start: f64,
    pub end: f64,
    pub interval: f64,
    /// Next instant (elapsed seconds) at which this phase should capture.
    pub next_scheduled: f64,
}

impl ResolvedPhase {
    /// Half-open `[start, end)` for inner phases, `[start, end + epsilon]` for the last.
    pub fn contains(&self, t: f64, is_last: bool, epsilon: f64) -> bool {
        if is_last {
            self.start <= t && t <= self.end + epsilon
        } else {
            self.start <= t && t < self.end
        }
    }

    pub fn is_due(&self, t: f64) -> bool {
        t >= self.next_scheduled
    }

    /// Consume the current scheduled instant and return it.
    ///
    /// The cursor moves by whole intervals from the phase start, so late
    /// captures never shift the grid.
    pub fn advance(&mut self) -> f64 {
        let due = self.next_scheduled;
        if self.interval > 0.0 {
            self.next_scheduled += self.interval;
        } else {
            self.next_scheduled = f64::INFINITY;
        }
        due
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlan {
    phases: Vec<ResolvedPhase>,
    epsilon: f64,
}

impl ResolvedPlan {
    pub fn phases(&self) -> &[ResolvedPhase] {
        &self.phases
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn start_delay(&self) -> f64 {
        self.phases.first().map(|p| p.start).unwrap_or(0.0)
    }

    pub fn total_duration(&self) -> f64 {
        self.phases.last().map(|p| p.end).unwrap_or(0.0)
    }

    /// True once `t` has passed the end of the session, tolerance included.
    pub fn is_finished(&self, t: f64) -> bool {
        t > self.total_duration() + self.epsilon
    }

    /// Index of the first phase that claims `t`, scanning in plan order.
    pub fn phase_at(&self, t: f64) -> Option<usize> {
        let last = self.phases.len().checked_sub(1)?;
        self.phases
            .iter()
            .enumerate()
            .find(|(i, p)| p.contains(t, *i == last, self.epsilon))
            .map(|(i, _)| i)
    }

    pub fn phase_mut(&mut self, index: usize) -> Option<&mut ResolvedPhase> {
        self.phases.get_mut(index)
    }
}
