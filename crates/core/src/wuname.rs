//! Work unit identifiers.
//!
//! A WU id is `<job>_<task>_<identifier>` with an optional `#<attempt>`
//! suffix. Parsing splits from the right, so the job name may itself contain
//! both separator characters; the task name and identifier may not.

use std::fmt;

use crate::error::FlowError;

/// Joins job, task and identifier.
pub const PASTE: char = '_';
/// Introduces the attempt number of a resubmitted WU.
pub const ATTEMPT: char = '#';

/// Parsed form of a WU identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WuName {
    pub job: String,
    pub task: String,
    pub identifier: String,
    pub attempt: Option<u32>,
}

impl WuName {
    /// Build a name, rejecting components that would not split back.
    pub fn new(
        job: &str,
        task: &str,
        identifier: &str,
        attempt: Option<u32>,
    ) -> Result<Self, FlowError> {
        if task.is_empty() || task.contains(PASTE) {
            return Err(FlowError::WuName(format!(
                "task name '{task}' must be non-empty and must not contain '{PASTE}'"
            )));
        }
        if identifier.is_empty() || identifier.contains(PASTE) || identifier.contains(ATTEMPT) {
            return Err(FlowError::WuName(format!(
                "identifier '{identifier}' must be non-empty and must not contain '{PASTE}' or '{ATTEMPT}'"
            )));
        }
        if job.is_empty() {
            return Err(FlowError::WuName("job name must not be empty".into()));
        }
        Ok(Self {
            job: job.to_string(),
            task: task.to_string(),
            identifier: identifier.to_string(),
            attempt,
        })
    }

    /// Parse a WU id produced by [`make_wuname`].
    pub fn parse(wuid: &str) -> Result<Self, FlowError> {
        let mut parts = wuid.rsplitn(3, PASTE);
        let (Some(last), Some(task), Some(job)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(FlowError::WuName(format!(
                "'{wuid}' does not have the form job{PASTE}task{PASTE}identifier"
            )));
        };

        let (identifier, attempt) = match last.split_once(ATTEMPT) {
            Some((ident, n)) => {
                let n = n.parse::<u32>().map_err(|_| {
                    FlowError::WuName(format!("'{wuid}' has a malformed attempt number '{n}'"))
                })?;
                (ident, Some(n))
            }
            None => (last, None),
        };

        Self::new(job, task, identifier, attempt)
    }

    /// The same WU with the next attempt number (2 for a first resubmission).
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: Some(self.attempt.map_or(2, |n| n + 1)),
            ..self.clone()
        }
    }
}

impl fmt::Display for WuName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{PASTE}{}{PASTE}{}", self.job, self.task, self.identifier)?;
        if let Some(n) = self.attempt {
            write!(f, "{ATTEMPT}{n}")?;
        }
        Ok(())
    }
}

/// Compose a WU id string.
pub fn make_wuname(
    job: &str,
    task: &str,
    identifier: &str,
    attempt: Option<u32>,
) -> Result<String, FlowError> {
    WuName::new(job, task, identifier, attempt).map(|n| n.to_string())
}

/// Split a WU id into (job, task, identifier, attempt).
pub fn split_wuname(wuid: &str) -> Result<(String, String, String, Option<u32>), FlowError> {
    let n = WuName::parse(wuid)?;
    Ok((n.job, n.task, n.identifier, n.attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain_and_with_attempt() {
        for attempt in [None, Some(2), Some(17)] {
            let id = make_wuname("c60", "sieving", "1000-2000", attempt).unwrap();
            let parsed = split_wuname(&id).unwrap();
            assert_eq!(
                parsed,
                ("c60".into(), "sieving".into(), "1000-2000".into(), attempt)
            );
        }
    }

    #[test]
    fn job_name_may_contain_separators() {
        let jobs = ["rsa_100", "a#b", "x_y#z_w", "__", "#"];
        for job in jobs {
            for attempt in [None, Some(3)] {
                let id = make_wuname(job, "polyselect", "q5", attempt).unwrap();
                let (j, t, i, a) = split_wuname(&id).unwrap();
                assert_eq!(j, job);
                assert_eq!(t, "polyselect");
                assert_eq!(i, "q5");
                assert_eq!(a, attempt);
            }
        }
    }

    #[test]
    fn round_trip_with_separators_around_names() {
        const JOB_SEPS: [&str; 3] = ["", "_", "#"];
        const TASK_SEPS: [&str; 2] = ["", "#"];
        let mut checked = 0;
        for p1 in JOB_SEPS {
            for p2 in JOB_SEPS {
                for s1 in JOB_SEPS {
                    for s2 in JOB_SEPS {
                        let job = format!("{p1}{p2}projectname{s1}{s2}");
                        for tp in TASK_SEPS {
                            for ts in TASK_SEPS {
                                let task = format!("{tp}taskname{ts}");
                                for attempt in [None, Some(2), Some(3)] {
                                    let id = make_wuname(&job, &task, "identifier", attempt).unwrap();
                                    assert_eq!(
                                        split_wuname(&id).unwrap(),
                                        (job.clone(), task.clone(), "identifier".to_string(), attempt),
                                        "{id}"
                                    );
                                    checked += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        assert_eq!(checked, 81 * 4 * 3);
    }

    #[test]
    fn task_name_may_contain_attempt_char() {
        let id = make_wuname("job", "sieve#2", "7", None).unwrap();
        let n = WuName::parse(&id).unwrap();
        assert_eq!(n.task, "sieve#2");
        assert_eq!(n.attempt, None);
    }

    #[test]
    fn rejects_illegal_components() {
        assert!(make_wuname("job", "sie_ving", "1", None).is_err());
        assert!(make_wuname("job", "sieving", "1_2", None).is_err());
        assert!(make_wuname("job", "sieving", "1#2", None).is_err());
        assert!(make_wuname("", "sieving", "1", None).is_err());
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(split_wuname("onlyone").is_err());
        assert!(split_wuname("two_parts").is_err());
        assert!(split_wuname("job_task_id#x").is_err());
    }

    #[test]
    fn next_attempt_increments() {
        let n = WuName::parse("job_task_5").unwrap();
        let n2 = n.next_attempt();
        assert_eq!(n2.to_string(), "job_task_5#2");
        assert_eq!(n2.next_attempt().to_string(), "job_task_5#3");
    }
}
