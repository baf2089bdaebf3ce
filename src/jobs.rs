//! Job and process bookkeeping.
//!
//! Every pipeline invocation creates a job record before execution and
//! completes it afterward, so the table is always eventually consistent with
//! real outcomes. Foreground/background transitions are bookkeeping only —
//! there is no OS process underneath to suspend or resume. Job-control
//! operations are advisory: acting on a nonexistent or terminated job
//! returns `false`/`None` instead of erroring.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use itertools::Itertools;

/// Status of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Currently executing (or believed to be).
    Running,
    /// Moved to the stopped list (bookkeeping only).
    Stopped,
    /// Finished; terminal.
    Completed,
    /// Killed via job control; terminal.
    Killed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stopped => write!(f, "stopped"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Killed => write!(f, "killed"),
        }
    }
}

impl JobStatus {
    fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Killed)
    }
}

/// A tracked unit of pipeline execution.
#[derive(Debug, Clone)]
pub struct Job {
    /// Monotonically increasing job id.
    pub id: u32,
    /// Process id assigned to the pipeline invocation.
    pub pid: u32,
    /// The originating command string.
    pub command: String,
    /// Current status.
    pub status: JobStatus,
    /// Whether the job runs in the foreground.
    pub foreground: bool,
    /// When the job started.
    pub started: Instant,
    /// Final exit code, once completed.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Default)]
struct JobTableInner {
    next_job_id: u32,
    next_pid: u32,
    jobs: HashMap<u32, Job>,
    notifications: Vec<String>,
}

/// The job/process table.
///
/// Interior mutability is encapsulated here; callers never see the map
/// itself, which keeps invariants intact under reentrant calls.
#[derive(Debug, Default)]
pub struct JobTable {
    inner: Mutex<JobTableInner>,
}

impl JobTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job record for a starting pipeline. Returns `(job_id, pid)`.
    pub fn start_job(&self, command: &str, foreground: bool) -> (u32, u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_job_id += 1;
        inner.next_pid += 1;
        let id = inner.next_job_id;
        let pid = inner.next_pid;
        inner.jobs.insert(
            id,
            Job {
                id,
                pid,
                command: command.to_string(),
                status: JobStatus::Running,
                foreground,
                started: Instant::now(),
                exit_code: None,
            },
        );
        if !foreground {
            let note = format!("[{}] {} {}", id, pid, command);
            inner.notifications.push(note);
        }
        tracing::debug!(job_id = id, pid, command, foreground, "job started");
        (id, pid)
    }

    /// Record a pipeline's final result. A job that was killed in the
    /// meantime keeps its `Killed` status.
    pub fn complete_job(&self, id: u32, exit_code: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        job.status = JobStatus::Completed;
        job.exit_code = Some(exit_code);
        let note = format!("[{}] done ({}) {}", id, exit_code, job.command);
        let foreground = job.foreground;
        if !foreground {
            inner.notifications.push(note);
        }
        tracing::debug!(job_id = id, exit_code, "job completed");
        true
    }

    /// Bring a job to the foreground (bookkeeping only).
    pub fn foreground_job(&self, id: u32) -> bool {
        self.transition(id, |job| {
            if job.status.is_terminal() {
                return None;
            }
            job.foreground = true;
            job.status = JobStatus::Running;
            Some(format!("[{}] foreground {}", job.id, job.command))
        })
    }

    /// Send a job to the background (bookkeeping only).
    pub fn background_job(&self, id: u32) -> bool {
        self.transition(id, |job| {
            if job.status.is_terminal() {
                return None;
            }
            job.foreground = false;
            job.status = JobStatus::Running;
            Some(format!("[{}] background {}", job.id, job.command))
        })
    }

    /// Mark a job as killed. The underlying task still runs to completion
    /// cooperatively, but the record will not be overwritten by it.
    pub fn kill_job(&self, id: u32) -> bool {
        self.transition(id, |job| {
            if job.status.is_terminal() {
                return None;
            }
            job.status = JobStatus::Killed;
            Some(format!("[{}] killed {}", job.id, job.command))
        })
    }

    /// Remove a job from the table without affecting its execution (disown).
    pub fn remove_job(&self, id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.jobs.remove(&id).is_some()
    }

    /// Snapshot of all tracked jobs, ordered by id.
    pub fn list_jobs(&self) -> Vec<Job> {
        let inner = self.inner.lock().unwrap();
        inner
            .jobs
            .values()
            .cloned()
            .sorted_by_key(|job| job.id)
            .collect()
    }

    /// Look up a single job.
    pub fn get_job(&self, id: u32) -> Option<Job> {
        self.inner.lock().unwrap().jobs.get(&id).cloned()
    }

    /// Enqueue a notification for the consumer.
    pub fn notify(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().notifications.push(message.into());
    }

    /// Drain and clear pending notifications.
    pub fn take_notifications(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().unwrap().notifications)
    }

    fn transition(&self, id: u32, f: impl FnOnce(&mut Job) -> Option<String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return false;
        };
        match f(job) {
            Some(note) => {
                inner.notifications.push(note);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let table = JobTable::new();
        let (a, pid_a) = table.start_job("sleep 1", true);
        let (b, pid_b) = table.start_job("sleep 2", true);
        assert!(b > a);
        assert!(pid_b > pid_a);
    }

    #[test]
    fn test_complete_job_records_exit() {
        let table = JobTable::new();
        let (id, _) = table.start_job("work", true);
        assert!(table.complete_job(id, 3));
        let job = table.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.exit_code, Some(3));
        // Completion is terminal; a second completion is a no-op.
        assert!(!table.complete_job(id, 0));
    }

    #[test]
    fn test_kill_is_not_overwritten_by_completion() {
        let table = JobTable::new();
        let (id, _) = table.start_job("spin", false);
        assert!(table.kill_job(id));
        assert!(!table.complete_job(id, 0));
        assert_eq!(table.get_job(id).unwrap().status, JobStatus::Killed);
        // Killing twice fails.
        assert!(!table.kill_job(id));
    }

    #[test]
    fn test_foreground_background_bookkeeping() {
        let table = JobTable::new();
        let (id, _) = table.start_job("sleep 30", false);
        assert!(!table.get_job(id).unwrap().foreground);
        assert!(table.foreground_job(id));
        assert!(table.get_job(id).unwrap().foreground);
        assert!(table.background_job(id));
        assert!(!table.get_job(id).unwrap().foreground);
    }

    #[test]
    fn test_missing_jobs_return_false_or_none() {
        let table = JobTable::new();
        assert!(!table.foreground_job(42));
        assert!(!table.kill_job(42));
        assert!(!table.remove_job(42));
        assert!(table.get_job(42).is_none());
    }

    #[test]
    fn test_disown_removes_record() {
        let table = JobTable::new();
        let (id, _) = table.start_job("spin", false);
        assert!(table.remove_job(id));
        assert!(table.get_job(id).is_none());
        assert!(table.list_jobs().is_empty());
    }

    #[test]
    fn test_notifications_drain_and_clear() {
        let table = JobTable::new();
        let (id, _) = table.start_job("sleep 30", false);
        table.complete_job(id, 0);
        let notes = table.take_notifications();
        assert_eq!(notes.len(), 2);
        assert!(notes[0].contains(&format!("[{}]", id)));
        assert!(notes[1].contains("done"));
        assert!(table.take_notifications().is_empty());
    }
}
