use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::ledger::{Allocation, ResourceLedger};
use crate::registry::NodeRegistry;
use crate::resources::ResourceVector;
use crate::scheduler::job::{Job, JobState};
use crate::scheduler::queue::JobQueue;

/// A job matched to a node with its resources already reserved.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub job: Job,
    pub allocation: Allocation,
}

#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub assignments: Vec<Assignment>,
    /// Ready jobs that found no node this cycle.
    pub unplaced: usize,
    /// Set when strict ordering stopped the cycle at a blocked job.
    pub blocked_by: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct Candidate {
    node_id: String,
    capacity: ResourceVector,
    free: ResourceVector,
}

/// Greedy best-fit matcher.
///
/// Each cycle walks the ready jobs in priority order and puts each on the
/// node whose free resources cover the request with the least slack left
/// over. This is a bin-packing heuristic: it keeps cycles short and the
/// result deterministic, and it makes no attempt at a global optimum.
#[derive(Debug, Clone)]
pub struct Scheduler {
    backfill: bool,
    max_assignments: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            backfill: true,
            max_assignments: usize::MAX,
        }
    }
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            backfill: config.backfill,
            max_assignments: config.max_assignments_per_cycle.max(1),
        }
    }

    pub fn with_backfill(mut self, backfill: bool) -> Self {
        self.backfill = backfill;
        self
    }

    pub fn run_cycle(
        &self,
        registry: &NodeRegistry,
        queue: &mut JobQueue,
        ledger: &ResourceLedger,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();

        let mut candidates: Vec<Candidate> = registry
            .list_available(ledger)
            .map(|n| Candidate {
                node_id: n.node.id.clone(),
                capacity: n.node.capacity,
                free: n.free,
            })
            .collect();

        let ready: Vec<(Uuid, ResourceVector)> = queue
            .peek_ready(now)
            .into_iter()
            .map(|j| (j.id, j.resources))
            .collect();

        if ready.is_empty() {
            return outcome;
        }
        if candidates.is_empty() {
            outcome.unplaced = ready.len();
            return outcome;
        }

        for (position, (job_id, request)) in ready.iter().enumerate() {
            if outcome.assignments.len() >= self.max_assignments {
                outcome.unplaced += ready.len() - position;
                break;
            }

            let placed = match best_fit(&candidates, request) {
                Some(index) => self.place(
                    &mut candidates[index],
                    *job_id,
                    *request,
                    queue,
                    ledger,
                    now,
                ),
                None => None,
            };

            match placed {
                Some(assignment) => outcome.assignments.push(assignment),
                None => {
                    outcome.unplaced += 1;
                    if !self.backfill {
                        outcome.unplaced += ready.len() - position - 1;
                        outcome.blocked_by = Some(*job_id);
                        tracing::debug!(job_id = %job_id, "Strict priority: cycle blocked");
                        break;
                    }
                }
            }
        }

        if !outcome.assignments.is_empty() {
            tracing::debug!(
                assigned = outcome.assignments.len(),
                unplaced = outcome.unplaced,
                "Scheduling cycle finished"
            );
        }
        outcome
    }

    fn place(
        &self,
        candidate: &mut Candidate,
        job_id: Uuid,
        request: ResourceVector,
        queue: &mut JobQueue,
        ledger: &ResourceLedger,
        now: DateTime<Utc>,
    ) -> Option<Assignment> {
        let allocation = match ledger.try_reserve(&candidate.node_id, job_id, request) {
            Ok(allocation) => allocation,
            Err(e) => {
                // The snapshot was stale; pick up the real free vector.
                tracing::debug!(job_id = %job_id, node_id = %candidate.node_id, error = %e, "Reservation lost a race");
                candidate.free = ledger.free(&candidate.node_id).unwrap_or(ResourceVector::ZERO);
                return None;
            }
        };

        let Some(mut job) = queue.remove(&job_id) else {
            let _ = ledger.release(allocation.id);
            return None;
        };
        if let Err(e) = job.transition(JobState::Scheduled) {
            tracing::warn!(job_id = %job_id, error = %e, "Queued job could not be scheduled");
            let _ = ledger.release(allocation.id);
            let _ = queue.requeue(job);
            return None;
        }
        job.assigned_node = Some(candidate.node_id.clone());
        job.allocation_id = Some(allocation.id);
        job.scheduled_at = Some(now);
        candidate.free = candidate.free.saturating_sub(&request);

        tracing::info!(
            job_id = %job_id,
            node_id = %candidate.node_id,
            resources = %request,
            "Job scheduled"
        );
        Some(Assignment { job, allocation })
    }
}

/// Index of the candidate with the least slack after placing `request`,
/// ties broken by node id.
fn best_fit(candidates: &[Candidate], request: &ResourceVector) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| request.fits_within(&c.free))
        .min_by(|(_, a), (_, b)| {
            a.free
                .slack_after(request, &a.capacity)
                .total_cmp(&b.free.slack_after(request, &b.capacity))
                .then_with(|| a.node_id.cmp(&b.node_id))
        })
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobSpec;
    use crate::scheduler::queue::AgingPolicy;
    use std::time::Duration;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    struct Fixture {
        registry: NodeRegistry,
        ledger: ResourceLedger,
        queue: JobQueue,
    }

    impl Fixture {
        fn new(nodes: &[(&str, ResourceVector)]) -> Self {
            let mut registry = NodeRegistry::new(Duration::from_secs(30));
            let ledger = ResourceLedger::new();
            for (id, cap) in nodes {
                registry.register(id, *cap, None, t(0));
                ledger.upsert_node(id, *cap);
            }
            Self {
                registry,
                ledger,
                queue: JobQueue::new().with_aging(AgingPolicy::DISABLED),
            }
        }

        fn submit(&mut self, cpus: u32, mem: u64, priority: u32, at: i64) -> Uuid {
            let job = Job::with_id(
                Uuid::new_v4(),
                "alice",
                JobSpec::new("true", ResourceVector::new(cpus, mem, 0)).with_priority(priority),
                60,
                t(at),
            );
            self.queue.enqueue(job, &self.registry).unwrap()
        }

        fn cycle(&mut self, scheduler: &Scheduler) -> CycleOutcome {
            scheduler.run_cycle(&self.registry, &mut self.queue, &self.ledger, t(100))
        }
    }

    #[test]
    fn higher_priority_runs_first_and_lower_waits_for_release() {
        let mut f = Fixture::new(&[("n1", ResourceVector::new(4, 0, 0))]);
        let a = f.submit(4, 0, 10, 0);
        let b = f.submit(2, 0, 1, 0);

        let first = f.cycle(&Scheduler::default());
        assert_eq!(first.assignments.len(), 1);
        assert_eq!(first.assignments[0].job.id, a);
        assert_eq!(first.assignments[0].job.state, JobState::Scheduled);
        assert_eq!(f.queue.get(&b).unwrap().state, JobState::Pending);

        // Nothing frees up: B keeps waiting.
        assert!(f.cycle(&Scheduler::default()).assignments.is_empty());

        f.ledger.release(first.assignments[0].allocation.id).unwrap();
        let second = f.cycle(&Scheduler::default());
        assert_eq!(second.assignments.len(), 1);
        assert_eq!(second.assignments[0].job.id, b);
    }

    #[test]
    fn best_fit_picks_tightest_node() {
        let mut f = Fixture::new(&[
            ("big", ResourceVector::new(16, 16384, 0)),
            ("small", ResourceVector::new(4, 4096, 0)),
        ]);
        f.submit(4, 4096, 0, 0);
        let outcome = f.cycle(&Scheduler::default());
        assert_eq!(
            outcome.assignments[0].allocation.node_id,
            "small".to_string()
        );
    }

    #[test]
    fn equal_fit_ties_break_on_node_id() {
        let mut f = Fixture::new(&[
            ("n2", ResourceVector::new(4, 0, 0)),
            ("n1", ResourceVector::new(4, 0, 0)),
        ]);
        f.submit(1, 0, 0, 0);
        let outcome = f.cycle(&Scheduler::default());
        assert_eq!(outcome.assignments[0].allocation.node_id, "n1");
    }

    #[test]
    fn all_dimensions_must_fit() {
        let mut f = Fixture::new(&[
            ("cpu-heavy", ResourceVector::new(32, 1024, 0)),
            ("mem-heavy", ResourceVector::new(4, 65536, 0)),
        ]);
        f.submit(4, 8192, 0, 0);
        let outcome = f.cycle(&Scheduler::default());
        assert_eq!(outcome.assignments[0].allocation.node_id, "mem-heavy");
    }

    #[test]
    fn backfill_schedules_smaller_job_past_blocked_one() {
        let mut f = Fixture::new(&[("n1", ResourceVector::new(4, 0, 0))]);
        let running = f.submit(3, 0, 100, 0);
        f.cycle(&Scheduler::default());
        assert!(!f.queue.contains(&running));

        let big = f.submit(4, 0, 50, 1);
        let small = f.submit(1, 0, 1, 2);

        let outcome = f.cycle(&Scheduler::default());
        let ids: Vec<Uuid> = outcome.assignments.iter().map(|a| a.job.id).collect();
        assert_eq!(ids, vec![small]);
        assert!(f.queue.contains(&big));
        assert_eq!(outcome.unplaced, 1);
    }

    #[test]
    fn strict_mode_stops_at_blocked_job() {
        let mut f = Fixture::new(&[("n1", ResourceVector::new(4, 0, 0))]);
        f.submit(3, 0, 100, 0);
        let strict = Scheduler::default().with_backfill(false);
        f.cycle(&strict);

        let big = f.submit(4, 0, 50, 1);
        let small = f.submit(1, 0, 1, 2);
        let outcome = f.cycle(&strict);
        assert!(outcome.assignments.is_empty());
        assert_eq!(outcome.blocked_by, Some(big));
        assert_eq!(outcome.unplaced, 2);
        assert!(f.queue.contains(&small));
    }

    #[test]
    fn one_cycle_packs_several_jobs_without_oversubscribing() {
        let mut f = Fixture::new(&[
            ("n1", ResourceVector::new(4, 0, 0)),
            ("n2", ResourceVector::new(4, 0, 0)),
        ]);
        for i in 0..5 {
            f.submit(2, 0, 0, i);
        }
        let outcome = f.cycle(&Scheduler::default());
        assert_eq!(outcome.assignments.len(), 4);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.ledger.free("n1"), Some(ResourceVector::ZERO));
        assert_eq!(f.ledger.free("n2"), Some(ResourceVector::ZERO));
    }

    #[test]
    fn down_nodes_are_not_candidates() {
        let mut f = Fixture::new(&[("n1", ResourceVector::new(4, 0, 0))]);
        f.registry.mark_down("n1", "test").unwrap();
        f.submit(1, 0, 0, 0);
        let outcome = f.cycle(&Scheduler::default());
        assert!(outcome.assignments.is_empty());
        assert_eq!(outcome.unplaced, 1);
    }

    #[test]
    fn respects_assignment_cap() {
        let mut f = Fixture::new(&[("n1", ResourceVector::new(8, 0, 0))]);
        for i in 0..4 {
            f.submit(1, 0, 0, i);
        }
        let config = SchedulerConfig {
            max_assignments_per_cycle: 2,
            ..SchedulerConfig::default()
        };
        let outcome = f.cycle(&Scheduler::new(&config));
        assert_eq!(outcome.assignments.len(), 2);
        assert_eq!(outcome.unplaced, 2);
    }
}
