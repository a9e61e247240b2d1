//! Case scheduling: which case a newly-ready worker gets next, and what
//! happens to a case once a worker finishes with it.
//!
//! Three sources feed a worker, in strict priority order: cases explicitly
//! requeued (`todo`), cases bounced back after a retriable infrastructure
//! fault (`rerun`), and the lazy case iterator. `todo` and `rerun` are both
//! drained completely before the iterator is touched again, so a retry never
//! starves behind fresh work.

use std::collections::VecDeque;

use driver_common::case::Case;
use driver_common::iterator::CaseIterator;

/// What happened when a worker finished running a case.
pub enum CaseOutcome {
    /// The model ran and outputs were collected.
    Completed,
    /// The model raised during `run()`. Never retried.
    ModelFault(String),
    /// An infrastructure-side operation failed before or during the run.
    /// Retried while the case has retries left.
    ServerFault(String),
}

/// What the dispatcher decided to do with a case after `complete_case`.
pub enum CaseDisposition {
    /// Done (successfully or with a terminal failure); hand to the recorder.
    Finished(Case),
    /// Pushed onto `rerun` for another worker to pick up later.
    Requeued,
}

pub struct Dispatcher {
    todo: VecDeque<Case>,
    rerun: VecDeque<Case>,
    iterator: Box<dyn CaseIterator>,
    exhausted: bool,
}

impl Dispatcher {
    pub fn new(iterator: Box<dyn CaseIterator>) -> Self {
        Self {
            todo: VecDeque::new(),
            rerun: VecDeque::new(),
            iterator,
            exhausted: false,
        }
    }

    /// Explicitly queue a case ahead of both `rerun` and the iterator.
    pub fn push_todo(&mut self, case: Case) {
        self.todo.push_back(case);
    }

    /// The next case for a ready worker, or `None` if every source is
    /// exhausted right now. `None` does not necessarily mean the run is
    /// done: `rerun` can still receive cases from workers still in flight.
    pub async fn next_case(&mut self) -> Option<Case> {
        let case = if let Some(case) = self.todo.pop_front() {
            Some(case)
        } else if let Some(case) = self.rerun.pop_front() {
            Some(case)
        } else if self.exhausted {
            None
        } else {
            match self.iterator.next_case().await {
                Some(case) => Some(case),
                None => {
                    self.exhausted = true;
                    None
                }
            }
        };
        if case.is_some() {
            metrics::counter!("case_driver_cases_dispatched").increment(1);
        }
        case
    }

    /// Route a finished case based on its outcome. `ServerFault` requeues
    /// onto `rerun` while the case has retries remaining; otherwise the case
    /// is terminal (recorded with `msg` set).
    pub fn complete_case(&mut self, mut case: Case, outcome: CaseOutcome) -> CaseDisposition {
        match outcome {
            CaseOutcome::Completed => {
                metrics::counter!("case_driver_cases_completed").increment(1);
                CaseDisposition::Finished(case)
            }
            CaseOutcome::ModelFault(msg) => {
                case.msg = Some(msg);
                metrics::counter!("case_driver_cases_failed", &[("reason", "model")]).increment(1);
                CaseDisposition::Finished(case)
            }
            CaseOutcome::ServerFault(msg) => {
                if case.retries < case.max_retries {
                    case.retries += 1;
                    self.rerun.push_back(case);
                    metrics::counter!("case_driver_cases_retried").increment(1);
                    CaseDisposition::Requeued
                } else {
                    case.msg = Some(msg);
                    metrics::counter!("case_driver_cases_failed", &[("reason", "server")]).increment(1);
                    CaseDisposition::Finished(case)
                }
            }
        }
    }

    /// True once the iterator is exhausted and nothing is waiting in `todo`
    /// or `rerun`. Workers still running a case are not reflected here; the
    /// orchestrator tracks those separately.
    pub fn is_drained(&self) -> bool {
        self.exhausted && self.todo.is_empty() && self.rerun.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver_common::iterator::VecCaseIterator;

    fn case_with_retries(max_retries: u32) -> Case {
        Case::new().with_max_retries(max_retries)
    }

    #[tokio::test]
    async fn todo_outranks_rerun_and_iterator() {
        let mut dispatcher = Dispatcher::new(Box::new(VecCaseIterator::new(vec![Case::new()])));
        let mut rerun_case = case_with_retries(1);
        rerun_case.label = "rerun".to_string();
        dispatcher.complete_case(rerun_case, CaseOutcome::ServerFault("boom".into()));

        let mut todo_case = Case::new();
        todo_case.label = "todo".to_string();
        dispatcher.push_todo(todo_case);

        let next = dispatcher.next_case().await.unwrap();
        assert_eq!(next.label, "todo");
        let next = dispatcher.next_case().await.unwrap();
        assert_eq!(next.label, "rerun");
    }

    #[tokio::test]
    async fn server_fault_requeues_until_retries_exhausted() {
        let mut dispatcher = Dispatcher::new(Box::new(VecCaseIterator::new(vec![])));
        let case = case_with_retries(1);

        match dispatcher.complete_case(case, CaseOutcome::ServerFault("e1".into())) {
            CaseDisposition::Requeued => {}
            _ => panic!("expected requeue"),
        }
        let retried = dispatcher.next_case().await.unwrap();
        assert_eq!(retried.retries, 1);

        match dispatcher.complete_case(retried, CaseOutcome::ServerFault("e2".into())) {
            CaseDisposition::Finished(case) => {
                assert_eq!(case.msg.as_deref(), Some("e2"));
            }
            CaseDisposition::Requeued => panic!("should be terminal after max_retries"),
        }
    }

    #[tokio::test]
    async fn model_fault_never_retries() {
        let mut dispatcher = Dispatcher::new(Box::new(VecCaseIterator::new(vec![])));
        let case = case_with_retries(5);
        match dispatcher.complete_case(case, CaseOutcome::ModelFault("bad input".into())) {
            CaseDisposition::Finished(case) => assert_eq!(case.msg.as_deref(), Some("bad input")),
            CaseDisposition::Requeued => panic!("model faults are never retried"),
        }
    }

    #[tokio::test]
    async fn drained_once_iterator_and_queues_are_empty() {
        let mut dispatcher = Dispatcher::new(Box::new(VecCaseIterator::new(vec![Case::new()])));
        assert!(!dispatcher.is_drained());
        dispatcher.next_case().await;
        assert!(dispatcher.next_case().await.is_none());
        assert!(dispatcher.is_drained());
    }
}
