use crate::executor::Worker;
use std::cmp::Ordering as CmpOrdering;

/// Picks the worker carrying the least load.
///
/// Linear scan using `Worker::compare_priority`; on a tie the earlier worker
/// wins. `None` only for an empty slice.
pub fn least_loaded(workers: &[Worker]) -> Option<&Worker> {
    let mut best: Option<&Worker> = None;

    for worker in workers {
        let better = match best {
            None => true,
            Some(current) => worker.compare_priority(current) == CmpOrdering::Greater,
        };
        if better {
            best = Some(worker);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::executor::LogSink;
    use std::sync::Arc;

    // never started, so posted work just accumulates as load
    fn idle_workers(n: usize) -> Vec<Worker> {
        let config = Config::default();
        (0..n).map(|id| Worker::new(id, &config, Arc::new(LogSink))).collect()
    }

    #[test]
    fn test_empty_has_no_choice() {
        assert!(least_loaded(&[]).is_none());
    }

    #[test]
    fn test_ties_pick_first() {
        let workers = idle_workers(3);
        assert_eq!(least_loaded(&workers).map(|w| w.id()), Some(0));
    }

    #[test]
    fn test_picks_lightest() {
        let workers = idle_workers(3);
        workers[0].post(|| {});
        workers[0].post(|| {});
        workers[1].post(|| {});
        workers[2].post(|| {});
        workers[2].post(|| {});

        assert_eq!(least_loaded(&workers).map(|w| w.id()), Some(1));
    }

    #[test]
    fn test_repeated_placement_stays_balanced() {
        let workers = idle_workers(4);
        for _ in 0..101 {
            least_loaded(&workers).unwrap().post(|| {});
        }

        let loads: Vec<usize> = workers.iter().map(|w| w.load()).collect();
        assert_eq!(loads, vec![26, 25, 25, 25]);
    }

    #[test]
    fn test_counts_tasks_not_due_times() {
        let workers = idle_workers(2);
        // several tasks sharing one due time still count individually
        for _ in 0..3 {
            workers[0].post(|| {});
        }
        workers[1].schedule(std::time::Duration::from_secs(1), || {});
        workers[1].schedule(std::time::Duration::from_secs(2), || {});

        assert_eq!(least_loaded(&workers).map(|w| w.id()), Some(1));
    }
}
