//! Read-only queries over the queue.

use super::error::QueueResult;
use super::models::{Job, JobFilter, QueueStats};
use super::queue::JobQueue;

impl JobQueue {
    /// Counts and timings across the whole queue.
    pub fn get_stats(&self) -> QueueResult<QueueStats> {
        Ok(self.store.get_stats()?)
    }

    /// Jobs matching `filter`, newest first.
    pub fn get_jobs(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        Ok(self.store.list_jobs(filter)?)
    }

    /// Number of jobs matching `filter`; paging is ignored.
    pub fn count_jobs(&self, filter: &JobFilter) -> QueueResult<usize> {
        Ok(self.store.count_jobs(filter)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::job_queue::models::{JobFilter, JobStatus, NewJob};
    use crate::job_queue::queue::tests::test_queue;

    #[test]
    fn test_stats_reflect_transitions() {
        let (queue, clock, _sink) = test_queue();
        let a = queue
            .enqueue(NewJob::new("generate_title", Vec::new()).with_priority(20))
            .unwrap();
        queue.enqueue(NewJob::new("generate_title", Vec::new())).unwrap();
        queue.enqueue(NewJob::new("generate_meta", Vec::new())).unwrap();

        clock.advance(10);
        assert_eq!(queue.dequeue_one().unwrap().unwrap().id, a);
        clock.advance(5);
        queue.mark_done(a, None).unwrap();

        let stats = queue.get_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.pending, 2);
        assert_eq!(stats.by_status.done, 1);
        assert_eq!(stats.avg_processing_secs, Some(5.0));
        assert_eq!(stats.avg_wait_secs, Some(10.0));

        let titles = stats
            .by_type
            .iter()
            .find(|t| t.job_type == "generate_title")
            .unwrap();
        assert_eq!(titles.total, 2);
        assert_eq!(titles.done, 1);
    }

    #[test]
    fn test_get_jobs_newest_first_with_paging() {
        let (queue, clock, _sink) = test_queue();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queue.enqueue(NewJob::new("a", Vec::new())).unwrap());
            clock.advance(1);
        }

        let page = queue.get_jobs(&JobFilter::default().page(2, 1)).unwrap();
        let page_ids: Vec<i64> = page.iter().map(|j| j.id).collect();
        assert_eq!(page_ids, vec![ids[3], ids[2]]);
    }

    #[test]
    fn test_count_jobs_ignores_paging() {
        let (queue, _clock, _sink) = test_queue();
        for job_type in ["a", "a", "b"] {
            queue.enqueue(NewJob::new(job_type, Vec::new())).unwrap();
        }
        let filter = JobFilter::default().with_type("a").page(1, 0);
        assert_eq!(queue.count_jobs(&filter).unwrap(), 2);
        assert_eq!(queue.get_jobs(&filter).unwrap().len(), 1);
        assert_eq!(
            queue
                .count_jobs(&JobFilter::default().with_status(JobStatus::Done))
                .unwrap(),
            0
        );
    }
}
