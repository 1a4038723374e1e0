use std::collections::VecDeque;

use crate::job::JobId;

/// FIFO of jobs waiting for a free worker.
///
/// New submissions join the back. Jobs recovered from a crashed worker are
/// put back at the front so newer submissions cannot starve them.
#[derive(Debug, Default)]
pub struct JobQueue {
    entries: VecDeque<JobId>,
    peak: usize,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly submitted job.
    pub fn push_back(&mut self, job_id: JobId) {
        self.entries.push_back(job_id);
        self.peak = self.peak.max(self.entries.len());
    }

    /// Re-insert a job ahead of everything already waiting.
    pub fn push_front(&mut self, job_id: JobId) {
        self.entries.push_front(job_id);
        self.peak = self.peak.max(self.entries.len());
    }

    pub fn pop_front(&mut self) -> Option<JobId> {
        self.entries.pop_front()
    }

    /// Remove a job wherever it sits. Returns whether it was queued.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.entries.iter().position(|queued| *queued == job_id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take every waiting job, oldest first.
    pub fn drain(&mut self) -> Vec<JobId> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest depth observed since the queue was created.
    pub fn peak(&self) -> usize {
        self.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_submission_order() {
        let mut queue = JobQueue::new();
        queue.push_back(JobId(1));
        queue.push_back(JobId(2));
        queue.push_back(JobId(3));

        assert_eq!(queue.pop_front(), Some(JobId(1)));
        assert_eq!(queue.pop_front(), Some(JobId(2)));
        assert_eq!(queue.pop_front(), Some(JobId(3)));
        assert_eq!(queue.pop_front(), None);
    }

    #[test]
    fn requeued_job_jumps_the_line() {
        let mut queue = JobQueue::new();
        queue.push_back(JobId(5));
        queue.push_back(JobId(6));
        queue.push_front(JobId(2));

        assert_eq!(queue.drain(), vec![JobId(2), JobId(5), JobId(6)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn tracks_peak_depth_across_pops() {
        let mut queue = JobQueue::new();
        for id in 1..=4 {
            queue.push_back(JobId(id));
        }
        queue.pop_front();
        queue.pop_front();
        queue.push_back(JobId(5));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peak(), 4);
    }

    #[test]
    fn remove_takes_job_from_the_middle() {
        let mut queue = JobQueue::new();
        queue.push_back(JobId(1));
        queue.push_back(JobId(2));
        queue.push_back(JobId(3));

        assert!(queue.remove(JobId(2)));
        assert!(!queue.remove(JobId(2)));
        assert_eq!(queue.drain(), vec![JobId(1), JobId(3)]);
    }
}
