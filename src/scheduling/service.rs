//! Async service wrapper around the scheduler core
//!
//! The core is synchronous and single-threaded; this wrapper gives it a
//! home: one tokio task owning the [`Scheduler`], fed by an ordered
//! command channel and a timer wheel. Commands are drained in FIFO order
//! and each handler runs to completion, so every ordering guarantee of
//! the core carries over.

use super::events::{DeviceEvent, TimerRequest};
use super::scheduler::{JobSnapshot, Scheduler, SchedulerStats};
use super::types::{JobInfo, JobKey, Uid, UserId};
use crate::errors::{ScheduleError, ScheduleResult};
use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

/// Messages processed by the scheduler task
enum Command {
    Schedule {
        info: JobInfo,
        uid: Uid,
        package: String,
        user_id: UserId,
        tag: Option<String>,
        reply: oneshot::Sender<ScheduleResult<()>>,
    },
    Enqueue {
        info: JobInfo,
        uid: Uid,
        package: String,
        user_id: UserId,
        tag: Option<String>,
        reply: oneshot::Sender<ScheduleResult<()>>,
    },
    Cancel {
        uid: Uid,
        job_id: i32,
        debug_reason: String,
    },
    CancelAll {
        uid: Uid,
        debug_reason: String,
    },
    GetPendingJobs {
        uid: Uid,
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    GetPendingJob {
        uid: Uid,
        job_id: i32,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    GetStartedJobs {
        reply: oneshot::Sender<Vec<JobSnapshot>>,
    },
    GetStats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Event(DeviceEvent),
    JobFinished {
        key: JobKey,
        needs_reschedule: bool,
    },
    CheckJobs,
}

/// Cloneable handle for talking to a running [`SchedulerService`]
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    pub async fn schedule(
        &self,
        info: JobInfo,
        uid: Uid,
        package: impl Into<String>,
        user_id: UserId,
        tag: Option<String>,
    ) -> ScheduleResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Schedule {
            info,
            uid,
            package: package.into(),
            user_id,
            tag,
            reply,
        })?;
        rx.await
            .map_err(|_| ScheduleError::invalid("scheduler is shut down"))?
    }

    pub async fn enqueue(
        &self,
        info: JobInfo,
        uid: Uid,
        package: impl Into<String>,
        user_id: UserId,
        tag: Option<String>,
    ) -> ScheduleResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Enqueue {
            info,
            uid,
            package: package.into(),
            user_id,
            tag,
            reply,
        })?;
        rx.await
            .map_err(|_| ScheduleError::invalid("scheduler is shut down"))?
    }

    pub fn cancel(&self, uid: Uid, job_id: i32, debug_reason: impl Into<String>) {
        let _ = self.tx.send(Command::Cancel {
            uid,
            job_id,
            debug_reason: debug_reason.into(),
        });
    }

    pub fn cancel_all(&self, uid: Uid, debug_reason: impl Into<String>) {
        let _ = self.tx.send(Command::CancelAll {
            uid,
            debug_reason: debug_reason.into(),
        });
    }

    pub async fn get_pending_jobs(&self, uid: Uid) -> ScheduleResult<Vec<JobSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetPendingJobs { uid, reply })?;
        rx.await
            .map_err(|_| ScheduleError::invalid("scheduler is shut down"))
    }

    pub async fn get_pending_job(
        &self,
        uid: Uid,
        job_id: i32,
    ) -> ScheduleResult<Option<JobSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetPendingJob { uid, job_id, reply })?;
        rx.await
            .map_err(|_| ScheduleError::invalid("scheduler is shut down"))
    }

    /// System callers only: the currently executing jobs
    pub async fn get_started_jobs(&self) -> ScheduleResult<Vec<JobSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetStartedJobs { reply })?;
        rx.await
            .map_err(|_| ScheduleError::invalid("scheduler is shut down"))
    }

    pub async fn stats(&self) -> ScheduleResult<SchedulerStats> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetStats { reply })?;
        rx.await
            .map_err(|_| ScheduleError::invalid("scheduler is shut down"))
    }

    /// Deliver a device/app signal
    pub fn deliver(&self, event: DeviceEvent) {
        let _ = self.tx.send(Command::Event(event));
    }

    /// Runner callback: the job finished or a requested stop took effect
    pub fn job_finished(&self, key: JobKey, needs_reschedule: bool) {
        let _ = self.tx.send(Command::JobFinished {
            key,
            needs_reschedule,
        });
    }

    /// Kick a readiness sweep and assignment pass
    pub fn check_jobs(&self) {
        let _ = self.tx.send(Command::CheckJobs);
    }

    fn send(&self, cmd: Command) -> ScheduleResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| ScheduleError::invalid("scheduler is shut down"))
    }
}

/// Owns the scheduler core and drives it from the command queue
pub struct SchedulerService {
    scheduler: Scheduler,
    rx: mpsc::UnboundedReceiver<Command>,
    epoch: Instant,
}

impl SchedulerService {
    pub fn new(scheduler: Scheduler) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                scheduler,
                rx,
                epoch: Instant::now(),
            },
            SchedulerHandle { tx },
        )
    }

    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Run the scheduler service until cancelled or all handles drop
    pub async fn run(mut self, cancellation_token: CancellationToken) -> Result<()> {
        info!("starting scheduler service");
        let mut timers: DelayQueue<TimerRequest> = DelayQueue::new();

        loop {
            // Arm whatever timers the last handler requested.
            for request in self.scheduler.take_timer_requests() {
                let delay_ms = (request.fire_at_ms() - self.now_ms()).max(0);
                debug!("arming timer {:?} in {}ms", request, delay_ms);
                timers.insert(request, Duration::from_millis(delay_ms as u64));
            }
            let timers_idle = timers.is_empty();

            tokio::select! {
                maybe_cmd = self.rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("all scheduler handles dropped, stopping");
                            break;
                        }
                    }
                }
                expired = std::future::poll_fn(|cx| timers.poll_expired(cx)), if !timers_idle => {
                    if let Some(expired) = expired {
                        let now = self.now_ms();
                        self.scheduler.on_timer(expired.into_inner(), now);
                    }
                }
                _ = cancellation_token.cancelled() => {
                    info!("scheduler service received cancellation signal");
                    break;
                }
            }
        }

        info!("scheduler service stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = self.now_ms();
        match cmd {
            Command::Schedule {
                info,
                uid,
                package,
                user_id,
                tag,
                reply,
            } => {
                let result = self.scheduler.schedule(info, uid, package, user_id, tag, now);
                let _ = reply.send(result);
            }
            Command::Enqueue {
                info,
                uid,
                package,
                user_id,
                tag,
                reply,
            } => {
                let result = self.scheduler.enqueue(info, uid, package, user_id, tag, now);
                let _ = reply.send(result);
            }
            Command::Cancel {
                uid,
                job_id,
                debug_reason,
            } => self.scheduler.cancel(uid, job_id, &debug_reason, now),
            Command::CancelAll { uid, debug_reason } => {
                self.scheduler.cancel_for_uid(uid, &debug_reason, now)
            }
            Command::GetPendingJobs { uid, reply } => {
                let _ = reply.send(self.scheduler.get_pending_jobs(uid));
            }
            Command::GetPendingJob { uid, job_id, reply } => {
                let _ = reply.send(self.scheduler.get_pending_job(uid, job_id));
            }
            Command::GetStartedJobs { reply } => {
                let _ = reply.send(self.scheduler.get_started_jobs());
            }
            Command::GetStats { reply } => {
                let _ = reply.send(self.scheduler.stats());
            }
            Command::Event(event) => self.scheduler.handle_event(event, now),
            Command::JobFinished {
                key,
                needs_reschedule,
            } => self.scheduler.on_job_finished(key, needs_reschedule, now),
            Command::CheckJobs => self.scheduler.check_jobs(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerSettings;
    use crate::scheduling::external::{
        ConstraintEvaluator, InMemoryJobStore, JobRunner, RateLimiter,
    };
    use crate::scheduling::types::{InternalStopReason, Job, StopReason, WorkType};

    struct AcceptingRunner;

    impl JobRunner for AcceptingRunner {
        fn start(&mut self, _job: &Job, _work_type: WorkType) -> bool {
            true
        }
        fn cancel(
            &mut self,
            _job: &Job,
            _reason: StopReason,
            _internal: InternalStopReason,
            _debug_reason: &str,
        ) {
        }
    }

    struct AlwaysReady;

    impl ConstraintEvaluator for AlwaysReady {
        fn is_ready(&self, _job: &Job, _now_ms: i64) -> bool {
            true
        }
        fn prepare(&mut self, _job: &Job) {}
        fn unprepare(&mut self, _job: &Job) {}
    }

    struct NoQuota;

    impl RateLimiter for NoQuota {
        fn is_within_quota(&mut self, _u: UserId, _p: &str, _t: &str, _n: i64) -> bool {
            true
        }
        fn note_event(&mut self, _u: UserId, _p: &str, _t: &str, _n: i64) {}
    }

    fn test_scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerSettings::default(),
            Box::new(InMemoryJobStore::new()),
            Box::new(AcceptingRunner),
            Box::new(AlwaysReady),
            Box::new(NoQuota),
        )
    }

    #[tokio::test]
    async fn test_service_runs_jobs_through_the_command_queue() {
        let (service, handle) = SchedulerService::new(test_scheduler());
        let token = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(service.run(token.clone()));

        handle
            .schedule(JobInfo::new(1, "com.example/.Svc"), 10_001, "com.example", 0, None)
            .await
            .unwrap();
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.running_jobs, 1);

        // Commands drain in FIFO order, so the follow-up stats read
        // observes the completion.
        handle.job_finished(JobKey::new(10_001, 1), false);
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.running_jobs, 0);
        assert_eq!(stats.recently_completed.len(), 1);

        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_handle_errors_after_shutdown() {
        tokio_test::block_on(async {
            let (service, handle) = SchedulerService::new(test_scheduler());
            drop(service);
            let result = handle
                .schedule(JobInfo::new(1, "com.example/.Svc"), 10_001, "com.example", 0, None)
                .await;
            assert!(result.is_err());
        });
    }
}
