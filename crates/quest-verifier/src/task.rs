// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::Result as AnyhowRes;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::errors::CodedError;

#[derive(Error, Debug)]
pub enum SupervisorErr<E: CodedError> {
    /// Restart / replace the task after failure
    #[error("Recoverable error: {0}")]
    Recover(E),
    /// Hard failure and exit the task set
    #[error("Hard failure: {0}")]
    Fault(E),
}

pub type RetryRes<E> = Pin<Box<dyn Future<Output = Result<(), SupervisorErr<E>>> + Send + 'static>>;

pub trait RetryTask {
    type Error: CodedError + Send + 'static;

    /// Defines how to spawn a task to be monitored for restarts
    fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error>;
}

/// Configuration for retry behavior in the supervisor
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay between retry attempts
    pub delay: std::time::Duration,
    /// Multiplier applied to the delay after each retry
    pub backoff_multiplier: f64,
    /// Maximum delay between retries, regardless of backoff
    pub max_delay: std::time::Duration,
    /// Maximum number of consecutive retries before giving up (None for unlimited)
    pub max_retries: Option<usize>,
    /// Duration after which to reset the retry counter if a task runs successfully
    pub reset_after: Option<std::time::Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: std::time::Duration::from_millis(500),
            backoff_multiplier: 1.5,
            max_delay: std::time::Duration::from_secs(60),
            max_retries: None,
            reset_after: Some(std::time::Duration::from_secs(60 * 5)),
        }
    }
}

/// Supervisor for managing and monitoring tasks with retry capabilities
pub struct Supervisor<T: RetryTask> {
    /// The task to be supervised
    task: Arc<T>,
    /// Configuration for retry behavior
    retry_policy: RetryPolicy,
    cancel_token: CancellationToken,
}

impl<T> Supervisor<T>
where
    T: RetryTask + Send,
{
    /// Create a new supervisor with a single task
    pub fn new(task: Arc<T>, cancel_token: CancellationToken) -> Self {
        Self { task, retry_policy: RetryPolicy::default(), cancel_token }
    }

    /// Configure the retry policy
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Calculate the delay for a specific retry attempt
    fn calculate_retry_delay(&self, retry_count: usize) -> std::time::Duration {
        if retry_count == 0 {
            return self.retry_policy.delay;
        }

        let backoff = self.retry_policy.delay.as_millis() as f64
            * self.retry_policy.backoff_multiplier.powi(retry_count as i32);

        let backoff_ms = backoff.min(self.retry_policy.max_delay.as_millis() as f64) as u64;

        std::time::Duration::from_millis(backoff_ms)
    }

    /// Run the supervisor until the task exits cleanly, faults, runs out of retries, or the
    /// cancel token fires.
    pub async fn spawn(self) -> AnyhowRes<()> {
        let mut tasks = JoinSet::new();
        let mut retry_count = 0;
        let mut last_spawn_time = tokio::time::Instant::now();

        tracing::debug!("Spawning task");
        tasks.spawn(self.task.spawn(self.cancel_token.clone()));

        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(task_res) => match task_res {
                    Ok(_) => {
                        tracing::debug!("Task exited cleanly");
                        if let Some(reset_duration) = self.retry_policy.reset_after {
                            let task_duration = last_spawn_time.elapsed();
                            if task_duration >= reset_duration && retry_count > 0 {
                                tracing::info!(
                                    "Task ran successfully for {:?}, resetting retry counter from {}",
                                    task_duration,
                                    retry_count
                                );
                                retry_count = 0;
                            }
                        }
                    }
                    Err(SupervisorErr::Recover(err)) => {
                        if self.cancel_token.is_cancelled() {
                            tracing::debug!("Task failed during shutdown, not restarting: {err}");
                            continue;
                        }
                        if let Some(max) = self.retry_policy.max_retries {
                            if retry_count >= max {
                                tracing::error!("Exceeded maximum retries ({max}) for task");
                                anyhow::bail!("Exceeded maximum retries for task");
                            }
                        }

                        let delay = self.calculate_retry_delay(retry_count);

                        tracing::warn!(
                            "Recoverable failure detected: {err:?}, spawning replacement (retry {}/{})",
                            retry_count + 1,
                            self.retry_policy
                                .max_retries
                                .map_or("unlimited".to_string(), |m| m.to_string())
                        );
                        tracing::debug!("Waiting {:?} before retry", delay);

                        let t = self.task.spawn(self.cancel_token.clone());
                        tasks.spawn(async move {
                            tokio::time::sleep(delay).await;
                            t.await
                        });

                        retry_count += 1;
                        last_spawn_time = tokio::time::Instant::now() + delay;
                    }
                    Err(SupervisorErr::Fault(err)) => {
                        tracing::error!("FAULT: Hard failure detected: {err:?}");
                        anyhow::bail!("Hard failure in supervisor task");
                    }
                },
                Err(err) => {
                    if err.is_cancelled() {
                        tracing::warn!("Task was canceled, treating it like a clean exit");
                    } else {
                        tracing::error!("ABORT: supervisor join failed");
                        anyhow::bail!(err);
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impl_coded_debug;
    use anyhow::Context;
    use async_channel::{Receiver, Sender};
    use tracing_test::traced_test;

    #[derive(Error)]
    enum TestErr {
        #[error("{code} Sample error", code = self.code())]
        Sample,
        #[error("{code} FAILURE", code = self.code())]
        Failure,
    }

    impl_coded_debug!(TestErr);

    impl CodedError for TestErr {
        fn code(&self) -> &str {
            match self {
                TestErr::Sample => "[QV-TEST-001]",
                TestErr::Failure => "[QV-TEST-002]",
            }
        }
    }

    struct TestTask {
        tx: Sender<u32>,
        rx: Receiver<u32>,
    }

    impl TestTask {
        fn new() -> Self {
            let (tx, rx) = async_channel::bounded(100);
            Self { tx, rx }
        }

        async fn tx(&self, val: u32) -> AnyhowRes<()> {
            self.tx.send(val).await.context("Failed to send on tx")
        }

        fn close(&self) -> bool {
            self.tx.close()
        }

        async fn process_item(
            rx: Receiver<u32>,
            cancel_token: CancellationToken,
        ) -> Result<(), SupervisorErr<TestErr>> {
            loop {
                let value = tokio::select! {
                    value = rx.recv() => match value {
                        Ok(val) => val,
                        Err(_) => {
                            tracing::debug!("channel closed, exiting..");
                            break;
                        }
                    },
                    _ = cancel_token.cancelled() => break,
                };

                tracing::info!("Got value: {value}");

                match value {
                    // Mock do work
                    0 => tokio::time::sleep(tokio::time::Duration::from_millis(100)).await,
                    // mock a clean exit
                    1 => return Ok(()),
                    // Mock a soft failure
                    2 => return Err(SupervisorErr::Recover(TestErr::Sample)),
                    // Mock a hard failure
                    3 => return Err(SupervisorErr::Fault(TestErr::Failure)),
                    _ => return Err(SupervisorErr::Recover(TestErr::Sample)),
                }
            }

            Ok(())
        }
    }

    impl RetryTask for TestTask {
        type Error = TestErr;

        fn spawn(&self, cancel_token: CancellationToken) -> RetryRes<Self::Error> {
            let rx_copy = self.rx.clone();
            Box::pin(Self::process_item(rx_copy, cancel_token))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn supervisor_simple() {
        let task = Arc::new(TestTask::new());
        task.tx(0).await.unwrap();

        let supervisor_task = Supervisor::new(task.clone(), CancellationToken::new()).spawn();

        task.tx(0).await.unwrap();
        task.tx(0).await.unwrap();
        task.tx(2).await.unwrap();
        task.tx(0).await.unwrap();
        task.close();

        supervisor_task.await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    #[should_panic(expected = "Hard failure in supervisor task")]
    async fn supervisor_fault() {
        let task = Arc::new(TestTask::new());
        task.tx(0).await.unwrap();

        let supervisor_task = Supervisor::new(task.clone(), CancellationToken::new()).spawn();

        task.tx(3).await.unwrap();
        task.close();

        supervisor_task.await.unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn supervisor_with_retry_policy() {
        let task = Arc::new(TestTask::new());

        let supervisor_task = Supervisor::new(task.clone(), CancellationToken::new())
            .with_retry_policy(RetryPolicy {
                delay: std::time::Duration::from_millis(10),
                backoff_multiplier: 2.0,
                max_delay: std::time::Duration::from_millis(500),
                max_retries: Some(3),
                reset_after: None,
            })
            .spawn();

        // Trigger 3 recoverable errors
        task.tx(2).await.unwrap();
        task.tx(2).await.unwrap();
        task.tx(2).await.unwrap();
        task.tx(0).await.unwrap();

        task.tx(2).await.unwrap();
        task.close();

        let res = supervisor_task.await;
        assert!(res.unwrap_err().to_string().contains("Exceeded maximum retries for task"));
    }

    #[tokio::test]
    #[traced_test]
    async fn supervisor_stops_on_cancel() {
        let task = Arc::new(TestTask::new());
        let cancel_token = CancellationToken::new();
        let supervisor_task =
            tokio::spawn(Supervisor::new(task.clone(), cancel_token.clone()).spawn());

        task.tx(0).await.unwrap();
        cancel_token.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(5), supervisor_task)
            .await
            .expect("supervisor did not stop")
            .unwrap()
            .unwrap();
    }
}
