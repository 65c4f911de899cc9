//! End-to-end tests: dispatcher and workers over one in-memory broker.
//!
//! Job → intake → worker A → results → intake → worker B → results → intake → done
//!
//! Verifies:
//! - outputs of one task become the resolved inputs of the next
//! - every chain entry carries its recorded outputs once the job finishes
//! - the job id assigned on the first pass survives the whole run
//! - failed tasks go around again until they succeed

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tokio::sync::watch;

use jobchain_broker::{Broker, Delivery, InMemoryBroker};
use jobchain_core::{Job, Task, WorkerEnvelope};

use crate::config::QueueNames;
use crate::dispatcher::{Dispatcher, NextTaskOutcome, ResultOutcome};
use crate::worker::{TaskError, TaskHandler, TaskWorker, WorkOutcome};

const INTAKE: &str = "worker";
const RESULTS: &str = "results";

/// Returns fixed outputs and remembers the inputs it was called with.
struct Recording {
    task_type: &'static str,
    outputs: Vec<JsonValue>,
    failures_left: Mutex<usize>,
    seen: Mutex<Vec<Vec<JsonValue>>>,
}

impl Recording {
    fn new(task_type: &'static str, outputs: Vec<JsonValue>) -> Arc<Self> {
        Self::failing(task_type, outputs, 0)
    }

    fn failing(task_type: &'static str, outputs: Vec<JsonValue>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            outputs,
            failures_left: Mutex::new(failures),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Vec<JsonValue>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskHandler for Arc<Recording> {
    fn task_type(&self) -> &str {
        self.task_type
    }

    async fn handle(
        &self,
        _task: &Task,
        inputs: Vec<JsonValue>,
    ) -> Result<Vec<JsonValue>, TaskError> {
        self.seen.lock().unwrap().push(inputs);
        let mut failures = self.failures_left.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(TaskError::Failed("transient".to_string()));
        }
        Ok(self.outputs.clone())
    }
}

fn scenario_job() -> JsonValue {
    json!({
        "chain": [
            { "id": 1, "type": "A", "inputs": ["x"] },
            { "id": 2, "type": "B", "inputs": [{ "outputOfId": 1, "outputIndex": 0 }] }
        ]
    })
}

async fn take(broker: &InMemoryBroker, queue: &str) -> Delivery {
    let mut sub = broker.consume(queue).await.unwrap();
    sub.try_recv()
        .unwrap_or_else(|| panic!("nothing waiting on {queue}"))
}

#[tokio::test]
async fn two_step_job_runs_to_completion() {
    let broker = Arc::new(InMemoryBroker::new());
    let dispatcher = Dispatcher::new(broker.clone(), QueueNames::new(INTAKE, RESULTS));
    dispatcher.init().await.unwrap();

    let a = Recording::new("A", vec![json!("y")]);
    let b = Recording::new("B", vec![json!("z")]);
    let worker_a = TaskWorker::new(broker.clone(), a.clone(), RESULTS);
    let worker_b = TaskWorker::new(broker.clone(), b.clone(), RESULTS);
    worker_a.init().await.unwrap();
    worker_b.init().await.unwrap();

    broker
        .publish(INTAKE, serde_json::to_vec(&scenario_job()).unwrap())
        .await
        .unwrap();

    // (a) id assigned, task 1 routed to "A"
    let outcome = dispatcher
        .handle_next_task(&take(&broker, INTAKE).await)
        .await
        .unwrap();
    let NextTaskOutcome::Dispatched { job_id, queue, idx } = outcome else {
        panic!("expected dispatch, got {outcome:?}");
    };
    assert_eq!((queue.as_str(), idx), ("A", 0));

    // (b) "A" returns ["y"]; merge records it and task 2 goes to "B" with "y"
    let outcome = worker_a.handle_delivery(&take(&broker, "A").await).await.unwrap();
    assert!(matches!(outcome, WorkOutcome::Succeeded { .. }));
    let outcome = dispatcher
        .handle_result(&take(&broker, RESULTS).await)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResultOutcome::Merged {
            job_id: Some(job_id.clone()),
            idx: 0
        }
    );
    let outcome = dispatcher
        .handle_next_task(&take(&broker, INTAKE).await)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        NextTaskOutcome::Dispatched {
            job_id: job_id.clone(),
            queue: "B".to_string(),
            idx: 1
        }
    );

    // (c) "B" succeeds; merge records chain[1]
    worker_b.handle_delivery(&take(&broker, "B").await).await.unwrap();
    assert_eq!(b.seen(), vec![vec![json!("y")]]);
    let outcome = dispatcher
        .handle_result(&take(&broker, RESULTS).await)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ResultOutcome::Merged {
            job_id: Some(job_id.clone()),
            idx: 1
        }
    );

    // (d) nothing pending: the job completes
    let last = take(&broker, INTAKE).await;
    let final_job: Job = serde_json::from_slice(last.body()).unwrap();
    let outcome = dispatcher.handle_next_task(&last).await.unwrap();
    assert_eq!(
        outcome,
        NextTaskOutcome::Completed {
            job_id: job_id.clone(),
            rollback: false
        }
    );

    assert_eq!(final_job.id, Some(job_id));
    let outputs: Vec<_> = final_job
        .tasks()
        .iter()
        .map(|t| (t.is_success(), t.outputs.clone()))
        .collect();
    assert_eq!(
        outputs,
        vec![(true, Some(vec![json!("y")])), (true, Some(vec![json!("z")]))]
    );
    assert_eq!(a.seen(), vec![vec![json!("x")]]);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn failing_task_is_retried_until_it_succeeds() {
    let broker = Arc::new(InMemoryBroker::new());
    let dispatcher = Dispatcher::new(broker.clone(), QueueNames::new(INTAKE, RESULTS));
    dispatcher.init().await.unwrap();

    let a = Recording::failing("A", vec![json!("y")], 2);
    let worker = TaskWorker::new(broker.clone(), a.clone(), RESULTS);
    worker.init().await.unwrap();

    let body = json!({ "chain": [{ "id": 1, "type": "A", "inputs": ["x"] }] });
    broker
        .publish(INTAKE, serde_json::to_vec(&body).unwrap())
        .await
        .unwrap();

    let mut forwarded = 0;
    let completed_id = loop {
        match dispatcher
            .handle_next_task(&take(&broker, INTAKE).await)
            .await
            .unwrap()
        {
            NextTaskOutcome::Dispatched { queue, idx, .. } => {
                assert_eq!((queue.as_str(), idx), ("A", 0));
            }
            NextTaskOutcome::Completed { job_id, .. } => break job_id,
            other => panic!("unexpected outcome {other:?}"),
        }
        worker.handle_delivery(&take(&broker, "A").await).await.unwrap();
        if let ResultOutcome::Forwarded { .. } = dispatcher
            .handle_result(&take(&broker, RESULTS).await)
            .await
            .unwrap()
        {
            forwarded += 1;
        }
    };

    assert_eq!(forwarded, 2);
    assert_eq!(a.seen().len(), 3);

    let stamped: Vec<_> = broker
        .published_to("A")
        .iter()
        .map(|body| {
            serde_json::from_slice::<WorkerEnvelope>(body)
                .unwrap()
                .content
                .id
        })
        .collect();
    assert_eq!(stamped, vec![Some(completed_id); 3]);
}

#[tokio::test]
async fn running_services_complete_the_scenario() {
    let broker = Arc::new(InMemoryBroker::new());
    let dispatcher = Arc::new(Dispatcher::new(
        broker.clone(),
        QueueNames::new(INTAKE, RESULTS),
    ));
    dispatcher.init().await.unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    let stopped = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.wait_for(|stop| *stop).await;
    };

    let mut handles = Vec::new();
    for (task_type, output) in [("A", "y"), ("B", "z")] {
        let worker = TaskWorker::new(
            broker.clone(),
            Recording::new(task_type, vec![json!(output)]),
            RESULTS,
        );
        // Declare before the job is submitted so nothing is published to a
        // queue the worker has not subscribed to yet.
        worker.init().await.unwrap();
        let shutdown = stopped(stop_rx.clone());
        handles.push(tokio::spawn(async move {
            worker.run(shutdown).await.map_err(|e| e.to_string())
        }));
    }
    {
        let dispatcher = dispatcher.clone();
        let shutdown = stopped(stop_rx.clone());
        handles.push(tokio::spawn(async move {
            dispatcher.run(shutdown).await.map_err(|e| e.to_string())
        }));
    }

    broker
        .publish(INTAKE, serde_json::to_vec(&scenario_job()).unwrap())
        .await
        .unwrap();

    // The job is done once a fully successful chain was resubmitted to intake
    // and the dispatcher settled it.
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = broker.published_to(INTAKE).iter().any(|body| {
                serde_json::from_slice::<Job>(body)
                    .map(|job| job.tasks().iter().all(Task::is_success))
                    .unwrap_or(false)
            });
            if done && broker.unacked_count() == 0 && broker.queue_depth(INTAKE) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "job did not finish in time");

    stop_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(broker.published_to("A").len(), 1);
    assert_eq!(broker.published_to("B").len(), 1);
    assert_eq!(broker.published_to(RESULTS).len(), 2);
}
