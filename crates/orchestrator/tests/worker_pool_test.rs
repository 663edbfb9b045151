//! Routing, backpressure, shutdown and failure-isolation scenarios for the
//! dispatcher and worker pool
use crossbeam_channel::{unbounded, Receiver};
use lipwatch_common::{DetectionJob, DetectionResult, FeatureVector, JobErrorCode, PipelineError, StreamId, WorkerId};
use lipwatch_orchestrator::{
    assign_worker, stable_hash, Dispatcher, PipelineStats, RecognizerFactory, WorkerPool, WorkerSettings, WorkerState,
};
use lipwatch_recognition::{Recognition, RecognitionError, RecognitionResult, Recognizer};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn settings(queue_capacity: usize) -> WorkerSettings {
    WorkerSettings {
        queue_capacity,
        poll_interval: Duration::from_millis(10),
        frame_batch_size: None,
    }
}

/// Job whose single feature carries `tag`
fn tagged_job(stream: &str, tag: u64) -> DetectionJob {
    DetectionJob::new(
        StreamId::new(stream),
        "lobby",
        vec![FeatureVector::new(vec![tag as f32], 0.9)],
        tag,
        tag,
    )
}

/// Recognizer answering with the tag of the first feature, after `delay`
fn tag_factory(delay: Duration) -> RecognizerFactory {
    Arc::new(move |_: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> {
        Ok(Box::new(move |batch: &[FeatureVector]| -> RecognitionResult<Recognition> {
            thread::sleep(delay);
            Ok(Recognition::new(format!("{}", batch[0].values[0]), 0.9))
        }))
    })
}

fn collect(rx: &Receiver<DetectionResult>, n: usize) -> Vec<DetectionResult> {
    (0..n)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect()
}

#[test]
fn test_routing_is_stable_across_pool_instances() {
    let stream = StreamId::new("north-gate");
    let first = assign_worker(&stream, 5);
    for _ in 0..100 {
        assert_eq!(assign_worker(&stream, 5), first);
    }

    // Same value a fresh process would compute: derived only from the id bytes
    let digest = blake3::hash(b"north-gate");
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    assert_eq!(stable_hash(&stream), u64::from_le_bytes(bytes));
    assert_eq!(first, WorkerId((u64::from_le_bytes(bytes) % 5) as usize));
}

#[test]
fn test_jobs_of_one_stream_are_processed_in_order_on_one_worker() {
    let (out_tx, out_rx) = unbounded();
    let stats = Arc::new(PipelineStats::new());
    let pool = WorkerPool::start(3, tag_factory(Duration::ZERO), out_tx, settings(32), Arc::clone(&stats)).unwrap();

    let stream = StreamId::new("platform-4");
    let dispatcher = Dispatcher::new(pool.queues(), [stream.clone()], Arc::clone(&stats));
    let expected_worker = assign_worker(&stream, 3);

    for tag in 0..20 {
        assert_eq!(dispatcher.submit(tagged_job("platform-4", tag)).unwrap(), expected_worker);
    }

    let results = collect(&out_rx, 20);
    let texts: Vec<String> = results.iter().map(|r| r.text.clone()).collect();
    let expected: Vec<String> = (0..20).map(|t| t.to_string()).collect();
    assert_eq!(texts, expected);
    assert!(results.iter().all(|r| r.worker == expected_worker));

    assert!(pool.shutdown(Duration::from_secs(5)).is_clean());
}

#[test]
fn test_full_queue_drops_new_job_and_counts_it() {
    let (out_tx, out_rx) = unbounded();
    let stats = Arc::new(PipelineStats::new());
    let pool =
        WorkerPool::start(1, tag_factory(Duration::from_millis(300)), out_tx, settings(2), Arc::clone(&stats)).unwrap();
    let dispatcher = Dispatcher::new(pool.queues(), [StreamId::new("cam")], Arc::clone(&stats));
    let queue = pool.queues().remove(0);

    // The worker takes job 0 and sleeps; jobs 1 and 2 fill the queue
    dispatcher.submit(tagged_job("cam", 0)).unwrap();
    while queue.depth() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    dispatcher.submit(tagged_job("cam", 1)).unwrap();
    dispatcher.submit(tagged_job("cam", 2)).unwrap();
    assert_eq!(queue.depth(), 2);

    let err = dispatcher.submit(tagged_job("cam", 3)).unwrap_err();
    assert!(matches!(err, PipelineError::QueueFull { worker: WorkerId(0) }));
    assert_eq!(queue.depth(), 2);
    assert_eq!(stats.snapshot().jobs_dropped_queue_full, 1);

    // The queued jobs are still the original two
    let texts: Vec<String> = collect(&out_rx, 3).into_iter().map(|r| r.text).collect();
    assert_eq!(texts, vec!["0", "1", "2"]);
    pool.shutdown(Duration::from_secs(5));
}

#[test]
fn test_graceful_shutdown_processes_queued_jobs() {
    let (out_tx, out_rx) = unbounded();
    let stats = Arc::new(PipelineStats::new());
    let pool =
        WorkerPool::start(2, tag_factory(Duration::from_millis(10)), out_tx, settings(8), Arc::clone(&stats)).unwrap();
    let streams: Vec<StreamId> = (0..4).map(|i| StreamId::new(format!("cam-{i}"))).collect();
    let dispatcher = Dispatcher::new(pool.queues(), streams.clone(), Arc::clone(&stats));

    for (i, stream) in streams.iter().enumerate() {
        dispatcher.submit(tagged_job(stream.as_str(), i as u64)).unwrap();
        dispatcher.submit(tagged_job(stream.as_str(), 10 + i as u64)).unwrap();
    }

    let queues = pool.queues();
    let report = pool.shutdown(Duration::from_secs(5));
    assert!(report.is_clean());
    assert_eq!(report.stopped.len(), 2);
    assert!(queues.iter().all(|q| q.state() == WorkerState::Stopped));

    // Every accepted job produced a result before the workers exited
    let results: Vec<DetectionResult> = out_rx.try_iter().collect();
    assert_eq!(results.len(), 8);
    assert!(results.iter().all(DetectionResult::is_success));
}

#[test]
fn test_force_stop_reports_every_queued_job() {
    let (out_tx, out_rx) = unbounded();
    let stats = Arc::new(PipelineStats::new());
    let pool =
        WorkerPool::start(1, tag_factory(Duration::from_millis(500)), out_tx, settings(4), Arc::clone(&stats)).unwrap();
    let dispatcher = Dispatcher::new(pool.queues(), [StreamId::new("cam")], Arc::clone(&stats));
    let queue = pool.queues().remove(0);

    dispatcher.submit(tagged_job("cam", 0)).unwrap();
    while queue.depth() > 0 {
        thread::sleep(Duration::from_millis(1));
    }
    dispatcher.submit(tagged_job("cam", 1)).unwrap();
    dispatcher.submit(tagged_job("cam", 2)).unwrap();

    let report = pool.shutdown(Duration::from_millis(50));
    assert_eq!(report.force_stopped, vec![WorkerId(0)]);
    assert_eq!(report.abandoned, 2);
    assert_eq!(stats.snapshot().workers_force_stopped, 1);

    // Two abandoned results now, the in-flight job's result once it finishes
    let results = collect(&out_rx, 3);
    let abandoned = results
        .iter()
        .filter(|r| r.error.as_ref().is_some_and(|e| e.code == JobErrorCode::Abandoned))
        .count();
    assert_eq!(abandoned, 2);
    assert_eq!(results.iter().filter(|r| r.is_success()).count(), 1);
}

#[test]
fn test_failing_recognizer_does_not_take_the_worker_down() {
    let (out_tx, out_rx) = unbounded();
    let stats = Arc::new(PipelineStats::new());
    let factory: RecognizerFactory = Arc::new(|_: WorkerId| -> RecognitionResult<Box<dyn Recognizer>> {
        Ok(Box::new(|_: &[FeatureVector]| -> RecognitionResult<Recognition> {
            Err(RecognitionError::Exhausted {
                attempts: 3,
                source: Box::new(RecognitionError::Request("connection refused".into())),
            })
        }))
    });
    let pool = WorkerPool::start(1, factory, out_tx, settings(8), Arc::clone(&stats)).unwrap();
    let dispatcher = Dispatcher::new(pool.queues(), [StreamId::new("cam")], Arc::clone(&stats));

    for tag in 0..3 {
        dispatcher.submit(tagged_job("cam", tag)).unwrap();
    }
    let failures = collect(&out_rx, 3);
    for result in &failures {
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.code, JobErrorCode::Inference);
        assert!(result.text.is_empty());
    }

    assert_eq!(pool.health(), vec![(WorkerId(0), WorkerState::Running)]);
    dispatcher.submit(tagged_job("cam", 3)).unwrap();
    let fourth = collect(&out_rx, 1).remove(0);
    assert_eq!(fourth.error.map(|e| e.code), Some(JobErrorCode::Inference));

    assert!(pool.shutdown(Duration::from_secs(5)).is_clean());
}
