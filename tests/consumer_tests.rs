//! Worker pool behavior against in-memory deliveries

use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};

use ocr_pipeline::consumer::{payload_builder, Delivery, FnEventHandler, ProcessOutcome, WorkerPool};
use ocr_pipeline::events::{Event, EventSpec, FileUploaded, EVENT_ID_HEADER};
use ocr_pipeline::jetstream::ConsumerSettings;
use ocr_pipeline::producer::message_headers;
use ocr_pipeline::propagation::default_propagator;

#[derive(Default)]
struct Settlements {
    acks: AtomicUsize,
    naks: AtomicUsize,
}

impl Settlements {
    fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    fn naks(&self) -> usize {
        self.naks.load(Ordering::SeqCst)
    }
}

struct FakeMessage {
    headers: Option<HeaderMap>,
    payload: Vec<u8>,
    settlements: Arc<Settlements>,
    ack_fails: bool,
    nak_fails: bool,
}

#[async_trait]
impl Delivery for FakeMessage {
    fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), async_nats::Error> {
        if self.ack_fails {
            return Err("ack timed out".into());
        }
        self.settlements.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self) -> Result<(), async_nats::Error> {
        if self.nak_fails {
            return Err("connection closed".into());
        }
        self.settlements.naks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn uploaded(file_key: &str) -> FileUploaded {
    FileUploaded {
        file_key: file_key.to_string(),
        file_name: "a.pdf".to_string(),
        bucket_name: String::new(),
    }
}

fn wire(event: &Event<FileUploaded>, settlements: &Arc<Settlements>) -> FakeMessage {
    let propagator = default_propagator();
    FakeMessage {
        headers: Some(message_headers(
            event,
            &opentelemetry::Context::new(),
            propagator.as_ref(),
        )),
        payload: event.encode_payload(),
        settlements: Arc::clone(settlements),
        ack_fails: false,
        nak_fails: false,
    }
}

fn settings(workers: usize, buffer_size: usize) -> ConsumerSettings {
    ConsumerSettings::new("test_file_uploaded_consumer", "storage", "storage.file.uploaded")
        .with_workers(workers)
        .with_buffer_size(buffer_size)
}

fn pool<F, Fut>(settings: &ConsumerSettings, handler: F) -> Arc<WorkerPool<Event<FileUploaded>>>
where
    F: Fn(Event<FileUploaded>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(WorkerPool::new(
        settings,
        payload_builder::<FileUploaded>(),
        Arc::new(FnEventHandler::new(handler)),
        default_propagator(),
    ))
}

async fn crash(_: Event<FileUploaded>) -> anyhow::Result<()> {
    panic!("ocr engine crashed")
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_published_event_is_decoded_and_acked() {
    let id = ulid::Ulid::from_string("01ARZ3NDEKTSV4RRFFQ69G5FAV").unwrap();
    let event = Event::with_id(id, uploaded("abc"));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let pool = pool(&settings(1, 1), move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().await.push(event);
            Ok(())
        }
    });

    let settlements = Arc::new(Settlements::default());
    let outcome = pool.process(wire(&event, &settlements)).await;

    assert_eq!(outcome, ProcessOutcome::Acked);
    assert_eq!(settlements.acks(), 1);
    assert_eq!(settlements.naks(), 0);

    let received = received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id().to_string(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
    assert_eq!(received[0].payload(), &uploaded("abc"));
}

#[tokio::test]
async fn test_missing_id_header_is_nacked() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let pool = pool(&settings(1, 1), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    });

    let settlements = Arc::new(Settlements::default());
    let mut msg = wire(&Event::new(uploaded("abc")), &settlements);
    msg.headers = Some(HeaderMap::new());

    let outcome = pool.process(msg).await;

    assert_eq!(outcome, ProcessOutcome::DecodeFailed);
    assert_eq!(settlements.naks(), 1);
    assert_eq!(settlements.acks(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_garbage_payload_is_nacked() {
    let pool = pool(&settings(1, 1), |_| async { Ok(()) });

    let settlements = Arc::new(Settlements::default());
    let mut msg = wire(&Event::new(uploaded("abc")), &settlements);
    msg.payload = vec![0xff, 0xff, 0xff];

    assert_eq!(pool.process(msg).await, ProcessOutcome::DecodeFailed);
    assert_eq!(settlements.naks(), 1);
}

#[tokio::test]
async fn test_handler_failure_is_nacked_not_acked() {
    let pool = pool(&settings(1, 1), |_| async { Err(anyhow::anyhow!("ocr backend down")) });

    let settlements = Arc::new(Settlements::default());
    let outcome = pool.process(wire(&Event::new(uploaded("abc")), &settlements)).await;

    assert_eq!(outcome, ProcessOutcome::HandlerFailed);
    assert_eq!(settlements.naks(), 1);
    assert_eq!(settlements.acks(), 0);
}

#[tokio::test]
async fn test_handler_panic_is_nacked() {
    let pool = pool(&settings(1, 1), crash);

    let settlements = Arc::new(Settlements::default());
    let outcome = pool.process(wire(&Event::new(uploaded("abc")), &settlements)).await;

    assert_eq!(outcome, ProcessOutcome::HandlerFailed);
    assert_eq!(settlements.naks(), 1);
    assert_eq!(settlements.acks(), 0);
}

#[tokio::test]
async fn test_panicking_handler_does_not_kill_the_worker() {
    let pool = pool(&settings(1, 4), |event: Event<FileUploaded>| async move {
        if event.payload().file_key == "boom" {
            panic!("ocr engine crashed");
        }
        Ok(())
    });

    let settlements = Arc::new(Settlements::default());
    let messages: Vec<_> = ["boom", "ok1", "ok2"]
        .into_iter()
        .map(|key| wire(&Event::new(uploaded(key)), &settlements))
        .collect();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let _delivery = pool.spawn(stream::iter(messages).chain(stream::pending()), stop_rx);

    wait_until(|| settlements.acks() == 2).await;
    assert_eq!(settlements.naks(), 1);
    assert_eq!(pool.active_workers(), 0);
}

#[tokio::test]
async fn test_failed_ack_is_not_nacked() {
    let pool = pool(&settings(1, 1), |_| async { Ok(()) });

    let settlements = Arc::new(Settlements::default());
    let mut msg = wire(&Event::new(uploaded("abc")), &settlements);
    msg.ack_fails = true;

    assert_eq!(pool.process(msg).await, ProcessOutcome::AckFailed);
    assert_eq!(settlements.acks(), 0);
    assert_eq!(settlements.naks(), 0);
}

#[tokio::test]
async fn test_failed_nak_still_reports_handler_failure() {
    let pool = pool(&settings(1, 1), |_| async { Err(anyhow::anyhow!("ocr backend down")) });

    let settlements = Arc::new(Settlements::default());
    let mut msg = wire(&Event::new(uploaded("abc")), &settlements);
    msg.nak_fails = true;

    assert_eq!(pool.process(msg).await, ProcessOutcome::HandlerFailed);
    assert_eq!(settlements.acks(), 0);
    assert_eq!(settlements.naks(), 0);
}

#[tokio::test]
async fn test_settlement_failures_do_not_stall_the_pool() {
    let pool = pool(&settings(1, 2), |event: Event<FileUploaded>| async move {
        if event.payload().file_key == "bad" {
            anyhow::bail!("ocr backend down");
        }
        Ok(())
    });

    let settlements = Arc::new(Settlements::default());
    let mut unackable = wire(&Event::new(uploaded("a")), &settlements);
    unackable.ack_fails = true;
    let mut unnakable = wire(&Event::new(uploaded("bad")), &settlements);
    unnakable.nak_fails = true;
    let healthy = wire(&Event::new(uploaded("b")), &settlements);

    let (_stop_tx, stop_rx) = watch::channel(false);
    let delivery = pool.spawn(stream::iter(vec![unackable, unnakable, healthy]), stop_rx);

    wait_until(|| settlements.acks() == 1).await;
    delivery.await.unwrap();
    assert_eq!(settlements.naks(), 0);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_worker_count() {
    const WORKERS: usize = 3;
    const MESSAGES: usize = 30;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (running_in, peak_in) = (Arc::clone(&running), Arc::clone(&peak));
    let pool = pool(&settings(WORKERS, 2), move |_| {
        let running = Arc::clone(&running_in);
        let peak = Arc::clone(&peak_in);
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let settlements = Arc::new(Settlements::default());
    let messages: Vec<_> = (0..MESSAGES)
        .map(|i| wire(&Event::new(uploaded(&i.to_string())), &settlements))
        .collect();

    let (_stop_tx, stop_rx) = watch::channel(false);
    let delivery = pool.spawn(stream::iter(messages), stop_rx);

    wait_until(|| settlements.acks() == MESSAGES).await;
    delivery.await.unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= WORKERS, "peak concurrency {peak} exceeded {WORKERS}");
    assert!(peak >= 2, "workers never overlapped");
    assert_eq!(settlements.naks(), 0);
}

#[tokio::test]
async fn test_full_buffer_pushes_back_on_the_feed() {
    let gate = Arc::new(Semaphore::new(0));
    let gate_in = Arc::clone(&gate);
    let pool = pool(&settings(1, 1), move |_| {
        let gate = Arc::clone(&gate_in);
        async move {
            let _pass = gate.acquire().await?;
            Ok::<_, anyhow::Error>(())
        }
    });

    let settlements = Arc::new(Settlements::default());
    let pulled = Arc::new(AtomicUsize::new(0));

    let feed_settlements = Arc::clone(&settlements);
    let feed_pulled = Arc::clone(&pulled);
    let feed = stream::iter(0..10).map(move |i| {
        feed_pulled.fetch_add(1, Ordering::SeqCst);
        wire(&Event::new(uploaded(&i.to_string())), &feed_settlements)
    });

    let (_stop_tx, stop_rx) = watch::channel(false);
    let delivery = pool.spawn(feed, stop_rx);

    wait_until(|| pulled.load(Ordering::SeqCst) >= 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // one in the handler, one buffered, one held by the delivery loop
    assert_eq!(pulled.load(Ordering::SeqCst), 3);
    assert_eq!(pool.active_workers(), 1);
    assert_eq!(settlements.acks(), 0);

    gate.add_permits(10);

    wait_until(|| settlements.acks() == 10).await;
    delivery.await.unwrap();
    assert_eq!(pulled.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_stop_ends_delivery_loop() {
    let pool = pool(&settings(2, 1), |_| async { Ok(()) });

    let (stop_tx, stop_rx) = watch::channel(false);
    let delivery = pool.spawn(stream::pending::<FakeMessage>(), stop_rx);

    stop_tx.send_replace(true);

    tokio::time::timeout(Duration::from_secs(1), delivery)
        .await
        .expect("delivery loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_stop_while_buffer_full_ends_delivery() {
    let gate = Arc::new(Semaphore::new(0));
    let gate_in = Arc::clone(&gate);
    let pool = pool(&settings(1, 1), move |_| {
        let gate = Arc::clone(&gate_in);
        async move {
            let _pass = gate.acquire().await?;
            Ok::<_, anyhow::Error>(())
        }
    });

    let settlements = Arc::new(Settlements::default());
    let pulled = Arc::new(AtomicUsize::new(0));

    let feed_settlements = Arc::clone(&settlements);
    let feed_pulled = Arc::clone(&pulled);
    let feed = stream::iter(0..10).map(move |i| {
        feed_pulled.fetch_add(1, Ordering::SeqCst);
        wire(&Event::new(uploaded(&i.to_string())), &feed_settlements)
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let delivery = pool.spawn(feed, stop_rx);

    // one in the handler, one buffered, one waiting for buffer space
    wait_until(|| pulled.load(Ordering::SeqCst) == 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!delivery.is_finished());

    stop_tx.send_replace(true);
    tokio::time::timeout(Duration::from_secs(1), delivery)
        .await
        .expect("delivery loop did not stop")
        .unwrap();

    gate.add_permits(10);
    wait_until(|| settlements.acks() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(pulled.load(Ordering::SeqCst), 3);
    assert_eq!(settlements.acks(), 2);
}

#[tokio::test]
async fn test_malformed_messages_do_not_stall_the_pool() {
    let pool = pool(&settings(2, 2), |_| async { Ok(()) });

    let settlements = Arc::new(Settlements::default());
    let mut messages = Vec::new();
    for i in 0..6 {
        let mut msg = wire(&Event::new(uploaded(&i.to_string())), &settlements);
        if i % 2 == 0 {
            msg.headers = None;
        }
        messages.push(msg);
    }

    let (_stop_tx, stop_rx) = watch::channel(false);
    let delivery = pool.spawn(stream::iter(messages), stop_rx);

    wait_until(|| settlements.acks() + settlements.naks() == 6).await;
    delivery.await.unwrap();

    assert_eq!(settlements.acks(), 3);
    assert_eq!(settlements.naks(), 3);
}

proptest! {
    #[test]
    fn prop_wire_shape_round_trips(
        file_key in "[a-zA-Z0-9/_.-]{0,64}",
        file_name in "\\PC{0,32}",
        bucket_name in "[a-z0-9-]{0,16}",
    ) {
        let event = Event::new(FileUploaded { file_key, file_name, bucket_name });
        let headers = message_headers(&event, &opentelemetry::Context::new(), default_propagator().as_ref());

        prop_assert_eq!(
            headers.get(EVENT_ID_HEADER).map(|v| v.as_str().to_string()),
            Some(event.id().to_string())
        );

        let decoded = Event::<FileUploaded>::from_message(Some(&headers), &event.encode_payload()).unwrap();
        prop_assert_eq!(decoded, event);
    }
}
