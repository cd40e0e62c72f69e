//! End-to-end watcher behavior against a scripted chain and a recording sink:
//! catch-up scans, live/catch-up handover dedupe, per-instance ordering,
//! checkpoint advancement and failure handling. No live node or broker.

use std::{
    collections::{HashSet, VecDeque},
    ops::RangeInclusive,
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use orbitsphere_relay::{
    Checkpoint, CheckpointStore, MemoryCheckpointStore, RelayError, Watcher,
    dispatch::EventSink,
    events::{
        BlockRef, ChainEvent, EventKind, InstanceRented, InstanceStopped, InstanceTerminated,
    },
    watcher::{ChainReader, LogStream},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const TENANT: Address = Address::repeat_byte(0xAA);

fn block_hash(number: u64) -> B256 {
    B256::repeat_byte(number as u8)
}

fn checkpoint_at(number: u64) -> Checkpoint {
    Checkpoint { block_number: number, block_hash: block_hash(number) }
}

fn mined_log(event: &impl SolEvent, block: u64, index: u64) -> Log {
    Log {
        inner: alloy::primitives::Log { address: Address::ZERO, data: event.encode_log_data() },
        block_number: Some(block),
        block_hash: Some(block_hash(block)),
        log_index: Some(index),
        ..Default::default()
    }
}

fn rented_log(nft_id: u64, block: u64) -> Log {
    let event = InstanceRented {
        nftId: U256::from(nft_id),
        tenant: TENANT,
        region: "us-east".into(),
        instanceType: "gpu.small".into(),
        sshPublicKey: "ssh-rsa AAAA".into(),
        rentedOn: U256::from(1_000u64),
        willBeEndOn: U256::from(4_600u64),
        totalCost: U256::from(360u64),
        pricePerHour: U256::from(1u64),
    };
    mined_log(&event, block, 0)
}

fn stopped_log(nft_id: u64, block: u64) -> Log {
    mined_log(&InstanceStopped { nftId: U256::from(nft_id), tenant: TENANT }, block, 1)
}

fn terminated_log(nft_id: u64, block: u64) -> Log {
    let event = InstanceTerminated {
        nftId: U256::from(nft_id),
        tenant: TENANT,
        actualCost: U256::from(300u64),
        timeConsumed: U256::from(3_600u64),
        refundAmount: U256::from(60u64),
    };
    mined_log(&event, block, 2)
}

/// Scripted chain: a fixed log history, a settable head, and a queue of
/// pre-arranged live subscriptions (dropping a feeder simulates a lost
/// subscription; an empty queue yields a subscription that never fires).
#[derive(Clone, Default)]
struct FakeChain {
    head: Arc<Mutex<u64>>,
    logs: Arc<Mutex<Vec<Log>>>,
    subscriptions: Arc<Mutex<VecDeque<mpsc::Receiver<Log>>>>,
}

impl FakeChain {
    fn set_head(&self, number: u64) {
        *self.head.lock().unwrap() = number;
    }

    fn add_logs(&self, logs: impl IntoIterator<Item = Log>) {
        self.logs.lock().unwrap().extend(logs);
    }

    fn push_subscription(&self) -> mpsc::Sender<Log> {
        let (tx, rx) = mpsc::channel(32);
        self.subscriptions.lock().unwrap().push_back(rx);
        tx
    }
}

impl ChainReader for FakeChain {
    async fn head(&self) -> Result<BlockRef, RelayError> {
        let number = *self.head.lock().unwrap();
        Ok(BlockRef { number, hash: block_hash(number) })
    }

    async fn logs(&self, range: RangeInclusive<u64>) -> Result<Vec<Log>, RelayError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.block_number.is_some_and(|n| range.contains(&n)))
            .cloned()
            .collect())
    }

    async fn subscribe(&self) -> Result<LogStream, RelayError> {
        match self.subscriptions.lock().unwrap().pop_front() {
            Some(rx) => Ok(Box::pin(ReceiverStream::new(rx))),
            None => Ok(Box::pin(tokio_stream::pending())),
        }
    }
}

/// Records every dispatched event; publishes for listed instances fail.
#[derive(Clone, Default)]
struct RecordingSink {
    events: Arc<Mutex<Vec<ChainEvent>>>,
    failing: Arc<Mutex<HashSet<U256>>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<ChainEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn fail_instance(&self, nft_id: u64) {
        self.failing.lock().unwrap().insert(U256::from(nft_id));
    }

    fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }
}

impl EventSink for RecordingSink {
    async fn dispatch(&self, event: &ChainEvent) -> Result<(), RelayError> {
        if self.failing.lock().unwrap().contains(&event.nft_id()) {
            return Err(RelayError::PublishRejected { routing_key: "ROUTE_TO_STOP_QUEUE" });
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

async fn wait_until(mut condition: impl AsyncFnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(120), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn stored_block(store: &MemoryCheckpointStore) -> Option<u64> {
    store.read().await.unwrap().map(|cp| cp.block_number)
}

#[tokio::test(start_paused = true)]
async fn restart_scan_dispatches_missed_events_and_advances_checkpoint() {
    let chain = FakeChain::default();
    chain.set_head(110);
    chain.add_logs([stopped_log(42, 105)]);
    let sink = RecordingSink::default();
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(checkpoint_at(100)));

    let handle = Watcher::new(chain, sink.clone(), Arc::clone(&store)).start();

    wait_until(async || stored_block(&store).await == Some(110)).await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), EventKind::Stopped);
    assert_eq!(events[0].nft_id(), U256::from(42));
    assert_eq!(events[0].block.number, 105);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn first_run_without_checkpoint_anchors_at_head() {
    let chain = FakeChain::default();
    chain.set_head(50);
    chain.add_logs([stopped_log(1, 40)]);
    let sink = RecordingSink::default();
    let store = Arc::new(MemoryCheckpointStore::new());

    let handle = Watcher::new(chain, sink.clone(), Arc::clone(&store)).start();

    wait_until(async || stored_block(&store).await == Some(50)).await;
    assert_eq!(sink.count(), 0, "historical events before the anchor are not replayed");

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn start_block_overrides_the_head_anchor() {
    let chain = FakeChain::default();
    chain.set_head(50);
    chain.add_logs([rented_log(7, 45)]);
    let sink = RecordingSink::default();
    let store = Arc::new(MemoryCheckpointStore::new());

    let handle = Watcher::new(chain, sink.clone(), Arc::clone(&store)).start_block(40).start();

    wait_until(async || stored_block(&store).await == Some(50)).await;
    assert_eq!(sink.count(), 1);
    assert_eq!(sink.events()[0].kind(), EventKind::Rented);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn overlapping_live_and_catchup_windows_dispatch_each_event_once() {
    let chain = FakeChain::default();
    chain.set_head(125);
    chain.add_logs([stopped_log(42, 120)]);
    let live = chain.push_subscription();
    let sink = RecordingSink::default();
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(checkpoint_at(100)));

    // the live path delivers the same block-120 event the scan will cover,
    // plus a genuinely new one
    live.send(stopped_log(42, 120)).await.unwrap();
    live.send(stopped_log(42, 126)).await.unwrap();

    let handle = Watcher::new(chain, sink.clone(), Arc::clone(&store)).start();

    wait_until(async || sink.count() == 2).await;
    wait_until(async || stored_block(&store).await == Some(126)).await;

    let events = sink.events();
    let ids: HashSet<_> = events.iter().map(ChainEvent::id).collect();
    assert_eq!(ids.len(), events.len(), "no duplicate dispatches");
    assert_eq!(events[0].block.number, 120, "catch-up dispatches the overlap first");
    assert_eq!(events[1].block.number, 126);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn per_instance_order_is_preserved_across_paths() {
    let chain = FakeChain::default();
    chain.set_head(120);
    chain.add_logs([rented_log(7, 110), stopped_log(7, 115)]);
    let live = chain.push_subscription();
    let sink = RecordingSink::default();
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(checkpoint_at(100)));

    live.send(terminated_log(7, 130)).await.unwrap();

    let handle = Watcher::new(chain, sink.clone(), Arc::clone(&store)).start();

    wait_until(async || sink.count() == 3).await;

    let kinds: Vec<_> = sink.events().iter().map(ChainEvent::kind).collect();
    assert_eq!(kinds, [EventKind::Rented, EventKind::Stopped, EventKind::Terminated]);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_publish_halts_the_checkpoint_and_is_retried() {
    let chain = FakeChain::default();
    chain.set_head(110);
    chain.add_logs([stopped_log(42, 105), stopped_log(43, 106), terminated_log(42, 107)]);
    let sink = RecordingSink::default();
    sink.fail_instance(42);
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(checkpoint_at(100)));

    let handle = Watcher::new(chain, sink.clone(), Arc::clone(&store)).start();

    // first scan: instance 42 fails at block 105, so its block-107 event is
    // held back to preserve order; the unaffected instance 43 still goes out
    wait_until(async || sink.count() == 1).await;
    assert_eq!(sink.events()[0].nft_id(), U256::from(43));
    assert_eq!(stored_block(&store).await, Some(100), "checkpoint must not pass the failure");

    // broker recovers; the retried scan completes the instance-42 stream
    sink.clear_failures();
    wait_until(async || sink.count() == 3).await;
    wait_until(async || stored_block(&store).await == Some(110)).await;

    let events = sink.events();
    let ids: HashSet<_> = events.iter().map(ChainEvent::id).collect();
    assert_eq!(ids.len(), 3, "instance 43 is not re-dispatched by the retry");
    let blocks_of_42: Vec<_> =
        events.iter().filter(|e| e.nft_id() == U256::from(42)).map(|e| e.block.number).collect();
    assert_eq!(blocks_of_42, [105, 107], "instance 42 replays in chain order");

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failure_after_a_success_in_the_same_block_is_still_retried() {
    let chain = FakeChain::default();
    chain.set_head(110);
    // both events share block 105; the stop (log index 1) dispatches before
    // the terminate (log index 2), which fails
    chain.add_logs([stopped_log(43, 105), terminated_log(42, 105)]);
    let sink = RecordingSink::default();
    sink.fail_instance(42);
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(checkpoint_at(100)));

    let handle = Watcher::new(chain, sink.clone(), Arc::clone(&store)).start();

    wait_until(async || sink.count() == 1).await;
    assert_eq!(sink.events()[0].nft_id(), U256::from(43));
    assert_eq!(
        stored_block(&store).await,
        Some(100),
        "checkpoint must stay below the block holding the failed event"
    );

    sink.clear_failures();
    wait_until(async || sink.count() == 2).await;
    wait_until(async || stored_block(&store).await == Some(110)).await;

    let events = sink.events();
    let blocks_of_42: Vec<_> =
        events.iter().filter(|e| e.nft_id() == U256::from(42)).map(|e| e.block.number).collect();
    assert_eq!(blocks_of_42, [105], "the failed event in the shared block is dispatched on retry");
    let ids: HashSet<_> = events.iter().map(ChainEvent::id).collect();
    assert_eq!(ids.len(), 2, "the earlier success in that block is not re-dispatched");

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_subscription_triggers_a_gap_closing_rescan() {
    let chain = FakeChain::default();
    chain.set_head(120);
    let first_live = chain.push_subscription();
    chain.push_subscription(); // replacement subscription, stays quiet
    let sink = RecordingSink::default();
    let store = Arc::new(MemoryCheckpointStore::with_checkpoint(checkpoint_at(115)));

    let handle = Watcher::new(chain.clone(), sink.clone(), Arc::clone(&store)).start();

    first_live.send(stopped_log(8, 120)).await.unwrap();
    wait_until(async || sink.count() == 1).await;

    // an event lands while the subscription is down; the reconnect scan picks
    // it up without re-dispatching anything already handled live
    chain.set_head(125);
    chain.add_logs([stopped_log(9, 123)]);
    drop(first_live);

    wait_until(async || sink.count() == 2).await;
    wait_until(async || stored_block(&store).await == Some(125)).await;

    let events = sink.events();
    assert_eq!(events[1].nft_id(), U256::from(9));
    assert_eq!(events[1].block.number, 123);

    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_service_cleanly() {
    let chain = FakeChain::default();
    chain.set_head(10);
    let store = Arc::new(MemoryCheckpointStore::new());

    let handle = Watcher::new(chain, RecordingSink::default(), Arc::clone(&store)).start();

    wait_until(async || stored_block(&store).await.is_some()).await;

    handle.shutdown().await.unwrap();
}
