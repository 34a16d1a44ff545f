//! End-to-end store tests over the in-process transport.

use std::any::Any;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use widefm_core::{FeaId, Progress, SArray};
use widefm_store::updater::Result as UpdaterResult;
use widefm_store::{
    Bus, ServerConfig, ServerNode, StoreClient, Updater, ValueKind,
};

/// A scalar-per-key updater: counts accumulate, gradients subtract.
#[derive(Default)]
struct ScalarUpdater {
    model: Mutex<std::collections::BTreeMap<FeaId, f32>>,
}

impl Updater for ScalarUpdater {
    fn get(
        &self,
        keys: &SArray<FeaId>,
        _kind: ValueKind,
    ) -> UpdaterResult<(SArray<f32>, SArray<i32>)> {
        let model = self.model.lock();
        let vals: SArray<f32> = keys
            .iter()
            .map(|k| model.get(k).copied().unwrap_or(0.0))
            .collect();
        Ok((vals, Default::default()))
    }

    fn update(
        &self,
        keys: &SArray<FeaId>,
        _kind: ValueKind,
        values: &SArray<f32>,
        _lens: &SArray<i32>,
    ) -> UpdaterResult<()> {
        let mut model = self.model.lock();
        for (k, v) in keys.iter().zip(values.iter()) {
            *model.entry(*k).or_insert(0.0) += v;
        }
        Ok(())
    }

    fn load(&self, _reader: &mut dyn Read) -> UpdaterResult<u64> {
        Ok(0)
    }

    fn save(&self, _save_aux: bool, _writer: &mut dyn Write) -> UpdaterResult<u64> {
        Ok(0)
    }

    fn dump(
        &self,
        _dump_aux: bool,
        _need_reverse: bool,
        _writer: &mut dyn Write,
    ) -> UpdaterResult<u64> {
        Ok(0)
    }

    fn report(&self) -> Progress {
        Progress::default()
    }

    fn evaluate(&self, _prog: &mut Progress) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn start_server(bus: &Arc<Bus>, rank: usize, config: ServerConfig) {
    ServerNode::spawn(
        Arc::clone(bus),
        rank,
        Arc::new(ScalarUpdater::default()),
        config,
        Box::new(|_| Vec::new()),
    );
}

#[test]
fn test_push_then_pull_roundtrip() {
    let bus = Arc::new(Bus::new(2, 1));
    start_server(&bus, 0, ServerConfig::default());
    start_server(&bus, 1, ServerConfig::default());
    let (client, _ctrl) = StoreClient::new(Arc::clone(&bus), 0);

    // Keys spanning both shards.
    let keys: SArray<FeaId> = vec![5, 1 << 40, 1 << 63, u64::MAX - 3].into();
    let vals: SArray<f32> = vec![1.0, 2.0, 3.0, 4.0].into();
    let ts = client.push(keys.clone(), ValueKind::FeaCount, vals, Default::default(), None);
    client.wait(ts);

    let got = client.pull_wait(keys.clone(), ValueKind::FeaCount);
    assert_eq!(&*got.vals, &[1.0, 2.0, 3.0, 4.0]);
    assert!(got.lens.is_empty());
}

#[test]
fn test_worker_self_ordering_without_wait() {
    // A pull issued after a push on the same keys observes the push even
    // though neither operation has been waited on.
    let bus = Arc::new(Bus::new(1, 1));
    start_server(&bus, 0, ServerConfig::default());
    let (client, _ctrl) = StoreClient::new(Arc::clone(&bus), 0);

    let keys: SArray<FeaId> = vec![7, 9].into();
    for round in 1..=5 {
        client.push(
            keys.clone(),
            ValueKind::Gradient,
            vec![1.0, 10.0].into(),
            Default::default(),
            None,
        );
        let got = client.pull_wait(keys.clone(), ValueKind::Weight);
        assert_eq!(&*got.vals, &[round as f32, 10.0 * round as f32]);
    }
}

#[test]
fn test_bsp_pull_blocks_on_slow_worker() {
    // sync_mode with max_delay = 0: worker 0's pull issued after its own
    // push may not be answered before worker 1's push of the same round.
    let bus = Arc::new(Bus::new(1, 2));
    start_server(
        &bus,
        0,
        ServerConfig {
            sync_mode: true,
            max_delay: 0,
            report_every: 50,
        },
    );
    let (w0, _c0) = StoreClient::new(Arc::clone(&bus), 0);
    let (w1, _c1) = StoreClient::new(Arc::clone(&bus), 1);

    let keys: SArray<FeaId> = vec![3].into();
    let t0 = Instant::now();

    // Worker 1 pushes after a 100 ms delay.
    let slow = {
        let keys = keys.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let ts = w1.push(
                keys,
                ValueKind::Gradient,
                vec![1.0].into(),
                Default::default(),
                None,
            );
            w1.wait(ts);
            Instant::now()
        })
    };

    // Worker 0 pushes immediately, then pulls.
    let ts = w0.push(
        keys.clone(),
        ValueKind::Gradient,
        vec![1.0].into(),
        Default::default(),
        None,
    );
    w0.wait(ts);
    let got = w0.pull_wait(keys, ValueKind::Weight);
    let pull_done = Instant::now();
    slow.join().unwrap();

    // The pull was parked until the delayed push landed, and its response
    // reflects both pushes.
    assert_eq!(&*got.vals, &[2.0]);
    assert!(
        pull_done - t0 >= Duration::from_millis(100),
        "pull finished after {:?}, before the slow push could land",
        pull_done - t0
    );
}

#[test]
fn test_bsp_max_delay_permits_bounded_lead() {
    // With max_delay = 1 a worker may run one iteration ahead without
    // blocking on its peer.
    let bus = Arc::new(Bus::new(1, 2));
    start_server(
        &bus,
        0,
        ServerConfig {
            sync_mode: true,
            max_delay: 1,
            report_every: 50,
        },
    );
    let (w0, _c0) = StoreClient::new(Arc::clone(&bus), 0);
    let (_w1, _c1) = StoreClient::new(Arc::clone(&bus), 1);

    let keys: SArray<FeaId> = vec![11].into();
    let ts = w0.push(
        keys.clone(),
        ValueKind::Gradient,
        vec![1.0].into(),
        Default::default(),
        None,
    );
    w0.wait(ts);
    // Worker 1 has not pushed at all; one iteration of lead is allowed.
    let got = w0.pull_wait(keys, ValueKind::Weight);
    assert_eq!(&*got.vals, &[1.0]);
}

#[test]
fn test_variable_length_push_split() {
    // Per-key lengths slice the value payload correctly across shards.
    let bus = Arc::new(Bus::new(2, 1));
    start_server(&bus, 0, ServerConfig::default());
    start_server(&bus, 1, ServerConfig::default());
    let (client, _ctrl) = StoreClient::new(Arc::clone(&bus), 0);

    // Key 1 lives on shard 0 with 2 values; key on shard 1 has 1 value.
    let keys: SArray<FeaId> = vec![1, 1 << 63].into();
    let vals: SArray<f32> = vec![0.5, 0.25, 8.0].into();
    let lens: SArray<i32> = vec![2, 1].into();
    let ts = client.push(keys.clone(), ValueKind::Gradient, vals, lens, None);
    client.wait(ts);

    // The scalar test updater summed each shard's slice per key in order.
    let got = client.pull_wait(keys, ValueKind::Weight);
    assert_eq!(got.vals.len(), 2);
    assert_eq!(got.vals[1], 8.0);
}
