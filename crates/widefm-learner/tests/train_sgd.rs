//! End-to-end SGD training over the in-process cluster.

use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use widefm_core::feaid::reverse_bytes;
use widefm_core::{FeaId, KwArgs};
use widefm_learner::{Learner, SgdLearner};
use widefm_store::{Updater, ValueKind};
use widefm_updater::{SgdUpdater, SgdUpdaterParam};

fn write_data(dir: &TempDir, name: &str, lines: &[&str]) -> String {
    let path = dir.path().join(name);
    let mut f = File::create(&path).unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
    path.display().to_string()
}

fn load_model(path: &str, dim: usize) -> SgdUpdater {
    let mut param = SgdUpdaterParam::init(&mut KwArgs::new()).unwrap();
    param.dim = dim;
    let updater = SgdUpdater::new(param);
    updater
        .load(&mut BufReader::new(File::open(path).unwrap()))
        .unwrap();
    updater
}

fn weight_of(updater: &SgdUpdater, key: FeaId) -> Option<f32> {
    let (vals, lens) = updater
        .get(&vec![key].into(), ValueKind::Weight)
        .unwrap();
    (lens[0] > 0).then(|| vals[0])
}

#[test]
fn test_two_worker_sgd_signs_and_auc() {
    let dir = TempDir::new().unwrap();
    let data = write_data(&dir, "train.libfm", &["1 1:1 2:1", "-1 2:1 3:1", "1 1:1 3:1"]);
    let model = dir.path().join("model").display().to_string();

    let mut kw = KwArgs::from_args(
        [
            format!("data_in={}", data).as_str(),
            format!("model_out={}", model).as_str(),
            "loss=logit",
            "V_dim=1",
            "field_num=1",
            "l1=0",
            "l2=0",
            "V_l2=0",
            "lr=0.1",
            "seed=0",
            "V_init_scale=0",
            "V_threshold=0",
            "max_num_epochs=1",
            "batch_size=1",
            "num_jobs_per_epoch=3",
            "shuffle=0",
            "num_workers=2",
            "num_servers=1",
        ]
        .iter(),
    );
    let mut learner = SgdLearner::new(&mut kw).unwrap();
    assert!(kw.remaining().is_empty());

    let train_auc = Arc::new(Mutex::new(0.0f64));
    let sink = Arc::clone(&train_auc);
    learner.add_epoch_end_callback(Box::new(move |_, train, _| {
        *sink.lock() = train.auc / train.nrows.max(1.0);
    }));
    learner.run().unwrap();

    // One server: a single model part.
    let updater = load_model(&format!("{}_part-0", model), 1);
    let w1 = weight_of(&updater, reverse_bytes(1)).expect("feature 1 trained");
    let w3 = weight_of(&updater, reverse_bytes(3)).expect("feature 3 trained");
    assert!(w1 > 0.0, "feature 1 weight {} should be positive", w1);
    assert!(w3 < 0.0, "feature 3 weight {} should be negative", w3);
    assert!(*train_auc.lock() >= 0.5);
}

#[test]
fn test_dump_reversal_restores_keys() {
    let dir = TempDir::new().unwrap();
    let data = write_data(&dir, "train.libfm", &["1 10:1 20:1", "-1 20:1 30:1"]);
    let model = dir.path().join("model").display().to_string();

    let mut kw = KwArgs::from_args(
        [
            format!("data_in={}", data).as_str(),
            format!("model_out={}", model).as_str(),
            "loss=logit",
            "V_dim=1",
            "field_num=1",
            "V_init_scale=0",
            "V_threshold=0",
            "lr=0.1",
            "l1=0",
            "max_num_epochs=1",
            "batch_size=10",
            "num_jobs_per_epoch=1",
            "shuffle=0",
        ]
        .iter(),
    );
    SgdLearner::new(&mut kw).unwrap().run().unwrap();

    let updater = load_model(&format!("{}_part-0", model), 1);
    let keys = |need_reverse: bool| -> Vec<FeaId> {
        let mut out = Vec::new();
        updater.dump(false, need_reverse, &mut out).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| l.split('\t').next().unwrap().parse().unwrap())
            .collect()
    };
    let stored = keys(false);
    let restored = keys(true);
    assert_eq!(stored.len(), restored.len());
    let mut mapped: Vec<FeaId> = stored.iter().map(|&k| reverse_bytes(k)).collect();
    let mut restored_sorted = restored.clone();
    mapped.sort_unstable();
    restored_sorted.sort_unstable();
    assert_eq!(mapped, restored_sorted);
    // The restored keys are the raw data IDs.
    for k in restored {
        assert!([10, 20, 30].contains(&k));
    }
}

#[test]
fn test_tail_features_never_weighted() {
    let dir = TempDir::new().unwrap();
    // Features 1 and 2 appear 10 times, features 777 and 888 once each.
    let mut lines: Vec<String> = Vec::new();
    for i in 0..10 {
        lines.push(format!("{} 1:1 2:1", if i % 2 == 0 { 1 } else { -1 }));
    }
    lines.push("1 777:1".to_string());
    lines.push("-1 888:1".to_string());
    let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
    let data = write_data(&dir, "train.libfm", &refs);
    let model = dir.path().join("model").display().to_string();

    let mut kw = KwArgs::from_args(
        [
            format!("data_in={}", data).as_str(),
            format!("model_out={}", model).as_str(),
            "loss=logit",
            "V_dim=1",
            "field_num=1",
            "V_init_scale=0",
            "tail_feature_filter=4",
            "lr=0.1",
            "l1=0",
            "max_num_epochs=2",
            "batch_size=100",
            "num_jobs_per_epoch=1",
            "shuffle=0",
        ]
        .iter(),
    );
    SgdLearner::new(&mut kw).unwrap().run().unwrap();

    let updater = load_model(&format!("{}_part-0", model), 1);
    assert!(weight_of(&updater, reverse_bytes(1)).is_some());
    assert!(weight_of(&updater, reverse_bytes(2)).is_some());
    // Rare features have no entry in the saved model.
    assert!(weight_of(&updater, reverse_bytes(777)).is_none());
    assert!(weight_of(&updater, reverse_bytes(888)).is_none());
}

#[test]
fn test_prediction_writes_output() {
    let dir = TempDir::new().unwrap();
    let data = write_data(&dir, "train.libfm", &["1 1:1", "-1 2:1", "1 1:1"]);
    let model = dir.path().join("model").display().to_string();
    let pred = dir.path().join("pred").display().to_string();

    let base = [
        format!("data_in={}", data),
        "loss=logit".to_string(),
        "V_dim=1".to_string(),
        "field_num=1".to_string(),
        "V_init_scale=0".to_string(),
        "V_threshold=0".to_string(),
        "lr=0.1".to_string(),
        "l1=0".to_string(),
        "batch_size=10".to_string(),
        "num_jobs_per_epoch=1".to_string(),
        "shuffle=0".to_string(),
    ];
    let mut train_kw = KwArgs::from_args(base.iter());
    train_kw.push("model_out", &model);
    train_kw.push("max_num_epochs", "2");
    SgdLearner::new(&mut train_kw).unwrap().run().unwrap();

    let mut pred_kw = KwArgs::from_args(base.iter());
    pred_kw.push("task", "pred");
    pred_kw.push("model_in", &model);
    pred_kw.push("pred_out", &pred);
    SgdLearner::new(&mut pred_kw).unwrap().run().unwrap();

    let text = std::fs::read_to_string(format!("{}_part-0", pred)).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    for line in lines {
        let mut cols = line.split('\t');
        let _label: f32 = cols.next().unwrap().parse().unwrap();
        let prob: f32 = cols.next().unwrap().parse().unwrap();
        assert!((0.0..=1.0).contains(&prob));
    }
}
