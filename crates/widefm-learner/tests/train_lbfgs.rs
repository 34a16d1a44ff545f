//! End-to-end L-BFGS training on a convex logistic problem.

use std::fs::File;
use std::io::{BufReader, Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use widefm_core::KwArgs;
use widefm_learner::{Learner, LbfgsLearner};

const NFEATURES: usize = 100;
const NROWS: usize = 1000;
const NNZ_PER_ROW: usize = 5;

struct Problem {
    rows: Vec<Vec<usize>>,
    labels: Vec<f32>,
}

fn generate(seed: u64) -> Problem {
    let mut rng = StdRng::seed_from_u64(seed);
    let true_w: Vec<f64> = (0..NFEATURES).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let mut rows = Vec::with_capacity(NROWS);
    let mut labels = Vec::with_capacity(NROWS);
    for _ in 0..NROWS {
        let mut cols: Vec<usize> = (0..NNZ_PER_ROW)
            .map(|_| rng.gen_range(0..NFEATURES))
            .collect();
        cols.sort_unstable();
        cols.dedup();
        let margin: f64 =
            cols.iter().map(|&c| true_w[c]).sum::<f64>() + rng.gen_range(-1.0..1.0);
        labels.push(if margin > 0.0 { 1.0 } else { -1.0 });
        rows.push(cols);
    }
    Problem { rows, labels }
}

fn objective(p: &Problem, w: &[f64]) -> f64 {
    p.rows
        .iter()
        .zip(&p.labels)
        .map(|(cols, &y)| {
            let f: f64 = cols.iter().map(|&c| w[c]).sum();
            (1.0 + (-(y as f64) * f).exp()).ln()
        })
        .sum()
}

fn gradient(p: &Problem, w: &[f64]) -> Vec<f64> {
    let mut g = vec![0.0; NFEATURES];
    for (cols, &y) in p.rows.iter().zip(&p.labels) {
        let y = y as f64;
        let f: f64 = cols.iter().map(|&c| w[c]).sum();
        let d = -y / (1.0 + (y * f).exp());
        for &c in cols {
            g[c] += d;
        }
    }
    g
}

/// Backtracking gradient descent as the reference optimum.
fn reference_optimum(p: &Problem) -> f64 {
    let mut w = vec![0.0f64; NFEATURES];
    let mut objv = objective(p, &w);
    for _ in 0..3000 {
        let g = gradient(p, &w);
        let gnorm: f64 = g.iter().map(|x| x * x).sum();
        if gnorm < 1e-12 {
            break;
        }
        let mut step = 1.0 / (NROWS as f64 / 10.0);
        loop {
            let trial: Vec<f64> = w.iter().zip(&g).map(|(&wi, &gi)| wi - step * gi).collect();
            let trial_objv = objective(p, &trial);
            if trial_objv < objv - 1e-4 * step * gnorm || step < 1e-12 {
                w = trial;
                objv = trial_objv;
                break;
            }
            step *= 0.5;
        }
    }
    objv
}

/// Reads every saved model part into a dense weight vector.
fn load_weights(prefix: &str, num_parts: usize) -> Vec<f64> {
    let mut w = vec![0.0f64; NFEATURES];
    for part in 0..num_parts {
        let path = format!("{}_part-{}", prefix, part);
        let mut reader = BufReader::new(File::open(&path).unwrap());
        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag).unwrap();
        loop {
            let mut key = [0u8; 8];
            if reader.read_exact(&mut key).is_err() {
                break;
            }
            let mut size = [0u8; 4];
            reader.read_exact(&mut size).unwrap();
            assert_eq!(i32::from_le_bytes(size), 1);
            let mut val = [0u8; 4];
            reader.read_exact(&mut val).unwrap();
            w[u64::from_le_bytes(key) as usize] = f32::from_le_bytes(val) as f64;
        }
    }
    w
}

#[test]
fn test_lbfgs_converges_near_optimum() {
    let problem = generate(42);
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("train.libfm");
    {
        let mut f = File::create(&data).unwrap();
        for (cols, &y) in problem.rows.iter().zip(&problem.labels) {
            write!(f, "{}", y).unwrap();
            for &c in cols {
                write!(f, " {}:1", c).unwrap();
            }
            writeln!(f).unwrap();
        }
    }
    let model = dir.path().join("model").display().to_string();

    let mut kw = KwArgs::from_args(
        [
            format!("data_in={}", data.display()).as_str(),
            format!("model_out={}", model).as_str(),
            "loss=logit",
            "reverse_feaid=0",
            "tail_feature_filter=0",
            "m=10",
            "c1=1e-4",
            "c2=0.9",
            "rho=0.5",
            "max_num_epochs=20",
            "min_num_epochs=2",
            "num_workers=2",
            "num_servers=2",
        ]
        .iter(),
    );
    let mut learner = LbfgsLearner::new(&mut kw).unwrap();
    assert!(kw.remaining().is_empty());
    learner.run().unwrap();

    let w = load_weights(&model, 2);
    let trained_objv = objective(&problem, &w);
    let reference = reference_optimum(&problem);
    assert!(
        trained_objv <= reference * 1.01,
        "objective {} vs reference optimum {}",
        trained_objv,
        reference
    );
}
