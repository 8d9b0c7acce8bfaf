//! Worker-pool execution layer.
//!
//! Fans environment stepping out across worker threads. Each worker owns
//! its assigned environments and its own copy of the loaded motion data;
//! the parent talks to each worker over a dedicated channel pair using
//! typed request/response messages, one blocking round trip per command.
//!
//! Ordering guarantee: result batches concatenate in worker-assignment
//! order, which is stable for a fixed (num_envs, num_workers) pair, so
//! environment index `i` always maps to the same logical environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use ndarray::Array2;

use super::character::{CharacterEnv, StepInfo};
use super::vec_env::{StepBatch, VecEnv};
use crate::config::CalmConfig;
use crate::motion::{load_motion_directory, standing_clip};

/// Commands sent to a worker. Every command gets exactly one response.
enum WorkerRequest {
    Reset,
    /// One action row per environment owned by the worker.
    Step(Vec<Vec<f32>>),
    GetDims,
    Close,
}

/// Worker responses, matched one-to-one with requests.
enum WorkerResponse {
    Obs(Vec<Vec<f32>>),
    Step {
        obs: Vec<Vec<f32>>,
        rewards: Vec<f32>,
        dones: Vec<bool>,
        infos: Vec<StepInfo>,
    },
    Dims(usize, usize),
    Closed,
}

struct WorkerHandle {
    request_tx: Sender<WorkerRequest>,
    response_rx: Receiver<WorkerResponse>,
    join: Option<JoinHandle<()>>,
    env_count: usize,
}

/// Thread-backed vectorized environment.
pub struct WorkerVecEnv {
    workers: Vec<WorkerHandle>,
    num_envs: usize,
    obs_dim: usize,
    act_dim: usize,
    closed: bool,
}

impl WorkerVecEnv {
    /// Spawn `min(num_workers, num_envs)` workers, partitioning the
    /// environments as evenly as possible (`base = n / w`, first `n % w`
    /// workers take one extra).
    pub fn new(config: &CalmConfig, num_envs: usize, num_workers: usize, seed: u64) -> Self {
        assert!(num_envs > 0 && num_workers > 0);
        let num_workers = num_workers.min(num_envs);
        let counts = distribute_envs(num_envs, num_workers);
        let motion_dir = PathBuf::from(&config.motion_dir);

        let mut workers = Vec::with_capacity(num_workers);
        let mut next_index = 0usize;
        for (worker_id, &count) in counts.iter().enumerate() {
            let env_indices: Vec<usize> = (next_index..next_index + count).collect();
            next_index += count;

            let (request_tx, request_rx) = unbounded::<WorkerRequest>();
            let (response_tx, response_rx) = unbounded::<WorkerResponse>();
            let worker_config = config.clone();
            let worker_motion_dir = motion_dir.clone();

            let join = std::thread::Builder::new()
                .name(format!("env-worker-{worker_id}"))
                .spawn(move || {
                    worker_loop(
                        worker_config,
                        worker_motion_dir,
                        env_indices,
                        seed,
                        request_rx,
                        response_tx,
                    );
                })
                .expect("failed to spawn environment worker");

            workers.push(WorkerHandle {
                request_tx,
                response_rx,
                join: Some(join),
                env_count: count,
            });
        }

        // Query dimensions from the first worker.
        workers[0]
            .request_tx
            .send(WorkerRequest::GetDims)
            .expect("worker died before initialization");
        let (obs_dim, act_dim) = match workers[0].response_rx.recv() {
            Ok(WorkerResponse::Dims(obs_dim, act_dim)) => (obs_dim, act_dim),
            _ => panic!("worker failed to report dimensions"),
        };

        Self {
            workers,
            num_envs,
            obs_dim,
            act_dim,
            closed: false,
        }
    }
}

impl VecEnv for WorkerVecEnv {
    fn num_envs(&self) -> usize {
        self.num_envs
    }

    fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    fn act_dim(&self) -> usize {
        self.act_dim
    }

    fn reset(&mut self) -> Array2<f32> {
        assert!(!self.closed, "reset after close");
        for worker in &self.workers {
            worker
                .request_tx
                .send(WorkerRequest::Reset)
                .expect("worker channel closed");
        }
        let mut obs = Array2::zeros((self.num_envs, self.obs_dim));
        let mut row = 0usize;
        for worker in &self.workers {
            match worker.response_rx.recv() {
                Ok(WorkerResponse::Obs(rows)) => {
                    for r in rows {
                        obs.row_mut(row)
                            .iter_mut()
                            .zip(r.iter())
                            .for_each(|(dst, src)| *dst = *src);
                        row += 1;
                    }
                }
                _ => panic!("worker failed during reset"),
            }
        }
        obs
    }

    fn step(&mut self, actions: &Array2<f32>) -> StepBatch {
        assert!(!self.closed, "step after close");
        assert_eq!(actions.nrows(), self.num_envs);

        let mut offset = 0usize;
        for worker in &self.workers {
            let slice: Vec<Vec<f32>> = (offset..offset + worker.env_count)
                .map(|i| actions.row(i).to_vec())
                .collect();
            offset += worker.env_count;
            worker
                .request_tx
                .send(WorkerRequest::Step(slice))
                .expect("worker channel closed");
        }

        let mut obs = Array2::zeros((self.num_envs, self.obs_dim));
        let mut rewards = Vec::with_capacity(self.num_envs);
        let mut dones = Vec::with_capacity(self.num_envs);
        let mut infos = Vec::with_capacity(self.num_envs);
        let mut row = 0usize;
        for worker in &self.workers {
            match worker.response_rx.recv() {
                Ok(WorkerResponse::Step {
                    obs: worker_obs,
                    rewards: worker_rewards,
                    dones: worker_dones,
                    infos: worker_infos,
                }) => {
                    for r in worker_obs {
                        obs.row_mut(row)
                            .iter_mut()
                            .zip(r.iter())
                            .for_each(|(dst, src)| *dst = *src);
                        row += 1;
                    }
                    rewards.extend(worker_rewards);
                    dones.extend(worker_dones);
                    infos.extend(worker_infos);
                }
                _ => panic!("worker failed during step"),
            }
        }

        StepBatch {
            obs,
            rewards,
            dones,
            infos,
        }
    }

    /// Idempotent shutdown; disconnected channels are treated as
    /// already-closed workers, not errors.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for worker in &mut self.workers {
            if worker.request_tx.send(WorkerRequest::Close).is_ok() {
                let _ = worker.response_rx.recv();
            }
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for WorkerVecEnv {
    fn drop(&mut self) {
        self.close();
    }
}

/// Even partition: `base = num_envs / num_workers`, the first
/// `num_envs % num_workers` workers get one extra.
fn distribute_envs(num_envs: usize, num_workers: usize) -> Vec<usize> {
    let base = num_envs / num_workers;
    let remainder = num_envs % num_workers;
    (0..num_workers)
        .map(|i| base + usize::from(i < remainder))
        .collect()
}

/// Worker thread body: builds its own environments (with a private copy of
/// the motion data) and answers commands until `Close` or disconnect.
fn worker_loop(
    config: CalmConfig,
    motion_dir: PathBuf,
    env_indices: Vec<usize>,
    base_seed: u64,
    request_rx: Receiver<WorkerRequest>,
    response_tx: Sender<WorkerResponse>,
) {
    let loaded = load_motion_directory(&motion_dir, 20);
    let clips = if loaded.is_empty() {
        Arc::new(vec![standing_clip(20)])
    } else {
        Arc::new(loaded.into_values().collect())
    };

    let mut envs: Vec<CharacterEnv> = env_indices
        .iter()
        .map(|_| CharacterEnv::with_kinematic_sim(&config, Arc::clone(&clips)))
        .collect();

    while let Ok(request) = request_rx.recv() {
        let response = match request {
            WorkerRequest::Reset => {
                let obs = env_indices
                    .iter()
                    .zip(envs.iter_mut())
                    .map(|(&i, env)| env.reset(Some(base_seed + i as u64)))
                    .collect();
                WorkerResponse::Obs(obs)
            }
            WorkerRequest::Step(actions) => {
                let mut obs = Vec::with_capacity(envs.len());
                let mut rewards = Vec::with_capacity(envs.len());
                let mut dones = Vec::with_capacity(envs.len());
                let mut infos = Vec::with_capacity(envs.len());
                for (env, action) in envs.iter_mut().zip(actions.iter()) {
                    let (mut ob, reward, done, info) = env.step(action);
                    if done {
                        ob = env.reset(None);
                    }
                    obs.push(ob);
                    rewards.push(reward);
                    dones.push(done);
                    infos.push(info);
                }
                WorkerResponse::Step {
                    obs,
                    rewards,
                    dones,
                    infos,
                }
            }
            WorkerRequest::GetDims => {
                WorkerResponse::Dims(envs[0].obs_dim(), envs[0].act_dim())
            }
            WorkerRequest::Close => {
                let _ = response_tx.send(WorkerResponse::Closed);
                break;
            }
        };
        if response_tx.send(response).is_err() {
            break; // parent hung up
        }
    }
}
