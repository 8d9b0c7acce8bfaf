//! Training progress logging.
//!
//! A [`TrainingSnapshot`] is assembled once per iteration and handed to a
//! [`MetricsLogger`] backend: console table, CSV file, or both. Logging is
//! observability only; nothing reads it back.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// One iteration's worth of training diagnostics.
#[derive(Debug, Clone, Default)]
pub struct TrainingSnapshot {
    pub iteration: usize,
    pub env_steps: usize,
    pub episodes: usize,
    pub avg_reward: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
    /// Discriminator metrics (LLC phase only; zero elsewhere).
    pub disc_loss: f32,
    pub real_score: f32,
    pub fake_score: f32,
    pub style_reward: f32,
}

impl TrainingSnapshot {
    pub fn new(iteration: usize, env_steps: usize, episodes: usize, avg_reward: f32) -> Self {
        Self {
            iteration,
            env_steps,
            episodes,
            avg_reward,
            ..Self::default()
        }
    }

    pub fn with_ppo(mut self, policy_loss: f32, value_loss: f32, entropy: f32) -> Self {
        self.policy_loss = policy_loss;
        self.value_loss = value_loss;
        self.entropy = entropy;
        self
    }

    pub fn with_amp(
        mut self,
        disc_loss: f32,
        real_score: f32,
        fake_score: f32,
        style_reward: f32,
    ) -> Self {
        self.disc_loss = disc_loss;
        self.real_score = real_score;
        self.fake_score = fake_score;
        self.style_reward = style_reward;
        self
    }
}

/// Logging backend.
pub trait MetricsLogger: Send {
    fn log(&mut self, snapshot: &TrainingSnapshot);
    fn flush(&mut self);
}

/// Fixed-width console table, header printed once.
pub struct ConsoleLogger {
    log_interval: usize,
    start_time: Instant,
    show_header: bool,
}

impl ConsoleLogger {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
            start_time: Instant::now(),
            show_header: true,
        }
    }

    fn print_header(&self) {
        println!(
            "{:>8} {:>10} {:>8} {:>8} {:>9} {:>9} {:>8} {:>8} {:>7} {:>7} {:>8}",
            "Iter", "EnvSteps", "Episodes", "Reward", "Policy", "Value", "Entropy", "DiscL",
            "Real", "Fake", "FPS"
        );
        println!("{}", "-".repeat(100));
    }
}

impl MetricsLogger for ConsoleLogger {
    fn log(&mut self, snapshot: &TrainingSnapshot) {
        if snapshot.iteration % self.log_interval != 0 {
            return;
        }
        if self.show_header {
            self.print_header();
            self.show_header = false;
        }
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let fps = if elapsed > 0.0 {
            snapshot.env_steps as f32 / elapsed
        } else {
            0.0
        };
        println!(
            "{:>8} {:>10} {:>8} {:>8.3} {:>9.4} {:>9.4} {:>8.3} {:>8.4} {:>7.3} {:>7.3} {:>8.0}",
            snapshot.iteration,
            snapshot.env_steps,
            snapshot.episodes,
            snapshot.avg_reward,
            snapshot.policy_loss,
            snapshot.value_loss,
            snapshot.entropy,
            snapshot.disc_loss,
            snapshot.real_score,
            snapshot.fake_score,
            fps
        );
    }

    fn flush(&mut self) {}
}

/// CSV file logger for offline analysis.
pub struct CsvLogger {
    writer: BufWriter<File>,
    start_time: Instant,
}

impl CsvLogger {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "iteration,env_steps,episodes,avg_reward,policy_loss,value_loss,entropy,\
             disc_loss,real_score,fake_score,style_reward,elapsed_secs"
        )?;
        Ok(Self {
            writer,
            start_time: Instant::now(),
        })
    }
}

impl MetricsLogger for CsvLogger {
    fn log(&mut self, snapshot: &TrainingSnapshot) {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let _ = writeln!(
            self.writer,
            "{},{},{},{:.4},{:.6},{:.6},{:.6},{:.6},{:.4},{:.4},{:.4},{:.2}",
            snapshot.iteration,
            snapshot.env_steps,
            snapshot.episodes,
            snapshot.avg_reward,
            snapshot.policy_loss,
            snapshot.value_loss,
            snapshot.entropy,
            snapshot.disc_loss,
            snapshot.real_score,
            snapshot.fake_score,
            snapshot.style_reward,
            elapsed
        );
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

impl Drop for CsvLogger {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Fan-out to multiple backends.
#[derive(Default)]
pub struct MultiLogger {
    loggers: Vec<Box<dyn MetricsLogger>>,
}

impl MultiLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<L: MetricsLogger + 'static>(mut self, logger: L) -> Self {
        self.loggers.push(Box::new(logger));
        self
    }
}

impl MetricsLogger for MultiLogger {
    fn log(&mut self, snapshot: &TrainingSnapshot) {
        for logger in &mut self.loggers {
            logger.log(snapshot);
        }
    }

    fn flush(&mut self) {
        for logger in &mut self.loggers {
            logger.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_builders() {
        let snapshot = TrainingSnapshot::new(10, 1000, 5, 0.8)
            .with_ppo(0.1, 0.2, 1.5)
            .with_amp(-0.3, 0.9, -0.6, 0.7);
        assert_eq!(snapshot.iteration, 10);
        assert!((snapshot.value_loss - 0.2).abs() < 1e-6);
        assert!((snapshot.fake_score + 0.6).abs() < 1e-6);
    }

    #[test]
    fn csv_logger_writes_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        {
            let mut logger = CsvLogger::new(&path).unwrap();
            logger.log(&TrainingSnapshot::new(0, 100, 1, 0.5));
            logger.log(&TrainingSnapshot::new(1, 200, 2, 0.6));
            logger.flush();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines[0].starts_with("iteration,"));
        assert!(lines[1].starts_with("0,100,1,"));
    }

    #[test]
    fn console_logger_respects_interval() {
        let mut logger = ConsoleLogger::new(10);
        // Only asserts it does not panic on both paths.
        logger.log(&TrainingSnapshot::new(3, 100, 1, 0.5)); // skipped
        logger.log(&TrainingSnapshot::new(10, 200, 2, 0.6)); // printed
    }

    #[test]
    fn multi_logger_fans_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multi.csv");
        let mut multi = MultiLogger::new()
            .add(ConsoleLogger::new(1))
            .add(CsvLogger::new(&path).unwrap());
        multi.log(&TrainingSnapshot::new(0, 10, 0, 0.0));
        multi.flush();
        assert!(std::fs::read_to_string(&path).unwrap().lines().count() >= 2);
    }
}
