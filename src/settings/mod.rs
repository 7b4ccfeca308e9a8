use clap::{Parser, Subcommand, value_parser};
use itertools::Itertools;
use loadstone_tasks::SchedulerConfig;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(name = "Loadstone")]
#[command(version)]
#[command(about = "Streams a data directory through the resource manager, frame by frame")]
pub struct CliArgs {
    #[arg(long, env = "LOADSTONE_DATA_DIR", default_value_t = default_data_dir())]
    pub data_dir: String,

    /// Worker threads as "short,long,file", defaults to the machine's core count
    #[arg(long, env = "LOADSTONE_WORKERS", value_parser = value_parser!(WorkerCounts))]
    pub workers: Option<WorkerCounts>,

    #[arg(long, default_value_t = 4, env = "LOADSTONE_MAX_DATA_LOADS")]
    pub max_data_loads: usize,

    /// Target frame time in milliseconds
    #[arg(long, default_value_t = 16)]
    pub frame_ms: u64,

    #[arg(long, default_value_t = 600)]
    pub max_frames: u32,

    #[command(subcommand)]
    pub operation_mode: OperationMode,
}

impl CliArgs {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        match &self.workers {
            Some(workers) => SchedulerConfig {
                short_task_workers: workers.short,
                long_task_workers: workers.long,
                file_access_workers: workers.file,
            },
            None => SchedulerConfig::default(),
        }
    }
}

pub fn default_data_dir() -> String {
    std::env::current_dir()
        .expect("Can't read current working directory!")
        .join("_data")
        .to_string_lossy()
        .to_string()
}

#[derive(Subcommand, Debug)]
pub enum OperationMode {
    /// Streams every file in the data directory (and its direct subdirectories)
    Scan,
    /// Streams the given ids, relative to the data directory
    Files {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Ids that have to be loaded before the first frame
        #[arg(long)]
        critical: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerCounts {
    pub short: usize,
    pub long: usize,
    pub file: usize,
}

impl FromStr for WorkerCounts {
    type Err = String;

    // short,long,file
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let string: String = s.chars().filter(|&c| !c.is_whitespace()).collect();
        let splits = string.split(',').collect_vec();

        if splits.len() != 3 {
            return Err(format!(
                "Comma splitting resulted in {} splits, not 3!",
                splits.len()
            ));
        }

        let counts = splits
            .iter()
            .map(|&split| {
                split
                    .parse::<usize>()
                    .map_err(|err| format!("Invalid worker count '{}': {}", split, err))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(WorkerCounts {
            short: counts[0],
            long: counts[1],
            file: counts[2],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerCounts;
    use std::str::FromStr;

    #[test]
    pub fn parses_three_counts() {
        let counts = WorkerCounts::from_str("6, 2,1").expect("valid counts");
        assert_eq!((counts.short, counts.long, counts.file), (6, 2, 1));
    }

    #[test]
    pub fn rejects_missing_counts() {
        assert!(WorkerCounts::from_str("6,2").is_err());
        assert!(WorkerCounts::from_str("6,two,1").is_err());
    }
}
