use crate::settings::{CliArgs, OperationMode};
use clap::Parser;
use itertools::Itertools;
use loadstone::resource::{
    AcquireMode, ContentLoadDesc, FileResourceLoader, ResourceContent, ResourceEventKind, ResourceLoadData,
    ResourceManager, ResourceManagerConfig, ResourcePriority, ResourceState, ResourceTypeOptions,
};
use loadstone::tasks::{TaskScheduler, WorkerThreadType};
use log::{info, trace, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod settings;

const BLOB_TYPE: &str = "Blob";

/// Keeps the bytes of a file around, nothing more.
#[derive(Default)]
struct Blob {
    bytes: Vec<u8>,
}

impl ResourceContent for Blob {
    fn update_content(&mut self, data: &ResourceLoadData) -> anyhow::Result<ContentLoadDesc> {
        self.bytes = data.bytes.clone();
        Ok(ContentLoadDesc::loaded())
    }

    fn unload_data(&mut self) {
        self.bytes = Vec::new();
    }

    fn memory_usage(&self) -> usize {
        self.bytes.len()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = CliArgs::parse();
    log::trace!("Starting with args: {:?}", args);

    let scheduler = TaskScheduler::start(args.scheduler_config())?;
    let manager = ResourceManager::new(
        scheduler.clone(),
        ResourceManagerConfig {
            max_data_load_tasks: args.max_data_loads,
            ..ResourceManagerConfig::default()
        },
    );

    manager.register_resource_type::<Blob>(
        BLOB_TYPE,
        Arc::new(FileResourceLoader::new(&args.data_dir)),
        ResourceTypeOptions::default(),
    );

    manager.subscribe(|event| {
        if event.kind == ResourceEventKind::LoadingFailed {
            warn!("{} failed to load: {:?}", *event.resource, event.resource.loading_state());
        } else {
            trace!("{:?}: {}", event.kind, *event.resource);
        }
    });

    let (ids, critical) = match &args.operation_mode {
        OperationMode::Scan => (scan_data_dir(Path::new(&args.data_dir))?, Vec::new()),
        OperationMode::Files { ids, critical } => (ids.clone(), critical.clone()),
    };

    for id in &critical {
        let resource = manager.load_resource_by_type(BLOB_TYPE, id)?;
        resource.set_priority(ResourcePriority::Critical);
        let acquired = manager.acquire(&resource, AcquireMode::BlockTillLoaded);
        info!("{} is {:?} before the first frame", *acquired.resource, acquired.resource.loading_state());
    }

    let resources = ids
        .iter()
        .map(|id| manager.load_resource_by_type(BLOB_TYPE, id))
        .collect::<Result<Vec<_>, _>>()?;

    for resource in &resources {
        manager.acquire(resource, AcquireMode::AllowLoadingFallback);
    }

    let frame_time = Duration::from_millis(args.frame_ms);
    let started = Instant::now();
    let mut frames = 0;
    while frames < args.max_frames {
        let frame_start = Instant::now();
        manager.per_frame_update();
        scheduler.execute_some_frame_tasks(frame_time / 4);
        scheduler.finish_frame_tasks();
        frames += 1;

        let pending = resources
            .iter()
            .filter(|resource| !resource.loading_state().reached(ResourceState::Loaded))
            .count();
        if pending == 0 {
            break;
        }

        if let Some(rest) = frame_time.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    let by_state = resources
        .iter()
        .map(|resource| resource.loading_state())
        .counts();
    let memory = resources
        .iter()
        .map(|resource| resource.memory_usage())
        .sum::<usize>();

    info!(
        "Streamed {} resources in {} frames ({:.2?}), {} bytes resident",
        resources.len(),
        frames,
        started.elapsed(),
        memory
    );
    for (state, count) in by_state.iter().sorted() {
        info!("  {:?}: {}", state, count);
    }

    for thread_type in WorkerThreadType::POOLED {
        let utilization = scheduler.thread_utilization(thread_type);
        let average = if utilization.is_empty() {
            0.0
        } else {
            utilization.iter().map(|worker| worker.utilization).sum::<f64>() / utilization.len() as f64
        };
        info!(
            "{} workers: {}, last frame utilization {:.1}%",
            thread_type.name(),
            utilization.len(),
            average * 100.0
        );
    }

    manager.unload_all_resources();
    scheduler.shutdown();
    Ok(())
}

/// Ids of the files in the data directory and its direct subdirectories.
fn scan_data_dir(data_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(data_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            for nested in fs::read_dir(&path)? {
                let nested = nested?.path();
                if nested.is_file() {
                    ids.push(relative_id(data_dir, &nested));
                }
            }
        } else if path.is_file() {
            ids.push(relative_id(data_dir, &path));
        }
    }

    ids.sort();
    Ok(ids)
}

fn relative_id(data_dir: &Path, path: &Path) -> String {
    path.strip_prefix(data_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}
