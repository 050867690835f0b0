//! Prometheus surface of the assimilation pipeline.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

use crate::error::{FsError, FsResult};

pub const ITEM_FILE: &str = "file";
pub const ITEM_DIR: &str = "dir";

pub const ACTION_ADDED: &str = "added";
pub const ACTION_UPDATED: &str = "updated";
pub const ACTION_DELETED: &str = "deleted";
pub const ACTION_MOVED: &str = "moved";

pub struct Metrics {
    registry: Registry,
    assimilation_count: IntCounterVec,
    assimilation_active_tasks: IntGauge,
}

impl Metrics {
    pub fn new() -> FsResult<Self> {
        let registry = Registry::new();

        let assimilation_count = IntCounterVec::new(
            Opts::new(
                "assimilation_count",
                "Number of assimilated filesystem items by type and action",
            ),
            &["type", "action"],
        )
        .map_err(metrics_error)?;

        let assimilation_active_tasks = IntGauge::new(
            "assimilation_active_tasks",
            "Assimilation tasks currently running",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(assimilation_count.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(assimilation_active_tasks.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            assimilation_count,
            assimilation_active_tasks,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn count_assimilation(&self, item_type: &str, action: &str) {
        self.assimilation_count
            .with_label_values(&[item_type, action])
            .inc();
    }

    pub fn task_started(&self) {
        self.assimilation_active_tasks.inc();
    }

    pub fn task_finished(&self) {
        self.assimilation_active_tasks.dec();
    }

    #[cfg(test)]
    pub(crate) fn assimilation_total(&self, item_type: &str, action: &str) -> u64 {
        self.assimilation_count
            .with_label_values(&[item_type, action])
            .get()
    }
}

fn metrics_error(err: prometheus::Error) -> FsError {
    FsError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("metrics registration failure: {err}"),
    ))
}
