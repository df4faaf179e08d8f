//! Running one routine across many devices.
//!
//! [`Fleet::gather`] starts one task per selected device. Every task scopes
//! the device's primary session (connect, run, disconnect) so a device that
//! cannot be reached, a routine that fails and a routine that panics all end
//! up as that device's [`DeviceOutcome::Failed`] while the others carry on.
//! How many devices make progress at once is decided by the pools of the
//! shared [`SessionContext`], not by the number of tasks.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use log::{debug, error, info};

use crate::device::{Device, DeviceBuilder};
use crate::error::FleetError;
use crate::session::SessionContext;

/// What happened to one device during [`Fleet::gather`].
#[derive(Debug)]
pub enum DeviceOutcome<T> {
    /// The device has no usable endpoint.
    Skipped,
    Completed(T),
    Failed(anyhow::Error),
}

impl<T> DeviceOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, DeviceOutcome::Completed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DeviceOutcome::Failed(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            DeviceOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            DeviceOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Outcome of every selected device, by device id.
#[derive(Debug)]
pub struct GatherReport<T> {
    outcomes: BTreeMap<String, DeviceOutcome<T>>,
}

impl<T> GatherReport<T> {
    pub fn get(&self, device_id: &str) -> Option<&DeviceOutcome<T>> {
        self.outcomes.get(device_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceOutcome<T>)> {
        self.outcomes
            .iter()
            .map(|(id, outcome)| (id.as_str(), outcome))
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.count(DeviceOutcome::is_completed)
    }

    pub fn failed(&self) -> usize {
        self.count(DeviceOutcome::is_failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|outcome| matches!(outcome, DeviceOutcome::Skipped))
    }

    fn count(&self, predicate: impl Fn(&DeviceOutcome<T>) -> bool) -> usize {
        self.outcomes.values().filter(|outcome| predicate(outcome)).count()
    }

    pub fn into_outcomes(self) -> BTreeMap<String, DeviceOutcome<T>> {
        self.outcomes
    }
}

/// The devices of one run and the context their sessions share.
#[derive(Debug)]
pub struct Fleet {
    context: SessionContext,
    devices: BTreeMap<String, Arc<Device>>,
}

impl Fleet {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            devices: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Adds a device. A device whose id is already taken is discarded.
    pub fn insert(&mut self, device: Arc<Device>) -> Result<(), FleetError> {
        if self.devices.contains_key(device.id()) {
            error!("duplicate device with id {}", device.id());
            return Err(FleetError::DuplicateDevice(device.id().to_string()));
        }
        debug!("{}: added to fleet", device.id());
        self.devices.insert(device.id().to_string(), device);
        Ok(())
    }

    /// Builds a device on the fleet's context and adds it.
    pub fn add(&mut self, builder: DeviceBuilder) -> Result<Arc<Device>, FleetError> {
        let device = builder.build(&self.context);
        self.insert(device.clone())?;
        Ok(device)
    }

    pub fn get(&self, device_id: &str) -> Option<&Arc<Device>> {
        self.devices.get(device_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Runs `process` on every device passing `filter`, concurrently.
    ///
    /// Jump hosts are not connected implicitly; connect them before
    /// gathering over devices that sit behind them.
    pub async fn gather<T, F, Fut, P>(&self, process: F, filter: P) -> GatherReport<T>
    where
        F: Fn(Arc<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
        P: Fn(&Device) -> bool,
    {
        let process = Arc::new(process);
        let selected: Vec<Arc<Device>> = self
            .devices
            .values()
            .filter(|device| filter(device))
            .cloned()
            .collect();
        info!("gather: {} of {} device(s)", selected.len(), self.devices.len());

        let ids: Vec<String> = selected.iter().map(|device| device.id().to_string()).collect();
        let tasks = selected.into_iter().map(|device| {
            let process = Arc::clone(&process);
            tokio::spawn(run_on_device(device, process))
        });
        let results = join_all(tasks).await;

        let outcomes = ids
            .into_iter()
            .zip(results)
            .map(|(id, result)| {
                let outcome = result.unwrap_or_else(|err| {
                    error!("{id}: task failed: {err}");
                    DeviceOutcome::Failed(anyhow::anyhow!("task failed: {err}"))
                });
                (id, outcome)
            })
            .collect();
        GatherReport { outcomes }
    }
}

async fn run_on_device<T, F, Fut>(device: Arc<Device>, process: Arc<F>) -> DeviceOutcome<T>
where
    F: Fn(Arc<Device>) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let Some(session) = device.primary_session().cloned() else {
        info!("{device}: no endpoint, skipped");
        return DeviceOutcome::Skipped;
    };
    // Panics are caught inside the scope so the session is still disconnected.
    let result = session
        .scoped(|_| async {
            AssertUnwindSafe(async { process(Arc::clone(&device)).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!("task failed: {}", panic_message(panic.as_ref())))
                })
        })
        .await;
    match result {
        Ok(value) => DeviceOutcome::Completed(value),
        Err(err) => {
            error!("{device}: {err:#}");
            DeviceOutcome::Failed(err)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "panicked"
    }
}
