use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::{BridgeContext, CycleError, CycleReport, PublishMode};
use crate::config::MeterConfig;

/// Per meter state shared between ticks
pub struct MeterSlot {
    pub meter: MeterConfig,
    busy: AtomicBool,
    announced: AtomicBool,
    /* Last (unmapped records, unused descriptors) we warned about */
    mismatch: Mutex<(usize, usize)>,
}

impl MeterSlot {
    fn new(meter: MeterConfig, announced: bool) -> Self {
        return MeterSlot {
            meter,
            busy: AtomicBool::new(false),
            announced: AtomicBool::new(announced),
            mismatch: Mutex::new((0, 0)),
        };
    }

    fn try_begin(self: &Arc<Self>) -> Option<InFlight> {
        return self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight { slot: self.clone() });
    }

    pub fn is_busy(&self) -> bool {
        return self.busy.load(Ordering::Acquire);
    }

    pub fn is_announced(&self) -> bool {
        return self.announced.load(Ordering::Acquire);
    }

    fn check_alignment(&self, report: &CycleReport) {
        let current = (report.unmapped_records, report.unused_descriptors);
        let mut last = self.mismatch.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *last == current {
            return;
        }
        *last = current;

        if report.is_aligned() {
            info!("Meter {} matches its template {} again", self.meter.name, self.meter.template);
        } else {
            warn!(
                "Meter {} does not match template {}: {} records without field, {} fields without record",
                self.meter.name, self.meter.template, report.unmapped_records, report.unused_descriptors
            );
        }
    }
}

/* Marks the meter idle again however the poll ends */
struct InFlight {
    slot: Arc<MeterSlot>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

/// Polls started and meters skipped by one tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub started: Vec<(String, JoinHandle<()>)>,
    pub skipped: Vec<String>,
}

impl TickReport {
    pub async fn join(self) {
        for (name, handle) in self.started {
            if let Err(e) = handle.await {
                error!("Poll of meter {name} aborted: {e}");
            }
        }
    }
}

pub struct PollScheduler {
    context: Arc<BridgeContext>,
    slots: Vec<Arc<MeterSlot>>,
}

impl PollScheduler {
    pub fn new(context: Arc<BridgeContext>) -> Self {
        /* Without autodiscover every meter starts in state mode */
        let announced = !context.config.autodiscover.enabled;
        let slots = context
            .config
            .meters
            .iter()
            .map(|meter| Arc::new(MeterSlot::new(meter.clone(), announced)))
            .collect();

        return PollScheduler { context, slots };
    }

    pub fn slots(&self) -> &[Arc<MeterSlot>] {
        return &self.slots;
    }

    /// Announces every meter once and waits for all of them
    pub async fn publish_autodiscover(&self) {
        if !self.context.config.autodiscover.enabled {
            return;
        }

        info!("Publishing Home Assistant autodiscover messages");
        self.tick().join().await;

        let pending = self.slots.iter().filter(|slot| !slot.is_announced()).count();
        if pending > 0 {
            warn!("{pending} meters could not be announced, retrying on the next tick");
        }
    }

    /// Starts one concurrent poll per idle meter, busy meters are skipped
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        for slot in self.slots.iter() {
            match slot.try_begin() {
                Some(in_flight) => {
                    let context = self.context.clone();
                    let handle = tokio::spawn(async move {
                        poll_meter(&context, in_flight).await;
                    });
                    report.started.push((slot.meter.name.clone(), handle));
                }
                None => {
                    warn!("Meter {} is still busy with the previous poll, skipping", slot.meter.name);
                    report.skipped.push(slot.meter.name.clone());
                }
            }
        }

        return report;
    }

    /// Ticks forever, the first tick fires one interval after the start
    pub async fn run(&self) {
        let period = self.context.config.interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Polling {} meters every {:?}", self.slots.len(), period);
        loop {
            interval.tick().await;
            let report = self.tick();
            debug!("Tick started {} polls, skipped {}", report.started.len(), report.skipped.len());
        }
    }
}

async fn poll_meter(context: &BridgeContext, in_flight: InFlight) {
    let slot = &in_flight.slot;
    let mode = if slot.is_announced() { PublishMode::State } else { PublishMode::Discovery };

    match context.fetch_and_publish(&slot.meter, mode).await {
        Ok(report) => {
            slot.check_alignment(&report);
            if mode == PublishMode::Discovery {
                if report.dropped > 0 {
                    warn!("Announcement of meter {} was dropped, retrying on the next tick", slot.meter.name);
                    return;
                }
                slot.announced.store(true, Ordering::Release);
                info!("Announced {} fields of meter {}", report.published, slot.meter.name);
            } else {
                debug!("Published {} values of meter {}", report.published, slot.meter.name);
            }
        }
        Err(CycleError::Fetch { meter, source }) if source.is_timeout() => {
            warn!("Meter {meter} at address {} did not answer: {source}", slot.meter.address);
        }
        Err(e) => {
            error!("{e}");
        }
    }
}
