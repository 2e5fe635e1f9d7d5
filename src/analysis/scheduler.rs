use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::zone::{ZoneRecord, ZoneStatus, ZoneStatusReader, ZoneStatusStore};
use super::{AnalysisConfig, InferenceService};
use crate::audio::{AnalyserTap, WindowExtractor};
use crate::error::AnalysisError;
use crate::events::{emit, EventSender, MonitorEvent};
use crate::remote::{AnalysisRequest, AnalysisResponse};
use crate::timer::ScheduledTask;

/// Generation a request was dispatched under. A result is applied only if
/// its ticket still matches the scheduler's current generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnalysisTicket(u64);

impl AnalysisTicket {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Dispatched(AnalysisTicket),
    /// Previous request still outstanding
    SkippedInFlight,
    /// Scheduler stopped or restarted since this tick was armed
    SkippedIdle,
    /// Analyser disconnected; nothing to read
    SourceReleased,
}

/// What happened to a returned result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied(ZoneStatus),
    Failed { consecutive: u32 },
    /// Ticket was superseded; the result was dropped
    Stale,
}

/// Counters and flags, exposed for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub generation: u64,
    pub running: bool,
    pub in_flight: bool,
    pub dispatched: u64,
    pub skipped: u64,
    pub stale: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub degraded: bool,
}

struct SchedulerShared {
    config: AnalysisConfig,
    sample_rate: u32,
    inference: Arc<dyn InferenceService>,
    extractor: WindowExtractor,
    zone: ZoneStatusStore,
    events: EventSender,
    state: Mutex<SchedulerStats>,
}

/// Drives periodic inference while a recording is live and owns the only
/// writer of the zone state.
///
/// At most one request is outstanding at a time. `stop()` bumps the
/// generation so anything still in flight is discarded on return.
pub struct AnalysisScheduler {
    shared: Arc<SchedulerShared>,
    task: Mutex<Option<ScheduledTask>>,
}

impl AnalysisScheduler {
    pub fn new(
        config: AnalysisConfig,
        sample_rate: u32,
        inference: Arc<dyn InferenceService>,
        zone: ZoneRecord,
        events: EventSender,
    ) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                sample_rate,
                inference,
                extractor: WindowExtractor::new(),
                zone: ZoneStatusStore::new(zone),
                events,
                state: Mutex::new(SchedulerStats::default()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn zone(&self) -> ZoneStatusReader {
        self.shared.zone.reader()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn current_ticket(&self) -> AnalysisTicket {
        AnalysisTicket(self.shared.lock().generation)
    }

    /// Begin ticking against `analyser`. Restarting supersedes any
    /// previous run and its outstanding request.
    pub fn start(&self, analyser: AnalyserTap) -> AnalysisTicket {
        let ticket = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.running = true;
            state.in_flight = false;
            state.consecutive_failures = 0;
            state.degraded = false;
            AnalysisTicket(state.generation)
        };

        let shared = Arc::clone(&self.shared);
        let period = self.shared.config.tick_interval();
        let task = ScheduledTask::every("analysis", period, move || {
            shared.tick(ticket, &analyser);
        });

        let previous = self.task_slot().replace(task);
        drop(previous);

        info!(
            "Analysis scheduler started (generation {}, every {}ms)",
            ticket.0,
            period.as_millis()
        );
        ticket
    }

    /// Halt ticking and invalidate any outstanding request. Safe to call
    /// when not running.
    pub fn stop(&self) {
        let was_running = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.in_flight = false;
            std::mem::replace(&mut state.running, false)
        };

        if let Some(mut task) = self.task_slot().take() {
            task.cancel();
        }

        if was_running {
            info!("Analysis scheduler stopped");
        }
    }

    /// Apply a result for `ticket`. Results for superseded tickets are
    /// dropped without touching the zone.
    pub fn complete(
        &self,
        ticket: AnalysisTicket,
        result: Result<AnalysisResponse, AnalysisError>,
    ) -> CompletionOutcome {
        self.shared.complete(ticket, result)
    }

    /// Clear a latched alert. Serialized with result application.
    pub fn acknowledge_alert(&self) -> bool {
        let _state = self.shared.lock();
        let cleared = self.shared.zone.acknowledge();
        if cleared {
            info!("Zone alert acknowledged");
        }
        cleared
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<ScheduledTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for AnalysisScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SchedulerShared {
    fn lock(&self) -> MutexGuard<'_, SchedulerStats> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tick(self: &Arc<Self>, ticket: AnalysisTicket, analyser: &AnalyserTap) -> TickOutcome {
        let request = {
            let mut state = self.lock();
            if !state.running || state.generation != ticket.0 {
                return TickOutcome::SkippedIdle;
            }
            if state.in_flight {
                state.skipped += 1;
                debug!("Analysis tick skipped: previous request still in flight");
                return TickOutcome::SkippedInFlight;
            }

            let window = match self.extractor.extract(analyser) {
                Ok(window) => window,
                Err(e) => {
                    debug!("Analysis tick skipped: {}", e);
                    return TickOutcome::SourceReleased;
                }
            };

            state.in_flight = true;
            state.dispatched += 1;
            AnalysisRequest {
                audio_data: window.into_samples(),
                sample_rate: self.sample_rate,
                duration: self.config.request_duration_ms,
            }
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let timeout = shared.config.timeout();
            let result =
                match tokio::time::timeout(timeout, shared.inference.analyze(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(AnalysisError::Timeout(timeout)),
                };
            shared.complete(ticket, result);
        });

        TickOutcome::Dispatched(ticket)
    }

    fn complete(
        &self,
        ticket: AnalysisTicket,
        result: Result<AnalysisResponse, AnalysisError>,
    ) -> CompletionOutcome {
        let mut state = self.lock();
        if state.generation != ticket.0 {
            state.stale += 1;
            debug!(
                "Discarding stale analysis result (generation {}, current {})",
                ticket.0, state.generation
            );
            return CompletionOutcome::Stale;
        }
        state.in_flight = false;

        let result = result.and_then(|response| {
            if response.success {
                Ok(response)
            } else {
                let reason = response
                    .error
                    .or(response.message)
                    .unwrap_or_else(|| "no reason given".to_string());
                Err(AnalysisError::Rejected(reason))
            }
        });

        match result {
            Ok(response) => {
                state.consecutive_failures = 0;
                if state.degraded {
                    state.degraded = false;
                    info!("Analysis recovered");
                    emit(&self.events, MonitorEvent::AnalysisRecovered);
                }

                let now = Local::now();
                let status = self.zone.apply(&response, now, self.config.alert_mode);
                if response.is_dangerous {
                    let zone_id = self.zone.snapshot().id;
                    warn!(
                        "Danger detected in zone {}: class {:?} ({}), probability {:?}",
                        zone_id,
                        response.predicted_class,
                        response.class_label().unwrap_or("unknown"),
                        response.danger_probability
                    );
                    emit(
                        &self.events,
                        MonitorEvent::DangerDetected {
                            zone_id,
                            predicted_class: response.predicted_class,
                            label: response.class_label().map(str::to_string),
                            danger_probability: response.danger_probability,
                            at: now,
                        },
                    );
                } else {
                    debug!(
                        "Analysis result: safe (probability {:?})",
                        response.danger_probability
                    );
                }
                CompletionOutcome::Applied(status)
            }
            Err(e) => {
                state.failed += 1;
                state.consecutive_failures += 1;
                let consecutive = state.consecutive_failures;
                warn!("Analysis tick failed ({} in a row): {}", consecutive, e);

                if !state.degraded && consecutive >= self.config.degraded_after {
                    state.degraded = true;
                    warn!(
                        "Analysis degraded after {} consecutive failures",
                        consecutive
                    );
                    emit(
                        &self.events,
                        MonitorEvent::AnalysisDegraded {
                            consecutive_failures: consecutive,
                        },
                    );
                }
                CompletionOutcome::Failed { consecutive }
            }
        }
    }
}
